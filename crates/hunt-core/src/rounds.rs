//! Round state: a single authoritative `active_round` value with
//! last-writer-wins semantics and a self-healing singleton record.

use contracts::{unix_time_ms, RoundSettings};

use crate::store::{ParticipantStore, StoreError};

pub const ROUND_INACTIVE: u8 = 0;
pub const ROUND_MAX: u8 = 3;

/// The only round gated by admission control.
pub const ADMISSION_ROUND: u8 = 1;

pub fn is_valid_round(round: u8) -> bool {
    round <= ROUND_MAX
}

/// Load the singleton round record, creating the inactive default if none
/// exists yet. Absence is never an error.
pub fn load_or_init<S: ParticipantStore>(store: &mut S) -> Result<RoundSettings, StoreError> {
    if let Some(settings) = store.round_settings()? {
        return Ok(settings);
    }

    let settings = RoundSettings::inactive(unix_time_ms());
    store.save_round_settings(&settings)?;
    Ok(settings)
}
