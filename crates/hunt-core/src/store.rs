//! Storage seam for participants, the singleton round record, and the
//! append-only click log.
//!
//! The kernel only ever talks to this trait; the API crate provides the
//! SQLite adapter and tests run against [`MemoryStore`].

use std::collections::BTreeMap;
use std::fmt;

use contracts::{ClickRecord, Participant, ParticipantStatus, RoundSettings};

#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached or was busy; safe to retry with
    /// backoff. Callers must not assume the write was applied.
    Transient(String),
    /// The store rejected the operation or returned corrupt data; not
    /// retryable without intervention.
    Internal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(detail) => write!(f, "transient store error: {detail}"),
            Self::Internal(detail) => write!(f, "store error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub trait ParticipantStore {
    fn participant(&self, participant_id: &str) -> Result<Option<Participant>, StoreError>;

    /// Insert or replace one participant record, keyed by id.
    fn upsert_participant(&mut self, participant: &Participant) -> Result<(), StoreError>;

    /// Every participant record, in unspecified order.
    fn participants(&self) -> Result<Vec<Participant>, StoreError>;

    fn count_by_status(&self, status: ParticipantStatus) -> Result<usize, StoreError>;

    /// Remove every participant record. Click history is kept.
    fn clear_participants(&mut self) -> Result<(), StoreError>;

    fn round_settings(&self) -> Result<Option<RoundSettings>, StoreError>;

    fn save_round_settings(&mut self, settings: &RoundSettings) -> Result<(), StoreError>;

    fn append_click(&mut self, click: &ClickRecord) -> Result<(), StoreError>;

    fn clicks_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ClickRecord>, StoreError>;
}

/// In-memory store used by kernel tests and local CLI inspection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    participants: BTreeMap<String, Participant>,
    settings: Option<RoundSettings>,
    clicks: Vec<ClickRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParticipantStore for MemoryStore {
    fn participant(&self, participant_id: &str) -> Result<Option<Participant>, StoreError> {
        Ok(self.participants.get(participant_id).cloned())
    }

    fn upsert_participant(&mut self, participant: &Participant) -> Result<(), StoreError> {
        self.participants
            .insert(participant.participant_id.clone(), participant.clone());
        Ok(())
    }

    fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        Ok(self.participants.values().cloned().collect())
    }

    fn count_by_status(&self, status: ParticipantStatus) -> Result<usize, StoreError> {
        Ok(self
            .participants
            .values()
            .filter(|participant| participant.status == status)
            .count())
    }

    fn clear_participants(&mut self) -> Result<(), StoreError> {
        self.participants.clear();
        Ok(())
    }

    fn round_settings(&self) -> Result<Option<RoundSettings>, StoreError> {
        Ok(self.settings.clone())
    }

    fn save_round_settings(&mut self, settings: &RoundSettings) -> Result<(), StoreError> {
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn append_click(&mut self, click: &ClickRecord) -> Result<(), StoreError> {
        self.clicks.push(click.clone());
        Ok(())
    }

    fn clicks_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ClickRecord>, StoreError> {
        Ok(self
            .clicks
            .iter()
            .filter(|click| click.participant_id == participant_id)
            .cloned()
            .collect())
    }
}
