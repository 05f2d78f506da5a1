//! The qualification state machine and quota authority.
//!
//! A single controller instance is the only mutator of quota-sensitive state;
//! callers serialize access to it (the server holds it behind one mutex), so
//! the count-then-admit step below is atomic with respect to concurrent
//! qualification attempts. Every mutation persists to the store before its
//! event is appended to the log, so observers never see an event whose
//! state change could still be lost.

use std::fmt;

use contracts::{
    unix_time_ms, ClickRecord, EventType, GameEvent, Participant, ParticipantStats,
    ParticipantStatus, QualificationMethod, QualifyOutcome, QualifyRequest, Room, RosterSnapshot,
    RoundSettings, QUALIFY_QUOTA, SCHEMA_VERSION_V1,
};
use serde_json::json;

use crate::assignment;
use crate::rounds::{self, ADMISSION_ROUND};
use crate::store::{ParticipantStore, StoreError};

const QUALIFIED_MESSAGE: &str = "Congratulations! You have qualified for round two.";
const ALREADY_QUALIFIED_MESSAGE: &str = "You have already qualified for round two.";
const TOO_LATE_MESSAGE: &str =
    "Better luck next time! All fifteen qualification spots are already taken.";

#[derive(Debug)]
pub enum AdmissionError {
    RoundNotActive { active_round: u8 },
    ParticipantNotFound { participant_id: String },
    InvalidDestination { claimed: String },
    InvalidRound { round: u8 },
    /// The qualified count exceeded the quota outside this controller.
    /// Fatal: the request is aborted rather than over-admitting.
    QuotaInvariantViolated { counted: usize },
    Store(StoreError),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundNotActive { active_round } => {
                write!(f, "round 1 is not active (current round: {active_round})")
            }
            Self::ParticipantNotFound { participant_id } => {
                write!(f, "participant not found: {participant_id}")
            }
            Self::InvalidDestination { claimed } => {
                write!(f, "destination is not a round-two link: {claimed}")
            }
            Self::InvalidRound { round } => {
                write!(f, "invalid round number: {round} (must be 0..=3)")
            }
            Self::QuotaInvariantViolated { counted } => {
                write!(
                    f,
                    "qualified count {counted} exceeds quota {QUALIFY_QUOTA}"
                )
            }
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<StoreError> for AdmissionError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug)]
pub struct AdmissionController<S> {
    store: S,
    event_log: Vec<GameEvent>,
    next_event_sequence: u64,
}

impl<S: ParticipantStore> AdmissionController<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            event_log: Vec::new(),
            next_event_sequence: 0,
        }
    }

    /// Append-only event log, oldest first. The API layer tracks how far it
    /// has broadcast and only ships the tail.
    pub fn events(&self) -> &[GameEvent] {
        &self.event_log
    }

    pub fn active_round(&mut self) -> Result<RoundSettings, AdmissionError> {
        Ok(rounds::load_or_init(&mut self.store)?)
    }

    pub fn set_active_round(&mut self, round: u8) -> Result<RoundSettings, AdmissionError> {
        if !rounds::is_valid_round(round) {
            return Err(AdmissionError::InvalidRound { round });
        }

        let settings = RoundSettings {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            active_round: round,
            last_updated_ms: unix_time_ms(),
        };
        self.store.save_round_settings(&settings)?;

        self.push_event(
            EventType::RoundChanged,
            Room::Broadcast,
            None,
            json!({ "active_round": round }),
        );

        Ok(settings)
    }

    /// Idempotent upsert. A re-registration may change the display name but
    /// never the status or timing fields.
    pub fn register(
        &mut self,
        participant_id: &str,
        display_name: &str,
    ) -> Result<Participant, AdmissionError> {
        match self.store.participant(participant_id)? {
            Some(mut existing) => {
                if existing.display_name != display_name {
                    existing.display_name = display_name.to_string();
                    self.store.upsert_participant(&existing)?;
                    self.push_participant_event(
                        EventType::ParticipantUpdated,
                        Room::Admin,
                        &existing,
                        "registration",
                    );
                }
                Ok(existing)
            }
            None => {
                let participant = Participant::new(participant_id, display_name, unix_time_ms());
                self.store.upsert_participant(&participant)?;
                self.push_participant_event(
                    EventType::ParticipantUpdated,
                    Room::Admin,
                    &participant,
                    "registration",
                );
                Ok(participant)
            }
        }
    }

    /// A participant claims to have reached their genuine link.
    pub fn attempt_qualify(
        &mut self,
        request: &QualifyRequest,
    ) -> Result<QualifyOutcome, AdmissionError> {
        self.require_admission_round()?;

        let participant =
            self.resolve_or_create(&request.participant_id, request.display_name.as_deref())?;

        if participant.status == ParticipantStatus::Qualified {
            return Ok(QualifyOutcome::new(
                true,
                ALREADY_QUALIFIED_MESSAGE,
                participant,
            ));
        }

        // Never trust the client's claim outright: recompute the assignment.
        let claimed = normalize_destination(&request.claimed_destination);
        if !is_genuine_claim(&request.participant_id, &claimed) {
            return Err(AdmissionError::InvalidDestination { claimed });
        }

        self.admit(participant, request.elapsed_ms, QualificationMethod::Timed)
    }

    /// Administrative qualification path; no destination to validate and no
    /// measured time. Still round-gated and quota-checked like any claim.
    pub fn manual_qualify(
        &mut self,
        participant_id: &str,
        display_name: Option<&str>,
    ) -> Result<QualifyOutcome, AdmissionError> {
        self.require_admission_round()?;

        let participant = self.resolve_or_create(participant_id, display_name)?;
        if participant.status == ParticipantStatus::Qualified {
            return Ok(QualifyOutcome::new(
                true,
                ALREADY_QUALIFIED_MESSAGE,
                participant,
            ));
        }

        self.admit(participant, 0, QualificationMethod::Manual)
    }

    /// Punitive and terminal: applies to any status, including Qualified,
    /// and the slot is NOT returned to the pool.
    pub fn disqualify(&mut self, participant_id: &str) -> Result<Participant, AdmissionError> {
        let Some(mut participant) = self.store.participant(participant_id)? else {
            return Err(AdmissionError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            });
        };

        participant.status = ParticipantStatus::Disqualified;
        self.store.upsert_participant(&participant)?;

        // Everyone hears about this one; the player's own client freezes.
        self.push_event(
            EventType::ParticipantDisqualified,
            Room::Broadcast,
            Some(participant.participant_id.clone()),
            json!({ "participant": participant }),
        );

        Ok(participant)
    }

    /// The only destructive operation: wipes the roster and deactivates the
    /// round. Click history survives for post-game audit.
    pub fn reset_game(&mut self) -> Result<(), AdmissionError> {
        self.store.clear_participants()?;

        let settings = RoundSettings::inactive(unix_time_ms());
        self.store.save_round_settings(&settings)?;

        self.push_event(
            EventType::GameReset,
            Room::Broadcast,
            None,
            json!({ "force_new_registration": true }),
        );

        Ok(())
    }

    /// Fire-and-forget audit insert. The caller decides what to do with a
    /// failure; gameplay flow never depends on it.
    pub fn record_click(
        &mut self,
        participant_id: &str,
        link_id: &str,
        was_genuine: bool,
    ) -> Result<(), StoreError> {
        let click = ClickRecord {
            participant_id: participant_id.to_string(),
            link_id: link_id.to_string(),
            recorded_at_ms: unix_time_ms(),
            was_genuine,
        };
        self.store.append_click(&click)
    }

    pub fn clicks_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ClickRecord>, AdmissionError> {
        Ok(self.store.clicks_for_participant(participant_id)?)
    }

    pub fn roster(&mut self) -> Result<RosterSnapshot, AdmissionError> {
        let mut participants = self.store.participants()?;
        participants.sort_by(|a, b| b.registered_at_ms.cmp(&a.registered_at_ms));

        let mut stats = ParticipantStats {
            total: participants.len(),
            ..ParticipantStats::default()
        };
        for participant in &participants {
            match participant.status {
                ParticipantStatus::Playing => stats.playing += 1,
                ParticipantStatus::Qualified => stats.qualified += 1,
                ParticipantStatus::Failed => stats.failed += 1,
                ParticipantStatus::Disqualified => stats.disqualified += 1,
            }
        }

        let round_settings = rounds::load_or_init(&mut self.store)?;

        Ok(RosterSnapshot {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            participants,
            round_settings,
            stats,
        })
    }

    fn require_admission_round(&mut self) -> Result<(), AdmissionError> {
        let settings = rounds::load_or_init(&mut self.store)?;
        if settings.active_round != ADMISSION_ROUND {
            return Err(AdmissionError::RoundNotActive {
                active_round: settings.active_round,
            });
        }
        Ok(())
    }

    fn resolve_or_create(
        &mut self,
        participant_id: &str,
        display_name: Option<&str>,
    ) -> Result<Participant, AdmissionError> {
        if let Some(existing) = self.store.participant(participant_id)? {
            return Ok(existing);
        }

        let Some(display_name) = display_name.filter(|name| !name.trim().is_empty()) else {
            return Err(AdmissionError::ParticipantNotFound {
                participant_id: participant_id.to_string(),
            });
        };

        let participant = Participant::new(participant_id, display_name, unix_time_ms());
        self.store.upsert_participant(&participant)?;
        Ok(participant)
    }

    /// The quota-sensitive step. Count, compare, then write exactly one
    /// status transition; the caller's lock makes the whole method atomic.
    fn admit(
        &mut self,
        mut participant: Participant,
        elapsed_ms: u64,
        method: QualificationMethod,
    ) -> Result<QualifyOutcome, AdmissionError> {
        let qualified_count = self.store.count_by_status(ParticipantStatus::Qualified)?;
        if qualified_count > QUALIFY_QUOTA {
            return Err(AdmissionError::QuotaInvariantViolated {
                counted: qualified_count,
            });
        }

        if qualified_count >= QUALIFY_QUOTA {
            participant.status = ParticipantStatus::Failed;
            self.store.upsert_participant(&participant)?;
            self.push_participant_event(
                EventType::ParticipantUpdated,
                Room::Admin,
                &participant,
                "quota_full",
            );
            return Ok(QualifyOutcome::new(false, TOO_LATE_MESSAGE, participant));
        }

        participant.status = ParticipantStatus::Qualified;
        participant.elapsed_ms = elapsed_ms;
        participant.qualification = Some(method);
        self.store.upsert_participant(&participant)?;

        // Admin room, plus a targeted copy for the player's own channel.
        self.push_event(
            EventType::ParticipantQualified,
            Room::Admin,
            Some(participant.participant_id.clone()),
            json!({ "participant": participant }),
        );

        Ok(QualifyOutcome::new(true, QUALIFIED_MESSAGE, participant))
    }

    fn push_participant_event(
        &mut self,
        event_type: EventType,
        room: Room,
        participant: &Participant,
        change: &str,
    ) {
        self.push_event(
            event_type,
            room,
            Some(participant.participant_id.clone()),
            json!({ "change": change, "participant": participant }),
        );
    }

    fn push_event(
        &mut self,
        event_type: EventType,
        room: Room,
        participant_id: Option<String>,
        payload: serde_json::Value,
    ) {
        self.next_event_sequence += 1;
        let sequence = self.next_event_sequence;

        self.event_log.push(GameEvent {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            event_id: format!("evt-{sequence:06}"),
            sequence,
            event_type,
            room,
            participant_id,
            created_at_ms: unix_time_ms(),
            payload,
        });
    }
}

/// Clean up a client-submitted destination the way browsers mangle it:
/// surrounding whitespace, a missing leading slash, or a full URL pasted
/// instead of a path.
fn normalize_destination(raw: &str) -> String {
    let mut cleaned = raw.trim().to_string();

    if let Some(scheme_end) = cleaned.find("://") {
        let after_scheme = &cleaned[scheme_end + 3..];
        cleaned = match after_scheme.find('/') {
            Some(slash) => after_scheme[slash..].to_string(),
            None => "/".to_string(),
        };
    }

    if !cleaned.starts_with('/') {
        cleaned.insert(0, '/');
    }

    cleaned
}

/// Server-side destination check. Exact entry paths and the recomputed
/// genuine target are authoritative; the prefix match is a documented
/// leniency for minor client-side formatting drift, not a bug.
fn is_genuine_claim(participant_id: &str, normalized: &str) -> bool {
    let lowered = normalized.to_ascii_lowercase();

    if assignment::ROUND_TWO_ENTRY_PATHS
        .iter()
        .any(|path| *path == lowered)
    {
        return true;
    }

    if let Some(genuine) = assignment::reachable_genuine_destination(participant_id) {
        if lowered == genuine {
            return true;
        }
    }

    lowered.starts_with(assignment::ROUND_TWO_ENTRY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn controller() -> AdmissionController<MemoryStore> {
        AdmissionController::new(MemoryStore::new())
    }

    fn active_controller() -> AdmissionController<MemoryStore> {
        let mut controller = controller();
        controller.set_active_round(1).expect("round 1 activates");
        controller
    }

    fn qualify_request(participant_id: &str, name: &str) -> QualifyRequest {
        QualifyRequest {
            participant_id: participant_id.to_string(),
            display_name: Some(name.to_string()),
            claimed_destination: assignment::ROUND_TWO_ENTRY_PATHS[0].to_string(),
            elapsed_ms: 42_000,
        }
    }

    #[test]
    fn attempt_fails_while_round_inactive() {
        let mut controller = controller();

        let err = controller
            .attempt_qualify(&qualify_request("p-1", "Asha"))
            .expect_err("inactive round rejects");
        assert!(matches!(err, AdmissionError::RoundNotActive { active_round: 0 }));
    }

    #[test]
    fn attempt_fails_in_rounds_two_and_three() {
        for round in [2, 3] {
            let mut controller = controller();
            controller.set_active_round(round).expect("round activates");

            let err = controller
                .attempt_qualify(&qualify_request("p-1", "Asha"))
                .expect_err("only round 1 admits");
            assert!(matches!(err, AdmissionError::RoundNotActive { .. }));
        }
    }

    #[test]
    fn set_active_round_rejects_out_of_range() {
        let mut controller = controller();
        let err = controller
            .set_active_round(4)
            .expect_err("round 4 does not exist");
        assert!(matches!(err, AdmissionError::InvalidRound { round: 4 }));
    }

    #[test]
    fn unknown_participant_without_name_is_not_found() {
        let mut controller = active_controller();

        let mut request = qualify_request("ghost", "");
        request.display_name = None;

        let err = controller
            .attempt_qualify(&request)
            .expect_err("no record, no name");
        assert!(matches!(err, AdmissionError::ParticipantNotFound { .. }));
    }

    #[test]
    fn unknown_participant_with_name_is_created_and_admitted() {
        let mut controller = active_controller();

        let outcome = controller
            .attempt_qualify(&qualify_request("new-p", "Noor"))
            .expect("claim succeeds");
        assert!(outcome.qualified);
        assert_eq!(outcome.participant.status, ParticipantStatus::Qualified);
        assert_eq!(outcome.participant.elapsed_ms, 42_000);
        assert_eq!(
            outcome.participant.qualification,
            Some(QualificationMethod::Timed)
        );
    }

    #[test]
    fn bogus_destination_is_rejected() {
        let mut controller = active_controller();

        let mut request = qualify_request("p-1", "Asha");
        request.claimed_destination = "/decoy/page3".to_string();

        let err = controller
            .attempt_qualify(&request)
            .expect_err("decoy does not qualify");
        assert!(matches!(err, AdmissionError::InvalidDestination { .. }));
    }

    #[test]
    fn pasted_full_url_is_normalized_before_validation() {
        let mut controller = active_controller();

        let mut request = qualify_request("p-1", "Asha");
        request.claimed_destination =
            format!("https://hunt.example.com{}", assignment::ROUND_TWO_ENTRY_PATHS[3]);

        let outcome = controller
            .attempt_qualify(&request)
            .expect("host prefix is stripped");
        assert!(outcome.qualified);
    }

    #[test]
    fn prefix_fallback_accepts_drifted_entry_path() {
        let mut controller = active_controller();

        let mut request = qualify_request("p-1", "Asha");
        request.claimed_destination = "roundtwo-freshly-minted-token".to_string();

        let outcome = controller
            .attempt_qualify(&request)
            .expect("lenient prefix match");
        assert!(outcome.qualified);
    }

    #[test]
    fn requalification_is_idempotent() {
        let mut controller = active_controller();

        let first = controller
            .attempt_qualify(&qualify_request("p-1", "Asha"))
            .expect("first claim");
        assert!(first.qualified);
        let events_after_first = controller.events().len();

        let mut replay = qualify_request("p-1", "Asha");
        replay.elapsed_ms = 99_999;
        let second = controller.attempt_qualify(&replay).expect("replayed claim");

        assert!(second.qualified);
        assert_eq!(second.participant.elapsed_ms, 42_000, "time must not change");
        assert_eq!(
            controller.events().len(),
            events_after_first,
            "no duplicate qualification event"
        );
        assert_eq!(
            controller
                .roster()
                .expect("roster loads")
                .stats
                .qualified,
            1
        );
    }

    #[test]
    fn quota_admits_fifteen_and_fails_the_rest() {
        let mut controller = active_controller();

        for index in 0..20 {
            let outcome = controller
                .attempt_qualify(&qualify_request(
                    &format!("p-{index}"),
                    &format!("Player {index}"),
                ))
                .expect("claim processes");
            assert_eq!(outcome.qualified, index < QUALIFY_QUOTA);
        }

        let stats = controller.roster().expect("roster loads").stats;
        assert_eq!(stats.qualified, 15);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.playing, 0);
    }

    #[test]
    fn quota_failure_is_a_non_qualifying_success() {
        let mut controller = active_controller();
        for index in 0..QUALIFY_QUOTA {
            controller
                .attempt_qualify(&qualify_request(&format!("p-{index}"), "Player"))
                .expect("claim processes");
        }

        let outcome = controller
            .attempt_qualify(&qualify_request("p-late", "Latecomer"))
            .expect("late claim still succeeds");
        assert!(!outcome.qualified);
        assert_eq!(outcome.participant.status, ParticipantStatus::Failed);
    }

    #[test]
    fn disqualification_is_terminal_and_does_not_release_the_slot() {
        let mut controller = active_controller();
        for index in 0..QUALIFY_QUOTA {
            controller
                .attempt_qualify(&qualify_request(&format!("p-{index}"), "Player"))
                .expect("claim processes");
        }

        let disqualified = controller.disqualify("p-0").expect("admin override");
        assert_eq!(disqualified.status, ParticipantStatus::Disqualified);

        // The freed-looking slot must not admit a sixteenth participant.
        let outcome = controller
            .attempt_qualify(&qualify_request("p-16", "Sixteenth"))
            .expect("claim processes");
        assert!(!outcome.qualified);

        let stats = controller.roster().expect("roster loads").stats;
        assert_eq!(stats.qualified, 14);
        assert_eq!(stats.disqualified, 1);
    }

    #[test]
    fn disqualify_unknown_participant_is_not_found() {
        let mut controller = active_controller();
        let err = controller
            .disqualify("ghost")
            .expect_err("nothing to disqualify");
        assert!(matches!(err, AdmissionError::ParticipantNotFound { .. }));
    }

    #[test]
    fn round_switch_preserves_existing_qualifications() {
        let mut controller = active_controller();
        for index in 0..10 {
            controller
                .attempt_qualify(&qualify_request(&format!("p-{index}"), "Player"))
                .expect("claim processes");
        }

        controller.set_active_round(2).expect("round 2 activates");

        let err = controller
            .attempt_qualify(&qualify_request("p-new", "New Player"))
            .expect_err("round 2 does not admit");
        assert!(matches!(err, AdmissionError::RoundNotActive { active_round: 2 }));

        let stats = controller.roster().expect("roster loads").stats;
        assert_eq!(stats.qualified, 10);
    }

    #[test]
    fn reset_clears_roster_and_deactivates_round() {
        let mut controller = active_controller();
        controller
            .attempt_qualify(&qualify_request("p-1", "Asha"))
            .expect("claim processes");

        controller.reset_game().expect("reset succeeds");

        let roster = controller.roster().expect("roster loads");
        assert!(roster.participants.is_empty());
        assert_eq!(roster.round_settings.active_round, 0);

        let last_event = controller.events().last().expect("reset event logged");
        assert_eq!(last_event.event_type, EventType::GameReset);
        assert_eq!(last_event.room, Room::Broadcast);
    }

    #[test]
    fn manual_qualification_marks_method_and_zero_time() {
        let mut controller = active_controller();

        let outcome = controller
            .manual_qualify("p-1", Some("Asha"))
            .expect("manual path admits");
        assert!(outcome.qualified);
        assert_eq!(outcome.participant.elapsed_ms, 0);
        assert_eq!(
            outcome.participant.qualification,
            Some(QualificationMethod::Manual)
        );
    }

    #[test]
    fn register_is_an_idempotent_upsert() {
        let mut controller = controller();

        let created = controller.register("p-1", "Asha").expect("first register");
        assert_eq!(created.status, ParticipantStatus::Playing);
        let registered_at = created.registered_at_ms;

        let renamed = controller
            .register("p-1", "Asha R")
            .expect("re-register with new name");
        assert_eq!(renamed.display_name, "Asha R");
        assert_eq!(renamed.registered_at_ms, registered_at);
        assert_eq!(
            controller.roster().expect("roster loads").stats.total,
            1
        );
    }

    #[test]
    fn qualification_event_targets_the_player_and_the_admin_room() {
        let mut controller = active_controller();
        controller
            .attempt_qualify(&qualify_request("p-1", "Asha"))
            .expect("claim processes");

        let event = controller
            .events()
            .iter()
            .find(|event| event.event_type == EventType::ParticipantQualified)
            .expect("qualification event logged");
        assert_eq!(event.room, Room::Admin);
        assert_eq!(event.participant_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn event_sequence_is_monotonic() {
        let mut controller = active_controller();
        controller.register("p-1", "Asha").expect("register");
        controller
            .attempt_qualify(&qualify_request("p-1", "Asha"))
            .expect("claim processes");

        let sequences: Vec<u64> = controller.events().iter().map(|event| event.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sequences, sorted);
    }
}
