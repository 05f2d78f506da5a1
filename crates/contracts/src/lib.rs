//! v1 cross-boundary contracts for the hunt kernel, API, persistence, and
//! connected admin/player views.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Round-1 admission quota: only the first 15 valid claims qualify.
pub const QUALIFY_QUOTA: usize = 15;

/// Current wall-clock time in unix milliseconds.
///
/// Never used by link assignment (which must stay clock-free); only record
/// timestamps and event stamps go through here.
pub fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Playing,
    Qualified,
    Failed,
    Disqualified,
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Qualified => "qualified",
            Self::Failed => "failed",
            Self::Disqualified => "disqualified",
        }
    }
}

/// How a qualification was earned. `None` on a participant record means the
/// record predates this field; `elapsed_ms == 0` keeps its historical
/// double meaning for such records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualificationMethod {
    Timed,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub schema_version: String,
    pub participant_id: String,
    pub display_name: String,
    pub status: ParticipantStatus,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub qualification: Option<QualificationMethod>,
    pub registered_at_ms: u64,
}

impl Participant {
    pub fn new(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        registered_at_ms: u64,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            status: ParticipantStatus::Playing,
            elapsed_ms: 0,
            qualification: None,
            registered_at_ms,
        }
    }
}

/// Singleton round record. Exactly one exists; absence self-heals to an
/// inactive round on first read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundSettings {
    pub schema_version: String,
    pub active_round: u8,
    pub last_updated_ms: u64,
}

impl RoundSettings {
    pub fn inactive(now_ms: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            active_round: 0,
            last_updated_ms: now_ms,
        }
    }
}

/// One slot of the fixed content surface where a hidden link may appear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentResult {
    pub page: String,
    pub section: String,
    pub position: String,
    pub link_id: String,
    pub visible: bool,
    pub is_real: bool,
    pub destination: String,
}

/// Append-only audit entry; never read on the gameplay path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClickRecord {
    pub participant_id: String,
    pub link_id: String,
    pub recorded_at_ms: u64,
    pub was_genuine: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RoundChanged,
    ParticipantQualified,
    ParticipantUpdated,
    ParticipantDisqualified,
    GameReset,
}

/// Delivery scope for a published event. Admin views receive both rooms;
/// player views receive `Broadcast` plus events targeted at their own id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    Admin,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameEvent {
    pub schema_version: String,
    pub event_id: String,
    pub sequence: u64,
    pub event_type: EventType,
    pub room: Room,
    /// Present when a copy of the event must reach one specific player's
    /// channel in addition to the room.
    pub participant_id: Option<String>,
    pub created_at_ms: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidRound,
    InvalidDestination,
    ParticipantNotFound,
    RoundNotActive,
    Unauthorized,
    StoreUnavailable,
    QuotaInvariantViolated,
    InternalError,
}

impl ErrorCode {
    /// True for failures the same caller may retry unchanged with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{:?}: {} ({details})", self.error_code, self.message),
            None => write!(f, "{:?}: {}", self.error_code, self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualifyRequest {
    pub participant_id: String,
    pub display_name: Option<String>,
    pub claimed_destination: String,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualQualifyRequest {
    pub participant_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetRoundRequest {
    pub round: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisqualifyRequest {
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClickRequest {
    pub participant_id: String,
    pub link_id: String,
    #[serde(default)]
    pub was_genuine: bool,
}

/// Outcome of a qualification attempt. `qualified: false` with a populated
/// participant is the "too late" path, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualifyOutcome {
    pub schema_version: String,
    pub qualified: bool,
    pub message: String,
    pub participant: Participant,
}

impl QualifyOutcome {
    pub fn new(qualified: bool, message: impl Into<String>, participant: Participant) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            qualified,
            message: message.into(),
            participant,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantStats {
    pub total: usize,
    pub qualified: usize,
    pub playing: usize,
    pub failed: usize,
    pub disqualified: usize,
}

/// Full admin view of the game: roster newest-first, the round record, and
/// aggregate counts for the dashboard header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub schema_version: String,
    pub participants: Vec<Participant>,
    pub round_settings: RoundSettings,
    pub stats: ParticipantStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_serde_round_trips_without_qualification_field() {
        let raw = r#"{
            "schema_version": "1.0",
            "participant_id": "p-1",
            "display_name": "Asha",
            "status": "playing",
            "elapsed_ms": 0,
            "registered_at_ms": 1000
        }"#;

        let participant: Participant = serde_json::from_str(raw).expect("legacy record parses");
        assert_eq!(participant.qualification, None);
        assert_eq!(participant.status, ParticipantStatus::Playing);
    }

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(!ErrorCode::RoundNotActive.is_retryable());
        assert!(!ErrorCode::InvalidDestination.is_retryable());
        assert!(!ErrorCode::QuotaInvariantViolated.is_retryable());
    }

    #[test]
    fn qualify_request_defaults_elapsed_to_zero() {
        let raw = r#"{"participant_id":"p-2","display_name":null,"claimed_destination":"/roundtwo-x"}"#;
        let request: QualifyRequest = serde_json::from_str(raw).expect("request parses");
        assert_eq!(request.elapsed_ms, 0);
    }
}
