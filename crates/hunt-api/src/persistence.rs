use std::path::Path;
use std::time::Duration;

use contracts::{
    ClickRecord, Participant, ParticipantStatus, QualificationMethod, RoundSettings,
};
use hunt_core::store::{ParticipantStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed participant store. One connection, WAL mode, and a busy
/// timeout so a contended database surfaces as a transient error instead of
/// an immediate failure or an indefinite block.
#[derive(Debug)]
pub struct SqliteParticipantStore {
    conn: Connection,
}

impl SqliteParticipantStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), StoreError> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite_error)?;
        self.conn
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_error)?;
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(map_sqlite_error)?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS participants (
                    participant_id TEXT PRIMARY KEY,
                    schema_version TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    elapsed_ms INTEGER NOT NULL,
                    qualification TEXT,
                    registered_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS round_settings (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    schema_version TEXT NOT NULL,
                    active_round INTEGER NOT NULL,
                    last_updated_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS link_clicks (
                    click_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    participant_id TEXT NOT NULL,
                    link_id TEXT NOT NULL,
                    recorded_at_ms INTEGER NOT NULL,
                    was_genuine INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_participants_status
                    ON participants(status);
                CREATE INDEX IF NOT EXISTS idx_link_clicks_participant
                    ON link_clicks(participant_id, recorded_at_ms);
                ",
            )
            .map_err(map_sqlite_error)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, name)
                 VALUES(1, 'initial_v1')",
                [],
            )
            .map_err(map_sqlite_error)?;

        Ok(())
    }
}

impl ParticipantStore for SqliteParticipantStore {
    fn participant(&self, participant_id: &str) -> Result<Option<Participant>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT participant_id, schema_version, display_name, status,
                        elapsed_ms, qualification, registered_at_ms
                 FROM participants
                 WHERE participant_id = ?1",
                params![participant_id],
                participant_row,
            )
            .optional()
            .map_err(map_sqlite_error)?;

        row.map(participant_from_row).transpose()
    }

    fn upsert_participant(&mut self, participant: &Participant) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO participants (
                    participant_id,
                    schema_version,
                    display_name,
                    status,
                    elapsed_ms,
                    qualification,
                    registered_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(participant_id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    display_name = excluded.display_name,
                    status = excluded.status,
                    elapsed_ms = excluded.elapsed_ms,
                    qualification = excluded.qualification,
                    registered_at_ms = excluded.registered_at_ms",
                params![
                    participant.participant_id.as_str(),
                    participant.schema_version.as_str(),
                    participant.display_name.as_str(),
                    participant.status.as_str(),
                    i64::try_from(participant.elapsed_ms).unwrap_or(i64::MAX),
                    participant.qualification.map(qualification_label),
                    i64::try_from(participant.registered_at_ms).unwrap_or(i64::MAX),
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(())
    }

    fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT participant_id, schema_version, display_name, status,
                        elapsed_ms, qualification, registered_at_ms
                 FROM participants",
            )
            .map_err(map_sqlite_error)?;

        let rows = stmt
            .query_map([], participant_row)
            .map_err(map_sqlite_error)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(participant_from_row(row.map_err(map_sqlite_error)?)?);
        }

        Ok(participants)
    }

    fn count_by_status(&self, status: ParticipantStatus) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM participants WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn clear_participants(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM participants", [])
            .map_err(map_sqlite_error)?;
        Ok(())
    }

    fn round_settings(&self) -> Result<Option<RoundSettings>, StoreError> {
        self.conn
            .query_row(
                "SELECT schema_version, active_round, last_updated_ms
                 FROM round_settings
                 WHERE id = 1",
                [],
                |row| {
                    Ok(RoundSettings {
                        schema_version: row.get(0)?,
                        active_round: row.get::<_, i64>(1)? as u8,
                        last_updated_ms: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                },
            )
            .optional()
            .map_err(map_sqlite_error)
    }

    fn save_round_settings(&mut self, settings: &RoundSettings) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO round_settings (id, schema_version, active_round, last_updated_ms)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    active_round = excluded.active_round,
                    last_updated_ms = excluded.last_updated_ms",
                params![
                    settings.schema_version.as_str(),
                    i64::from(settings.active_round),
                    i64::try_from(settings.last_updated_ms).unwrap_or(i64::MAX),
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(())
    }

    fn append_click(&mut self, click: &ClickRecord) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO link_clicks (participant_id, link_id, recorded_at_ms, was_genuine)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    click.participant_id.as_str(),
                    click.link_id.as_str(),
                    i64::try_from(click.recorded_at_ms).unwrap_or(i64::MAX),
                    if click.was_genuine { 1_i64 } else { 0_i64 },
                ],
            )
            .map_err(map_sqlite_error)?;

        Ok(())
    }

    fn clicks_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ClickRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT participant_id, link_id, recorded_at_ms, was_genuine
                 FROM link_clicks
                 WHERE participant_id = ?1
                 ORDER BY recorded_at_ms DESC, click_id DESC",
            )
            .map_err(map_sqlite_error)?;

        let rows = stmt
            .query_map(params![participant_id], |row| {
                Ok(ClickRecord {
                    participant_id: row.get(0)?,
                    link_id: row.get(1)?,
                    recorded_at_ms: row.get::<_, i64>(2)?.max(0) as u64,
                    was_genuine: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(map_sqlite_error)?;

        let mut clicks = Vec::new();
        for row in rows {
            clicks.push(row.map_err(map_sqlite_error)?);
        }

        Ok(clicks)
    }
}

type ParticipantRow = (String, String, String, String, i64, Option<String>, i64);

fn participant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn participant_from_row(row: ParticipantRow) -> Result<Participant, StoreError> {
    let (participant_id, schema_version, display_name, status, elapsed_ms, qualification, registered_at_ms) =
        row;

    Ok(Participant {
        schema_version,
        participant_id,
        display_name,
        status: status_from_label(&status)?,
        elapsed_ms: elapsed_ms.max(0) as u64,
        qualification: qualification
            .as_deref()
            .map(qualification_from_label)
            .transpose()?,
        registered_at_ms: registered_at_ms.max(0) as u64,
    })
}

fn status_from_label(label: &str) -> Result<ParticipantStatus, StoreError> {
    match label {
        "playing" => Ok(ParticipantStatus::Playing),
        "qualified" => Ok(ParticipantStatus::Qualified),
        "failed" => Ok(ParticipantStatus::Failed),
        "disqualified" => Ok(ParticipantStatus::Disqualified),
        other => Err(StoreError::Internal(format!(
            "unknown participant status in store: {other}"
        ))),
    }
}

fn qualification_label(method: QualificationMethod) -> &'static str {
    match method {
        QualificationMethod::Timed => "timed",
        QualificationMethod::Manual => "manual",
    }
}

fn qualification_from_label(label: &str) -> Result<QualificationMethod, StoreError> {
    match label {
        "timed" => Ok(QualificationMethod::Timed),
        "manual" => Ok(QualificationMethod::Manual),
        other => Err(StoreError::Internal(format!(
            "unknown qualification method in store: {other}"
        ))),
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
        if matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::Transient(
                message
                    .clone()
                    .unwrap_or_else(|| "database is busy".to_string()),
            );
        }
    }

    StoreError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();

        std::env::temp_dir().join(format!("hunt_store_{name}_{nanos}.sqlite"))
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
    }

    #[test]
    fn participant_survives_reopen() {
        let path = temp_db_path("reopen");

        {
            let mut store = SqliteParticipantStore::open(&path).expect("store opens");
            let mut participant = Participant::new("p-1", "Asha", 12345);
            participant.status = ParticipantStatus::Qualified;
            participant.elapsed_ms = 61_500;
            participant.qualification = Some(QualificationMethod::Timed);
            store
                .upsert_participant(&participant)
                .expect("upsert succeeds");
        }

        let store = SqliteParticipantStore::open(&path).expect("store reopens");
        let loaded = store
            .participant("p-1")
            .expect("read succeeds")
            .expect("record survived restart");
        assert_eq!(loaded.display_name, "Asha");
        assert_eq!(loaded.status, ParticipantStatus::Qualified);
        assert_eq!(loaded.elapsed_ms, 61_500);
        assert_eq!(loaded.qualification, Some(QualificationMethod::Timed));
        assert_eq!(loaded.registered_at_ms, 12345);

        cleanup(&path);
    }

    #[test]
    fn upsert_overwrites_and_counts_by_status() {
        let path = temp_db_path("counts");
        let mut store = SqliteParticipantStore::open(&path).expect("store opens");

        for index in 0..4 {
            let mut participant =
                Participant::new(format!("p-{index}"), format!("Player {index}"), index);
            if index < 2 {
                participant.status = ParticipantStatus::Qualified;
            }
            store
                .upsert_participant(&participant)
                .expect("upsert succeeds");
        }

        assert_eq!(
            store
                .count_by_status(ParticipantStatus::Qualified)
                .expect("count succeeds"),
            2
        );

        let mut flipped = store
            .participant("p-0")
            .expect("read succeeds")
            .expect("record exists");
        flipped.status = ParticipantStatus::Disqualified;
        store.upsert_participant(&flipped).expect("upsert succeeds");

        assert_eq!(
            store
                .count_by_status(ParticipantStatus::Qualified)
                .expect("count succeeds"),
            1
        );
        assert_eq!(store.participants().expect("list succeeds").len(), 4);

        cleanup(&path);
    }

    #[test]
    fn round_settings_singleton_upserts() {
        let path = temp_db_path("round");
        let mut store = SqliteParticipantStore::open(&path).expect("store opens");

        assert!(store.round_settings().expect("read succeeds").is_none());

        let mut settings = RoundSettings::inactive(1000);
        store
            .save_round_settings(&settings)
            .expect("save succeeds");
        settings.active_round = 2;
        settings.last_updated_ms = 2000;
        store
            .save_round_settings(&settings)
            .expect("second save updates in place");

        let loaded = store
            .round_settings()
            .expect("read succeeds")
            .expect("singleton exists");
        assert_eq!(loaded.active_round, 2);
        assert_eq!(loaded.last_updated_ms, 2000);

        cleanup(&path);
    }

    #[test]
    fn clicks_are_append_only_and_filtered_by_participant() {
        let path = temp_db_path("clicks");
        let mut store = SqliteParticipantStore::open(&path).expect("store opens");

        for (participant_id, was_genuine) in [("p-1", false), ("p-1", true), ("p-2", false)] {
            store
                .append_click(&ClickRecord {
                    participant_id: participant_id.to_string(),
                    link_id: format!("link-{participant_id}-about-header-right"),
                    recorded_at_ms: 500,
                    was_genuine,
                })
                .expect("append succeeds");
        }

        let clicks = store
            .clicks_for_participant("p-1")
            .expect("clicks load");
        assert_eq!(clicks.len(), 2);
        assert!(clicks.iter().all(|click| click.participant_id == "p-1"));

        cleanup(&path);
    }
}
