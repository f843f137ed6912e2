use chrono::{DateTime, SecondsFormat, Utc};
use quest_core::{
    apply_action, ActionOutcome, ActionRequest, ActivityStreams, Clock, GamificationRecord,
    LeaderboardCandidate, LearnerPatch, LearnerProgress, LearnerState, ProgressionRules,
    RawCatalog, SystemClock, TimePeriod,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::channels::{lock, Channels};
use crate::ledger::ActivityRecord;
use crate::{LearnerProfile, ProgressRepository, StoreError, Subscription};

pub const PROGRESS_SCHEMA_VERSION: i64 = 1;

/// File-backed store. SQLite has no change feed of its own, so the store
/// publishes to its subscribers after each committed transaction, still
/// holding the connection lock so publishes follow commit order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    channels: Channels,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            channels: Channels::new(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        schema_version(&lock(&self.conn))
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StoreError> {
        let count: i64 = lock(&self.conn).query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Replaces the stored catalog. Entries are kept verbatim; validation
    /// happens when they are read into a `Catalog`.
    pub fn seed_catalog(&self, catalog: &RawCatalog) -> Result<(), StoreError> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM catalog_entries", [])?;
        for (kind, entries) in [("badge", &catalog.badges), ("title", &catalog.titles)] {
            for (position, entry) in entries.iter().enumerate() {
                tx.execute(
                    "INSERT INTO catalog_entries (kind, position, body_json) VALUES (?1, ?2, ?3)",
                    params![kind, position as i64, serde_json::to_string(entry)?],
                )?;
            }
        }
        tx.commit()?;
        self.channels.catalog.publish(&(), catalog.clone());
        Ok(())
    }

    pub fn record_activity(&self, learner_id: &str, record: &ActivityRecord) -> Result<(), StoreError> {
        let conn = lock(&self.conn);
        conn.execute(
            "
            INSERT INTO activity_records (learner_id, stream, record_id, body_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(learner_id, stream, record_id) DO UPDATE SET
                body_json=excluded.body_json
            ",
            params![
                learner_id,
                record.stream(),
                record.id(),
                serde_json::to_string(record)?,
            ],
        )?;
        let streams = load_activity(&conn, learner_id)?;
        self.channels.activity.publish(&learner_id.to_string(), streams);
        Ok(())
    }
}

impl ProgressRepository for SqliteStore {
    fn initialize_learner(&self, profile: &LearnerProfile) -> Result<LearnerProgress, StoreError> {
        let now = self.clock.now();
        let mut conn = lock(&self.conn);
        let (state, created) = {
            let tx = conn.transaction()?;
            let created = match load_state(&tx, &profile.learner_id)? {
                Some(_) => false,
                None => {
                    tx.execute(
                        "
                        INSERT INTO learners (
                            learner_id, name, role, progress_json, gamification_json, updated_at
                        ) VALUES (?1, ?2, ?3, '{}', '{}', ?4)
                        ",
                        params![
                            profile.learner_id,
                            profile.name,
                            profile.role,
                            encode_ts(now),
                        ],
                    )?;
                    save_state(&tx, &profile.learner_id, &LearnerState::default(), now)?;
                    true
                }
            };
            let state = load_state(&tx, &profile.learner_id)?
                .ok_or_else(|| StoreError::NotFound(profile.learner_id.clone()))?;
            tx.commit()?;
            (state, created)
        };
        if created {
            self.channels.publish_state(&profile.learner_id, &state);
            self.channels
                .publish_leaderboards(|period| load_candidates(&conn, period, now));
        }
        Ok(state.progress)
    }

    fn read_learner(&self, learner_id: &str) -> Result<LearnerProgress, StoreError> {
        let conn = lock(&self.conn);
        load_state(&conn, learner_id)?
            .map(|state| state.progress)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))
    }

    fn read_gamification(&self, learner_id: &str) -> Result<GamificationRecord, StoreError> {
        let conn = lock(&self.conn);
        load_state(&conn, learner_id)?
            .map(|state| state.gamification)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))
    }

    fn write_learner(
        &self,
        learner_id: &str,
        patch: &LearnerPatch,
    ) -> Result<LearnerProgress, StoreError> {
        let now = self.clock.now();
        let mut conn = lock(&self.conn);
        let progress = {
            let tx = conn.transaction()?;
            let mut state = load_state(&tx, learner_id)?
                .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
            let previous_xp = state.progress.xp;
            patch.apply_to(&mut state.progress)?;
            let gained = state.progress.xp - previous_xp;
            save_state(&tx, learner_id, &state, now)?;
            if gained > 0 {
                insert_ledger(&tx, learner_id, gained, "patch", now)?;
            }
            tx.commit()?;
            state.progress
        };
        self.channels
            .learners
            .publish(&learner_id.to_string(), progress.clone());
        // Boards also show level and streak, so any committed write refreshes them.
        self.channels
            .publish_leaderboards(|period| load_candidates(&conn, period, now));
        Ok(progress)
    }

    fn apply_action(
        &self,
        learner_id: &str,
        request: &ActionRequest,
        rules: &ProgressionRules,
    ) -> Result<ActionOutcome, StoreError> {
        let now = self.clock.now();
        let mut conn = lock(&self.conn);
        let (outcome, state) = {
            let tx = conn.transaction()?;
            let mut state = load_state(&tx, learner_id)?
                .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
            let outcome = apply_action(&mut state, request, rules, now);
            save_state(&tx, learner_id, &state, now)?;
            if outcome.xp_awarded > 0 {
                insert_ledger(&tx, learner_id, outcome.xp_awarded, request.kind.as_str(), now)?;
            }
            tx.commit()?;
            (outcome, state)
        };
        self.channels.publish_state(learner_id, &state);
        if outcome.xp_awarded > 0 {
            self.channels
                .publish_leaderboards(|period| load_candidates(&conn, period, now));
        }
        Ok(outcome)
    }

    fn subscribe_learner(&self, learner_id: &str) -> Result<Subscription<LearnerProgress>, StoreError> {
        let conn = lock(&self.conn);
        let progress = load_state(&conn, learner_id)?
            .map(|state| state.progress)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        Ok(self
            .channels
            .learners
            .subscribe(&learner_id.to_string(), || progress))
    }

    fn subscribe_gamification(
        &self,
        learner_id: &str,
    ) -> Result<Subscription<GamificationRecord>, StoreError> {
        let conn = lock(&self.conn);
        let record = load_state(&conn, learner_id)?
            .map(|state| state.gamification)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        Ok(self
            .channels
            .gamification
            .subscribe(&learner_id.to_string(), || record))
    }

    fn subscribe_catalog(&self) -> Result<Subscription<RawCatalog>, StoreError> {
        let conn = lock(&self.conn);
        let catalog = load_catalog(&conn)?;
        Ok(self.channels.catalog.subscribe(&(), || catalog))
    }

    fn subscribe_activity(&self, learner_id: &str) -> Result<Subscription<ActivityStreams>, StoreError> {
        let conn = lock(&self.conn);
        let streams = load_activity(&conn, learner_id)?;
        Ok(self
            .channels
            .activity
            .subscribe(&learner_id.to_string(), || streams))
    }

    fn subscribe_leaderboard(
        &self,
        period: TimePeriod,
    ) -> Result<Subscription<Vec<LeaderboardCandidate>>, StoreError> {
        let conn = lock(&self.conn);
        let candidates = load_candidates(&conn, period, self.clock.now())?;
        Ok(self.channels.leaderboards.subscribe(&period, || candidates))
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > PROGRESS_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: PROGRESS_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_progress_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

/// Fixed-width UTC so stored timestamps compare correctly as text.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn load_state(conn: &Connection, learner_id: &str) -> Result<Option<LearnerState>, StoreError> {
    let row = conn
        .query_row(
            "SELECT progress_json, gamification_json FROM learners WHERE learner_id = ?1",
            [learner_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((progress_json, gamification_json)) = row else {
        return Ok(None);
    };

    let progress = LearnerProgress::from_value(serde_json::from_str::<Value>(&progress_json)?)?;
    let gamification = serde_json::from_str::<GamificationRecord>(&gamification_json)?;
    Ok(Some(LearnerState {
        progress,
        gamification,
    }))
}

fn save_state(
    conn: &Connection,
    learner_id: &str,
    state: &LearnerState,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let updated = conn.execute(
        "
        UPDATE learners
        SET progress_json = ?2, gamification_json = ?3, updated_at = ?4
        WHERE learner_id = ?1
        ",
        params![
            learner_id,
            serde_json::to_string(&state.progress)?,
            serde_json::to_string(&state.gamification)?,
            encode_ts(now),
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(learner_id.to_string()));
    }
    Ok(())
}

fn insert_ledger(
    conn: &Connection,
    learner_id: &str,
    amount: u64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO xp_ledger (learner_id, amount, reason, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        params![learner_id, amount as i64, reason, encode_ts(now)],
    )?;
    Ok(())
}

fn load_catalog(conn: &Connection) -> Result<RawCatalog, StoreError> {
    let mut stmt =
        conn.prepare("SELECT kind, body_json FROM catalog_entries ORDER BY kind, position")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut catalog = RawCatalog::default();
    for row in rows {
        let (kind, body_json) = row?;
        // Unparseable bodies become nulls and are skipped at validation.
        let value = serde_json::from_str::<Value>(&body_json).unwrap_or(Value::Null);
        match kind.as_str() {
            "badge" => catalog.badges.push(value),
            _ => catalog.titles.push(value),
        }
    }
    Ok(catalog)
}

fn load_activity(conn: &Connection, learner_id: &str) -> Result<ActivityStreams, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT body_json FROM activity_records WHERE learner_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map([learner_id], |row| row.get::<_, String>(0))?;

    let mut streams = ActivityStreams::default();
    for row in rows {
        let record = serde_json::from_str::<ActivityRecord>(&row?)?;
        record.merge_into(&mut streams);
    }
    Ok(streams)
}

fn load_candidates(
    conn: &Connection,
    period: TimePeriod,
    now: DateTime<Utc>,
) -> Result<Vec<LeaderboardCandidate>, StoreError> {
    let since = period.window_start(now).map(encode_ts);
    let mut stmt = conn.prepare(
        "
        SELECT l.learner_id, l.name, l.role, l.progress_json,
               COALESCE((
                   SELECT SUM(x.amount) FROM xp_ledger x
                   WHERE x.learner_id = l.learner_id
                     AND (?1 IS NULL OR x.recorded_at >= ?1)
               ), 0)
        FROM learners l
        ORDER BY l.learner_id
        ",
    )?;
    let rows = stmt.query_map([since], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut candidates = Vec::new();
    for row in rows {
        let (id, name, role, progress_json, ledger_points) = row?;
        let progress = LearnerProgress::from_value(serde_json::from_str::<Value>(&progress_json)?)?;
        let points = match period {
            TimePeriod::AllTime => progress.xp,
            _ => u64::try_from(ledger_points).unwrap_or(0),
        };
        candidates.push(LeaderboardCandidate {
            id,
            name,
            points,
            level: progress.level,
            streak: progress.streak,
            role: Some(role),
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_core::{ActionKind, ManualClock};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn migration_creates_progress_tables() {
        let store = SqliteStore::open_in_memory().expect("open db");
        for table in ["learners", "xp_ledger", "catalog_entries", "activity_records"] {
            assert!(store.table_exists(table).expect("table check"));
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            PROGRESS_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        assert!(matches!(
            SqliteStore::open(file.path()),
            Err(StoreError::UnsupportedSchemaVersion { found: 9, .. })
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = SqliteStore::open(file.path())
                .expect("open")
                .with_clock(Arc::new(ManualClock::new(ts(0))));
            store
                .initialize_learner(&LearnerProfile::student("amy", "Amy"))
                .expect("init");
            store
                .apply_action(
                    "amy",
                    &ActionRequest::new(ActionKind::QuizCompleted).with_score(85),
                    &ProgressionRules::default(),
                )
                .expect("apply");
        }

        let store = SqliteStore::open(file.path()).expect("reopen");
        let progress = store.read_learner("amy").expect("read");
        assert!(progress.xp >= 75);
        assert!(progress.unlocked_badges.contains("quiz_first"));
        let gamification = store.read_gamification("amy").expect("read");
        assert_eq!(gamification.counters.quizzes_completed, 1);
        assert!(!gamification.missions.is_empty());
    }

    #[test]
    fn legacy_progress_documents_are_read_leniently() {
        let store = SqliteStore::open_in_memory().expect("open");
        lock(&store.conn)
            .execute(
                "
                INSERT INTO learners (learner_id, name, role, progress_json, gamification_json, updated_at)
                VALUES ('old', 'Old', 'student', ?1, '{}', '2024-01-01T00:00:00.000Z')
                ",
                [r#"{"xp": 120, "badges": [{"badgeId": "doc_first"}], "currentTitleId": "title_newbie"}"#],
            )
            .expect("insert legacy row");

        let progress = store.read_learner("old").expect("read");
        assert_eq!(progress.xp, 120);
        assert!(progress.unlocked_badges.contains("doc_first"));
        assert_eq!(progress.equipped_title_id, "title_newbie");
    }

    #[test]
    fn records_with_null_fields_stay_writable() {
        let store = SqliteStore::open_in_memory().expect("open");
        lock(&store.conn)
            .execute(
                "
                INSERT INTO learners (learner_id, name, role, progress_json, gamification_json, updated_at)
                VALUES ('old', 'Old', 'student', ?1, '{}', '2024-01-01T00:00:00.000Z')
                ",
                [r#"{"xp": 120, "level": null, "equippedTitleId": null}"#],
            )
            .expect("insert legacy row");

        assert!(store.subscribe_learner("old").is_ok());
        let progress = store
            .write_learner("old", &LearnerPatch::stats(150, 2, 0))
            .expect("write");
        assert_eq!(progress.xp, 150);
        assert_eq!(progress.level, 2);
        assert_eq!(progress.equipped_title_id, "title_newbie");
    }

    #[test]
    fn locked_title_write_is_rejected_and_not_committed() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        let err = store
            .write_learner("amy", &LearnerPatch::equip("title_sage"))
            .expect_err("locked");
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(!err.is_transient());
        assert_eq!(
            store.read_learner("amy").expect("read").equipped_title_id,
            "title_newbie"
        );
    }

    #[test]
    fn period_leaderboard_uses_ledger_window() {
        let clock = ManualClock::new(ts(0));
        let store = SqliteStore::open_in_memory()
            .expect("open")
            .with_clock(Arc::new(clock.clone()));
        for (id, name) in [("amy", "Amy"), ("bo", "Bo")] {
            store
                .initialize_learner(&LearnerProfile::student(id, name))
                .expect("init");
        }
        store
            .write_learner("bo", &LearnerPatch::stats(300, 3, 0))
            .expect("write");

        // Two days later: bo's XP is outside today's window.
        clock.advance_ms(2 * 24 * 60 * 60 * 1000);
        store
            .apply_action(
                "amy",
                &ActionRequest::new(ActionKind::DocumentUploaded),
                &ProgressionRules::default(),
            )
            .expect("apply");

        let today = store
            .subscribe_leaderboard(TimePeriod::Today)
            .expect("today")
            .latest()
            .expect("value");
        let points = |id: &str| {
            today
                .iter()
                .find(|candidate| candidate.id == id)
                .map(|candidate| candidate.points)
        };
        assert_eq!(points("amy"), Some(50));
        assert_eq!(points("bo"), Some(0));

        let all_time = store
            .subscribe_leaderboard(TimePeriod::AllTime)
            .expect("all time")
            .latest()
            .expect("value");
        assert!(all_time.iter().any(|candidate| candidate.id == "bo" && candidate.points == 300));
    }

    #[test]
    fn catalog_and_activity_round_trip_through_sqlite() {
        let store = SqliteStore::open_in_memory().expect("open");
        let raw = RawCatalog {
            badges: vec![serde_json::json!({"id": "x"}), serde_json::json!("junk")],
            titles: Vec::new(),
        };
        store.seed_catalog(&raw).expect("seed");
        let loaded = store
            .subscribe_catalog()
            .expect("catalog")
            .latest()
            .expect("value");
        assert_eq!(loaded, raw);

        let mut activity = store.subscribe_activity("amy").expect("activity");
        store
            .record_activity(
                "amy",
                &ActivityRecord::Document(quest_core::activity::DocumentRecord {
                    id: "d1".into(),
                    created_at: None,
                }),
            )
            .expect("record");
        assert_eq!(activity.poll_update().expect("update").documents.len(), 1);
    }
}
