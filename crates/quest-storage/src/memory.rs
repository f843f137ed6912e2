use quest_core::{
    apply_action, ActionOutcome, ActionRequest, ActivityStreams, Clock, GamificationRecord,
    LeaderboardCandidate, LearnerPatch, LearnerProgress, LearnerState, ProgressionRules,
    RawCatalog, SystemClock, TimePeriod,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::channels::{lock, Channels};
use crate::ledger::{period_points, ActivityRecord, XpLedgerEntry};
use crate::{LearnerProfile, ProgressRepository, StoreError, Subscription};

struct LearnerEntry {
    profile: LearnerProfile,
    state: LearnerState,
}

#[derive(Default)]
struct MemoryState {
    learners: BTreeMap<String, LearnerEntry>,
    activity: BTreeMap<String, ActivityStreams>,
    catalog: RawCatalog,
    ledger: Vec<XpLedgerEntry>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_writes: u32,
    catalog_unavailable: bool,
    offline: bool,
}

/// In-process store with the same change-feed semantics as a remote one.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Mutex<Faults>,
    channels: Channels,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            faults: Mutex::new(Faults::default()),
            channels: Channels::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Learner-record writes attempted, failed ones included.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_writes(&self, count: u32) {
        lock(&self.faults).failing_writes = count;
    }

    pub fn set_catalog_unavailable(&self, unavailable: bool) {
        lock(&self.faults).catalog_unavailable = unavailable;
    }

    pub fn set_offline(&self, offline: bool) {
        lock(&self.faults).offline = offline;
    }

    pub fn seed_catalog(&self, catalog: RawCatalog) {
        let mut state = lock(&self.state);
        state.catalog = catalog.clone();
        self.channels.catalog.publish(&(), catalog);
    }

    pub fn record_activity(&self, learner_id: &str, record: ActivityRecord) {
        let mut state = lock(&self.state);
        let streams = state.activity.entry(learner_id.to_string()).or_default();
        record.merge_into(streams);
        self.channels
            .activity
            .publish(&learner_id.to_string(), streams.clone());
    }

    /// Direct XP grant, as an admin tool or a seeding script would issue.
    pub fn award_xp(&self, learner_id: &str, amount: u64, reason: &str) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let now = self.clock.now();
        let entry = state
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        entry.state.progress.xp = entry.state.progress.xp.saturating_add(amount);
        let progress = entry.state.progress.clone();
        state.ledger.push(XpLedgerEntry {
            learner_id: learner_id.to_string(),
            amount,
            reason: reason.to_string(),
            recorded_at: now,
        });
        self.channels.learners.publish(&learner_id.to_string(), progress);
        self.publish_leaderboards(&state, now);
        Ok(())
    }

    pub fn ledger(&self) -> Vec<XpLedgerEntry> {
        lock(&self.state).ledger.clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if lock(&self.faults).offline {
            return Err(StoreError::Connectivity("store is offline".to_string()));
        }
        Ok(())
    }

    fn begin_write(&self, learner_id: &str) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut faults = lock(&self.faults);
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(StoreError::WriteConflict(learner_id.to_string()));
        }
        Ok(())
    }

    /// Caller holds the state lock.
    fn publish_leaderboards(&self, state: &MemoryState, now: DateTime<Utc>) {
        self.channels
            .publish_leaderboards(|period| Ok(candidates_from(state, period, now)));
    }
}

fn candidates_from(
    state: &MemoryState,
    period: TimePeriod,
    now: DateTime<Utc>,
) -> Vec<LeaderboardCandidate> {
    state
        .learners
        .values()
        .map(|entry| {
            let progress = &entry.state.progress;
            let points = match period {
                TimePeriod::AllTime => progress.xp,
                _ => period_points(&state.ledger, &entry.profile.learner_id, period, now),
            };
            LeaderboardCandidate {
                id: entry.profile.learner_id.clone(),
                name: entry.profile.name.clone(),
                points,
                level: progress.level,
                streak: progress.streak,
                role: Some(entry.profile.role.clone()),
            }
        })
        .collect()
}

impl ProgressRepository for MemoryStore {
    fn initialize_learner(&self, profile: &LearnerProfile) -> Result<LearnerProgress, StoreError> {
        self.check_online()?;
        let mut state = lock(&self.state);
        let mut created = false;
        let entry = state
            .learners
            .entry(profile.learner_id.clone())
            .or_insert_with(|| {
                created = true;
                LearnerEntry {
                    profile: profile.clone(),
                    state: LearnerState::default(),
                }
            });
        let learner = entry.state.clone();
        if created {
            self.channels.publish_state(&profile.learner_id, &learner);
            self.publish_leaderboards(&state, self.clock.now());
        }
        Ok(learner.progress)
    }

    fn read_learner(&self, learner_id: &str) -> Result<LearnerProgress, StoreError> {
        self.check_online()?;
        lock(&self.state)
            .learners
            .get(learner_id)
            .map(|entry| entry.state.progress.clone())
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))
    }

    fn read_gamification(&self, learner_id: &str) -> Result<GamificationRecord, StoreError> {
        self.check_online()?;
        lock(&self.state)
            .learners
            .get(learner_id)
            .map(|entry| entry.state.gamification.clone())
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))
    }

    fn write_learner(
        &self,
        learner_id: &str,
        patch: &LearnerPatch,
    ) -> Result<LearnerProgress, StoreError> {
        self.begin_write(learner_id)?;
        let mut state = lock(&self.state);
        let now = self.clock.now();
        let entry = state
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        let mut progress = entry.state.progress.clone();
        let previous_xp = progress.xp;
        patch.apply_to(&mut progress)?;
        entry.state.progress = progress.clone();
        let gained = progress.xp - previous_xp;
        if gained > 0 {
            state.ledger.push(XpLedgerEntry {
                learner_id: learner_id.to_string(),
                amount: gained,
                reason: "patch".to_string(),
                recorded_at: now,
            });
        }
        self.channels
            .learners
            .publish(&learner_id.to_string(), progress.clone());
        // Boards also show level and streak, so any committed write refreshes them.
        self.publish_leaderboards(&state, now);
        Ok(progress)
    }

    fn apply_action(
        &self,
        learner_id: &str,
        request: &ActionRequest,
        rules: &ProgressionRules,
    ) -> Result<ActionOutcome, StoreError> {
        self.begin_write(learner_id)?;
        let mut state = lock(&self.state);
        let now = self.clock.now();
        let entry = state
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        let mut working = entry.state.clone();
        let outcome = apply_action(&mut working, request, rules, now);
        entry.state = working.clone();
        if outcome.xp_awarded > 0 {
            state.ledger.push(XpLedgerEntry {
                learner_id: learner_id.to_string(),
                amount: outcome.xp_awarded,
                reason: request.kind.as_str().to_string(),
                recorded_at: now,
            });
        }
        self.channels.publish_state(learner_id, &working);
        if outcome.xp_awarded > 0 {
            self.publish_leaderboards(&state, now);
        }
        Ok(outcome)
    }

    fn subscribe_learner(&self, learner_id: &str) -> Result<Subscription<LearnerProgress>, StoreError> {
        self.check_online()?;
        let state = lock(&self.state);
        let progress = state
            .learners
            .get(learner_id)
            .map(|entry| entry.state.progress.clone())
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
        self.check_online()?;
        let state = lock(&self.state);
        let record = state
            .learners
            .get(learner_id)
            .map(|entry| entry.state.gamification.clone())
            .ok_or_else(|| StoreError::NotFound(learner_id.to_string()))?;
        Ok(self
            .channels
            .gamification
            .subscribe(&learner_id.to_string(), || record))
    }

    fn subscribe_catalog(&self) -> Result<Subscription<RawCatalog>, StoreError> {
        self.check_online()?;
        if lock(&self.faults).catalog_unavailable {
            return Err(StoreError::Connectivity("catalog unavailable".to_string()));
        }
        let state = lock(&self.state);
        let catalog = state.catalog.clone();
        Ok(self.channels.catalog.subscribe(&(), || catalog))
    }

    fn subscribe_activity(&self, learner_id: &str) -> Result<Subscription<ActivityStreams>, StoreError> {
        self.check_online()?;
        let state = lock(&self.state);
        let streams = state
            .activity
            .get(learner_id)
            .cloned()
            .unwrap_or_default();
        Ok(self
            .channels
            .activity
            .subscribe(&learner_id.to_string(), || streams))
    }

    fn subscribe_leaderboard(
        &self,
        period: TimePeriod,
    ) -> Result<Subscription<Vec<LeaderboardCandidate>>, StoreError> {
        self.check_online()?;
        let state = lock(&self.state);
        let candidates = candidates_from(&state, period, self.clock.now());
        Ok(self.channels.leaderboards.subscribe(&period, || candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_core::activity::DocumentRecord;
    use quest_core::{ActionKind, ManualClock};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(ts(0))));
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        store
    }

    #[test]
    fn initialize_is_idempotent() {
        let store = store();
        store.award_xp("amy", 40, "seed").expect("award");
        let again = store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        assert_eq!(again.xp, 40);
    }

    #[test]
    fn writes_publish_to_learner_subscription() {
        let store = store();
        let mut sub = store.subscribe_learner("amy").expect("subscribe");
        assert_eq!(sub.poll_update(), None);

        let patch = LearnerPatch::unlocks(
            ["doc_first".to_string()].into_iter().collect(),
            Default::default(),
            ts(10),
        );
        store.write_learner("amy", &patch).expect("write");
        let update = sub.poll_update().expect("update");
        assert!(update.unlocked_badges.contains("doc_first"));

        // Re-applying the same union changes nothing and notifies nobody.
        let mut same = patch.clone();
        same.last_badge_sync = update.last_badge_sync;
        store.write_learner("amy", &same).expect("write");
        assert_eq!(sub.poll_update(), None);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn injected_failures_leave_record_untouched() {
        let store = store();
        store.fail_next_writes(1);
        let err = store
            .write_learner("amy", &LearnerPatch::stats(500, 4, 0))
            .expect_err("injected");
        assert!(err.is_transient());
        assert_eq!(store.read_learner("amy").expect("read").xp, 0);
        store
            .write_learner("amy", &LearnerPatch::stats(500, 4, 0))
            .expect("second attempt");
        assert_eq!(store.read_learner("amy").expect("read").xp, 500);
    }

    #[test]
    fn actions_update_both_documents_and_leaderboard() {
        let store = store();
        store
            .initialize_learner(&LearnerProfile::student("bo", "Bo"))
            .expect("init");
        let mut board = store
            .subscribe_leaderboard(TimePeriod::Week)
            .expect("board");
        let mut gamification = store.subscribe_gamification("amy").expect("sub");

        let outcome = store
            .apply_action(
                "amy",
                &ActionRequest::new(ActionKind::DocumentUploaded),
                &ProgressionRules::default(),
            )
            .expect("apply");
        assert_eq!(outcome.badges.len(), 1);

        let record = gamification.poll_update().expect("gamification update");
        assert_eq!(record.counters.documents_uploaded, 1);
        let candidates = board.poll_update().expect("board update");
        let amy = candidates
            .iter()
            .find(|candidate| candidate.id == "amy")
            .expect("amy ranked");
        assert_eq!(amy.points, outcome.xp_awarded);
        assert_eq!(store.ledger().len(), 1);
    }

    #[test]
    fn catalog_and_connectivity_faults() {
        let store = store();
        store.set_catalog_unavailable(true);
        assert!(matches!(
            store.subscribe_catalog(),
            Err(StoreError::Connectivity(_))
        ));
        store.set_catalog_unavailable(false);
        assert!(store.subscribe_catalog().is_ok());

        store.set_offline(true);
        assert!(store.read_learner("amy").is_err());
        assert!(matches!(
            store.read_learner("amy"),
            Err(StoreError::Connectivity(_))
        ));
    }

    #[test]
    fn activity_records_stream_to_subscribers() {
        let store = store();
        let mut activity = store.subscribe_activity("amy").expect("sub");
        store.record_activity(
            "amy",
            ActivityRecord::Document(DocumentRecord {
                id: "d1".into(),
                created_at: None,
            }),
        );
        assert_eq!(activity.poll_update().expect("update").documents.len(), 1);
        assert!(matches!(
            store.read_learner("nobody"),
            Err(StoreError::NotFound(_))
        ));
    }
}
