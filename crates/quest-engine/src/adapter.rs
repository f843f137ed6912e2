use chrono::NaiveDate;
use quest_core::{
    aggregate, ActivitySnapshot, ActivityStreams, Catalog, GamificationRecord,
    LeaderboardCandidate, LearnerProgress, LevelTable, RawCatalog, TimePeriod,
};
use quest_storage::{ProgressRepository, StoreError, Subscription};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Remote,
    /// Built-in catalog, used while the remote one is empty or unreachable.
    Fallback,
}

/// Normalized projection of everything the engine reads. Replaced piecewise
/// by each authoritative update.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub progress: LearnerProgress,
    /// Level as the store holds it, before `normalize` re-derives it from xp.
    pub stored_level: u32,
    pub gamification: GamificationRecord,
    pub catalog: Catalog,
    pub catalog_source: CatalogSource,
    pub streams: ActivityStreams,
    pub activity: ActivitySnapshot,
    pub leaderboard: Vec<LeaderboardCandidate>,
}

impl ProgressSnapshot {
    /// Counters the unlock evaluator sees: stream aggregates merged with the
    /// tallies kept by tracked actions.
    pub fn evaluation_input(&self) -> ActivitySnapshot {
        let tracked = self.gamification.counters.snapshot(
            self.gamification
                .streak
                .current
                .max(self.progress.streak),
        );
        self.activity.max_with(&tracked)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotChanges {
    pub learner: bool,
    pub gamification: bool,
    pub catalog: bool,
    pub activity: bool,
    pub leaderboard: bool,
}

impl SnapshotChanges {
    pub fn any(&self) -> bool {
        self.learner || self.gamification || self.catalog || self.activity || self.leaderboard
    }

    fn merge(&mut self, other: SnapshotChanges) {
        self.learner |= other.learner;
        self.gamification |= other.gamification;
        self.catalog |= other.catalog;
        self.activity |= other.activity;
        self.leaderboard |= other.leaderboard;
    }
}

enum Wake {
    Learner(LearnerProgress),
    Gamification(GamificationRecord),
    Catalog(RawCatalog),
    Activity(ActivityStreams),
    Leaderboard(Vec<LeaderboardCandidate>),
}

/// Owns the store subscriptions and validates every record at the boundary.
pub struct ProgressionStoreAdapter {
    repo: Arc<dyn ProgressRepository>,
    learner_id: Option<String>,
    levels: LevelTable,
    snapshot: ProgressSnapshot,
    learner_sub: Option<Subscription<LearnerProgress>>,
    gamification_sub: Option<Subscription<GamificationRecord>>,
    catalog_sub: Option<Subscription<RawCatalog>>,
    activity_sub: Option<Subscription<ActivityStreams>>,
    leaderboard_sub: Option<Subscription<Vec<LeaderboardCandidate>>>,
}

impl ProgressionStoreAdapter {
    pub fn connect(
        repo: Arc<dyn ProgressRepository>,
        learner_id: Option<String>,
        levels: LevelTable,
        period: TimePeriod,
        today: NaiveDate,
    ) -> Self {
        let mut adapter = Self {
            repo,
            learner_id,
            levels,
            snapshot: ProgressSnapshot {
                progress: LearnerProgress::default(),
                stored_level: 1,
                gamification: GamificationRecord::default(),
                catalog: Catalog::default(),
                catalog_source: CatalogSource::Fallback,
                streams: ActivityStreams::default(),
                activity: ActivitySnapshot::default(),
                leaderboard: Vec::new(),
            },
            learner_sub: None,
            gamification_sub: None,
            catalog_sub: None,
            activity_sub: None,
            leaderboard_sub: None,
        };

        adapter.catalog_sub = adapter.open("catalog", |repo| repo.subscribe_catalog());
        let raw = adapter.catalog_sub.as_ref().and_then(Subscription::latest);
        adapter.apply_catalog(raw);

        if let Some(learner_id) = adapter.learner_id.clone() {
            adapter.learner_sub = adapter.open("learner", |repo| repo.subscribe_learner(&learner_id));
            adapter.gamification_sub =
                adapter.open("gamification", |repo| repo.subscribe_gamification(&learner_id));
            adapter.activity_sub = adapter.open("activity", |repo| repo.subscribe_activity(&learner_id));

            if let Some(progress) = adapter.learner_sub.as_ref().and_then(Subscription::latest) {
                adapter.apply_learner(progress);
            }
            if let Some(record) = adapter.gamification_sub.as_ref().and_then(Subscription::latest) {
                adapter.snapshot.gamification = record;
            }
            if let Some(streams) = adapter.activity_sub.as_ref().and_then(Subscription::latest) {
                adapter.apply_activity(streams, today);
            }
        }

        adapter.subscribe_leaderboard(period);
        adapter
    }

    fn open<T>(
        &self,
        stream: &'static str,
        subscribe: impl FnOnce(&dyn ProgressRepository) -> Result<Subscription<T>, StoreError>,
    ) -> Option<Subscription<T>> {
        match subscribe(self.repo.as_ref()) {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(event = "subscribe_failed", stream, error = %err);
                None
            }
        }
    }

    pub fn learner_id(&self) -> Option<&str> {
        self.learner_id.as_deref()
    }

    pub fn repository(&self) -> &Arc<dyn ProgressRepository> {
        &self.repo
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    pub fn levels(&self) -> &LevelTable {
        &self.levels
    }

    /// Switches the leaderboard stream; the previous subscription is dropped.
    pub fn subscribe_leaderboard(&mut self, period: TimePeriod) {
        if let Some(mut previous) = self.leaderboard_sub.take() {
            previous.cancel();
        }
        self.leaderboard_sub = self.open("leaderboard", |repo| repo.subscribe_leaderboard(period));
        self.snapshot.leaderboard = self
            .leaderboard_sub
            .as_ref()
            .and_then(Subscription::latest)
            .unwrap_or_default();
    }

    /// Retries subscriptions that failed to open, e.g. after the store came
    /// back online.
    pub fn reconnect_missing(&mut self, period: TimePeriod, today: NaiveDate) -> SnapshotChanges {
        let mut changes = SnapshotChanges::default();
        if self.catalog_sub.is_none() {
            self.catalog_sub = self.open("catalog", |repo| repo.subscribe_catalog());
            if let Some(raw) = self.catalog_sub.as_ref().and_then(Subscription::latest) {
                changes.catalog = self.apply_catalog(Some(raw));
            }
        }
        if let Some(learner_id) = self.learner_id.clone() {
            if self.learner_sub.is_none() {
                self.learner_sub = self.open("learner", |repo| repo.subscribe_learner(&learner_id));
                if let Some(progress) = self.learner_sub.as_ref().and_then(Subscription::latest) {
                    self.apply_learner(progress);
                    changes.learner = true;
                }
            }
            if self.activity_sub.is_none() {
                self.activity_sub =
                    self.open("activity", |repo| repo.subscribe_activity(&learner_id));
                if let Some(streams) = self.activity_sub.as_ref().and_then(Subscription::latest) {
                    self.apply_activity(streams, today);
                    changes.activity = true;
                }
            }
            if self.gamification_sub.is_none() {
                self.gamification_sub =
                    self.open("gamification", |repo| repo.subscribe_gamification(&learner_id));
                if let Some(record) = self.gamification_sub.as_ref().and_then(Subscription::latest) {
                    self.snapshot.gamification = record;
                    changes.gamification = true;
                }
            }
        }
        if self.leaderboard_sub.is_none() {
            self.subscribe_leaderboard(period);
            changes.leaderboard = !self.snapshot.leaderboard.is_empty();
        }
        changes
    }

    /// Pull every pending update.
    pub fn poll(&mut self, today: NaiveDate) -> SnapshotChanges {
        let mut changes = SnapshotChanges::default();
        if let Some(progress) = self.learner_sub.as_mut().and_then(Subscription::poll_update) {
            self.apply_learner(progress);
            changes.learner = true;
        }
        if let Some(record) = self
            .gamification_sub
            .as_mut()
            .and_then(Subscription::poll_update)
        {
            self.snapshot.gamification = record;
            changes.gamification = true;
        }
        if let Some(raw) = self.catalog_sub.as_mut().and_then(Subscription::poll_update) {
            changes.catalog = self.apply_catalog(Some(raw));
        }
        if let Some(streams) = self.activity_sub.as_mut().and_then(Subscription::poll_update) {
            self.apply_activity(streams, today);
            changes.activity = true;
        }
        if let Some(candidates) = self
            .leaderboard_sub
            .as_mut()
            .and_then(Subscription::poll_update)
        {
            self.snapshot.leaderboard = candidates;
            changes.leaderboard = true;
        }
        changes
    }

    /// Waits for the next pushed update, applies it, then drains anything
    /// else already pending. Never resolves when nothing is subscribed.
    pub async fn wait_for_change(&mut self, today: NaiveDate) -> SnapshotChanges {
        let wake = tokio::select! {
            Some(progress) = next_change(&mut self.learner_sub) => Wake::Learner(progress),
            Some(record) = next_change(&mut self.gamification_sub) => Wake::Gamification(record),
            Some(raw) = next_change(&mut self.catalog_sub) => Wake::Catalog(raw),
            Some(streams) = next_change(&mut self.activity_sub) => Wake::Activity(streams),
            Some(board) = next_change(&mut self.leaderboard_sub) => Wake::Leaderboard(board),
            else => std::future::pending::<Wake>().await,
        };

        let mut changes = SnapshotChanges::default();
        match wake {
            Wake::Learner(progress) => {
                self.apply_learner(progress);
                changes.learner = true;
            }
            Wake::Gamification(record) => {
                self.snapshot.gamification = record;
                changes.gamification = true;
            }
            Wake::Catalog(raw) => changes.catalog = self.apply_catalog(Some(raw)),
            Wake::Activity(streams) => {
                self.apply_activity(streams, today);
                changes.activity = true;
            }
            Wake::Leaderboard(board) => {
                self.snapshot.leaderboard = board;
                changes.leaderboard = true;
            }
        }
        changes.merge(self.poll(today));
        changes
    }

    /// Drops every subscription; no further updates are delivered.
    pub fn disconnect(&mut self) {
        self.learner_sub = None;
        self.gamification_sub = None;
        self.catalog_sub = None;
        self.activity_sub = None;
        self.leaderboard_sub = None;
    }

    /// Local write-through after a successful store write, until the
    /// subscription delivers the same record.
    pub fn apply_learner(&mut self, mut progress: LearnerProgress) {
        self.snapshot.stored_level = progress.level;
        if progress.normalize(&self.levels) {
            debug!(event = "learner_record_normalized", learner_id = ?self.learner_id);
        }
        self.snapshot.progress = progress;
    }

    fn apply_activity(&mut self, streams: ActivityStreams, today: NaiveDate) {
        self.snapshot.activity = aggregate(&streams, today);
        self.snapshot.streams = streams;
    }

    /// Returns true when the effective catalog changed.
    fn apply_catalog(&mut self, raw: Option<RawCatalog>) -> bool {
        let previous = (self.snapshot.catalog.clone(), self.snapshot.catalog_source);
        match raw {
            Some(raw) => {
                let load = Catalog::from_raw(&raw);
                for skipped in &load.skipped {
                    warn!(event = "catalog_entry_skipped", error = %skipped);
                }
                if load.badges_defaulted || load.titles_defaulted {
                    debug!(
                        event = "catalog_defaults_used",
                        badges = load.badges_defaulted,
                        titles = load.titles_defaulted
                    );
                }
                self.snapshot.catalog_source = if load.badges_defaulted && load.titles_defaulted {
                    CatalogSource::Fallback
                } else {
                    CatalogSource::Remote
                };
                self.snapshot.catalog = load.catalog;
            }
            None => {
                warn!(event = "catalog_fallback", reason = "subscription unavailable");
                self.snapshot.catalog = Catalog::default();
                self.snapshot.catalog_source = CatalogSource::Fallback;
            }
        }
        previous != (self.snapshot.catalog.clone(), self.snapshot.catalog_source)
    }
}

async fn next_change<T: Clone>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) if sub.is_active() => sub.changed().await,
        _ => std::future::pending().await,
    }
}
