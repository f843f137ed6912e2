use chrono::{DateTime, Utc};
use quest_core::{
    insights, ActionKind, ActionMetadata, ActionOutcome, ActionRequest, ActivityInsights, Clock,
    LeaderboardDisplay, LearnerPatch, LearnerProgress, LevelStatus, LevelTable, Mission,
    ProgressionRules, TimePeriod, UnlockSet, DEFAULT_TITLE_ID,
};
use quest_storage::{ProgressRepository, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{ProgressSnapshot, ProgressionStoreAdapter, SnapshotChanges};
use crate::leaderboard::{FeedbackSink, LeaderboardTracker, LeaderboardView, TracingFeedback};
use crate::notifications::{Notification, NotificationPayload, NotificationQueue};
use crate::reconciler::{PassStart, ReconcilerStats, StoredStats, SyncReconciler};
use crate::scheduler::{TimerHandle, TimerScheduler};
use crate::tracker::{ActionTracker, TrackerStats};

pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_NOTIFICATION_TTL_MS: u64 = 5_000;
pub const DEFAULT_RANK_DELTA_TTL_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub debounce_ms: u64,
    pub notification_ttl_ms: u64,
    pub rank_delta_ttl_ms: u64,
    pub levels: LevelTable,
    pub celebration_sound: bool,
    pub leaderboard: LeaderboardDisplay,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            notification_ttl_ms: DEFAULT_NOTIFICATION_TTL_MS,
            rank_delta_ttl_ms: DEFAULT_RANK_DELTA_TTL_MS,
            levels: LevelTable::default(),
            celebration_sound: true,
            leaderboard: LeaderboardDisplay::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no authenticated learner")]
    Unauthenticated,
    #[error("unknown title {0}")]
    UnknownTitle(String),
    #[error("engine is shut down")]
    ShutDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTimer {
    Reconcile,
    ExpireNotification(String),
    ExpireRankDelta(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleChange {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The progression engine for one signed-in (or anonymous) session.
///
/// Single-threaded: the owner drives it with [`ProgressionEngine::pump`] or
/// [`ProgressionEngine::wait`]. Store failures are logged and absorbed; no
/// public operation returns an error.
pub struct ProgressionEngine {
    adapter: ProgressionStoreAdapter,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    reconciler: SyncReconciler,
    tracker: ActionTracker,
    notifications: NotificationQueue,
    leaderboard: LeaderboardTracker,
    feedback: Box<dyn FeedbackSink>,
    timers: TimerScheduler<EngineTimer>,
    debounce: Option<TimerHandle>,
    /// Derived level the last reconcile pass evaluated against.
    reconciled_level: Option<u32>,
    notification_timers: HashMap<String, TimerHandle>,
    delta_timers: HashMap<String, TimerHandle>,
    shut_down: bool,
}

impl ProgressionEngine {
    pub fn new(
        repo: Arc<dyn ProgressRepository>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        learner_id: Option<String>,
    ) -> Self {
        let now = clock.now();
        let adapter = ProgressionStoreAdapter::connect(
            repo,
            learner_id.clone(),
            config.levels.clone(),
            config.leaderboard.time_period,
            now.date_naive(),
        );
        let leaderboard = LeaderboardTracker::new(
            config.leaderboard,
            learner_id,
            config.rank_delta_ttl_ms,
            config.celebration_sound,
        );

        let mut engine = Self {
            adapter,
            clock,
            notifications: NotificationQueue::new(config.notification_ttl_ms),
            config,
            reconciler: SyncReconciler::new(),
            tracker: ActionTracker::new(),
            leaderboard,
            feedback: Box::new(TracingFeedback),
            timers: TimerScheduler::new(),
            debounce: None,
            reconciled_level: None,
            notification_timers: HashMap::new(),
            delta_timers: HashMap::new(),
            shut_down: false,
        };
        engine.update_leaderboard(now);
        if engine.adapter.learner_id().is_some() {
            // The first snapshot counts as an activity change.
            engine.arm_debounce(now);
        }
        info!(
            event = "engine_started",
            learner_id = ?engine.adapter.learner_id(),
            period = %engine.config.leaderboard.time_period,
        );
        engine
    }

    pub fn with_feedback(mut self, feedback: Box<dyn FeedbackSink>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn learner_id(&self) -> Option<&str> {
        self.adapter.learner_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        self.adapter.snapshot()
    }

    pub fn level_status(&self) -> LevelStatus {
        self.config.levels.status(self.snapshot().progress.xp)
    }

    /// Average quiz score and streak hints from the raw activity streams.
    pub fn activity_insights(&self) -> ActivityInsights {
        insights(&self.snapshot().streams, self.clock.now().date_naive())
    }

    pub fn missions(&self) -> &[Mission] {
        &self.snapshot().gamification.missions
    }

    pub fn reconciler_stats(&self) -> &ReconcilerStats {
        self.reconciler.stats()
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Applies pending store updates, then fires every timer that is due.
    pub fn pump(&mut self) -> SnapshotChanges {
        if self.shut_down {
            return SnapshotChanges::default();
        }
        let now = self.clock.now();
        let changes = self.adapter.poll(now.date_naive());
        self.handle_changes(changes, now);
        self.run_due();
        changes
    }

    /// Sleeps until a store update arrives or the next timer is due.
    pub async fn wait(&mut self) -> SnapshotChanges {
        if self.shut_down {
            return SnapshotChanges::default();
        }
        let now = self.clock.now();
        let today = now.date_naive();
        let changes = match self.timers.next_deadline() {
            Some(deadline) => {
                let delay = (deadline - now).to_std().unwrap_or_default();
                tokio::select! {
                    changes = self.adapter.wait_for_change(today) => changes,
                    _ = tokio::time::sleep(delay) => SnapshotChanges::default(),
                }
            }
            None => self.adapter.wait_for_change(today).await,
        };
        let now = self.clock.now();
        self.handle_changes(changes, now);
        self.run_due();
        changes
    }

    /// Fires due timers; returns how many ran.
    pub fn run_due(&mut self) -> usize {
        let now = self.clock.now();
        let due = self.timers.drain_due(now);
        let fired = due.len();
        for timer in due {
            match timer {
                EngineTimer::Reconcile => {
                    self.debounce = None;
                    self.reconcile(now);
                }
                EngineTimer::ExpireNotification(id) => {
                    self.notification_timers.remove(&id);
                    let expired = self.notifications.expire_due(now);
                    debug!(event = "notification_expired", id = %id, expired);
                }
                EngineTimer::ExpireRankDelta(entry_id) => {
                    self.delta_timers.remove(&entry_id);
                    self.leaderboard.expire_delta(&entry_id, now);
                }
            }
        }
        fired
    }

    pub fn track_action(&mut self, kind: ActionKind, metadata: ActionMetadata) -> ActionOutcome {
        if self.shut_down {
            debug!(event = "track_action_after_shutdown", kind = %kind);
            return ActionOutcome::default();
        }
        let rules = ProgressionRules::new(self.config.levels.clone(), self.snapshot().catalog.clone());
        let request = ActionRequest { kind, metadata };
        let outcome = self.tracker.track(
            self.adapter.repository().as_ref(),
            self.adapter.learner_id(),
            &request,
            &rules,
        );

        let now = self.clock.now();
        for payload in NotificationPayload::from_outcome(&outcome) {
            self.push_notification(payload, now);
        }
        self.pump();
        outcome
    }

    pub fn change_title(&mut self, title_id: &str) -> TitleChange {
        match self.equip(title_id) {
            Ok(progress) => {
                info!(event = "title_equipped", title_id);
                self.adapter.apply_learner(progress);
                TitleChange {
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                warn!(event = "title_change_failed", title_id, error = %err);
                self.feedback.toast(&format!("Could not equip title: {err}"));
                TitleChange {
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    fn equip(&self, title_id: &str) -> Result<LearnerProgress, EngineError> {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        let learner_id = self.adapter.learner_id().ok_or(EngineError::Unauthenticated)?;
        if title_id != DEFAULT_TITLE_ID && self.snapshot().catalog.title(title_id).is_none() {
            return Err(EngineError::UnknownTitle(title_id.to_string()));
        }
        Ok(self
            .adapter
            .repository()
            .write_learner(learner_id, &LearnerPatch::equip(title_id))?)
    }

    pub fn visible_notifications(&self) -> Vec<&Notification> {
        self.notifications.visible(self.clock.now())
    }

    pub fn dismiss_notification(&mut self, id: &str) -> bool {
        if let Some(handle) = self.notification_timers.remove(id) {
            self.timers.cancel(handle);
        }
        self.notifications.dismiss(id)
    }

    pub fn clear_all_notifications(&mut self) {
        for id in self.notifications.clear() {
            if let Some(handle) = self.notification_timers.remove(&id) {
                self.timers.cancel(handle);
            }
        }
    }

    /// Re-opens failed subscriptions and reconciles immediately. This is the
    /// manual retry after a failed write.
    pub fn refresh(&mut self) {
        if self.shut_down {
            return;
        }
        let now = self.clock.now();
        let today = now.date_naive();
        let mut changes = self
            .adapter
            .reconnect_missing(self.leaderboard.display().time_period, today);
        let polled = self.adapter.poll(today);
        changes.leaderboard |= polled.leaderboard;
        if changes.leaderboard {
            self.update_leaderboard(now);
        }
        if let Some(handle) = self.debounce.take() {
            self.timers.cancel(handle);
        }
        self.reconcile(now);
        self.run_due();
    }

    pub fn leaderboard_display(&self) -> LeaderboardDisplay {
        self.leaderboard.display()
    }

    pub fn leaderboard_view(&self) -> LeaderboardView {
        self.leaderboard.view(self.clock.now())
    }

    pub fn set_leaderboard_period(&mut self, period: TimePeriod) {
        if period == self.leaderboard.display().time_period {
            return;
        }
        self.cancel_delta_timers();
        self.leaderboard.set_period(period);
        self.adapter.subscribe_leaderboard(period);
        let now = self.clock.now();
        self.update_leaderboard(now);
    }

    pub fn set_leaderboard_display(&mut self, display: LeaderboardDisplay) {
        let period = display.time_period;
        self.set_leaderboard_period(period);
        self.leaderboard.set_display(display);
    }

    /// Cancels every timer and drops every subscription.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.timers.cancel_all();
        self.debounce = None;
        self.notification_timers.clear();
        self.delta_timers.clear();
        self.adapter.disconnect();
        self.shut_down = true;
        info!(event = "engine_stopped", learner_id = ?self.adapter.learner_id());
    }

    fn handle_changes(&mut self, changes: SnapshotChanges, now: DateTime<Utc>) {
        if changes.leaderboard {
            self.update_leaderboard(now);
        }
        if changes.activity || changes.catalog || (changes.learner && self.level_moved()) {
            self.arm_debounce(now);
        }
    }

    /// True when the learner record now derives a level the last pass did not
    /// evaluate, e.g. after XP was awarded elsewhere. The pass's own unlock
    /// writes leave xp alone and so never re-arm it.
    fn level_moved(&self) -> bool {
        self.adapter.learner_id().is_some()
            && self.reconciled_level != Some(self.derived_level())
    }

    fn derived_level(&self) -> u32 {
        self.config.levels.level_for(self.snapshot().progress.xp)
    }

    fn arm_debounce(&mut self, now: DateTime<Utc>) {
        if let Some(handle) = self.debounce.take() {
            self.timers.cancel(handle);
        }
        self.debounce = Some(
            self.timers
                .schedule(now, self.config.debounce_ms, EngineTimer::Reconcile),
        );
    }

    fn reconcile(&mut self, now: DateTime<Utc>) {
        let Some(learner_id) = self.adapter.learner_id().map(str::to_string) else {
            return;
        };
        self.reconciled_level = Some(self.derived_level());
        let snapshot = self.adapter.snapshot();
        let stored = StoredStats {
            level: snapshot.stored_level,
            history_streak: u32::try_from(snapshot.activity.streak_days).unwrap_or(u32::MAX),
        };
        let start = self.reconciler.begin_pass(
            &snapshot.catalog,
            &snapshot.evaluation_input(),
            &snapshot.progress,
            stored,
            &self.config.levels,
            now,
        );
        let (patch, diff) = match start {
            PassStart::InFlight => {
                debug!(event = "reconcile_skipped_in_flight", learner_id = %learner_id);
                return;
            }
            PassStart::UpToDate => {
                debug!(event = "reconcile_up_to_date", learner_id = %learner_id);
                return;
            }
            PassStart::Write { patch, diff } => (patch, diff),
        };

        match self.adapter.repository().write_learner(&learner_id, &patch) {
            Ok(progress) => {
                self.reconciler.finish_pass(true);
                info!(
                    event = "unlocks_synced",
                    learner_id = %learner_id,
                    badges = diff.badges.len(),
                    titles = diff.titles.len(),
                    healed_streak = ?patch.streak,
                    healed_level = ?patch.level
                );
                let payloads = self.unlock_payloads(&diff);
                self.adapter.apply_learner(progress);
                for payload in payloads {
                    self.push_notification(payload, now);
                }
            }
            Err(err) => {
                self.reconciler.finish_pass(false);
                warn!(
                    event = "unlock_sync_failed",
                    learner_id = %learner_id,
                    transient = err.is_transient(),
                    error = %err
                );
            }
        }
    }

    fn unlock_payloads(&self, diff: &UnlockSet) -> Vec<NotificationPayload> {
        let catalog = &self.snapshot().catalog;
        diff.badges
            .iter()
            .filter_map(|id| catalog.badge(id).cloned().map(NotificationPayload::Badge))
            .chain(
                diff.titles
                    .iter()
                    .filter_map(|id| catalog.title(id).cloned().map(NotificationPayload::Title)),
            )
            .collect()
    }

    fn push_notification(&mut self, payload: NotificationPayload, now: DateTime<Utc>) {
        let id = self.notifications.push(payload, now).id.clone();
        let handle = self.timers.schedule(
            now,
            self.config.notification_ttl_ms,
            EngineTimer::ExpireNotification(id.clone()),
        );
        self.notification_timers.insert(id, handle);
    }

    fn update_leaderboard(&mut self, now: DateTime<Utc>) {
        let created = self.leaderboard.update(
            &self.adapter.snapshot().leaderboard,
            now,
            self.feedback.as_mut(),
        );
        for delta in created {
            if let Some(previous) = self.delta_timers.remove(&delta.entry_id) {
                self.timers.cancel(previous);
            }
            let handle = self.timers.schedule(
                now,
                self.config.rank_delta_ttl_ms,
                EngineTimer::ExpireRankDelta(delta.entry_id.clone()),
            );
            self.delta_timers.insert(delta.entry_id, handle);
        }
    }

    fn cancel_delta_timers(&mut self) {
        for (_, handle) in self.delta_timers.drain() {
            self.timers.cancel(handle);
        }
    }
}
