use chrono::{DateTime, Utc};
use quest_core::{unlocks, ActivitySnapshot, Catalog, LearnerPatch, LearnerProgress, LevelTable, UnlockSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub passes: u64,
    pub writes: u64,
    pub failures: u64,
    pub skipped_in_flight: u64,
}

/// What the store currently holds next to what activity history proves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredStats {
    /// Level as written in the learner record, possibly stale.
    pub level: u32,
    /// Consecutive-day streak derived from activity dates.
    pub history_streak: u32,
}

impl Default for StoredStats {
    fn default() -> Self {
        Self {
            level: 1,
            history_streak: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassStart {
    /// A previous pass has not finished.
    InFlight,
    /// Everything evaluated is already persisted and the stats are current.
    UpToDate,
    Write { patch: LearnerPatch, diff: UnlockSet },
}

/// Decides what write a debounced pass should issue: missing unlocks, plus
/// `{xp, level, streak}` when the stored level or streak lags behind. The
/// caller owns the debounce timer and the store call; this type owns the
/// in-flight guard.
#[derive(Debug, Default)]
pub struct SyncReconciler {
    in_flight: bool,
    retry_pending: bool,
    stats: ReconcilerStats,
}

impl SyncReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_pass(
        &mut self,
        catalog: &Catalog,
        activity: &ActivitySnapshot,
        persisted: &LearnerProgress,
        stored: StoredStats,
        levels: &LevelTable,
        now: DateTime<Utc>,
    ) -> PassStart {
        if self.in_flight {
            self.stats.skipped_in_flight += 1;
            return PassStart::InFlight;
        }
        self.stats.passes += 1;

        let level = levels.level_for(persisted.xp).max(persisted.level);
        let evaluated = unlocks::evaluate(catalog, activity, level);
        let diff = evaluated.missing_from(&persisted.unlocked_badges, &persisted.unlocked_titles);
        let stats_behind = stored.level < level || stored.history_streak > persisted.streak;
        if diff.is_empty() && !stats_behind {
            self.retry_pending = false;
            return PassStart::UpToDate;
        }

        let mut patch = if stats_behind {
            LearnerPatch::stats(
                persisted.xp,
                level,
                stored.history_streak.max(persisted.streak),
            )
        } else {
            LearnerPatch::default()
        };
        if !diff.is_empty() {
            patch.unlock_badges = diff.badges.clone();
            patch.unlock_titles = diff.titles.clone();
            patch.last_badge_sync = Some(now);
        }
        self.in_flight = true;
        PassStart::Write { patch, diff }
    }

    /// Releases the guard. A failed write is not retried here; the next pass
    /// recomputes the same diff from the persisted sets.
    pub fn finish_pass(&mut self, succeeded: bool) {
        self.in_flight = false;
        if succeeded {
            self.stats.writes += 1;
            self.retry_pending = false;
        } else {
            self.stats.failures += 1;
            self.retry_pending = true;
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// True after a failed write until a later pass succeeds or finds nothing
    /// to do.
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn one_document() -> ActivitySnapshot {
        ActivitySnapshot {
            document_count: 1,
            ..ActivitySnapshot::default()
        }
    }

    #[test]
    fn empty_diff_issues_no_write() {
        let mut reconciler = SyncReconciler::new();
        let mut persisted = LearnerProgress::default();
        persisted.unlocked_badges.insert("doc_first".to_string());

        let start = reconciler.begin_pass(
            &Catalog::default(),
            &one_document(),
            &persisted,
            StoredStats::default(),
            &LevelTable::default(),
            ts(0),
        );
        assert_eq!(start, PassStart::UpToDate);
        assert!(!reconciler.is_in_flight());
    }

    #[test]
    fn diff_becomes_union_patch() {
        let mut reconciler = SyncReconciler::new();
        let start = reconciler.begin_pass(
            &Catalog::default(),
            &one_document(),
            &LearnerProgress::default(),
            StoredStats::default(),
            &LevelTable::default(),
            ts(7),
        );
        let PassStart::Write { patch, diff } = start else {
            panic!("expected a write");
        };
        assert_eq!(diff.badges, ["doc_first".to_string()].into_iter().collect());
        assert!(diff.titles.is_empty());
        assert_eq!(patch.unlock_badges, diff.badges);
        assert_eq!(patch.last_badge_sync, Some(ts(7)));
        assert_eq!(patch.xp, None);
    }

    #[test]
    fn in_flight_pass_is_not_reentered() {
        let mut reconciler = SyncReconciler::new();
        let catalog = Catalog::default();
        let levels = LevelTable::default();
        let persisted = LearnerProgress::default();

        assert!(matches!(
            reconciler.begin_pass(&catalog, &one_document(), &persisted, StoredStats::default(), &levels, ts(0)),
            PassStart::Write { .. }
        ));
        assert_eq!(
            reconciler.begin_pass(&catalog, &one_document(), &persisted, StoredStats::default(), &levels, ts(1)),
            PassStart::InFlight
        );

        reconciler.finish_pass(false);
        assert!(reconciler.retry_pending());
        assert!(matches!(
            reconciler.begin_pass(&catalog, &one_document(), &persisted, StoredStats::default(), &levels, ts(2)),
            PassStart::Write { .. }
        ));
        reconciler.finish_pass(true);
        assert!(!reconciler.retry_pending());
        assert_eq!(reconciler.stats().skipped_in_flight, 1);
        assert_eq!(reconciler.stats().writes, 1);
        assert_eq!(reconciler.stats().failures, 1);
    }

    #[test]
    fn stale_streak_and_level_are_healed_without_unlock_noise() {
        let mut reconciler = SyncReconciler::new();
        let mut persisted = LearnerProgress {
            xp: 120,
            level: 2,
            streak: 1,
            ..LearnerProgress::default()
        };
        persisted.unlocked_badges.insert("doc_first".to_string());
        let stored = StoredStats {
            level: 1,
            history_streak: 2,
        };

        let PassStart::Write { patch, diff } = reconciler.begin_pass(
            &Catalog::default(),
            &one_document(),
            &persisted,
            stored,
            &LevelTable::default(),
            ts(0),
        ) else {
            panic!("expected a healing write");
        };
        assert!(diff.is_empty());
        assert_eq!(patch, LearnerPatch::stats(120, 2, 2));
        reconciler.finish_pass(true);

        persisted.streak = 2;
        let healed = StoredStats {
            level: 2,
            history_streak: 2,
        };
        assert_eq!(
            reconciler.begin_pass(
                &Catalog::default(),
                &one_document(),
                &persisted,
                healed,
                &LevelTable::default(),
                ts(1),
            ),
            PassStart::UpToDate
        );
    }
}
