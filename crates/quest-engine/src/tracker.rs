use quest_core::{ActionOutcome, ActionRequest, ProgressionRules};
use quest_storage::ProgressRepository;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub tracked: u64,
    pub rejected_unauthenticated: u64,
    pub failed: u64,
}

/// Sends discrete learner actions to the store. Never fails outward: a
/// missing learner or a store error yields the empty outcome.
#[derive(Debug, Default)]
pub struct ActionTracker {
    stats: TrackerStats,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(
        &mut self,
        repo: &dyn ProgressRepository,
        learner_id: Option<&str>,
        request: &ActionRequest,
        rules: &ProgressionRules,
    ) -> ActionOutcome {
        let Some(learner_id) = learner_id else {
            self.stats.rejected_unauthenticated += 1;
            debug!(event = "track_action_unauthenticated", kind = %request.kind);
            return ActionOutcome::default();
        };

        match repo.apply_action(learner_id, request, rules) {
            Ok(outcome) => {
                self.stats.tracked += 1;
                info!(
                    event = "action_tracked",
                    learner_id,
                    kind = %request.kind,
                    xp_awarded = outcome.xp_awarded,
                    badges = outcome.badges.len(),
                    titles = outcome.titles.len(),
                    achievements = outcome.achievements.len(),
                    level_up = outcome.level_up.map(|level_up| level_up.new_level),
                );
                outcome
            }
            Err(err) => {
                self.stats.failed += 1;
                warn!(
                    event = "track_action_failed",
                    learner_id,
                    kind = %request.kind,
                    error = %err
                );
                ActionOutcome::default()
            }
        }
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }
}
