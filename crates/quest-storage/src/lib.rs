//! Storage seam for the progression engine.
//!
//! [`ProgressRepository`] is the only way the engine talks to the remote
//! record store. Two implementations ship here: [`MemoryStore`] for tests and
//! demos (with fault injection) and [`SqliteStore`] for a local file-backed
//! store. Both publish every committed change on `tokio::sync::watch`
//! channels, surfaced to callers as [`Subscription`] handles.

use quest_core::{
    ActionOutcome, ActionRequest, ActivityStreams, GamificationRecord, LeaderboardCandidate,
    LearnerPatch, LearnerProgress, ProgressError, ProgressionRules, RawCatalog, TimePeriod,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod channels;
pub mod ledger;
pub mod memory;
pub mod sqlite;
mod subscription;

pub use ledger::{ActivityRecord, XpLedgerEntry};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, PROGRESS_SCHEMA_VERSION};
pub use subscription::Subscription;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("write conflict on learner {0}")]
    WriteConflict(String),
    #[error("learner {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Rejected(#[from] ProgressError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl StoreError {
    /// Failures that may succeed on a later attempt without any caller change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connectivity(_) | StoreError::WriteConflict(_) | StoreError::Sqlite(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub learner_id: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

impl LearnerProfile {
    pub fn student(learner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            learner_id: learner_id.into(),
            name: name.into(),
            role: default_role(),
        }
    }
}

fn default_role() -> String {
    "student".to_string()
}

/// Subscribe / read / write access to the authoritative learner records.
///
/// Writes are partial merges; no method overwrites a whole learner record.
pub trait ProgressRepository: Send + Sync {
    /// Creates the defaulted record on first sign-in; returns the existing
    /// record untouched otherwise.
    fn initialize_learner(&self, profile: &LearnerProfile) -> Result<LearnerProgress, StoreError>;

    fn read_learner(&self, learner_id: &str) -> Result<LearnerProgress, StoreError>;

    fn read_gamification(&self, learner_id: &str) -> Result<GamificationRecord, StoreError>;

    /// Read current, merge, write. Returns the committed record.
    fn write_learner(
        &self,
        learner_id: &str,
        patch: &LearnerPatch,
    ) -> Result<LearnerProgress, StoreError>;

    /// Applies a tracked action to both learner documents in one transaction.
    fn apply_action(
        &self,
        learner_id: &str,
        request: &ActionRequest,
        rules: &ProgressionRules,
    ) -> Result<ActionOutcome, StoreError>;

    fn subscribe_learner(&self, learner_id: &str) -> Result<Subscription<LearnerProgress>, StoreError>;

    fn subscribe_gamification(
        &self,
        learner_id: &str,
    ) -> Result<Subscription<GamificationRecord>, StoreError>;

    fn subscribe_catalog(&self) -> Result<Subscription<RawCatalog>, StoreError>;

    fn subscribe_activity(&self, learner_id: &str) -> Result<Subscription<ActivityStreams>, StoreError>;

    fn subscribe_leaderboard(
        &self,
        period: TimePeriod,
    ) -> Result<Subscription<Vec<LeaderboardCandidate>>, StoreError>;
}

impl<R: ProgressRepository + ?Sized> ProgressRepository for std::sync::Arc<R> {
    fn initialize_learner(&self, profile: &LearnerProfile) -> Result<LearnerProgress, StoreError> {
        (**self).initialize_learner(profile)
    }

    fn read_learner(&self, learner_id: &str) -> Result<LearnerProgress, StoreError> {
        (**self).read_learner(learner_id)
    }

    fn read_gamification(&self, learner_id: &str) -> Result<GamificationRecord, StoreError> {
        (**self).read_gamification(learner_id)
    }

    fn write_learner(
        &self,
        learner_id: &str,
        patch: &LearnerPatch,
    ) -> Result<LearnerProgress, StoreError> {
        (**self).write_learner(learner_id, patch)
    }

    fn apply_action(
        &self,
        learner_id: &str,
        request: &ActionRequest,
        rules: &ProgressionRules,
    ) -> Result<ActionOutcome, StoreError> {
        (**self).apply_action(learner_id, request, rules)
    }

    fn subscribe_learner(&self, learner_id: &str) -> Result<Subscription<LearnerProgress>, StoreError> {
        (**self).subscribe_learner(learner_id)
    }

    fn subscribe_gamification(
        &self,
        learner_id: &str,
    ) -> Result<Subscription<GamificationRecord>, StoreError> {
        (**self).subscribe_gamification(learner_id)
    }

    fn subscribe_catalog(&self) -> Result<Subscription<RawCatalog>, StoreError> {
        (**self).subscribe_catalog()
    }

    fn subscribe_activity(&self, learner_id: &str) -> Result<Subscription<ActivityStreams>, StoreError> {
        (**self).subscribe_activity(learner_id)
    }

    fn subscribe_leaderboard(
        &self,
        period: TimePeriod,
    ) -> Result<Subscription<Vec<LeaderboardCandidate>>, StoreError> {
        (**self).subscribe_leaderboard(period)
    }
}
