//! Progression model for the learning dashboard: XP levels, the badge and
//! title catalog, activity aggregation, missions, tracked actions and
//! leaderboard ranking. Everything here is pure; stores and timers live in
//! `quest-storage` and `quest-engine`.

pub mod actions;
pub mod activity;
pub mod catalog;
pub mod clock;
pub mod leaderboard;
pub mod levels;
pub mod missions;
pub mod progress;
pub mod unlocks;

pub use actions::{
    apply_action, ActionKind, ActionMetadata, ActionOutcome, ActionRequest, LevelUp,
    ProgressionRules,
};
pub use activity::{aggregate, insights, ActivityInsights, ActivitySnapshot, ActivityStreams};
pub use catalog::{
    BadgeDefinition, Catalog, CatalogError, CatalogLoad, Metric, RawCatalog, Requirement,
    RequirementKind, TitleDefinition, TitleRarity, DEFAULT_TITLE_ID,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use leaderboard::{
    rank_changes, rank_entries, LeaderboardCandidate, LeaderboardDisplay, LeaderboardEntry,
    RankChange, TimePeriod,
};
pub use levels::{LevelStatus, LevelTable, LevelTableError};
pub use missions::{Achievement, Mission, MissionMetric, MissionScope};
pub use progress::{
    ActivityCounters, GamificationRecord, LearnerPatch, LearnerProgress, LearnerState,
    ProgressError, StreakState,
};
pub use unlocks::{evaluate, UnlockSet};
