//! Runtime side of the progression engine: store adapter, debounced unlock
//! reconciliation, action tracking, transient notifications and live
//! leaderboard rank changes, all driven by one timer scheduler.

pub mod adapter;
pub mod engine;
pub mod leaderboard;
pub mod notifications;
pub mod reconciler;
pub mod scheduler;
pub mod tracker;

pub use adapter::{CatalogSource, ProgressSnapshot, ProgressionStoreAdapter, SnapshotChanges};
pub use engine::{EngineConfig, EngineError, EngineTimer, ProgressionEngine, TitleChange};
pub use leaderboard::{
    Celebration, FeedbackSink, LeaderboardRow, LeaderboardTracker, LeaderboardView, RankDelta,
    TracingFeedback,
};
pub use notifications::{Notification, NotificationKind, NotificationPayload, NotificationQueue};
pub use reconciler::{PassStart, ReconcilerStats, StoredStats, SyncReconciler};
pub use scheduler::{TimerHandle, TimerScheduler};
pub use tracker::{ActionTracker, TrackerStats};
