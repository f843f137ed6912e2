use quest_core::{
    ActivityStreams, GamificationRecord, LeaderboardCandidate, LearnerProgress, LearnerState,
    RawCatalog, TimePeriod,
};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::{StoreError, Subscription};

/// Keyed watch senders. A sender is created on first subscribe and then kept
/// current by every publish.
pub(crate) struct Topic<K, T> {
    senders: Mutex<HashMap<K, watch::Sender<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone + PartialEq> Topic<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, key: &K, current: impl FnOnce() -> T) -> Subscription<T> {
        let mut senders = lock(&self.senders);
        let sender = senders
            .entry(key.clone())
            .or_insert_with(|| watch::channel(current()).0);
        Subscription::new(sender.subscribe())
    }

    /// Notifies subscribers only when the value actually changed.
    pub(crate) fn publish(&self, key: &K, value: T) {
        let senders = lock(&self.senders);
        if let Some(sender) = senders.get(key) {
            sender.send_if_modified(|current| {
                if *current == value {
                    return false;
                }
                *current = value;
                true
            });
        }
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        lock(&self.senders).keys().cloned().collect()
    }
}

pub(crate) struct Channels {
    pub(crate) learners: Topic<String, LearnerProgress>,
    pub(crate) gamification: Topic<String, GamificationRecord>,
    pub(crate) activity: Topic<String, ActivityStreams>,
    pub(crate) leaderboards: Topic<TimePeriod, Vec<LeaderboardCandidate>>,
    pub(crate) catalog: Topic<(), RawCatalog>,
}

impl Channels {
    pub(crate) fn new() -> Self {
        Self {
            learners: Topic::new(),
            gamification: Topic::new(),
            activity: Topic::new(),
            leaderboards: Topic::new(),
            catalog: Topic::new(),
        }
    }

    /// Publishes both learner documents. Stores call this while still
    /// holding their own lock, so subscribers see commits in order.
    pub(crate) fn publish_state(&self, learner_id: &str, state: &LearnerState) {
        let key = learner_id.to_string();
        self.learners.publish(&key, state.progress.clone());
        self.gamification.publish(&key, state.gamification.clone());
    }

    /// Recomputes every board that has a subscriber. A board that fails to
    /// load keeps its previous value until the next commit.
    pub(crate) fn publish_leaderboards(
        &self,
        mut load: impl FnMut(TimePeriod) -> Result<Vec<LeaderboardCandidate>, StoreError>,
    ) {
        for period in self.leaderboards.keys() {
            if let Ok(candidates) = load(period) {
                self.leaderboards.publish(&period, candidates);
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
