use chrono::{DateTime, Duration, Utc};
use quest_core::{
    rank_changes, rank_entries, LeaderboardCandidate, LeaderboardDisplay, LeaderboardEntry,
    TimePeriod,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

pub const CELEBRATION_RANK: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankDelta {
    pub entry_id: String,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Celebration {
    pub rank: u32,
    pub delta: i64,
    /// Podium finish.
    pub enhanced: bool,
    pub sound: bool,
}

/// Where celebratory feedback for the local learner goes (confetti, sound,
/// toasts in a UI; log lines in the CLI).
pub trait FeedbackSink: Send {
    fn celebrate(&mut self, celebration: Celebration);
    fn toast(&mut self, message: &str);
}

#[derive(Debug, Default)]
pub struct TracingFeedback;

impl FeedbackSink for TracingFeedback {
    fn celebrate(&mut self, celebration: Celebration) {
        info!(
            event = "rank_celebration",
            rank = celebration.rank,
            delta = celebration.delta,
            enhanced = celebration.enhanced,
            sound = celebration.sound
        );
    }

    fn toast(&mut self, message: &str) {
        info!(event = "toast", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
    pub delta: Option<i64>,
    pub is_local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardView {
    pub rows: Vec<LeaderboardRow>,
    /// The local learner's row when it falls below the visible cut.
    pub pinned_local: Option<LeaderboardRow>,
    pub total_entries: usize,
}

/// Ranks consecutive leaderboard snapshots and keeps short-lived rank deltas.
#[derive(Debug)]
pub struct LeaderboardTracker {
    display: LeaderboardDisplay,
    local_id: Option<String>,
    delta_ttl_ms: u64,
    sound_enabled: bool,
    entries: Option<Vec<LeaderboardEntry>>,
    deltas: HashMap<String, RankDelta>,
}

impl LeaderboardTracker {
    pub fn new(
        display: LeaderboardDisplay,
        local_id: Option<String>,
        delta_ttl_ms: u64,
        sound_enabled: bool,
    ) -> Self {
        Self {
            display,
            local_id,
            delta_ttl_ms,
            sound_enabled,
            entries: None,
            deltas: HashMap::new(),
        }
    }

    pub fn display(&self) -> LeaderboardDisplay {
        self.display
    }

    pub fn entries(&self) -> &[LeaderboardEntry] {
        self.entries.as_deref().unwrap_or_default()
    }

    /// Ranks `candidates` against the previous snapshot. Returns the deltas
    /// created by this update so the caller can schedule their expiry.
    pub fn update(
        &mut self,
        candidates: &[LeaderboardCandidate],
        now: DateTime<Utc>,
        feedback: &mut dyn FeedbackSink,
    ) -> Vec<RankDelta> {
        let ranked = rank_entries(candidates, self.entries.as_deref());
        let ttl = Duration::milliseconds(i64::try_from(self.delta_ttl_ms).unwrap_or(i64::MAX / 2));

        let mut created = Vec::new();
        for change in rank_changes(&ranked) {
            let delta = change.delta();
            if delta == 0 {
                continue;
            }
            let rank_delta = RankDelta {
                entry_id: change.entry_id.to_string(),
                delta,
                created_at: now,
                expires_at: now + ttl,
            };
            self.deltas
                .insert(rank_delta.entry_id.clone(), rank_delta.clone());
            created.push(rank_delta);

            if self.local_id.as_deref() == Some(change.entry_id) {
                if delta > 0 {
                    let enhanced = change.rank <= CELEBRATION_RANK;
                    feedback.celebrate(Celebration {
                        rank: change.rank,
                        delta,
                        enhanced,
                        sound: enhanced && self.sound_enabled,
                    });
                } else {
                    feedback.toast(&format!(
                        "Rank changed: you are now #{} (was #{})",
                        change.rank, change.previous_rank
                    ));
                }
            }
        }

        self.entries = Some(ranked);
        created
    }

    /// Drops the delta for `entry_id` once its TTL has elapsed.
    pub fn expire_delta(&mut self, entry_id: &str, now: DateTime<Utc>) -> bool {
        let expired = self
            .deltas
            .get(entry_id)
            .is_some_and(|delta| now >= delta.expires_at);
        if expired {
            self.deltas.remove(entry_id);
        }
        expired
    }

    pub fn active_deltas(&self, now: DateTime<Utc>) -> Vec<&RankDelta> {
        let mut deltas = self
            .deltas
            .values()
            .filter(|delta| now < delta.expires_at)
            .collect::<Vec<_>>();
        deltas.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        deltas
    }

    /// New period: history is discarded so the next snapshot produces no
    /// deltas.
    pub fn set_period(&mut self, period: TimePeriod) {
        self.display.time_period = period;
        self.entries = None;
        self.deltas.clear();
    }

    pub fn set_display(&mut self, display: LeaderboardDisplay) {
        if display.time_period != self.display.time_period {
            self.set_period(display.time_period);
        }
        self.display = display;
    }

    pub fn view(&self, now: DateTime<Utc>) -> LeaderboardView {
        let entries = self.entries();
        let row = |entry: &LeaderboardEntry| LeaderboardRow {
            entry: entry.clone(),
            delta: self
                .deltas
                .get(&entry.id)
                .filter(|delta| now < delta.expires_at)
                .map(|delta| delta.delta),
            is_local: self.local_id.as_deref() == Some(entry.id.as_str()),
        };

        let rows = entries
            .iter()
            .take(self.display.max_visible)
            .map(row)
            .collect::<Vec<_>>();
        let pinned_local = if self.display.compact {
            None
        } else {
            entries
                .iter()
                .skip(self.display.max_visible)
                .find(|entry| self.local_id.as_deref() == Some(entry.id.as_str()))
                .map(row)
        };

        LeaderboardView {
            rows,
            pinned_local,
            total_entries: entries.len(),
        }
    }
}
