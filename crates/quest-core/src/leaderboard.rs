use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const RANKED_ROLES: [&str; 2] = ["student", "learner"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Today,
    #[default]
    Week,
    Month,
    #[serde(alias = "all-time", alias = "all_time")]
    AllTime,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Today => "today",
            TimePeriod::Week => "week",
            TimePeriod::Month => "month",
            TimePeriod::AllTime => "alltime",
        }
    }

    /// Start of the current window in UTC; `None` for all time.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let start = match self {
            TimePeriod::Today => today,
            TimePeriod::Week => {
                today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
            }
            TimePeriod::Month => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?,
            TimePeriod::AllTime => return None,
        };
        Some(start.and_hms_opt(0, 0, 0)?.and_utc())
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "today" | "day" => Ok(TimePeriod::Today),
            "week" => Ok(TimePeriod::Week),
            "month" => Ok(TimePeriod::Month),
            "alltime" | "all" => Ok(TimePeriod::AllTime),
            _ => Err(format!("unknown time period: {s}")),
        }
    }
}

/// Unranked row as delivered by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardCandidate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub points: u64,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub streak: u32,
    #[serde(default)]
    pub role: Option<String>,
}

impl LeaderboardCandidate {
    /// Missing roles are treated as learners; staff accounts are not ranked.
    pub fn is_ranked(&self) -> bool {
        match self.role.as_deref() {
            None => true,
            Some(role) => RANKED_ROLES
                .iter()
                .any(|ranked| role.eq_ignore_ascii_case(ranked)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub id: String,
    pub name: String,
    pub points: u64,
    pub level: u32,
    pub streak: u32,
    pub rank: u32,
    #[serde(default)]
    pub previous_rank: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDisplay {
    pub time_period: TimePeriod,
    pub max_visible: usize,
    pub compact: bool,
}

impl Default for LeaderboardDisplay {
    fn default() -> Self {
        Self {
            time_period: TimePeriod::Week,
            max_visible: 10,
            compact: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankChange<'a> {
    pub entry_id: &'a str,
    pub previous_rank: u32,
    pub rank: u32,
}

impl RankChange<'_> {
    /// Positive when the entry moved up.
    pub fn delta(&self) -> i64 {
        i64::from(self.previous_rank) - i64::from(self.rank)
    }
}

/// Strict order: points descending, then id ascending. Ranks start at 1 and
/// `previous_rank` is filled from `previous` when the id was present there.
pub fn rank_entries(
    candidates: &[LeaderboardCandidate],
    previous: Option<&[LeaderboardEntry]>,
) -> Vec<LeaderboardEntry> {
    let previous_ranks = previous
        .unwrap_or_default()
        .iter()
        .map(|entry| (entry.id.as_str(), entry.rank))
        .collect::<HashMap<_, _>>();

    let mut ordered = candidates
        .iter()
        .filter(|candidate| candidate.is_ranked())
        .collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.id.cmp(&b.id)));

    ordered
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| LeaderboardEntry {
            id: candidate.id.clone(),
            name: candidate.name.clone(),
            points: candidate.points,
            level: candidate.level,
            streak: candidate.streak,
            rank: index as u32 + 1,
            previous_rank: previous_ranks.get(candidate.id.as_str()).copied(),
        })
        .collect()
}

/// One change per id present in both snapshots, including zero moves.
pub fn rank_changes(entries: &[LeaderboardEntry]) -> Vec<RankChange<'_>> {
    entries
        .iter()
        .filter_map(|entry| {
            entry.previous_rank.map(|previous_rank| RankChange {
                entry_id: entry.id.as_str(),
                previous_rank,
                rank: entry.rank,
            })
        })
        .collect()
}

fn default_level() -> u32 {
    1
}
