use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::activity::ActivitySnapshot;
use crate::catalog::DEFAULT_TITLE_ID;
use crate::levels::LevelTable;
use crate::missions::{Achievement, Mission};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("title {0} is not unlocked")]
    TitleLocked(String),
    #[error("unknown title {0}")]
    UnknownTitle(String),
}

/// The authoritative per-learner record. Local copies are projections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProgress {
    #[serde(default, deserialize_with = "deserialize_clamped")]
    pub xp: u64,
    #[serde(default = "default_level", deserialize_with = "deserialize_level")]
    pub level: u32,
    #[serde(default, deserialize_with = "deserialize_clamped_u32")]
    pub streak: u32,
    #[serde(default, alias = "badges", deserialize_with = "deserialize_id_set")]
    pub unlocked_badges: BTreeSet<String>,
    #[serde(default, alias = "titles", deserialize_with = "deserialize_id_set")]
    pub unlocked_titles: BTreeSet<String>,
    #[serde(
        default = "default_title_id",
        alias = "currentTitleId",
        deserialize_with = "deserialize_title_id"
    )]
    pub equipped_title_id: String,
    #[serde(default, deserialize_with = "deserialize_lenient_ts")]
    pub last_badge_sync: Option<DateTime<Utc>>,
}

impl Default for LearnerProgress {
    fn default() -> Self {
        Self {
            xp: 0,
            level: 1,
            streak: 0,
            unlocked_badges: BTreeSet::new(),
            unlocked_titles: [DEFAULT_TITLE_ID.to_string()].into_iter().collect(),
            equipped_title_id: DEFAULT_TITLE_ID.to_string(),
            last_badge_sync: None,
        }
    }
}

impl LearnerProgress {
    /// Parses a loosely shaped store document; unknown fields are ignored and
    /// missing ones take explicit defaults.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Re-establishes record invariants: level derived from xp, the default
    /// title always unlocked, and the equipped title one that is unlocked.
    /// Returns true when anything changed.
    pub fn normalize(&mut self, levels: &LevelTable) -> bool {
        let mut changed = false;
        let level = levels.level_for(self.xp);
        if self.level != level {
            self.level = level;
            changed = true;
        }
        if self.unlocked_titles.insert(DEFAULT_TITLE_ID.to_string()) {
            changed = true;
        }
        if !self.unlocked_titles.contains(&self.equipped_title_id) {
            self.equipped_title_id = DEFAULT_TITLE_ID.to_string();
            changed = true;
        }
        changed
    }
}

/// Partial merge applied to a learner record. Unlock sets are unioned, never
/// replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LearnerPatch {
    #[serde(default)]
    pub unlock_badges: BTreeSet<String>,
    #[serde(default)]
    pub unlock_titles: BTreeSet<String>,
    #[serde(default)]
    pub last_badge_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub xp: Option<u64>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub streak: Option<u32>,
    #[serde(default)]
    pub equipped_title_id: Option<String>,
}

impl LearnerPatch {
    pub fn unlocks(
        badges: BTreeSet<String>,
        titles: BTreeSet<String>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            unlock_badges: badges,
            unlock_titles: titles,
            last_badge_sync: Some(synced_at),
            ..Self::default()
        }
    }

    pub fn stats(xp: u64, level: u32, streak: u32) -> Self {
        Self {
            xp: Some(xp),
            level: Some(level),
            streak: Some(streak),
            ..Self::default()
        }
    }

    pub fn equip(title_id: impl Into<String>) -> Self {
        Self {
            equipped_title_id: Some(title_id.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Merges into `progress`. XP and level never move backwards; the
    /// equipped title must already be unlocked (after this patch's unlocks).
    pub fn apply_to(&self, progress: &mut LearnerProgress) -> Result<(), ProgressError> {
        if let Some(title_id) = &self.equipped_title_id {
            let unlocked = progress.unlocked_titles.contains(title_id)
                || self.unlock_titles.contains(title_id);
            if !unlocked {
                return Err(ProgressError::TitleLocked(title_id.clone()));
            }
        }

        progress
            .unlocked_badges
            .extend(self.unlock_badges.iter().cloned());
        progress
            .unlocked_titles
            .extend(self.unlock_titles.iter().cloned());
        if let Some(synced_at) = self.last_badge_sync {
            progress.last_badge_sync = Some(synced_at);
        }
        if let Some(xp) = self.xp {
            progress.xp = progress.xp.max(xp);
        }
        if let Some(level) = self.level {
            progress.level = progress.level.max(level);
        }
        if let Some(streak) = self.streak {
            progress.streak = streak;
        }
        if let Some(title_id) = &self.equipped_title_id {
            progress.equipped_title_id = title_id.clone();
        }
        Ok(())
    }
}

/// Lifetime tallies kept on the gamification record by tracked actions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCounters {
    #[serde(default)]
    pub study_minutes: u64,
    #[serde(default)]
    pub quizzes_completed: u64,
    #[serde(default)]
    pub perfect_quizzes: u64,
    #[serde(default)]
    pub flashcards_reviewed: u64,
    #[serde(default)]
    pub flashcards_mastered: u64,
    #[serde(default)]
    pub decks_created: u64,
    #[serde(default)]
    pub documents_uploaded: u64,
    #[serde(default)]
    pub classes_joined: u64,
    #[serde(default)]
    pub content_generated: u64,
}

impl ActivityCounters {
    pub fn snapshot(&self, streak_days: u32) -> ActivitySnapshot {
        ActivitySnapshot {
            document_count: self.documents_uploaded,
            quiz_count: self.quizzes_completed,
            perfect_quiz_count: self.perfect_quizzes,
            study_minutes: self.study_minutes,
            deck_count: self.decks_created,
            mastered_card_count: self.flashcards_mastered,
            flashcards_reviewed: self.flashcards_reviewed,
            streak_days: u64::from(streak_days),
            classes_joined: self.classes_joined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckIn {
    AlreadyCheckedIn,
    Extended(u32),
    Restarted,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreakState {
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub longest: u32,
    #[serde(default)]
    pub last_check_in: Option<NaiveDate>,
}

impl StreakState {
    pub fn check_in(&mut self, today: NaiveDate) -> CheckIn {
        if self.last_check_in == Some(today) {
            return CheckIn::AlreadyCheckedIn;
        }
        let consecutive = self
            .last_check_in
            .zip(today.pred_opt())
            .is_some_and(|(last, yesterday)| last == yesterday);
        let result = if consecutive {
            self.current += 1;
            CheckIn::Extended(self.current)
        } else {
            self.current = 1;
            CheckIn::Restarted
        };
        self.longest = self.longest.max(self.current);
        self.last_check_in = Some(today);
        result
    }
}

/// Per-learner gamification document: counters, streak, missions, achievements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GamificationRecord {
    #[serde(default)]
    pub counters: ActivityCounters,
    #[serde(default, rename = "streakData")]
    pub streak: StreakState,
    #[serde(default)]
    pub missions: Vec<Mission>,
    #[serde(default)]
    pub achievements: Vec<Achievement>,
    #[serde(default)]
    pub daily_bonus_window: Option<String>,
}

/// Both learner documents, loaded and saved together by a store transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnerState {
    pub progress: LearnerProgress,
    pub gamification: GamificationRecord,
}

fn default_level() -> u32 {
    1
}

fn default_title_id() -> String {
    DEFAULT_TITLE_ID.to_string()
}

fn deserialize_clamped<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => Ok(n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0)),
        Value::Null => Ok(0),
        _ => Err(serde::de::Error::custom("expected number")),
    }
}

/// Anything that is not a positive number reads as level 1; `normalize`
/// re-derives the real level from xp.
fn deserialize_level<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    let level = match val {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    };
    Ok(u32::try_from(level).unwrap_or(u32::MAX).max(1))
}

fn deserialize_title_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(id) if !id.trim().is_empty() => id,
        _ => default_title_id(),
    })
}

fn deserialize_lenient_ts<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(val
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|ts| ts.with_timezone(&Utc)))
}

fn deserialize_clamped_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = deserialize_clamped(deserializer)?;
    Ok(u32::try_from(value).unwrap_or(u32::MAX))
}

/// Accepts `["a", {"id": "b"}, {"badgeId": "c"}]` and drops anything else.
fn deserialize_id_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    let Value::Array(items) = val else {
        return Ok(BTreeSet::new());
    };
    let mut ids = BTreeSet::new();
    for item in items {
        let id = match item {
            Value::String(s) => Some(s),
            Value::Object(map) => ["id", "badgeId", "titleId"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        };
        if let Some(id) = id.filter(|id| !id.trim().is_empty()) {
            ids.insert(id);
        }
    }
    Ok(ids)
}
