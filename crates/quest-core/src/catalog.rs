use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_TITLE_ID: &str = "title_newbie";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("malformed {kind} entry at index {index}: {reason}")]
    Malformed {
        kind: &'static str,
        index: usize,
        reason: String,
    },
    #[error("duplicate {kind} id {id}")]
    Duplicate { kind: &'static str, id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    DocumentCount,
    QuizCount,
    PerfectQuizCount,
    StudyMinutes,
    DeckCount,
    MasteredCardCount,
    FlashcardsReviewed,
    StreakDays,
    ClassesJoined,
    Level,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::DocumentCount => "documentCount",
            Metric::QuizCount => "quizCount",
            Metric::PerfectQuizCount => "perfectQuizCount",
            Metric::StudyMinutes => "studyMinutes",
            Metric::DeckCount => "deckCount",
            Metric::MasteredCardCount => "masteredCardCount",
            Metric::FlashcardsReviewed => "flashcardsReviewed",
            Metric::StreakDays => "streakDays",
            Metric::ClassesJoined => "classesJoined",
            Metric::Level => "level",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequirementKind {
    Count,
    Level,
    Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub kind: RequirementKind,
    pub metric: Metric,
    pub threshold: u64,
}

impl Requirement {
    pub fn count(metric: Metric, threshold: u64) -> Self {
        Self {
            kind: RequirementKind::Count,
            metric,
            threshold,
        }
    }

    pub fn duration(threshold_minutes: u64) -> Self {
        Self {
            kind: RequirementKind::Duration,
            metric: Metric::StudyMinutes,
            threshold: threshold_minutes,
        }
    }

    pub fn level(required: u64) -> Self {
        Self {
            kind: RequirementKind::Level,
            metric: Metric::Level,
            threshold: required,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let consistent = match self.kind {
            RequirementKind::Level => self.metric == Metric::Level,
            RequirementKind::Duration => self.metric == Metric::StudyMinutes,
            RequirementKind::Count => {
                !matches!(self.metric, Metric::Level | Metric::StudyMinutes)
            }
        };
        if !consistent {
            return Err(format!(
                "requirement kind {:?} cannot use metric {}",
                self.kind, self.metric
            ));
        }
        if self.threshold == 0 {
            return Err("requirement threshold must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BadgeDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub requirement: Requirement,
    #[serde(default)]
    pub xp_reward: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TitleRarity {
    #[default]
    Common,
    Rare,
    Epic,
    Legendary,
}

impl FromStr for TitleRarity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "common" => Ok(TitleRarity::Common),
            "rare" => Ok(TitleRarity::Rare),
            "epic" => Ok(TitleRarity::Epic),
            "legendary" => Ok(TitleRarity::Legendary),
            other => Err(format!("Unknown rarity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TitleDefinition {
    pub id: String,
    pub text: String,
    pub required_level: u32,
    #[serde(default)]
    pub rarity: TitleRarity,
}

/// Catalog records as delivered by the store, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawCatalog {
    #[serde(default)]
    pub badges: Vec<Value>,
    #[serde(default)]
    pub titles: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub badges: Vec<BadgeDefinition>,
    pub titles: Vec<TitleDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLoad {
    pub catalog: Catalog,
    pub skipped: Vec<CatalogError>,
    pub badges_defaulted: bool,
    pub titles_defaulted: bool,
}

impl Catalog {
    pub fn badge(&self, id: &str) -> Option<&BadgeDefinition> {
        self.badges.iter().find(|badge| badge.id == id)
    }

    pub fn title(&self, id: &str) -> Option<&TitleDefinition> {
        self.titles.iter().find(|title| title.id == id)
    }

    pub fn badge_ids(&self) -> BTreeSet<String> {
        self.badges.iter().map(|badge| badge.id.clone()).collect()
    }

    /// Validates raw store entries, skipping malformed ones. A kind that ends up
    /// empty falls back to the built-in defaults.
    pub fn from_raw(raw: &RawCatalog) -> CatalogLoad {
        let mut skipped = Vec::new();
        let badges = parse_entries::<BadgeDefinition>(&raw.badges, "badge", &mut skipped, |badge| {
            if badge.id.trim().is_empty() {
                return Err("badge id is empty".to_string());
            }
            badge.requirement.validate()
        });
        let titles = parse_entries::<TitleDefinition>(&raw.titles, "title", &mut skipped, |title| {
            if title.id.trim().is_empty() {
                return Err("title id is empty".to_string());
            }
            if title.required_level == 0 {
                return Err("title requiredLevel must be at least 1".to_string());
            }
            Ok(())
        });

        let defaults = Catalog::default();
        let badges_defaulted = badges.is_empty();
        let titles_defaulted = titles.is_empty();
        CatalogLoad {
            catalog: Catalog {
                badges: if badges_defaulted { defaults.badges } else { badges },
                titles: if titles_defaulted { defaults.titles } else { titles },
            },
            skipped,
            badges_defaulted,
            titles_defaulted,
        }
    }

    pub fn to_raw(&self) -> RawCatalog {
        RawCatalog {
            badges: self
                .badges
                .iter()
                .filter_map(|badge| serde_json::to_value(badge).ok())
                .collect(),
            titles: self
                .titles
                .iter()
                .filter_map(|title| serde_json::to_value(title).ok())
                .collect(),
        }
    }
}

fn parse_entries<T>(
    values: &[Value],
    kind: &'static str,
    skipped: &mut Vec<CatalogError>,
    validate: impl Fn(&T) -> Result<(), String>,
) -> Vec<T>
where
    T: serde::de::DeserializeOwned + HasId,
{
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for (index, value) in values.iter().enumerate() {
        let entry = match serde_json::from_value::<T>(value.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                skipped.push(CatalogError::Malformed {
                    kind,
                    index,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if let Err(reason) = validate(&entry) {
            skipped.push(CatalogError::Malformed {
                kind,
                index,
                reason,
            });
            continue;
        }
        if !seen.insert(entry.id().to_string()) {
            skipped.push(CatalogError::Duplicate {
                kind,
                id: entry.id().to_string(),
            });
            continue;
        }
        entries.push(entry);
    }
    entries
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for BadgeDefinition {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for TitleDefinition {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            badges: default_badges(),
            titles: default_titles(),
        }
    }
}

fn badge(id: &str, name: &str, description: &str, requirement: Requirement, xp_reward: u64) -> BadgeDefinition {
    BadgeDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        requirement,
        xp_reward,
    }
}

fn default_badges() -> Vec<BadgeDefinition> {
    vec![
        badge("streak_3", "Getting Started", "Study for 3 days in a row", Requirement::count(Metric::StreakDays, 3), 50),
        badge("streak_7", "Week Warrior", "Maintain a 7-day study streak", Requirement::count(Metric::StreakDays, 7), 100),
        badge("streak_30", "Unstoppable", "Study for 30 days straight", Requirement::count(Metric::StreakDays, 30), 500),
        badge("study_1hr", "First Hour", "Study for 1 hour total", Requirement::duration(60), 50),
        badge("study_10hr", "Dedicated Learner", "Study for 10 hours total", Requirement::duration(600), 200),
        badge("study_50hr", "Study Master", "Study for 50 hours total", Requirement::duration(3_000), 1_000),
        badge("quiz_first", "Quiz Taker", "Complete your first quiz", Requirement::count(Metric::QuizCount, 1), 25),
        badge("quiz_10", "Quiz Champion", "Complete 10 quizzes", Requirement::count(Metric::QuizCount, 10), 150),
        badge("quiz_perfect", "Perfectionist", "Score 100% on any quiz", Requirement::count(Metric::PerfectQuizCount, 1), 100),
        badge("flashcard_50", "Memory Builder", "Review 50 flashcards", Requirement::count(Metric::FlashcardsReviewed, 50), 75),
        badge("flashcard_master", "Master 20 Cards", "Fully master 20 flashcards", Requirement::count(Metric::MasteredCardCount, 20), 200),
        badge("deck_first", "Deck Builder", "Create your first flashcard deck", Requirement::count(Metric::DeckCount, 1), 25),
        badge("doc_first", "First Upload", "Upload your first document", Requirement::count(Metric::DocumentCount, 1), 25),
        badge("doc_10", "Library Builder", "Upload 10 documents", Requirement::count(Metric::DocumentCount, 10), 150),
        badge("level_5", "Leveling Up", "Reach Level 5", Requirement::level(5), 100),
        badge("level_10", "Double Digits", "Reach Level 10", Requirement::level(10), 300),
        badge("level_25", "Elite Student", "Reach Level 25", Requirement::level(25), 1_000),
        badge("class_join", "Classmate", "Join your first class", Requirement::count(Metric::ClassesJoined, 1), 50),
    ]
}

fn default_titles() -> Vec<TitleDefinition> {
    [
        (DEFAULT_TITLE_ID, "Novice Learner", 1, TitleRarity::Common),
        ("title_apprentice", "Knowledge Apprentice", 5, TitleRarity::Common),
        ("title_scholar", "Dedicated Scholar", 10, TitleRarity::Rare),
        ("title_master", "Master Student", 15, TitleRarity::Rare),
        ("title_sage", "Sage", 20, TitleRarity::Epic),
        ("title_legend", "Living Legend", 25, TitleRarity::Legendary),
    ]
    .into_iter()
    .map(|(id, text, required_level, rarity)| TitleDefinition {
        id: id.to_string(),
        text: text.to_string(),
        required_level,
        rarity,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_catalog_is_internally_valid() {
        let load = Catalog::from_raw(&Catalog::default().to_raw());
        assert!(load.skipped.is_empty(), "{:?}", load.skipped);
        assert!(!load.badges_defaulted);
        assert_eq!(load.catalog, Catalog::default());
        assert!(load.catalog.title(DEFAULT_TITLE_ID).is_some());
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let raw = RawCatalog {
            badges: vec![
                json!({"id": "doc_first", "name": "First Upload",
                       "requirement": {"kind": "count", "metric": "documentCount", "threshold": 1}}),
                json!({"id": "broken", "name": "No requirement"}),
                json!({"id": "mismatch", "name": "Bad kind",
                       "requirement": {"kind": "level", "metric": "quizCount", "threshold": 3}}),
                json!({"id": "doc_first", "name": "Dupe",
                       "requirement": {"kind": "count", "metric": "documentCount", "threshold": 2}}),
            ],
            titles: vec![json!({"id": "t1", "text": "One", "requiredLevel": 1}), json!("nope")],
        };

        let load = Catalog::from_raw(&raw);
        assert_eq!(load.catalog.badges.len(), 1);
        assert_eq!(load.catalog.badges[0].id, "doc_first");
        assert_eq!(load.catalog.badges[0].xp_reward, 0);
        assert_eq!(load.catalog.titles.len(), 1);
        assert_eq!(load.skipped.len(), 4);
        assert!(load
            .skipped
            .iter()
            .any(|err| matches!(err, CatalogError::Duplicate { id, .. } if id == "doc_first")));
    }

    #[test]
    fn empty_remote_catalog_falls_back_to_defaults() {
        let load = Catalog::from_raw(&RawCatalog::default());
        assert!(load.badges_defaulted);
        assert!(load.titles_defaulted);
        assert_eq!(load.catalog, Catalog::default());
    }
}
