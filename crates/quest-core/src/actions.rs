use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::catalog::{BadgeDefinition, Catalog, TitleDefinition};
use crate::levels::{LevelStatus, LevelTable};
use crate::missions::{
    advance_missions, all_daily_completed, roll_missions, Achievement, MissionMetric,
    MissionScope, ALL_DAILY_COMPLETE_BONUS_XP,
};
use crate::progress::{CheckIn, LearnerState};
use crate::unlocks::{badge_qualifies, title_qualifies};

pub mod rewards {
    pub const STUDY_SESSION: u64 = 20;
    pub const QUIZ_COMPLETED: u64 = 50;
    pub const PERFECT_QUIZ_BONUS: u64 = 50;
    pub const FLASHCARD_REVIEWED: u64 = 2;
    pub const FLASHCARD_MASTERED: u64 = 10;
    pub const DECK_CREATED: u64 = 10;
    pub const DOCUMENT_UPLOADED: u64 = 25;
    pub const CLASS_JOINED: u64 = 10;
    pub const CONTENT_GENERATED: u64 = 15;
    pub const DAILY_CHECK_IN: u64 = 10;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    StudySession,
    StudyTime,
    QuizCompleted,
    FlashcardReviewed,
    FlashcardMastered,
    DeckCreated,
    DocumentUploaded,
    ClassJoined,
    ContentGenerated,
    DailyCheckIn,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::StudySession,
        ActionKind::StudyTime,
        ActionKind::QuizCompleted,
        ActionKind::FlashcardReviewed,
        ActionKind::FlashcardMastered,
        ActionKind::DeckCreated,
        ActionKind::DocumentUploaded,
        ActionKind::ClassJoined,
        ActionKind::ContentGenerated,
        ActionKind::DailyCheckIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::StudySession => "STUDY_SESSION",
            ActionKind::StudyTime => "STUDY_TIME",
            ActionKind::QuizCompleted => "QUIZ_COMPLETED",
            ActionKind::FlashcardReviewed => "FLASHCARD_REVIEWED",
            ActionKind::FlashcardMastered => "FLASHCARD_MASTERED",
            ActionKind::DeckCreated => "DECK_CREATED",
            ActionKind::DocumentUploaded => "DOCUMENT_UPLOADED",
            ActionKind::ClassJoined => "CLASS_JOINED",
            ActionKind::ContentGenerated => "CONTENT_GENERATED",
            ActionKind::DailyCheckIn => "DAILY_CHECK_IN",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "STUDY_SESSION" => ActionKind::StudySession,
            "STUDY_TIME" => ActionKind::StudyTime,
            "QUIZ_COMPLETED" | "COMPLETE_QUIZ" => ActionKind::QuizCompleted,
            "FLASHCARD_REVIEWED" | "FLASHCARD_VIEWED" => ActionKind::FlashcardReviewed,
            "FLASHCARD_MASTERED" => ActionKind::FlashcardMastered,
            "DECK_CREATED" | "CREATE_FLASHCARD" => ActionKind::DeckCreated,
            "DOCUMENT_UPLOADED" | "UPLOAD_DOCUMENT" => ActionKind::DocumentUploaded,
            "CLASS_JOINED" | "JOIN_ROOM" => ActionKind::ClassJoined,
            "CONTENT_GENERATED" => ActionKind::ContentGenerated,
            "DAILY_CHECK_IN" | "DAILY_CHECKIN" => ActionKind::DailyCheckIn,
            _ => return Err(format!("unknown action kind: {s}")),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    #[serde(default)]
    pub minutes: Option<u64>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub perfect: Option<bool>,
}

impl ActionMetadata {
    fn is_perfect(&self) -> bool {
        self.perfect.unwrap_or(false) || self.score.is_some_and(|score| score >= 100)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    #[serde(default)]
    pub metadata: ActionMetadata,
}

impl ActionRequest {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            metadata: ActionMetadata::default(),
        }
    }

    pub fn with_minutes(mut self, minutes: u64) -> Self {
        self.metadata.minutes = Some(minutes);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.metadata.count = Some(count);
        self
    }

    pub fn with_score(mut self, score: u32) -> Self {
        self.metadata.score = Some(score);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelUp {
    pub previous_level: u32,
    pub new_level: u32,
}

/// What a single tracked action newly unlocked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub badges: Vec<BadgeDefinition>,
    pub titles: Vec<TitleDefinition>,
    pub achievements: Vec<Achievement>,
    pub level_up: Option<LevelUp>,
    pub xp_awarded: u64,
}

impl ActionOutcome {
    pub fn is_empty(&self) -> bool {
        self.badges.is_empty()
            && self.titles.is_empty()
            && self.achievements.is_empty()
            && self.level_up.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressionRules {
    pub levels: LevelTable,
    pub catalog: Catalog,
}

impl ProgressionRules {
    pub fn new(levels: LevelTable, catalog: Catalog) -> Self {
        Self { levels, catalog }
    }

    pub fn level_status(&self, xp: u64) -> LevelStatus {
        self.levels.status(xp)
    }
}

/// Applies one action to both learner documents. Callers run this inside a
/// single store transaction and persist `state` afterwards.
pub fn apply_action(
    state: &mut LearnerState,
    request: &ActionRequest,
    rules: &ProgressionRules,
    now: DateTime<Utc>,
) -> ActionOutcome {
    let mut outcome = ActionOutcome::default();
    let today = now.date_naive();
    let LearnerState {
        progress,
        gamification,
    } = state;

    if request.kind == ActionKind::DailyCheckIn
        && gamification.streak.check_in(today) == CheckIn::AlreadyCheckedIn
    {
        return outcome;
    }

    roll_missions(&mut gamification.missions, now);
    let starting_xp = progress.xp;
    let previous_level = rules.levels.level_for(progress.xp).max(progress.level);
    let meta = &request.metadata;
    let counters = &mut gamification.counters;
    let mut xp = 0u64;
    let mut observations: Vec<(MissionMetric, u64)> = Vec::new();

    match request.kind {
        ActionKind::StudySession | ActionKind::StudyTime => {
            let minutes = meta.minutes.unwrap_or(0);
            counters.study_minutes = counters.study_minutes.saturating_add(minutes);
            if request.kind == ActionKind::StudySession {
                xp += rewards::STUDY_SESSION;
            }
            if minutes > 0 {
                observations.push((MissionMetric::StudyMinutes, minutes));
            }
        }
        ActionKind::QuizCompleted => {
            counters.quizzes_completed += 1;
            xp += rewards::QUIZ_COMPLETED;
            let perfect = meta.is_perfect();
            if perfect {
                counters.perfect_quizzes += 1;
                xp += rewards::PERFECT_QUIZ_BONUS;
            }
            observations.push((MissionMetric::QuizCompleted, 1));
            let score = meta.score.or(perfect.then_some(100));
            if let Some(score) = score {
                observations.push((MissionMetric::QuizScore, u64::from(score)));
            }
        }
        ActionKind::FlashcardReviewed => {
            let cards = meta.count.unwrap_or(1);
            counters.flashcards_reviewed = counters.flashcards_reviewed.saturating_add(cards);
            xp += rewards::FLASHCARD_REVIEWED.saturating_mul(cards);
            observations.push((MissionMetric::FlashcardsReviewed, cards));
        }
        ActionKind::FlashcardMastered => {
            let cards = meta.count.unwrap_or(1);
            counters.flashcards_mastered = counters.flashcards_mastered.saturating_add(cards);
            xp += rewards::FLASHCARD_MASTERED.saturating_mul(cards);
        }
        ActionKind::DeckCreated => {
            counters.decks_created += 1;
            xp += rewards::DECK_CREATED;
        }
        ActionKind::DocumentUploaded => {
            counters.documents_uploaded += 1;
            xp += rewards::DOCUMENT_UPLOADED;
        }
        ActionKind::ClassJoined => {
            counters.classes_joined += 1;
            xp += rewards::CLASS_JOINED;
        }
        ActionKind::ContentGenerated => {
            let items = meta.count.unwrap_or(1);
            counters.content_generated = counters.content_generated.saturating_add(items);
            xp += rewards::CONTENT_GENERATED.saturating_mul(items);
        }
        ActionKind::DailyCheckIn => {
            xp += rewards::DAILY_CHECK_IN;
            progress.streak = gamification.streak.current;
        }
    }

    for (metric, amount) in observations {
        for achievement in advance_missions(&mut gamification.missions, metric, amount, now) {
            xp += achievement.xp_reward;
            outcome.achievements.push(achievement);
        }
    }
    let daily_key = MissionScope::Daily.window_key(today);
    if gamification.daily_bonus_window.as_deref() != Some(daily_key.as_str())
        && all_daily_completed(&gamification.missions, &daily_key)
    {
        xp += ALL_DAILY_COMPLETE_BONUS_XP;
        gamification.daily_bonus_window = Some(daily_key);
    }
    gamification
        .achievements
        .extend(outcome.achievements.iter().cloned());

    progress.xp = progress.xp.saturating_add(xp);

    // Badge rewards can raise the level, which can unlock level badges.
    let snapshot = gamification
        .counters
        .snapshot(gamification.streak.current.max(progress.streak));
    loop {
        let level = rules.levels.level_for(progress.xp);
        let fresh = rules
            .catalog
            .badges
            .iter()
            .filter(|badge| !progress.unlocked_badges.contains(&badge.id))
            .filter(|badge| badge_qualifies(badge, &snapshot, level))
            .collect::<Vec<_>>();
        if fresh.is_empty() {
            break;
        }
        for badge in fresh {
            progress.unlocked_badges.insert(badge.id.clone());
            progress.xp = progress.xp.saturating_add(badge.xp_reward);
            outcome.badges.push(badge.clone());
        }
    }

    let level = rules.levels.level_for(progress.xp).max(progress.level);
    for title in &rules.catalog.titles {
        if title_qualifies(title, level) && progress.unlocked_titles.insert(title.id.clone()) {
            outcome.titles.push(title.clone());
        }
    }
    if level > previous_level {
        outcome.level_up = Some(LevelUp {
            previous_level,
            new_level: level,
        });
    }
    progress.level = level;
    outcome.xp_awarded = progress.xp - starting_xp;
    outcome
}
