use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::Metric;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuizSessionRecord {
    pub id: String,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Percentage score, the single canonical score field.
    #[serde(default)]
    pub score: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StudySessionRecord {
    pub id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlashcardDeckRecord {
    pub id: String,
    #[serde(default)]
    pub card_count: u64,
    #[serde(default)]
    pub mastered_count: u64,
    #[serde(default)]
    pub reviewed_count: u64,
}

/// Read-only activity collections owned by the content screens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStreams {
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
    #[serde(default)]
    pub quiz_sessions: Vec<QuizSessionRecord>,
    #[serde(default)]
    pub study_sessions: Vec<StudySessionRecord>,
    #[serde(default)]
    pub decks: Vec<FlashcardDeckRecord>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub document_count: u64,
    pub quiz_count: u64,
    pub perfect_quiz_count: u64,
    pub study_minutes: u64,
    pub deck_count: u64,
    pub mastered_card_count: u64,
    pub flashcards_reviewed: u64,
    pub streak_days: u64,
    pub classes_joined: u64,
}

impl ActivitySnapshot {
    /// Value of a non-level metric; `Metric::Level` is supplied by the caller.
    pub fn metric(&self, metric: Metric) -> Option<u64> {
        match metric {
            Metric::DocumentCount => Some(self.document_count),
            Metric::QuizCount => Some(self.quiz_count),
            Metric::PerfectQuizCount => Some(self.perfect_quiz_count),
            Metric::StudyMinutes => Some(self.study_minutes),
            Metric::DeckCount => Some(self.deck_count),
            Metric::MasteredCardCount => Some(self.mastered_card_count),
            Metric::FlashcardsReviewed => Some(self.flashcards_reviewed),
            Metric::StreakDays => Some(self.streak_days),
            Metric::ClassesJoined => Some(self.classes_joined),
            Metric::Level => None,
        }
    }

    /// Component-wise `self <= other`.
    pub fn is_dominated_by(&self, other: &ActivitySnapshot) -> bool {
        self.document_count <= other.document_count
            && self.quiz_count <= other.quiz_count
            && self.perfect_quiz_count <= other.perfect_quiz_count
            && self.study_minutes <= other.study_minutes
            && self.deck_count <= other.deck_count
            && self.mastered_card_count <= other.mastered_card_count
            && self.flashcards_reviewed <= other.flashcards_reviewed
            && self.streak_days <= other.streak_days
            && self.classes_joined <= other.classes_joined
    }

    /// Component-wise maximum, used to merge stream-derived counters with the
    /// tallies kept by tracked actions.
    pub fn max_with(&self, other: &ActivitySnapshot) -> ActivitySnapshot {
        ActivitySnapshot {
            document_count: self.document_count.max(other.document_count),
            quiz_count: self.quiz_count.max(other.quiz_count),
            perfect_quiz_count: self.perfect_quiz_count.max(other.perfect_quiz_count),
            study_minutes: self.study_minutes.max(other.study_minutes),
            deck_count: self.deck_count.max(other.deck_count),
            mastered_card_count: self.mastered_card_count.max(other.mastered_card_count),
            flashcards_reviewed: self.flashcards_reviewed.max(other.flashcards_reviewed),
            streak_days: self.streak_days.max(other.streak_days),
            classes_joined: self.classes_joined.max(other.classes_joined),
        }
    }
}

pub fn aggregate(streams: &ActivityStreams, today: NaiveDate) -> ActivitySnapshot {
    let document_count = distinct(streams.documents.iter().map(|doc| doc.id.as_str()));

    let completed_quizzes = dedupe_by_id(
        streams
            .quiz_sessions
            .iter()
            .filter(|quiz| quiz.completed_at.is_some()),
        |quiz| quiz.id.as_str(),
    );
    let perfect_quiz_count = completed_quizzes
        .values()
        .filter(|quiz| quiz.score.is_some_and(|score| score >= 100))
        .count() as u64;

    let completed_sessions = dedupe_by_id(
        streams
            .study_sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Completed),
        |session| session.id.as_str(),
    );
    let study_seconds: u64 = completed_sessions
        .values()
        .map(|session| session.total_seconds)
        .sum();

    let decks = dedupe_by_id(streams.decks.iter(), |deck| deck.id.as_str());

    ActivitySnapshot {
        document_count,
        quiz_count: completed_quizzes.len() as u64,
        perfect_quiz_count,
        study_minutes: (study_seconds + 30) / 60,
        deck_count: decks.len() as u64,
        mastered_card_count: decks.values().map(|deck| deck.mastered_count).sum(),
        flashcards_reviewed: decks.values().map(|deck| deck.reviewed_count).sum(),
        streak_days: u64::from(consecutive_day_streak(active_days(streams), today)),
        classes_joined: 0,
    }
}

/// Dashboard hints read from the raw streams; unlocks never depend on them.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInsights {
    pub average_quiz_score: Option<u32>,
    pub streak_days: u32,
    pub streak_at_risk: bool,
}

pub fn insights(streams: &ActivityStreams, today: NaiveDate) -> ActivityInsights {
    let days = active_days(streams);
    ActivityInsights {
        average_quiz_score: average_quiz_score(streams),
        streak_days: consecutive_day_streak(days.iter().copied(), today),
        streak_at_risk: is_streak_at_risk(days, today),
    }
}

/// Days with a completed study session or quiz.
fn active_days(streams: &ActivityStreams) -> BTreeSet<NaiveDate> {
    streams
        .study_sessions
        .iter()
        .filter(|session| session.status == SessionStatus::Completed)
        .filter_map(|session| session.start_time)
        .chain(streams.quiz_sessions.iter().filter_map(|quiz| quiz.completed_at))
        .map(|ts| ts.date_naive())
        .collect()
}

pub fn average_quiz_score(streams: &ActivityStreams) -> Option<u32> {
    let scores = streams
        .quiz_sessions
        .iter()
        .filter(|quiz| quiz.completed_at.is_some())
        .filter_map(|quiz| quiz.score)
        .collect::<Vec<_>>();
    if scores.is_empty() {
        return None;
    }
    let total: u64 = scores.iter().map(|score| u64::from(*score)).sum();
    let count = scores.len() as u64;
    Some(((total + count / 2) / count) as u32)
}

/// Consecutive active days ending on the most recent one; broken when the most
/// recent active day is before yesterday.
pub fn consecutive_day_streak(days: impl IntoIterator<Item = NaiveDate>, today: NaiveDate) -> u32 {
    let days = days.into_iter().collect::<BTreeSet<_>>();
    let Some(&latest) = days.iter().next_back() else {
        return 0;
    };
    let yesterday = today.pred_opt().unwrap_or(today);
    if latest < yesterday {
        return 0;
    }

    let mut streak = 0;
    let mut expected = latest;
    for day in days.iter().rev() {
        if *day != expected {
            break;
        }
        streak += 1;
        match expected.pred_opt() {
            Some(previous) => expected = previous,
            None => break,
        }
    }
    streak
}

pub fn is_streak_at_risk(days: impl IntoIterator<Item = NaiveDate>, today: NaiveDate) -> bool {
    let days = days.into_iter().collect::<BTreeSet<_>>();
    let Some(yesterday) = today.pred_opt() else {
        return false;
    };
    !days.contains(&today) && days.contains(&yesterday)
}

fn distinct<'a>(ids: impl Iterator<Item = &'a str>) -> u64 {
    ids.collect::<BTreeSet<_>>().len() as u64
}

fn dedupe_by_id<'a, T>(
    items: impl Iterator<Item = &'a T>,
    id: impl Fn(&T) -> &str,
) -> BTreeMap<String, &'a T> {
    let mut by_id = BTreeMap::new();
    for item in items {
        by_id.entry(id(item).to_string()).or_insert(item);
    }
    by_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("valid date")
    }

    fn at(d: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn session(id: &str, status: SessionStatus, start: DateTime<Utc>, seconds: u64) -> StudySessionRecord {
        StudySessionRecord {
            id: id.to_string(),
            status,
            start_time: Some(start),
            total_seconds: seconds,
        }
    }

    #[test]
    fn aggregate_reduces_streams_into_counters() {
        let streams = ActivityStreams {
            documents: vec![
                DocumentRecord { id: "d1".into(), created_at: None },
                DocumentRecord { id: "d2".into(), created_at: None },
                DocumentRecord { id: "d2".into(), created_at: None },
            ],
            quiz_sessions: vec![
                QuizSessionRecord { id: "q1".into(), completed_at: Some(at(9, 10)), score: Some(100) },
                QuizSessionRecord { id: "q2".into(), completed_at: Some(at(10, 10)), score: Some(60) },
                QuizSessionRecord { id: "q3".into(), completed_at: None, score: Some(100) },
            ],
            study_sessions: vec![
                session("s1", SessionStatus::Completed, at(8, 9), 1_800),
                session("s2", SessionStatus::Completed, at(10, 9), 1_830),
                session("s3", SessionStatus::Abandoned, at(10, 12), 9_000),
            ],
            decks: vec![FlashcardDeckRecord {
                id: "deck".into(),
                card_count: 40,
                mastered_count: 12,
                reviewed_count: 55,
            }],
        };

        let snapshot = aggregate(&streams, day(10));
        assert_eq!(snapshot.document_count, 2);
        assert_eq!(snapshot.quiz_count, 2);
        assert_eq!(snapshot.perfect_quiz_count, 1);
        assert_eq!(snapshot.study_minutes, 61);
        assert_eq!(snapshot.deck_count, 1);
        assert_eq!(snapshot.mastered_card_count, 12);
        assert_eq!(snapshot.flashcards_reviewed, 55);
        assert_eq!(snapshot.streak_days, 3);
        assert_eq!(average_quiz_score(&streams), Some(80));

        let hints = insights(&streams, day(11));
        assert_eq!(hints.average_quiz_score, Some(80));
        assert_eq!(hints.streak_days, 3);
        assert!(hints.streak_at_risk);
        assert!(!insights(&streams, day(10)).streak_at_risk);
    }

    #[test]
    fn streak_breaks_after_a_missed_day() {
        assert_eq!(consecutive_day_streak([day(5), day(6), day(7)], day(8)), 3);
        assert_eq!(consecutive_day_streak([day(5), day(6), day(7)], day(9)), 0);
        assert_eq!(consecutive_day_streak([day(3), day(5), day(6)], day(6)), 2);
        assert_eq!(consecutive_day_streak(Vec::new(), day(6)), 0);
    }

    #[test]
    fn streak_at_risk_when_only_yesterday_is_active() {
        assert!(is_streak_at_risk([day(5), day(6)], day(7)));
        assert!(!is_streak_at_risk([day(6), day(7)], day(7)));
        assert!(!is_streak_at_risk([day(4)], day(7)));
    }

    #[test]
    fn dominance_is_component_wise() {
        let small = ActivitySnapshot {
            quiz_count: 1,
            ..ActivitySnapshot::default()
        };
        let large = ActivitySnapshot {
            quiz_count: 2,
            document_count: 1,
            ..ActivitySnapshot::default()
        };
        assert!(small.is_dominated_by(&large));
        assert!(!large.is_dominated_by(&small));
    }
}
