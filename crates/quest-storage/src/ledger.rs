use chrono::{DateTime, Utc};
use quest_core::activity::{
    DocumentRecord, FlashcardDeckRecord, QuizSessionRecord, StudySessionRecord,
};
use quest_core::{ActivityStreams, TimePeriod};
use serde::{Deserialize, Serialize};

/// One XP award. Period leaderboards sum these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpLedgerEntry {
    pub learner_id: String,
    pub amount: u64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Points earned by `learner_id` within `period` as of `now`.
pub fn period_points(
    ledger: &[XpLedgerEntry],
    learner_id: &str,
    period: TimePeriod,
    now: DateTime<Utc>,
) -> u64 {
    let start = period.window_start(now);
    ledger
        .iter()
        .filter(|entry| entry.learner_id == learner_id)
        .filter(|entry| start.map_or(true, |start| entry.recorded_at >= start))
        .map(|entry| entry.amount)
        .sum()
}

/// A single record written by the content screens into one activity stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "record", rename_all = "snake_case")]
pub enum ActivityRecord {
    Document(DocumentRecord),
    QuizSession(QuizSessionRecord),
    StudySession(StudySessionRecord),
    Deck(FlashcardDeckRecord),
}

impl ActivityRecord {
    pub fn stream(&self) -> &'static str {
        match self {
            ActivityRecord::Document(_) => "document",
            ActivityRecord::QuizSession(_) => "quiz_session",
            ActivityRecord::StudySession(_) => "study_session",
            ActivityRecord::Deck(_) => "deck",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ActivityRecord::Document(record) => &record.id,
            ActivityRecord::QuizSession(record) => &record.id,
            ActivityRecord::StudySession(record) => &record.id,
            ActivityRecord::Deck(record) => &record.id,
        }
    }

    /// Upserts into `streams`, replacing a record with the same id.
    pub fn merge_into(self, streams: &mut ActivityStreams) {
        fn upsert<T>(items: &mut Vec<T>, record: T, same: impl Fn(&T) -> bool) {
            match items.iter_mut().find(|item| same(item)) {
                Some(existing) => *existing = record,
                None => items.push(record),
            }
        }

        match self {
            ActivityRecord::Document(record) => {
                let id = record.id.clone();
                upsert(&mut streams.documents, record, |item| item.id == id)
            }
            ActivityRecord::QuizSession(record) => {
                let id = record.id.clone();
                upsert(&mut streams.quiz_sessions, record, |item| item.id == id)
            }
            ActivityRecord::StudySession(record) => {
                let id = record.id.clone();
                upsert(&mut streams.study_sessions, record, |item| item.id == id)
            }
            ActivityRecord::Deck(record) => {
                let id = record.id.clone();
                upsert(&mut streams.decks, record, |item| item.id == id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn entry(learner_id: &str, amount: u64, recorded_at: DateTime<Utc>) -> XpLedgerEntry {
        XpLedgerEntry {
            learner_id: learner_id.to_string(),
            amount,
            reason: "QUIZ_COMPLETED".to_string(),
            recorded_at,
        }
    }

    #[test]
    fn period_points_sum_within_window() {
        let ledger = vec![
            entry("amy", 50, at(1, 9)),
            entry("amy", 20, at(13, 9)),
            entry("amy", 10, at(18, 8)),
            entry("bo", 500, at(18, 8)),
        ];
        let now = at(18, 12);
        assert_eq!(period_points(&ledger, "amy", TimePeriod::Today, now), 10);
        assert_eq!(period_points(&ledger, "amy", TimePeriod::Week, now), 30);
        assert_eq!(period_points(&ledger, "amy", TimePeriod::Month, now), 80);
        assert_eq!(period_points(&ledger, "amy", TimePeriod::AllTime, now), 80);
    }

    #[test]
    fn merge_replaces_same_id() {
        let mut streams = ActivityStreams::default();
        ActivityRecord::Document(DocumentRecord { id: "d1".into(), created_at: None })
            .merge_into(&mut streams);
        ActivityRecord::Document(DocumentRecord { id: "d1".into(), created_at: Some(at(2, 1)) })
            .merge_into(&mut streams);
        assert_eq!(streams.documents.len(), 1);
        assert_eq!(streams.documents[0].created_at, Some(at(2, 1)));
    }
}
