use chrono::{DateTime, Duration, Utc};
use quest_core::{Achievement, ActionOutcome, BadgeDefinition, LevelUp, TitleDefinition};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Badge,
    Title,
    Achievement,
    LevelUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum NotificationPayload {
    Badge(BadgeDefinition),
    Title(TitleDefinition),
    Achievement(Achievement),
    LevelUp(LevelUp),
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::Badge(_) => NotificationKind::Badge,
            NotificationPayload::Title(_) => NotificationKind::Title,
            NotificationPayload::Achievement(_) => NotificationKind::Achievement,
            NotificationPayload::LevelUp(_) => NotificationKind::LevelUp,
        }
    }

    pub fn headline(&self) -> String {
        match self {
            NotificationPayload::Badge(badge) => format!("Badge unlocked: {}", badge.name),
            NotificationPayload::Title(title) => format!("Title unlocked: {}", title.text),
            NotificationPayload::Achievement(achievement) => {
                format!("Mission complete: {} (+{} XP)", achievement.title, achievement.xp_reward)
            }
            NotificationPayload::LevelUp(level_up) => format!("Level up! Level {}", level_up.new_level),
        }
    }

    /// One payload per non-empty outcome field, in badge, title, achievement,
    /// level-up order.
    pub fn from_outcome(outcome: &ActionOutcome) -> Vec<NotificationPayload> {
        outcome
            .badges
            .iter()
            .cloned()
            .map(NotificationPayload::Badge)
            .chain(outcome.titles.iter().cloned().map(NotificationPayload::Title))
            .chain(
                outcome
                    .achievements
                    .iter()
                    .cloned()
                    .map(NotificationPayload::Achievement),
            )
            .chain(outcome.level_up.map(NotificationPayload::LevelUp))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(flatten)]
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Transient unlock notices. Only visible entries are held; dismissal and
/// expiry both remove the entry, so nothing becomes visible twice.
#[derive(Debug)]
pub struct NotificationQueue {
    ttl_ms: u64,
    visible: Vec<Notification>,
}

impl NotificationQueue {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            visible: Vec::new(),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn push(&mut self, payload: NotificationPayload, now: DateTime<Utc>) -> &Notification {
        let ttl = Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX / 2));
        self.visible.push(Notification {
            id: Uuid::new_v4().to_string(),
            payload,
            created_at: now,
            expires_at: now + ttl,
        });
        // just pushed
        &self.visible[self.visible.len() - 1]
    }

    /// Idempotent: false when the id is unknown or already gone.
    pub fn dismiss(&mut self, id: &str) -> bool {
        let before = self.visible.len();
        self.visible.retain(|notification| notification.id != id);
        self.visible.len() != before
    }

    /// Drops every entry whose TTL has elapsed; returns how many.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.visible.len();
        self.visible.retain(|notification| !notification.is_expired(now));
        before - self.visible.len()
    }

    /// Oldest first. Entries past their TTL are hidden even before the
    /// expiry timer runs.
    pub fn visible(&self, now: DateTime<Utc>) -> Vec<&Notification> {
        self.visible
            .iter()
            .filter(|notification| !notification.is_expired(now))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<String> {
        self.visible
            .drain(..)
            .map(|notification| notification.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn level_up(level: u32) -> NotificationPayload {
        NotificationPayload::LevelUp(LevelUp {
            previous_level: level - 1,
            new_level: level,
        })
    }

    #[test]
    fn expires_after_ttl() {
        let mut queue = NotificationQueue::new(5_000);
        let id = queue.push(level_up(2), ts(0)).id.clone();

        assert_eq!(queue.visible(ts(4_999)).len(), 1);
        assert!(queue.visible(ts(5_001)).is_empty());
        assert_eq!(queue.expire_due(ts(5_001)), 1);
        assert!(!queue.dismiss(&id));
    }

    #[test]
    fn dismiss_is_immediate_and_idempotent() {
        let mut queue = NotificationQueue::new(5_000);
        let first = queue.push(level_up(2), ts(0)).id.clone();
        queue.push(level_up(3), ts(10));

        assert!(queue.dismiss(&first));
        assert!(!queue.dismiss(&first));
        let visible = queue.visible(ts(20));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].kind(), NotificationKind::LevelUp);
        assert_eq!(queue.clear().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn outcome_fans_out_in_order() {
        let outcome = ActionOutcome {
            level_up: Some(LevelUp {
                previous_level: 1,
                new_level: 2,
            }),
            titles: vec![TitleDefinition {
                id: "t".into(),
                text: "T".into(),
                required_level: 2,
                rarity: Default::default(),
            }],
            ..ActionOutcome::default()
        };
        let kinds = NotificationPayload::from_outcome(&outcome)
            .iter()
            .map(NotificationPayload::kind)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![NotificationKind::Title, NotificationKind::LevelUp]);
    }
}
