use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const ALL_DAILY_COMPLETE_BONUS_XP: u64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MissionScope {
    Daily,
    Weekly,
}

impl MissionScope {
    pub fn window_key(&self, date: NaiveDate) -> String {
        match self {
            MissionScope::Daily => date.format("%Y-%m-%d").to_string(),
            MissionScope::Weekly => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MissionMetric {
    QuizCompleted,
    QuizScore,
    StudyMinutes,
    FlashcardsReviewed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub id: String,
    pub title: String,
    pub scope: MissionScope,
    pub metric: MissionMetric,
    pub target: u64,
    #[serde(default)]
    pub current: u64,
    pub xp_reward: u64,
    pub window_key: String,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn progress_percent(&self) -> u8 {
        if self.target == 0 {
            return 100;
        }
        ((self.current.min(self.target) * 100) / self.target) as u8
    }

    /// Applies one observation; returns true when this call completed it.
    fn record(&mut self, amount: u64, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        let reached = match self.metric {
            MissionMetric::QuizScore => {
                self.current = self.current.max(amount.min(self.target));
                amount >= self.target
            }
            _ => {
                self.current = self.current.saturating_add(amount).min(self.target);
                self.current >= self.target
            }
        };
        if reached {
            self.completed_at = Some(now);
        }
        reached
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub mission_id: String,
    pub title: String,
    pub xp_reward: u64,
    pub completed_at: DateTime<Utc>,
}

impl Achievement {
    fn from_mission(mission: &Mission, completed_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}@{}", mission.id, mission.window_key),
            mission_id: mission.id.clone(),
            title: mission.title.clone(),
            xp_reward: mission.xp_reward,
            completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MissionTemplate {
    id: &'static str,
    title: &'static str,
    metric: MissionMetric,
    target: u64,
    xp_reward: u64,
}

impl MissionTemplate {
    fn instantiate(&self, scope: MissionScope, window_key: &str) -> Mission {
        Mission {
            id: self.id.to_string(),
            title: self.title.to_string(),
            scope,
            metric: self.metric,
            target: self.target,
            current: 0,
            xp_reward: self.xp_reward,
            window_key: window_key.to_string(),
            completed_at: None,
        }
    }
}

const fn template(
    id: &'static str,
    title: &'static str,
    metric: MissionMetric,
    target: u64,
    xp_reward: u64,
) -> MissionTemplate {
    MissionTemplate {
        id,
        title,
        metric,
        target,
        xp_reward,
    }
}

const EASY: [MissionTemplate; 3] = [
    template("complete_quiz", "Quiz Master", MissionMetric::QuizCompleted, 1, 50),
    template("study_15min", "Quick Study", MissionMetric::StudyMinutes, 15, 50),
    template("view_flashcards", "Memory Boost", MissionMetric::FlashcardsReviewed, 10, 50),
];

const MEDIUM: [MissionTemplate; 3] = [
    template("complete_2_quizzes", "Double Trouble", MissionMetric::QuizCompleted, 2, 100),
    template("study_30min", "Focused Learner", MissionMetric::StudyMinutes, 30, 100),
    template("score_80_quiz", "High Achiever", MissionMetric::QuizScore, 80, 100),
];

const HARD: [MissionTemplate; 3] = [
    template("perfect_quiz", "Perfectionist", MissionMetric::QuizScore, 100, 200),
    template("study_60min", "Marathon Scholar", MissionMetric::StudyMinutes, 60, 200),
    template("complete_4_quizzes", "Quiz Champion", MissionMetric::QuizCompleted, 4, 200),
];

const WEEKLY: [MissionTemplate; 2] = [
    template("weekly_quizzes", "Weekly Quiz Streak", MissionMetric::QuizCompleted, 10, 300),
    template("weekly_study", "Three Hour Week", MissionMetric::StudyMinutes, 180, 300),
];

/// One easy, one medium and one hard mission, rotating by calendar day.
pub fn daily_missions(date: NaiveDate) -> Vec<Mission> {
    let key = MissionScope::Daily.window_key(date);
    let day = date.num_days_from_ce().unsigned_abs() as usize;
    [(&EASY, day), (&MEDIUM, day + 1), (&HARD, day + 2)]
        .into_iter()
        .map(|(pool, offset)| pool[offset % pool.len()].instantiate(MissionScope::Daily, &key))
        .collect()
}

pub fn weekly_missions(date: NaiveDate) -> Vec<Mission> {
    let key = MissionScope::Weekly.window_key(date);
    WEEKLY
        .iter()
        .map(|template| template.instantiate(MissionScope::Weekly, &key))
        .collect()
}

/// Replaces missions whose window has passed. Returns true if anything rolled.
pub fn roll_missions(missions: &mut Vec<Mission>, now: DateTime<Utc>) -> bool {
    let today = now.date_naive();
    let mut rolled = false;
    for scope in [MissionScope::Daily, MissionScope::Weekly] {
        let key = scope.window_key(today);
        let current = missions
            .iter()
            .any(|mission| mission.scope == scope && mission.window_key == key);
        if current {
            continue;
        }
        missions.retain(|mission| mission.scope != scope);
        missions.extend(match scope {
            MissionScope::Daily => daily_missions(today),
            MissionScope::Weekly => weekly_missions(today),
        });
        rolled = true;
    }
    rolled
}

/// Feeds one observation to every open mission tracking `metric`.
pub fn advance_missions(
    missions: &mut [Mission],
    metric: MissionMetric,
    amount: u64,
    now: DateTime<Utc>,
) -> Vec<Achievement> {
    missions
        .iter_mut()
        .filter(|mission| mission.metric == metric)
        .filter_map(|mission| {
            mission
                .record(amount, now)
                .then(|| Achievement::from_mission(mission, now))
        })
        .collect()
}

pub fn all_daily_completed(missions: &[Mission], window_key: &str) -> bool {
    let mut daily = missions
        .iter()
        .filter(|mission| mission.scope == MissionScope::Daily && mission.window_key == window_key)
        .peekable();
    daily.peek().is_some() && daily.all(Mission::is_completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, d, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn window_keys_are_day_and_iso_week() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).expect("date");
        assert_eq!(MissionScope::Daily.window_key(date), "2026-10-18");
        assert_eq!(MissionScope::Weekly.window_key(date), "2026-W42");
    }

    #[test]
    fn daily_rotation_is_deterministic_and_tiered() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).expect("date");
        let first = daily_missions(date);
        assert_eq!(first, daily_missions(date));
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].xp_reward, 50);
        assert_eq!(first[1].xp_reward, 100);
        assert_eq!(first[2].xp_reward, 200);
        let next_day = daily_missions(date.succ_opt().expect("next day"));
        assert_ne!(first[0].id, next_day[0].id);
    }

    #[test]
    fn roll_replaces_only_stale_scopes() {
        let mut missions = Vec::new();
        assert!(roll_missions(&mut missions, at(18, 9)));
        assert_eq!(missions.len(), 5);
        assert!(!roll_missions(&mut missions, at(18, 22)));

        missions
            .iter_mut()
            .for_each(|mission| mission.current = 1);
        // Oct 19 2026 is a Monday: both windows roll.
        assert!(roll_missions(&mut missions, at(19, 1)));
        assert!(missions.iter().all(|mission| mission.current == 0));
    }

    #[test]
    fn counts_cap_at_target_and_scores_keep_best() {
        let mut missions = vec![
            template("m", "Count", MissionMetric::QuizCompleted, 2, 10)
                .instantiate(MissionScope::Daily, "k"),
            template("s", "Score", MissionMetric::QuizScore, 80, 20)
                .instantiate(MissionScope::Daily, "k"),
        ];

        assert!(advance_missions(&mut missions, MissionMetric::QuizCompleted, 1, at(1, 1)).is_empty());
        let done = advance_missions(&mut missions, MissionMetric::QuizCompleted, 5, at(1, 2));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "m@k");
        assert_eq!(missions[0].current, 2);
        assert!(advance_missions(&mut missions, MissionMetric::QuizCompleted, 1, at(1, 3)).is_empty());

        assert!(advance_missions(&mut missions, MissionMetric::QuizScore, 70, at(1, 4)).is_empty());
        assert!(advance_missions(&mut missions, MissionMetric::QuizScore, 40, at(1, 5)).is_empty());
        assert_eq!(missions[1].current, 70);
        assert_eq!(missions[1].progress_percent(), 87);
        assert_eq!(
            advance_missions(&mut missions, MissionMetric::QuizScore, 90, at(1, 6)).len(),
            1
        );
        assert!(all_daily_completed(&missions, "k"));
        assert!(!all_daily_completed(&missions, "other"));
    }
}
