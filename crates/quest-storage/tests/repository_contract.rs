use chrono::{DateTime, TimeZone, Utc};
use quest_core::{
    ActionKind, ActionRequest, LearnerPatch, ManualClock, ProgressionRules, TimePeriod,
    DEFAULT_TITLE_ID,
};
use quest_storage::{LearnerProfile, MemoryStore, ProgressRepository, SqliteStore, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
        .single()
        .expect("valid timestamp")
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn stores() -> Vec<(&'static str, Box<dyn ProgressRepository>)> {
    let clock = Arc::new(ManualClock::new(ts(0)));
    vec![
        (
            "memory",
            Box::new(MemoryStore::with_clock(clock.clone())) as Box<dyn ProgressRepository>,
        ),
        (
            "sqlite",
            Box::new(
                SqliteStore::open_in_memory()
                    .expect("open sqlite")
                    .with_clock(clock),
            ) as Box<dyn ProgressRepository>,
        ),
    ]
}

#[test]
fn new_learners_start_from_explicit_defaults() {
    for (name, store) in stores() {
        let progress = store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        assert_eq!(progress.xp, 0, "{name}");
        assert_eq!(progress.level, 1, "{name}");
        assert_eq!(progress.equipped_title_id, DEFAULT_TITLE_ID, "{name}");
        assert!(progress.unlocked_titles.contains(DEFAULT_TITLE_ID), "{name}");
    }
}

#[test]
fn unlock_writes_are_unions() {
    for (name, store) in stores() {
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        store
            .write_learner(
                "amy",
                &LearnerPatch::unlocks(ids(&["doc_first"]), BTreeSet::new(), ts(1)),
            )
            .expect("first write");
        let progress = store
            .write_learner(
                "amy",
                &LearnerPatch::unlocks(ids(&["quiz_first"]), ids(&["title_apprentice"]), ts(2)),
            )
            .expect("second write");

        assert_eq!(progress.unlocked_badges, ids(&["doc_first", "quiz_first"]), "{name}");
        assert!(progress.unlocked_titles.contains("title_apprentice"), "{name}");
        assert_eq!(progress.last_badge_sync, Some(ts(2)), "{name}");
    }
}

#[test]
fn equipping_requires_an_unlocked_title() {
    for (name, store) in stores() {
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        assert!(
            matches!(
                store.write_learner("amy", &LearnerPatch::equip("title_legend")),
                Err(StoreError::Rejected(_))
            ),
            "{name}"
        );
        store
            .write_learner(
                "amy",
                &LearnerPatch::unlocks(BTreeSet::new(), ids(&["title_legend"]), ts(1)),
            )
            .expect("unlock");
        let progress = store
            .write_learner("amy", &LearnerPatch::equip("title_legend"))
            .expect("equip");
        assert_eq!(progress.equipped_title_id, "title_legend", "{name}");
    }
}

#[test]
fn subscriptions_see_committed_actions() {
    for (name, store) in stores() {
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        let mut learner = store.subscribe_learner("amy").expect("learner");
        let mut board = store.subscribe_leaderboard(TimePeriod::AllTime).expect("board");

        let outcome = store
            .apply_action(
                "amy",
                &ActionRequest::new(ActionKind::ContentGenerated).with_count(2),
                &ProgressionRules::default(),
            )
            .expect("apply");
        assert_eq!(outcome.xp_awarded, 30, "{name}");

        assert_eq!(learner.poll_update().map(|progress| progress.xp), Some(30), "{name}");
        let candidates = board.poll_update().expect("board update");
        assert_eq!(candidates.len(), 1, "{name}");
        assert_eq!(candidates[0].points, 30, "{name}");
    }
}

#[test]
fn unknown_learners_are_not_found() {
    for (name, store) in stores() {
        assert!(
            matches!(store.read_learner("ghost"), Err(StoreError::NotFound(_))),
            "{name}"
        );
        assert!(
            matches!(
                store.apply_action(
                    "ghost",
                    &ActionRequest::new(ActionKind::DailyCheckIn),
                    &ProgressionRules::default()
                ),
                Err(StoreError::NotFound(_))
            ),
            "{name}"
        );
    }
}

#[test]
fn concurrent_writers_leave_subscribers_on_the_last_commit() {
    for (name, store) in stores() {
        store
            .initialize_learner(&LearnerProfile::student("amy", "Amy"))
            .expect("init");
        let subscription = store.subscribe_learner("amy").expect("subscribe");

        std::thread::scope(|scope| {
            for writer in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..25 {
                        let badge = format!("badge_{writer}_{round}");
                        store
                            .write_learner(
                                "amy",
                                &LearnerPatch::unlocks(ids(&[badge.as_str()]), BTreeSet::new(), ts(round)),
                            )
                            .expect("write");
                    }
                });
            }
        });

        let committed = store.read_learner("amy").expect("read");
        assert_eq!(committed.unlocked_badges.len(), 100, "{name}");
        assert_eq!(subscription.latest(), Some(committed), "{name}");
    }
}
