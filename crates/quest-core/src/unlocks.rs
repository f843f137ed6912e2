use std::collections::BTreeSet;

use crate::activity::ActivitySnapshot;
use crate::catalog::{BadgeDefinition, Catalog, Metric, TitleDefinition};

/// Everything that should be unlocked for the given counters and level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockSet {
    pub badges: BTreeSet<String>,
    pub titles: BTreeSet<String>,
}

impl UnlockSet {
    pub fn is_empty(&self) -> bool {
        self.badges.is_empty() && self.titles.is_empty()
    }

    /// Entries of `self` not already present in the persisted sets.
    pub fn missing_from(
        &self,
        persisted_badges: &BTreeSet<String>,
        persisted_titles: &BTreeSet<String>,
    ) -> UnlockSet {
        UnlockSet {
            badges: self.badges.difference(persisted_badges).cloned().collect(),
            titles: self.titles.difference(persisted_titles).cloned().collect(),
        }
    }
}

pub fn badge_qualifies(badge: &BadgeDefinition, snapshot: &ActivitySnapshot, level: u32) -> bool {
    let value = match badge.requirement.metric {
        Metric::Level => u64::from(level),
        metric => snapshot.metric(metric).unwrap_or(0),
    };
    value >= badge.requirement.threshold
}

pub fn title_qualifies(title: &TitleDefinition, level: u32) -> bool {
    level >= title.required_level
}

pub fn evaluate_badges(catalog: &Catalog, snapshot: &ActivitySnapshot, level: u32) -> BTreeSet<String> {
    catalog
        .badges
        .iter()
        .filter(|badge| badge_qualifies(badge, snapshot, level))
        .map(|badge| badge.id.clone())
        .collect()
}

pub fn evaluate_titles(catalog: &Catalog, level: u32) -> BTreeSet<String> {
    catalog
        .titles
        .iter()
        .filter(|title| title_qualifies(title, level))
        .map(|title| title.id.clone())
        .collect()
}

pub fn evaluate(catalog: &Catalog, snapshot: &ActivitySnapshot, level: u32) -> UnlockSet {
    UnlockSet {
        badges: evaluate_badges(catalog, snapshot, level),
        titles: evaluate_titles(catalog, level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(documents: u64, quizzes: u64, minutes: u64) -> ActivitySnapshot {
        ActivitySnapshot {
            document_count: documents,
            quiz_count: quizzes,
            study_minutes: minutes,
            ..ActivitySnapshot::default()
        }
    }

    #[test]
    fn thresholds_unlock_matching_badges() {
        let catalog = Catalog::default();
        let unlocked = evaluate_badges(&catalog, &snapshot(1, 10, 59), 5);
        assert!(unlocked.contains("doc_first"));
        assert!(unlocked.contains("quiz_first"));
        assert!(unlocked.contains("quiz_10"));
        assert!(unlocked.contains("level_5"));
        assert!(!unlocked.contains("study_1hr"));
        assert!(!unlocked.contains("doc_10"));
    }

    #[test]
    fn titles_depend_only_on_level() {
        let catalog = Catalog::default();
        let titles = evaluate_titles(&catalog, 10);
        assert_eq!(
            titles,
            ["title_apprentice", "title_newbie", "title_scholar"]
                .into_iter()
                .map(String::from)
                .collect()
        );
    }

    #[test]
    fn evaluation_is_monotonic_in_each_metric() {
        let catalog = Catalog::default();
        let grid = [0u64, 1, 3, 9, 10, 25, 60, 600, 3_000];
        for &docs in &grid {
            for &quizzes in &grid {
                for &minutes in &grid {
                    let lower = snapshot(docs, quizzes, minutes);
                    let lower_set = evaluate(&catalog, &lower, 3);
                    for bumped in [
                        snapshot(docs + 1, quizzes, minutes),
                        snapshot(docs, quizzes + 7, minutes),
                        snapshot(docs, quizzes, minutes + 45),
                    ] {
                        assert!(lower.is_dominated_by(&bumped));
                        let higher_set = evaluate(&catalog, &bumped, 4);
                        assert!(lower_set.badges.is_subset(&higher_set.badges));
                        assert!(lower_set.titles.is_subset(&higher_set.titles));
                    }
                }
            }
        }
    }

    #[test]
    fn repeated_evaluation_is_stable() {
        let catalog = Catalog::default();
        let input = snapshot(12, 4, 700);
        assert_eq!(evaluate(&catalog, &input, 7), evaluate(&catalog, &input, 7));
    }

    #[test]
    fn missing_from_reports_only_new_ids() {
        let catalog = Catalog::default();
        let computed = evaluate(&catalog, &snapshot(1, 1, 0), 1);
        let persisted = ["doc_first".to_string()].into_iter().collect();
        let titles = ["title_newbie".to_string()].into_iter().collect();
        let diff = computed.missing_from(&persisted, &titles);
        assert_eq!(diff.badges, ["quiz_first".to_string()].into_iter().collect());
        assert!(diff.titles.is_empty());
    }
}
