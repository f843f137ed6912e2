use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LEVEL_THRESHOLDS: [u64; 13] = [
    0, 100, 250, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000,
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LevelTableError {
    #[error("level table is empty")]
    Empty,
    #[error("level table must start at 0, found {0}")]
    NonZeroStart(u64),
    #[error("level table must be strictly ascending (level {level} is {found}, previous {previous})")]
    NotAscending { level: u32, found: u64, previous: u64 },
}

/// Ascending cumulative XP thresholds; index 0 is level 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct LevelTable {
    thresholds: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelStatus {
    pub xp: u64,
    pub level: u32,
    pub level_progress: u8,
    pub xp_to_next_level: u64,
    pub current_threshold: u64,
    pub next_threshold: Option<u64>,
}

impl LevelStatus {
    pub fn is_max_level(&self) -> bool {
        self.next_threshold.is_none()
    }
}

impl LevelTable {
    pub fn new(thresholds: Vec<u64>) -> Result<Self, LevelTableError> {
        let first = *thresholds.first().ok_or(LevelTableError::Empty)?;
        if first != 0 {
            return Err(LevelTableError::NonZeroStart(first));
        }
        for (index, pair) in thresholds.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(LevelTableError::NotAscending {
                    level: index as u32 + 2,
                    found: pair[1],
                    previous: pair[0],
                });
            }
        }
        Ok(Self { thresholds })
    }

    pub fn max_level(&self) -> u32 {
        self.thresholds.len() as u32
    }

    pub fn thresholds(&self) -> &[u64] {
        &self.thresholds
    }

    /// XP needed to reach `level`, `None` past the final defined level.
    pub fn threshold(&self, level: u32) -> Option<u64> {
        let index = usize::try_from(level.checked_sub(1)?).ok()?;
        self.thresholds.get(index).copied()
    }

    pub fn level_for(&self, xp: u64) -> u32 {
        // thresholds[0] == 0, so at least one entry always qualifies
        self.thresholds
            .iter()
            .rposition(|threshold| xp >= *threshold)
            .map(|index| index as u32 + 1)
            .unwrap_or(1)
    }

    pub fn status(&self, xp: u64) -> LevelStatus {
        let level = self.level_for(xp);
        let current_threshold = self.threshold(level).unwrap_or(0);
        let next_threshold = self.threshold(level + 1);

        let (level_progress, xp_to_next_level) = match next_threshold {
            Some(next) => {
                let span = next - current_threshold;
                let gained = xp.saturating_sub(current_threshold);
                let percent = (gained.saturating_mul(100) + span / 2) / span;
                (percent.min(100) as u8, next.saturating_sub(xp))
            }
            None => (100, 0),
        };

        LevelStatus {
            xp,
            level,
            level_progress,
            xp_to_next_level,
            current_threshold,
            next_threshold,
        }
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_LEVEL_THRESHOLDS.to_vec(),
        }
    }
}

impl TryFrom<Vec<u64>> for LevelTable {
    type Error = LevelTableError;

    fn try_from(value: Vec<u64>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LevelTable> for Vec<u64> {
    fn from(value: LevelTable) -> Self {
        value.thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> LevelTable {
        LevelTable::new(vec![0, 100, 250, 500]).expect("valid table")
    }

    #[test]
    fn level_is_largest_threshold_reached() {
        let table = small_table();
        assert_eq!(table.level_for(0), 1);
        assert_eq!(table.level_for(99), 1);
        assert_eq!(table.level_for(100), 2);
        assert_eq!(table.level_for(249), 2);
        assert_eq!(table.level_for(250), 3);
        assert_eq!(table.level_for(10_000), 4);
    }

    #[test]
    fn status_reports_rounded_progress_and_remaining_xp() {
        let status = small_table().status(120);
        assert_eq!(status.level, 2);
        assert_eq!(status.xp_to_next_level, 130);
        assert_eq!(status.level_progress, 13);
        assert_eq!(status.current_threshold, 100);
        assert_eq!(status.next_threshold, Some(250));
    }

    #[test]
    fn final_level_is_full_with_nothing_left() {
        let status = small_table().status(900);
        assert_eq!(status.level, 4);
        assert_eq!(status.level_progress, 100);
        assert_eq!(status.xp_to_next_level, 0);
        assert!(status.is_max_level());
    }

    #[test]
    fn level_never_decreases_as_xp_grows() {
        let table = LevelTable::default();
        let mut previous = table.status(0);
        for xp in (0..300_000).step_by(37) {
            let status = table.status(xp);
            assert!(status.level >= previous.level, "xp {xp}");
            assert!(status.level_progress <= 100);
            if let Some(next) = status.next_threshold {
                assert_eq!(status.xp_to_next_level, next - xp);
            }
            previous = status;
        }
    }

    #[test]
    fn rejects_malformed_tables() {
        assert_eq!(LevelTable::new(vec![]), Err(LevelTableError::Empty));
        assert_eq!(
            LevelTable::new(vec![10, 20]),
            Err(LevelTableError::NonZeroStart(10))
        );
        assert!(matches!(
            LevelTable::new(vec![0, 100, 100]),
            Err(LevelTableError::NotAscending { level: 3, .. })
        ));
    }

    #[test]
    fn table_round_trips_through_json_with_validation() {
        let table: LevelTable = serde_json::from_str("[0, 50, 75]").expect("parse");
        assert_eq!(table.max_level(), 3);
        assert!(serde_json::from_str::<LevelTable>("[5, 50]").is_err());
    }
}
