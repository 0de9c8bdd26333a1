use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Number of distinct priority levels in every host wait queue.
pub const PRIORITY_LEVELS: usize = 9;

/// Dispatch priority of a queued request.
///
/// Levels run from 1 (most urgent) to 9 (least urgent). Within one level
/// requests leave the queue in arrival order; across levels a more urgent
/// request always dispatches first. Values outside the range are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl Priority {
    /// Most urgent level (1)
    pub const HIGHEST: Self = Self(1);
    /// Default level for requests that do not ask for anything special (5)
    pub const NORMAL: Self = Self(5);
    /// Least urgent level (9)
    pub const LOWEST: Self = Self(PRIORITY_LEVELS as u8);

    /// Create a priority, clamping `level` into `1..=9`.
    #[must_use]
    pub const fn new(level: u8) -> Self {
        if level < 1 {
            Self(1)
        } else if level > PRIORITY_LEVELS as u8 {
            Self(PRIORITY_LEVELS as u8)
        } else {
            Self(level)
        }
    }

    /// Queue index for this level, always in `0..PRIORITY_LEVELS`.
    ///
    /// Clamps on the way out as well, so a value smuggled in through
    /// deserialization can never index out of bounds.
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        Self::new(self.0).0 as usize - 1
    }

    /// The raw level, 1 through 9.
    #[must_use]
    pub const fn level(self) -> u8 {
        Self::new(self.0).0
    }
}

impl From<u8> for Priority {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamping() {
        assert_eq!(Priority::new(0), Priority::HIGHEST);
        assert_eq!(Priority::new(1), Priority::HIGHEST);
        assert_eq!(Priority::new(5), Priority::NORMAL);
        assert_eq!(Priority::new(9), Priority::LOWEST);
        assert_eq!(Priority::new(200), Priority::LOWEST);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGHEST < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::LOWEST);
    }

    #[test]
    fn test_index_in_bounds() {
        for level in 0..=255u8 {
            let idx = Priority::new(level).index();
            assert!(idx < PRIORITY_LEVELS);
        }
    }

    #[test]
    fn test_default_is_normal() {
        assert_eq!(Priority::default(), Priority::NORMAL);
    }
}
