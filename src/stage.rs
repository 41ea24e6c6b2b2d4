//! Mastery stages of a sub-chapter
//!
//! Stages follow the lower rungs of Bloom's taxonomy, preceded by a plain
//! reading stage. The order is fixed and drives stage gating.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the five ordered mastery phases of a sub-chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Reading,
    Remember,
    Understand,
    Apply,
    Analyze,
}

impl Stage {
    /// All stages in order
    pub const ALL: [Stage; 5] = [
        Stage::Reading,
        Stage::Remember,
        Stage::Understand,
        Stage::Apply,
        Stage::Analyze,
    ];

    /// Position of the stage (0-4)
    pub fn index(self) -> usize {
        match self {
            Stage::Reading => 0,
            Stage::Remember => 1,
            Stage::Understand => 2,
            Stage::Apply => 3,
            Stage::Analyze => 4,
        }
    }

    /// Wire label
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Reading => "reading",
            Stage::Remember => "remember",
            Stage::Understand => "understand",
            Stage::Apply => "apply",
            Stage::Analyze => "analyze",
        }
    }

    /// Parse a stage label, ignoring case and surrounding whitespace
    pub fn from_label(label: &str) -> Option<Stage> {
        let label = label.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(label))
    }

    /// The stage after this one, if any
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// Whether the stage is assessed by quizzes
    pub fn is_quiz_stage(self) -> bool {
        self != Stage::Reading
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = crate::error::ProgressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::from_label(s).ok_or_else(|| {
            crate::error::ProgressionError::InvalidInput(format!(
                "Invalid stage: {}. Valid stages: {:?}",
                s,
                Stage::ALL.map(Stage::as_str)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        assert!(Stage::Reading < Stage::Remember);
        assert!(Stage::Remember < Stage::Understand);
        assert!(Stage::Understand < Stage::Apply);
        assert!(Stage::Apply < Stage::Analyze);
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn test_from_label_ignores_case() {
        assert_eq!(Stage::from_label("Remember"), Some(Stage::Remember));
        assert_eq!(Stage::from_label(" ANALYZE "), Some(Stage::Analyze));
        assert_eq!(Stage::from_label("evaluate"), None);
        assert!("create".parse::<Stage>().is_err());
    }

    #[test]
    fn test_next_and_quiz_stage() {
        assert_eq!(Stage::Reading.next(), Some(Stage::Remember));
        assert_eq!(Stage::Analyze.next(), None);
        assert!(!Stage::Reading.is_quiz_stage());
        assert!(Stage::Apply.is_quiz_stage());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Understand).unwrap(), "\"understand\"");
        let stage: Stage = serde_json::from_str("\"apply\"").unwrap();
        assert_eq!(stage, Stage::Apply);
    }
}
