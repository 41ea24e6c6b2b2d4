//! Attempt history and attempt-mode resolution
//!
//! Classifies the learner's situation for one (sub-chapter, stage) pair from
//! its quiz and revision history:
//!
//! ```text
//! no attempts ──► NO_QUIZ_YET
//! latest ratio ≥ pass ratio ──► QUIZ_COMPLETED
//! latest failed, revision for it ──► CAN_TAKE_NEXT_QUIZ
//! latest failed, no revision ──► NEED_REVISION
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ProgressionError;
use crate::score::{RawScore, ScoreRatio};

// ============================================================================
// History Types
// ============================================================================

/// One answered question within an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    /// Concept the question is tagged with; untagged questions have none
    #[serde(default)]
    pub concept_name: Option<String>,
    /// Score in 0..=1; exactly 1.0 means correct. Unreadable values load
    /// as 0.0.
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: f64,
}

/// Accepts numbers and score strings; anything else is a failing zero
fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let score = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(text) => ScoreRatio::parse(&text).map_or(0.0, ScoreRatio::value),
        other => {
            warn!(value = %other, "Unreadable question score, treating as incorrect");
            0.0
        }
    };
    Ok(score)
}

impl QuestionResult {
    pub fn new(concept_name: impl Into<String>, score: f64) -> Self {
        Self {
            concept_name: Some(concept_name.into()),
            score,
        }
    }

    /// Exactly 1.0. Out-of-range and non-finite scores are incorrect.
    pub fn is_correct(&self) -> bool {
        self.score == 1.0
    }
}

/// One completed quiz submission for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    /// 1-based, contiguous per (sub-chapter, stage)
    pub attempt_number: u32,
    /// Aggregate score as reported ("3/5", "60%", 0.6)
    #[serde(default)]
    pub score: Option<RawScore>,
    #[serde(default)]
    pub submission: Vec<QuestionResult>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl QuizAttempt {
    /// Aggregate ratio of the attempt.
    ///
    /// Uses the reported score when present. Without one, the ratio is
    /// derived from the submission. `None` means the attempt cannot be
    /// scored and is treated as failing.
    pub fn ratio(&self) -> Option<ScoreRatio> {
        match &self.score {
            Some(raw) => raw.ratio(),
            None if self.submission.is_empty() => None,
            None => {
                let correct = self.submission.iter().filter(|q| q.is_correct()).count();
                Some(ScoreRatio::from_fraction(
                    correct as u32,
                    self.submission.len() as u32,
                ))
            }
        }
    }
}

/// A remediation pass between a failed attempt and the next retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionAttempt {
    /// Equals the attempt number of the quiz it remediates
    pub revision_number: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Attempt and revision history of one (sub-chapter, stage)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptHistory {
    #[serde(default)]
    pub attempts: Vec<QuizAttempt>,
    #[serde(default)]
    pub revisions: Vec<RevisionAttempt>,
}

// ============================================================================
// Mode Resolution
// ============================================================================

/// Learner situation for one (sub-chapter, stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptMode {
    NoQuizYet,
    QuizCompleted,
    NeedRevision,
    CanTakeNextQuiz,
}

/// Resolved mode with the attempt it was derived from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeResolution {
    pub mode: AttemptMode,
    pub latest: Option<QuizAttempt>,
    pub latest_ratio: Option<ScoreRatio>,
}

impl ModeResolution {
    fn no_quiz_yet() -> Self {
        Self {
            mode: AttemptMode::NoQuizYet,
            latest: None,
            latest_ratio: None,
        }
    }
}

/// Classify the learner's situation from attempt and revision history.
///
/// `attempts` is expected most-recent first; the latest attempt is the one
/// with the highest attempt number. Never fails: malformed history degrades
/// to the failing branch.
pub fn resolve_mode(
    attempts: &[QuizAttempt],
    revisions: &[RevisionAttempt],
    pass_ratio: f64,
) -> ModeResolution {
    let Some(latest) = latest_attempt(attempts) else {
        return ModeResolution::no_quiz_yet();
    };

    if let Err(e) = check_attempt_sequence(attempts) {
        warn!(error = %e, "Attempt history is not contiguous");
    }

    let ratio = latest.ratio();
    if ratio.is_none() {
        warn!(
            attempt = latest.attempt_number,
            score = ?latest.score,
            "Unparsable attempt score, treating as failing"
        );
    }

    let mode = if ratio.unwrap_or(ScoreRatio::ZERO).meets(pass_ratio) {
        AttemptMode::QuizCompleted
    } else if revisions
        .iter()
        .any(|r| r.revision_number == latest.attempt_number)
    {
        AttemptMode::CanTakeNextQuiz
    } else {
        AttemptMode::NeedRevision
    };

    debug!(
        attempt = latest.attempt_number,
        ratio = ?ratio.map(ScoreRatio::value),
        mode = ?mode,
        "Attempt mode resolved"
    );

    ModeResolution {
        mode,
        latest: Some(latest.clone()),
        latest_ratio: ratio,
    }
}

/// Attempt with the highest number; ties keep input order
pub fn latest_attempt(attempts: &[QuizAttempt]) -> Option<&QuizAttempt> {
    attempts
        .iter()
        .reduce(|best, a| if a.attempt_number > best.attempt_number { a } else { best })
}

/// Number the next attempt should carry
pub fn next_attempt_number(attempts: &[QuizAttempt]) -> u32 {
    latest_attempt(attempts).map_or(1, |a| a.attempt_number.saturating_add(1))
}

/// Verify attempt numbers are exactly `1..=n`
pub fn check_attempt_sequence(attempts: &[QuizAttempt]) -> Result<(), ProgressionError> {
    let mut numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    numbers.sort_unstable();

    for (i, number) in numbers.iter().enumerate() {
        let expected = i as u32 + 1;
        if *number != expected {
            return Err(ProgressionError::InvalidInput(format!(
                "expected attempt number {}, found {}",
                expected, number
            )));
        }
    }
    Ok(())
}

/// Verify a revision remediates an existing attempt
pub fn check_revision(
    revision: &RevisionAttempt,
    attempts: &[QuizAttempt],
) -> Result<(), ProgressionError> {
    if attempts
        .iter()
        .any(|a| a.attempt_number == revision.revision_number)
    {
        Ok(())
    } else {
        Err(ProgressionError::InvalidInput(format!(
            "revision {} does not match any attempt",
            revision.revision_number
        )))
    }
}
