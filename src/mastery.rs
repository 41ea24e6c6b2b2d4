//! Concept mastery aggregation
//!
//! Reduces question-level quiz results into per-concept figures.
//!
//! - Within one attempt a concept passes only when every question tagged with
//!   it scored exactly 1.0. Any lower score fails it; no tagged question
//!   leaves it untested.
//! - Across attempts a pass is sticky: once a concept passed in any attempt
//!   it stays passed even if a later attempt fails it.
//! - Questions without a concept tag are counted under [`UNKNOWN_CONCEPT`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attempts::{QuestionResult, QuizAttempt};
use crate::score::ScoreRatio;

/// Bucket for questions that carry no concept tag
pub const UNKNOWN_CONCEPT: &str = "Unknown concept";

// ============================================================================
// Result Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasteryStatus {
    Pass,
    Fail,
    NotTested,
}

/// Per-concept result for a single attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptScore {
    pub concept_name: String,
    pub correct: u32,
    pub total: u32,
    pub ratio: ScoreRatio,
    pub status: MasteryStatus,
}

/// All concept results of one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptBreakdown {
    pub attempt_number: u32,
    pub question_count: u32,
    pub concepts: Vec<ConceptScore>,
}

impl AttemptBreakdown {
    pub fn concept(&self, name: &str) -> Option<&ConceptScore> {
        self.concepts.iter().find(|c| c.concept_name == name)
    }
}

/// Consolidated status of a concept across all attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptStatus {
    pub concept_name: String,
    pub status: MasteryStatus,
    /// First attempt in which the concept passed
    pub passed_on_attempt: Option<u32>,
    /// Status in the most recent attempt
    pub latest_status: MasteryStatus,
    /// Number of attempts that tested the concept
    pub attempts_tested: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterySummary {
    pub mastered: usize,
    pub in_progress: usize,
    pub not_tested: usize,
    pub total: usize,
    /// mastered / total, 0 when there are no concepts
    pub mastery_pct: f64,
}

/// Concept × attempt status grid for historical display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMatrix {
    pub concepts: Vec<String>,
    /// Column headers, ascending
    pub attempt_numbers: Vec<u32>,
    /// `cells[concept][attempt]`
    pub cells: Vec<Vec<MasteryStatus>>,
}

impl ConceptMatrix {
    pub fn status(&self, concept: &str, attempt_number: u32) -> Option<MasteryStatus> {
        let row = self.concepts.iter().position(|c| c == concept)?;
        let col = self
            .attempt_numbers
            .iter()
            .position(|n| *n == attempt_number)?;
        Some(self.cells[row][col])
    }
}

/// Everything derived from a stage's attempt history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptAggregate {
    pub per_attempt: Vec<AttemptBreakdown>,
    pub consolidated: Vec<ConceptStatus>,
    pub summary: MasterySummary,
    pub matrix: ConceptMatrix,
}

// ============================================================================
// Concept Ordering
// ============================================================================

/// Stable concept ordering: catalog first, then tested concepts outside the
/// catalog in first-seen order, then the unknown bucket.
struct ConceptIndex {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ConceptIndex {
    fn build<'a>(catalog: &[String], attempts: impl IntoIterator<Item = &'a QuizAttempt>) -> Self {
        let mut index = Self {
            names: Vec::new(),
            positions: HashMap::new(),
        };

        for name in catalog {
            let name = name.trim();
            if !name.is_empty() {
                index.insert(name);
            }
        }

        let mut saw_unknown = false;
        for attempt in attempts {
            for question in &attempt.submission {
                match tagged_concept(question) {
                    Some(name) => index.insert(name),
                    None => saw_unknown = true,
                }
            }
        }
        if saw_unknown {
            index.insert(UNKNOWN_CONCEPT);
        }

        index
    }

    fn insert(&mut self, name: &str) {
        if !self.positions.contains_key(name) {
            self.positions.insert(name.to_string(), self.names.len());
            self.names.push(name.to_string());
        }
    }

    fn position(&self, question: &QuestionResult) -> Option<usize> {
        let name = tagged_concept(question).unwrap_or(UNKNOWN_CONCEPT);
        self.positions.get(name).copied()
    }
}

fn tagged_concept(question: &QuestionResult) -> Option<&str> {
    question
        .concept_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

fn status_of(correct: u32, total: u32) -> MasteryStatus {
    if total == 0 {
        MasteryStatus::NotTested
    } else if correct == total {
        MasteryStatus::Pass
    } else {
        MasteryStatus::Fail
    }
}

fn sorted_attempts(attempts: &[QuizAttempt]) -> Vec<&QuizAttempt> {
    let mut sorted: Vec<&QuizAttempt> = attempts.iter().collect();
    sorted.sort_by_key(|a| a.attempt_number);
    sorted
}

fn tally(attempt: &QuizAttempt, index: &ConceptIndex) -> AttemptBreakdown {
    let mut counts = vec![(0u32, 0u32); index.names.len()];

    for question in &attempt.submission {
        if let Some(pos) = index.position(question) {
            let (correct, total) = &mut counts[pos];
            *total += 1;
            if question.is_correct() {
                *correct += 1;
            }
        }
    }

    let concepts = index
        .names
        .iter()
        .zip(counts)
        .map(|(name, (correct, total))| ConceptScore {
            concept_name: name.clone(),
            correct,
            total,
            ratio: ScoreRatio::from_fraction(correct, total),
            status: status_of(correct, total),
        })
        .collect();

    AttemptBreakdown {
        attempt_number: attempt.attempt_number,
        question_count: attempt.submission.len() as u32,
        concepts,
    }
}

fn consolidate_breakdowns(names: &[String], breakdowns: &[AttemptBreakdown]) -> Vec<ConceptStatus> {
    names
        .iter()
        .enumerate()
        .map(|(row, name)| {
            let mut passed_on_attempt = None;
            let mut attempts_tested = 0;
            let mut latest_status = MasteryStatus::NotTested;

            for breakdown in breakdowns {
                let status = breakdown.concepts[row].status;
                if status != MasteryStatus::NotTested {
                    attempts_tested += 1;
                }
                if status == MasteryStatus::Pass && passed_on_attempt.is_none() {
                    passed_on_attempt = Some(breakdown.attempt_number);
                }
                latest_status = status;
            }

            let status = if passed_on_attempt.is_some() {
                MasteryStatus::Pass
            } else if attempts_tested > 0 {
                MasteryStatus::Fail
            } else {
                MasteryStatus::NotTested
            };

            ConceptStatus {
                concept_name: name.clone(),
                status,
                passed_on_attempt,
                latest_status,
                attempts_tested,
            }
        })
        .collect()
}

// ============================================================================
// Public Operations
// ============================================================================

/// Per-concept results for a single attempt
pub fn attempt_breakdown(attempt: &QuizAttempt, catalog: &[String]) -> AttemptBreakdown {
    let index = ConceptIndex::build(catalog, [attempt]);
    tally(attempt, &index)
}

/// Consolidated per-concept status across attempts (sticky pass)
pub fn consolidate(attempts: &[QuizAttempt], catalog: &[String]) -> Vec<ConceptStatus> {
    aggregate_concepts(attempts, catalog).consolidated
}

/// Concept × attempt matrix ordered by ascending attempt number
pub fn concept_matrix(attempts: &[QuizAttempt], catalog: &[String]) -> ConceptMatrix {
    aggregate_concepts(attempts, catalog).matrix
}

/// Mastered / in-progress / not-tested counts
pub fn summarize(statuses: &[ConceptStatus]) -> MasterySummary {
    let mastered = statuses
        .iter()
        .filter(|s| s.status == MasteryStatus::Pass)
        .count();
    let in_progress = statuses
        .iter()
        .filter(|s| s.status == MasteryStatus::Fail)
        .count();
    let not_tested = statuses.len() - mastered - in_progress;
    let total = statuses.len();

    MasterySummary {
        mastered,
        in_progress,
        not_tested,
        total,
        mastery_pct: if total == 0 {
            0.0
        } else {
            mastered as f64 / total as f64
        },
    }
}

/// Aggregate a stage's full attempt history against its concept catalog
pub fn aggregate_concepts(attempts: &[QuizAttempt], catalog: &[String]) -> ConceptAggregate {
    let sorted = sorted_attempts(attempts);
    let index = ConceptIndex::build(catalog, sorted.iter().copied());

    let per_attempt: Vec<AttemptBreakdown> = sorted.iter().map(|a| tally(a, &index)).collect();
    let consolidated = consolidate_breakdowns(&index.names, &per_attempt);
    let summary = summarize(&consolidated);

    let matrix = ConceptMatrix {
        concepts: index.names.clone(),
        attempt_numbers: per_attempt.iter().map(|b| b.attempt_number).collect(),
        cells: (0..index.names.len())
            .map(|row| per_attempt.iter().map(|b| b.concepts[row].status).collect())
            .collect(),
    };

    debug!(
        attempts = per_attempt.len(),
        concepts = summary.total,
        mastered = summary.mastered,
        "Concept mastery aggregated"
    );

    ConceptAggregate {
        per_attempt,
        consolidated,
        summary,
        matrix,
    }
}

/// Concepts a revision pass should cover: failing ones first, then untested.
/// The unknown bucket is never a revision target.
pub fn revision_focus(consolidated: &[ConceptStatus]) -> Vec<String> {
    let pick = |wanted: MasteryStatus| {
        consolidated
            .iter()
            .filter(move |c| c.status == wanted && c.concept_name != UNKNOWN_CONCEPT)
            .map(|c| c.concept_name.clone())
    };
    pick(MasteryStatus::Fail)
        .chain(pick(MasteryStatus::NotTested))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(number: u32, questions: Vec<QuestionResult>) -> QuizAttempt {
        QuizAttempt {
            attempt_number: number,
            score: None,
            submission: questions,
            timestamp: None,
        }
    }

    fn untagged(score: f64) -> QuestionResult {
        QuestionResult {
            concept_name: None,
            score,
        }
    }

    fn catalog(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pass_requires_every_question_perfect() {
        let a = attempt(
            1,
            vec![
                QuestionResult::new("X", 1.0),
                QuestionResult::new("X", 0.99),
                QuestionResult::new("Y", 1.0),
                QuestionResult::new("Y", 1.0),
            ],
        );
        let breakdown = attempt_breakdown(&a, &catalog(&["X", "Y", "Z"]));

        let x = breakdown.concept("X").unwrap();
        assert_eq!((x.correct, x.total), (1, 2));
        assert_eq!(x.status, MasteryStatus::Fail);
        assert_eq!(x.ratio.value(), 0.5);

        assert_eq!(breakdown.concept("Y").unwrap().status, MasteryStatus::Pass);

        let z = breakdown.concept("Z").unwrap();
        assert_eq!(z.total, 0);
        assert_eq!(z.status, MasteryStatus::NotTested);
    }

    #[test]
    fn test_sticky_pass() {
        let attempts = vec![
            attempt(2, vec![QuestionResult::new("X", 0.0)]),
            attempt(1, vec![QuestionResult::new("X", 1.0)]),
        ];
        let consolidated = consolidate(&attempts, &catalog(&["X"]));
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].status, MasteryStatus::Pass);
        assert_eq!(consolidated[0].passed_on_attempt, Some(1));
        assert_eq!(consolidated[0].latest_status, MasteryStatus::Fail);
        assert_eq!(consolidated[0].attempts_tested, 2);
    }

    #[test]
    fn test_fail_then_pass_is_pass() {
        let attempts = vec![
            attempt(1, vec![QuestionResult::new("X", 0.5)]),
            attempt(2, vec![QuestionResult::new("X", 1.0)]),
        ];
        let consolidated = consolidate(&attempts, &[]);
        assert_eq!(consolidated[0].status, MasteryStatus::Pass);
        assert_eq!(consolidated[0].passed_on_attempt, Some(2));
    }

    #[test]
    fn test_untagged_questions_bucket_under_unknown() {
        let a = attempt(
            1,
            vec![
                QuestionResult::new("X", 1.0),
                untagged(1.0),
                QuestionResult {
                    concept_name: Some("   ".into()),
                    score: 0.0,
                },
            ],
        );
        let breakdown = attempt_breakdown(&a, &catalog(&["X"]));
        let unknown = breakdown.concept(UNKNOWN_CONCEPT).unwrap();
        assert_eq!((unknown.correct, unknown.total), (1, 2));

        let counted: u32 = breakdown.concepts.iter().map(|c| c.total).sum();
        assert_eq!(counted, breakdown.question_count);
        assert_eq!(breakdown.concepts.last().unwrap().concept_name, UNKNOWN_CONCEPT);
    }

    #[test]
    fn test_summary_counts_cover_union_of_concepts() {
        let attempts = vec![
            attempt(
                1,
                vec![
                    QuestionResult::new("A", 1.0),
                    QuestionResult::new("B", 0.0),
                    QuestionResult::new("Extra", 1.0),
                ],
            ),
            attempt(2, vec![QuestionResult::new("B", 0.0), untagged(0.0)]),
        ];
        let aggregate = aggregate_concepts(&attempts, &catalog(&["A", "B", "C"]));
        let s = aggregate.summary;

        // {A, B, C} ∪ {A, B, Extra, Unknown}
        assert_eq!(s.total, 5);
        assert_eq!(s.mastered + s.in_progress + s.not_tested, s.total);
        assert_eq!(s.mastered, 2); // A, Extra
        assert_eq!(s.in_progress, 2); // B, Unknown
        assert_eq!(s.not_tested, 1); // C
        assert_eq!(s.mastery_pct, 0.4);

        assert_eq!(
            aggregate.consolidated.iter().map(|c| c.concept_name.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "C", "Extra", UNKNOWN_CONCEPT]
        );
    }

    #[test]
    fn test_empty_inputs() {
        let aggregate = aggregate_concepts(&[], &[]);
        assert_eq!(aggregate.summary.total, 0);
        assert_eq!(aggregate.summary.mastery_pct, 0.0);
        assert!(aggregate.matrix.cells.is_empty());

        let untested = aggregate_concepts(&[], &catalog(&["A", " ", "A"]));
        assert_eq!(untested.summary.total, 1);
        assert_eq!(untested.summary.not_tested, 1);
    }

    #[test]
    fn test_concept_matrix_history() {
        let attempts = vec![
            attempt(2, vec![QuestionResult::new("X", 1.0)]),
            attempt(1, vec![QuestionResult::new("X", 0.0), QuestionResult::new("Y", 1.0)]),
        ];
        let matrix = concept_matrix(&attempts, &catalog(&["X", "Y"]));
        assert_eq!(matrix.attempt_numbers, vec![1, 2]);
        assert_eq!(matrix.status("X", 1), Some(MasteryStatus::Fail));
        assert_eq!(matrix.status("X", 2), Some(MasteryStatus::Pass));
        assert_eq!(matrix.status("Y", 2), Some(MasteryStatus::NotTested));
        assert_eq!(matrix.status("Z", 1), None);
    }

    #[test]
    fn test_out_of_range_scores() {
        let a = attempt(
            1,
            vec![
                QuestionResult::new("X", 1.5),
                QuestionResult::new("Y", f64::NAN),
            ],
        );
        let breakdown = attempt_breakdown(&a, &[]);
        assert_eq!(breakdown.concept("X").unwrap().status, MasteryStatus::Fail);
        assert_eq!(breakdown.concept("Y").unwrap().status, MasteryStatus::Fail);
    }

    #[test]
    fn test_revision_focus() {
        let attempts = vec![attempt(
            1,
            vec![
                QuestionResult::new("A", 1.0),
                QuestionResult::new("B", 0.0),
                untagged(0.0),
            ],
        )];
        let aggregate = aggregate_concepts(&attempts, &catalog(&["A", "B", "C"]));
        assert_eq!(revision_focus(&aggregate.consolidated), vec!["B", "C"]);
    }
}
