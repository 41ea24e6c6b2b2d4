//! Activity evaluation
//!
//! Combines the pure components into one view of an activity:
//!
//! ```text
//! IndexedPlan ──► cursor (previous / current / next)
//! snapshot.attempts + revisions ──► attempt mode
//! snapshot.attempts + concepts  ──► concept aggregate ──► revision focus
//! snapshot.stageStatus + mode   ──► stage gates
//! ```
//!
//! The snapshot is whatever the shell fetched from its collaborators for the
//! activity's sub-chapter and the selected stage.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attempts::{next_attempt_number, resolve_mode, AttemptHistory, ModeResolution};
use crate::attempts::{QuizAttempt, RevisionAttempt};
use crate::config::Config;
use crate::error::ProgressionError;
use crate::gate::{gate_stages, StageAggregate, StageGateReport};
use crate::mastery::{aggregate_concepts, revision_focus, ConceptAggregate};
use crate::plan::{ActivityNode, Cursor, IndexedPlan};
use crate::stage::Stage;

/// Collaborator data for one activity view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Attempts for the selected stage, most recent first
    #[serde(default)]
    pub attempts: Vec<QuizAttempt>,
    #[serde(default)]
    pub revisions: Vec<RevisionAttempt>,
    #[serde(default)]
    pub stage_status: Vec<StageAggregate>,
    /// Canonical concept list of the sub-chapter
    #[serde(default)]
    pub concepts: Vec<String>,
}

impl ProgressSnapshot {
    pub fn from_parts(
        history: &AttemptHistory,
        stage_status: &[StageAggregate],
        concepts: &[String],
    ) -> Self {
        Self {
            attempts: history.attempts.clone(),
            revisions: history.revisions.clone(),
            stage_status: stage_status.to_vec(),
            concepts: concepts.to_vec(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ProgressionError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Everything the shell needs to render one activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityView {
    pub activity: ActivityNode,
    pub previous_activity_id: Option<String>,
    pub next_activity_id: Option<String>,
    pub selected_stage: Stage,
    pub mode: ModeResolution,
    pub next_attempt_number: u32,
    /// Absent for the reading stage
    pub concepts: Option<ConceptAggregate>,
    pub revision_focus: Vec<String>,
    pub gates: StageGateReport,
}

/// Stateless evaluator configured with the pass threshold
#[derive(Debug, Clone)]
pub struct ProgressionEngine {
    config: Config,
}

impl ProgressionEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Evaluate one activity of a plan.
    ///
    /// `selected` defaults to the activity's own stage.
    pub fn evaluate(
        &self,
        plan: &IndexedPlan,
        activity_id: &str,
        selected: Option<Stage>,
        snapshot: &ProgressSnapshot,
    ) -> Result<ActivityView, ProgressionError> {
        let cursor = plan
            .cursor_for(activity_id)
            .ok_or_else(|| ProgressionError::NotFound(format!("activity {}", activity_id)))?;

        let (previous, current, next) = match cursor {
            Cursor::At {
                previous,
                current,
                next,
            } => (previous, current, next),
            Cursor::NoActivity => {
                return Err(ProgressionError::NotFound(format!(
                    "activity {}",
                    activity_id
                )))
            }
        };

        let selected_stage = selected.unwrap_or(current.stage);
        let mode = resolve_mode(
            &snapshot.attempts,
            &snapshot.revisions,
            self.config.pass_ratio,
        );

        let (concepts, focus) = if selected_stage.is_quiz_stage() {
            let aggregate = aggregate_concepts(&snapshot.attempts, &snapshot.concepts);
            let focus = revision_focus(&aggregate.consolidated);
            (Some(aggregate), focus)
        } else {
            (None, Vec::new())
        };

        let gates = gate_stages(&snapshot.stage_status, selected_stage, Some(&mode));

        debug!(
            plan_id = %plan.plan_id(),
            activity_id = %activity_id,
            stage = %selected_stage,
            mode = ?mode.mode,
            "Activity evaluated"
        );

        Ok(ActivityView {
            activity: current.clone(),
            previous_activity_id: previous.map(|a| a.activity_id.clone()),
            next_activity_id: next.map(|a| a.activity_id.clone()),
            selected_stage,
            next_attempt_number: next_attempt_number(&snapshot.attempts),
            mode,
            concepts,
            revision_focus: focus,
            gates,
        })
    }
}

impl Default for ProgressionEngine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
