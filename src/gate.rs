//! Stage gating
//!
//! Decides how each of the five stages of a sub-chapter is presented. Only
//! the learner's selected stage can be interactive, and only when it is not
//! locked. Every other stage is a browsable label.
//!
//! The result is derived purely from the external stage aggregates, the
//! selected stage and the attempt mode of that stage.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::attempts::{AttemptMode, ModeResolution};
use crate::stage::Stage;

/// Progress reported by the stage status source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageProgress {
    InProgress,
    Done,
    /// Also what any unrecognised status reads as
    #[default]
    #[serde(other)]
    NotStarted,
}

/// External per-stage aggregate for one sub-chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAggregate {
    /// An empty or unknown label leaves its stage without a status
    #[serde(default, deserialize_with = "lenient_label")]
    pub stage_label: String,
    /// Missing lock information is treated as locked
    #[serde(default = "default_locked", deserialize_with = "lenient_locked")]
    pub locked: bool,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: StageProgress,
}

fn default_locked() -> bool {
    true
}

fn lenient_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(label) => Ok(label),
        _ => Ok(String::new()),
    }
}

fn lenient_locked<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_bool().unwrap_or(true))
}

fn lenient_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StageProgress, D::Error> {
    Ok(serde_json::from_value(Value::deserialize(deserializer)?).unwrap_or_default())
}

impl StageAggregate {
    pub fn new(stage: Stage, locked: bool, status: StageProgress) -> Self {
        Self {
            stage_label: stage.as_str().to_string(),
            locked,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderDirective {
    Locked,
    Done,
    Active,
    Default,
}

/// How one stage should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageGate {
    pub stage: Stage,
    pub directive: RenderDirective,
    pub interactive: bool,
    pub selected: bool,
    /// Effective lock, including locks inherited from earlier stages
    pub locked: bool,
    pub status: StageProgress,
}

/// Gates for all five stages, in stage order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageGateReport {
    pub selected: Stage,
    pub stages: Vec<StageGate>,
}

impl StageGateReport {
    pub fn gate_for(&self, stage: Stage) -> &StageGate {
        &self.stages[stage.index()]
    }

    /// The stage whose content may be interacted with, if any
    pub fn interactive_stage(&self) -> Option<Stage> {
        self.stages.iter().find(|g| g.interactive).map(|g| g.stage)
    }
}

/// Derive render directives for every stage.
///
/// A stage absent from `status_list` is locked and not started. A lock on an
/// earlier stage carries over to every later stage.
pub fn gate_stages(
    status_list: &[StageAggregate],
    selected: Stage,
    mode: Option<&ModeResolution>,
) -> StageGateReport {
    let mut resolved: [Option<&StageAggregate>; 5] = [None; 5];
    for aggregate in status_list {
        match Stage::from_label(&aggregate.stage_label) {
            Some(stage) => {
                if resolved[stage.index()].is_none() {
                    resolved[stage.index()] = Some(aggregate);
                }
            }
            None => {
                warn!(label = %aggregate.stage_label, "Ignoring status for unknown stage");
            }
        }
    }

    let selected_completed = mode.is_some_and(|m| m.mode == AttemptMode::QuizCompleted);
    let mut earlier_locked = false;

    let stages = Stage::ALL
        .into_iter()
        .map(|stage| {
            let (own_lock, status) = match resolved[stage.index()] {
                Some(aggregate) => (aggregate.locked, aggregate.status),
                None => (true, StageProgress::NotStarted),
            };
            let locked = own_lock || earlier_locked;
            earlier_locked = locked;

            let is_selected = stage == selected;
            let directive = if locked {
                RenderDirective::Locked
            } else if status == StageProgress::Done || (is_selected && selected_completed) {
                RenderDirective::Done
            } else if is_selected {
                RenderDirective::Active
            } else {
                RenderDirective::Default
            };

            StageGate {
                stage,
                directive,
                interactive: is_selected && !locked,
                selected: is_selected,
                locked,
                status,
            }
        })
        .collect();

    let report = StageGateReport { selected, stages };
    debug!(
        selected = %selected,
        interactive = ?report.interactive_stage(),
        "Stage gates resolved"
    );
    report
}
