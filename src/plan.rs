//! Plan indexing and navigation
//!
//! A plan arrives as ordered sessions (one per calendar day), each holding an
//! ordered list of activities. [`normalize`] annotates every activity with its
//! session position (`dayIndex`) and global position (`flatIndex`) and builds a
//! flat list for previous/current/next lookups.
//!
//! Indices are always recomputed from scratch. Activity sets can be rebalanced
//! between refreshes, so an index from an older plan instance is never patched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProgressionError;
use crate::stage::Stage;

// ============================================================================
// Plan Document
// ============================================================================

/// Kind of scheduled activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Read,
    Quiz,
}

/// A single scheduled activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityNode {
    pub activity_id: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default = "default_stage")]
    pub stage: Stage,
    pub sub_chapter_id: String,
    #[serde(default)]
    pub chapter_id: String,
    #[serde(default)]
    pub completed: bool,
    /// Session position, assigned by [`normalize`]
    #[serde(default)]
    pub day_index: usize,
    /// Global position, assigned by [`normalize`]
    #[serde(default)]
    pub flat_index: usize,
}

fn default_stage() -> Stage {
    Stage::Reading
}

/// One day of the plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub activities: Vec<ActivityNode>,
}

/// Nested plan document as returned by the plan source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDoc {
    pub plan_id: String,
    #[serde(default)]
    pub sessions: Vec<Session>,
}

impl PlanDoc {
    pub fn from_json(json: &str) -> Result<Self, ProgressionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Total number of activities across all sessions
    pub fn activity_count(&self) -> usize {
        self.sessions.iter().map(|s| s.activities.len()).sum()
    }
}

// ============================================================================
// Indexed Plan
// ============================================================================

/// Plan annotated with day and flat indices
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedPlan {
    pub plan: PlanDoc,
    pub flat: Vec<ActivityNode>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

/// Result of loading a plan that may not exist
#[derive(Debug, Clone)]
pub enum PlanState {
    /// The plan source returned no document
    NoPlan,
    Ready(IndexedPlan),
}

impl PlanState {
    pub fn plan(&self) -> Option<&IndexedPlan> {
        match self {
            PlanState::NoPlan => None,
            PlanState::Ready(plan) => Some(plan),
        }
    }
}

/// Position of an activity with its neighbours in the flat list
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Cursor<'a> {
    /// The plan has no activities
    NoActivity,
    At {
        previous: Option<&'a ActivityNode>,
        current: &'a ActivityNode,
        next: Option<&'a ActivityNode>,
    },
}

impl<'a> Cursor<'a> {
    pub fn current(&self) -> Option<&'a ActivityNode> {
        match self {
            Cursor::NoActivity => None,
            Cursor::At { current, .. } => Some(current),
        }
    }
}

/// Completed vs. total activity counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCompletion {
    pub completed: usize,
    pub total: usize,
}

/// Annotate a plan with `dayIndex` and `flatIndex` and build its flat list.
///
/// Business fields are left untouched; any indices already present on the
/// input are overwritten. Empty sessions contribute nothing.
pub fn normalize(doc: &PlanDoc) -> IndexedPlan {
    let mut plan = doc.clone();
    let mut flat = Vec::with_capacity(doc.activity_count());
    let mut by_id = HashMap::with_capacity(flat.capacity());

    for (day_index, session) in plan.sessions.iter_mut().enumerate() {
        for activity in session.activities.iter_mut() {
            activity.day_index = day_index;
            activity.flat_index = flat.len();

            if by_id.contains_key(&activity.activity_id) {
                warn!(
                    plan_id = %doc.plan_id,
                    activity_id = %activity.activity_id,
                    "Duplicate activity id in plan, keeping first position for lookups"
                );
            } else {
                by_id.insert(activity.activity_id.clone(), activity.flat_index);
            }

            flat.push(activity.clone());
        }
    }

    debug!(
        plan_id = %doc.plan_id,
        sessions = plan.sessions.len(),
        activities = flat.len(),
        "Plan normalized"
    );

    IndexedPlan { plan, flat, by_id }
}

/// Normalize a plan document that may be absent
pub fn normalize_document(doc: Option<&PlanDoc>) -> PlanState {
    match doc {
        Some(doc) => PlanState::Ready(normalize(doc)),
        None => {
            debug!("No plan document available");
            PlanState::NoPlan
        }
    }
}

impl IndexedPlan {
    pub fn plan_id(&self) -> &str {
        &self.plan.plan_id
    }

    pub fn len(&self) -> usize {
        self.flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    pub fn get(&self, flat_index: usize) -> Option<&ActivityNode> {
        self.flat.get(flat_index)
    }

    /// Flat index of an activity
    pub fn position_of(&self, activity_id: &str) -> Option<usize> {
        self.by_id.get(activity_id).copied()
    }

    pub fn find(&self, activity_id: &str) -> Option<&ActivityNode> {
        self.position_of(activity_id).and_then(|i| self.flat.get(i))
    }

    /// Activities scheduled on one day
    pub fn day(&self, day_index: usize) -> &[ActivityNode] {
        self.plan
            .sessions
            .get(day_index)
            .map(|s| s.activities.as_slice())
            .unwrap_or(&[])
    }

    /// Cursor at a flat index. Out-of-range indices clamp to the last activity.
    pub fn cursor_at(&self, flat_index: usize) -> Cursor<'_> {
        if self.flat.is_empty() {
            return Cursor::NoActivity;
        }
        let index = flat_index.min(self.flat.len() - 1);
        Cursor::At {
            previous: index.checked_sub(1).and_then(|i| self.flat.get(i)),
            current: &self.flat[index],
            next: self.flat.get(index + 1),
        }
    }

    /// Cursor at an activity, if it exists in this plan
    pub fn cursor_for(&self, activity_id: &str) -> Option<Cursor<'_>> {
        self.position_of(activity_id).map(|i| self.cursor_at(i))
    }

    /// Cursor at the first incomplete activity, or the last one when
    /// everything is done.
    pub fn resume_cursor(&self) -> Cursor<'_> {
        let index = self
            .flat
            .iter()
            .position(|a| !a.completed)
            .unwrap_or_else(|| self.flat.len().saturating_sub(1));
        self.cursor_at(index)
    }

    pub fn completion(&self) -> PlanCompletion {
        PlanCompletion {
            completed: self.flat.iter().filter(|a| a.completed).count(),
            total: self.flat.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(id: &str, activity_type: ActivityType, stage: Stage) -> ActivityNode {
        ActivityNode {
            activity_id: id.to_string(),
            activity_type,
            stage,
            sub_chapter_id: "sub-1".to_string(),
            chapter_id: "ch-1".to_string(),
            completed: false,
            day_index: 99,
            flat_index: 99,
        }
    }

    fn sample_plan() -> PlanDoc {
        PlanDoc {
            plan_id: "plan-1".into(),
            sessions: vec![
                Session {
                    date: Some("2024-01-01".into()),
                    activities: vec![
                        activity("a", ActivityType::Read, Stage::Reading),
                        activity("b", ActivityType::Quiz, Stage::Remember),
                    ],
                },
                Session::default(),
                Session {
                    date: None,
                    activities: vec![activity("c", ActivityType::Quiz, Stage::Understand)],
                },
            ],
        }
    }

    #[test]
    fn test_normalize_assigns_indices() {
        let indexed = normalize(&sample_plan());
        assert_eq!(indexed.len(), 3);

        let flat: Vec<usize> = indexed.flat.iter().map(|a| a.flat_index).collect();
        assert_eq!(flat, vec![0, 1, 2]);

        let days: Vec<usize> = indexed.flat.iter().map(|a| a.day_index).collect();
        assert_eq!(days, vec![0, 0, 2]);

        // Tree is annotated as well
        assert_eq!(indexed.plan.sessions[2].activities[0].flat_index, 2);
        assert_eq!(indexed.day(1).len(), 0);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(&sample_plan());
        let twice = normalize(&once.plan);
        assert_eq!(once.flat, twice.flat);
        assert_eq!(once.plan, twice.plan);
    }

    #[test]
    fn test_normalize_keeps_business_fields() {
        let mut doc = sample_plan();
        doc.sessions[0].activities[1].completed = true;
        let indexed = normalize(&doc);
        let b = indexed.find("b").unwrap();
        assert!(b.completed);
        assert_eq!(b.stage, Stage::Remember);
        assert_eq!(b.activity_type, ActivityType::Quiz);
    }

    #[test]
    fn test_empty_plan_yields_no_activity() {
        let indexed = normalize(&PlanDoc {
            plan_id: "empty".into(),
            sessions: vec![Session::default()],
        });
        assert!(indexed.is_empty());
        assert_eq!(indexed.resume_cursor(), Cursor::NoActivity);
        assert_eq!(indexed.cursor_at(0), Cursor::NoActivity);
    }

    #[test]
    fn test_absent_document_is_no_plan() {
        assert!(matches!(normalize_document(None), PlanState::NoPlan));
        assert!(normalize_document(Some(&sample_plan())).plan().is_some());
    }

    #[test]
    fn test_cursor_neighbours() {
        let indexed = normalize(&sample_plan());
        match indexed.cursor_for("b").unwrap() {
            Cursor::At {
                previous,
                current,
                next,
            } => {
                assert_eq!(previous.unwrap().activity_id, "a");
                assert_eq!(current.activity_id, "b");
                assert_eq!(next.unwrap().activity_id, "c");
            }
            Cursor::NoActivity => panic!("expected cursor"),
        }

        match indexed.cursor_at(0) {
            Cursor::At { previous, .. } => assert!(previous.is_none()),
            Cursor::NoActivity => panic!("expected cursor"),
        }
        assert!(indexed.cursor_for("missing").is_none());
    }

    #[test]
    fn test_resume_cursor_skips_completed() {
        let mut doc = sample_plan();
        doc.sessions[0].activities[0].completed = true;
        let indexed = normalize(&doc);
        assert_eq!(indexed.resume_cursor().current().unwrap().activity_id, "b");
        assert_eq!(
            indexed.completion(),
            PlanCompletion {
                completed: 1,
                total: 3
            }
        );

        for session in doc.sessions.iter_mut() {
            for a in session.activities.iter_mut() {
                a.completed = true;
            }
        }
        let indexed = normalize(&doc);
        assert_eq!(indexed.resume_cursor().current().unwrap().activity_id, "c");
    }

    #[test]
    fn test_plan_from_json() {
        let json = r#"{
            "planId": "p",
            "sessions": [
                {"activities": [
                    {"activityId": "r1", "type": "read", "subChapterId": "s1", "chapterId": "c1"},
                    {"activityId": "q1", "type": "quiz", "stage": "remember", "subChapterId": "s1", "completed": true}
                ]},
                {}
            ]
        }"#;
        let doc = PlanDoc::from_json(json).unwrap();
        let indexed = normalize(&doc);
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed.flat[0].stage, Stage::Reading);
        assert!(indexed.flat[1].completed);
    }
}
