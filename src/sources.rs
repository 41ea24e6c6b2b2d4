//! Collaborator boundaries and the progression service
//!
//! The engine itself never performs I/O. The shell implements these traits
//! against its backend and hands them to [`ProgressionService`], which
//! caches every fetch by key and drops cached entries when mutation events
//! arrive.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  PlanSource  │   │ AttemptHistory-  │   │ StageStatusSource│
//! │              │   │     Source       │   │                  │
//! └──────┬───────┘   └────────┬─────────┘   └────────┬─────────┘
//!        │                    │                      │
//!        └──────────► ProgressCaches ◄───────────────┘
//!                           │        ▲
//!                           ▼        │ invalidate
//!                   ProgressionEngine  EventBus
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::attempts::AttemptHistory;
use crate::cache::{spawn_invalidation_listener, HistoryKey, PlanKey, ProgressCaches, StatusKey};
use crate::config::Config;
use crate::engine::{ActivityView, ProgressSnapshot, ProgressionEngine};
use crate::error::ProgressionError;
use crate::events::{EventBus, ProgressionEvent};
use crate::gate::StageAggregate;
use crate::plan::{normalize_document, PlanDoc, PlanState};
use crate::stage::Stage;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Source of plan documents and concept catalogs
#[async_trait]
pub trait PlanSource: Send + Sync {
    /// Fetch a learner's plan. `None` means the learner has no such plan.
    async fn fetch_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Option<PlanDoc>, ProgressionError>;

    /// Canonical concept list of a sub-chapter
    async fn fetch_concepts(
        &self,
        _plan_id: &str,
        _sub_chapter_id: &str,
    ) -> Result<Vec<String>, ProgressionError> {
        Ok(Vec::new())
    }
}

/// Source of quiz attempts and revisions
#[async_trait]
pub trait AttemptHistorySource: Send + Sync {
    async fn fetch_history(&self, key: &HistoryKey) -> Result<AttemptHistory, ProgressionError>;
}

/// Source of per-stage lock and progress aggregates
#[async_trait]
pub trait StageStatusSource: Send + Sync {
    async fn fetch_stage_status(
        &self,
        key: &StatusKey,
    ) -> Result<Vec<StageAggregate>, ProgressionError>;
}

// ============================================================================
// Progression Service
// ============================================================================

/// Cached access to collaborators plus activity evaluation
pub struct ProgressionService {
    engine: ProgressionEngine,
    plans: Arc<dyn PlanSource>,
    history: Arc<dyn AttemptHistorySource>,
    stages: Arc<dyn StageStatusSource>,
    caches: Arc<ProgressCaches>,
    events: Arc<EventBus>,
}

impl ProgressionService {
    pub fn new(
        config: Config,
        plans: Arc<dyn PlanSource>,
        history: Arc<dyn AttemptHistorySource>,
        stages: Arc<dyn StageStatusSource>,
    ) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));
        Self {
            engine: ProgressionEngine::new(config),
            plans,
            history,
            stages,
            caches: Arc::new(ProgressCaches::new()),
            events,
        }
    }

    pub fn engine(&self) -> &ProgressionEngine {
        &self.engine
    }

    pub fn caches(&self) -> &Arc<ProgressCaches> {
        &self.caches
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Keep caches in step with events emitted by other components, such as
    /// usage timers or another service sharing the bus.
    pub fn spawn_invalidation_listener(&self) -> tokio::task::JoinHandle<()> {
        spawn_invalidation_listener(self.caches.clone(), &self.events)
    }

    /// Load and index a plan. A missing document yields [`PlanState::NoPlan`].
    pub async fn load_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Arc<PlanState>, ProgressionError> {
        let key = PlanKey {
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
        };
        self.caches
            .plans
            .get_or_fetch(&key, || async {
                let doc = self.plans.fetch_plan(user_id, plan_id).await?;
                Ok(normalize_document(doc.as_ref()))
            })
            .await
    }

    pub async fn history(&self, key: &HistoryKey) -> Result<Arc<AttemptHistory>, ProgressionError> {
        self.caches
            .history
            .get_or_fetch(key, || self.history.fetch_history(key))
            .await
    }

    pub async fn stage_status(
        &self,
        key: &StatusKey,
    ) -> Result<Arc<Vec<StageAggregate>>, ProgressionError> {
        self.caches
            .statuses
            .get_or_fetch(key, || self.stages.fetch_stage_status(key))
            .await
    }

    /// Fetch everything an activity needs and evaluate it.
    ///
    /// Fails with [`ProgressionError::NotFound`] when the plan or the
    /// activity does not exist.
    pub async fn evaluate(
        &self,
        user_id: &str,
        plan_id: &str,
        activity_id: &str,
        selected: Option<Stage>,
    ) -> Result<ActivityView, ProgressionError> {
        let state = self.load_plan(user_id, plan_id).await?;
        let plan = state
            .plan()
            .ok_or_else(|| ProgressionError::NotFound(format!("plan {}", plan_id)))?;
        let activity = plan
            .find(activity_id)
            .ok_or_else(|| ProgressionError::NotFound(format!("activity {}", activity_id)))?;

        let key = HistoryKey {
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            sub_chapter_id: activity.sub_chapter_id.clone(),
            stage: selected.unwrap_or(activity.stage),
        };

        let status_key = key.status_key();
        let (history, statuses, concepts) = tokio::try_join!(
            self.history(&key),
            self.stage_status(&status_key),
            self.plans.fetch_concepts(plan_id, &activity.sub_chapter_id),
        )?;

        let snapshot = ProgressSnapshot::from_parts(&history, &statuses, &concepts);
        self.engine
            .evaluate(plan, activity_id, Some(key.stage), &snapshot)
    }

    /// Invalidate synchronously, then broadcast to other listeners
    pub fn notify(&self, event: ProgressionEvent) {
        let removed = self.caches.apply(&event);
        debug!(removed = removed, event = ?event, "Applied mutation event");
        self.events.emit(event);
    }

    pub fn record_quiz_submitted(&self, key: HistoryKey, attempt_number: u32) {
        info!(key = %key, attempt = attempt_number, "Quiz submitted");
        self.notify(ProgressionEvent::QuizSubmitted {
            key,
            attempt_number,
        });
    }

    pub fn record_revision_completed(&self, key: HistoryKey, revision_number: u32) {
        self.notify(ProgressionEvent::RevisionCompleted {
            key,
            revision_number,
        });
    }

    pub fn record_activity_completed(&self, plan_id: &str, activity_id: &str) {
        self.notify(ProgressionEvent::ActivityCompleted {
            plan_id: plan_id.to_string(),
            activity_id: activity_id.to_string(),
        });
    }
}
