//! Keyed caches with invalidate-then-refetch semantics
//!
//! Each key owns a slot that is filled at most once. Concurrent readers of a
//! key that is still loading wait for the first fetch instead of racing it.
//! Invalidation replaces the slot wholesale; a ready entry is never mutated.
//! A fetch that completes after its slot was invalidated lands in the
//! orphaned slot and is discarded.
//!
//! [`ProgressCaches`] groups the plan, history and stage status caches and
//! maps each mutation event to the entries it makes stale.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::attempts::AttemptHistory;
use crate::error::ProgressionError;
use crate::events::{spawn_listener, EventBus, EventListener, ProgressionEvent};
use crate::gate::StageAggregate;
use crate::plan::PlanState;
use crate::stage::Stage;

// ============================================================================
// Keys
// ============================================================================

/// Attempt history partition: one stage of one sub-chapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryKey {
    pub user_id: String,
    pub plan_id: String,
    pub sub_chapter_id: String,
    pub stage: Stage,
}

impl HistoryKey {
    pub fn status_key(&self) -> StatusKey {
        StatusKey {
            user_id: self.user_id.clone(),
            plan_id: self.plan_id.clone(),
            sub_chapter_id: self.sub_chapter_id.clone(),
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.user_id, self.plan_id, self.sub_chapter_id, self.stage
        )
    }
}

/// Stage status partition: one sub-chapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusKey {
    pub user_id: String,
    pub plan_id: String,
    pub sub_chapter_id: String,
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.plan_id, self.sub_chapter_id)
    }
}

/// Plan partition: one learner's plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanKey {
    pub user_id: String,
    pub plan_id: String,
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.plan_id)
    }
}

// ============================================================================
// Keyed Cache
// ============================================================================

type Slot<V> = Arc<OnceCell<Arc<V>>>;

/// Concurrent cache partitioned by key
pub struct KeyedCache<K, V> {
    name: &'static str,
    slots: DashMap<K, Slot<V>>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: DashMap::new(),
        }
    }

    /// Return the cached value or run `fetch` to fill it.
    ///
    /// Only one fetch per key is in flight; other callers await it. A failed
    /// fetch leaves nothing behind so the next call retries.
    pub async fn get_or_fetch<F, Fut>(&self, key: &K, fetch: F) -> Result<Arc<V>, ProgressionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ProgressionError>>,
    {
        // Clone the slot out so the shard lock is not held across the fetch
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(value) = slot.get() {
            trace!(cache = self.name, key = %key, "Cache hit");
            return Ok(Arc::clone(value));
        }

        let result = slot
            .get_or_try_init(|| async {
                debug!(cache = self.name, key = %key, "Fetching");
                fetch().await.map(Arc::new)
            })
            .await;

        match result {
            Ok(value) => Ok(Arc::clone(value)),
            Err(e) => {
                self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
                Err(e)
            }
        }
    }

    /// Ready value for a key, without fetching
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.slots
            .get(key)
            .and_then(|slot| slot.get().map(Arc::clone))
    }

    /// Whether a fetch for the key is in flight
    pub fn is_loading(&self, key: &K) -> bool {
        self.slots
            .get(key)
            .map(|slot| !slot.initialized())
            .unwrap_or(false)
    }

    /// Drop the entry for a key. Returns whether one existed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.slots.remove(key).is_some();
        if removed {
            debug!(cache = self.name, key = %key, "Invalidated");
        }
        removed
    }

    /// Drop every entry whose key matches
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| !predicate(key));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(cache = self.name, removed = removed, "Invalidated matching entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

// ============================================================================
// Progression Caches
// ============================================================================

/// The three caches behind a progression view
pub struct ProgressCaches {
    pub plans: KeyedCache<PlanKey, PlanState>,
    pub history: KeyedCache<HistoryKey, AttemptHistory>,
    pub statuses: KeyedCache<StatusKey, Vec<StageAggregate>>,
}

impl ProgressCaches {
    pub fn new() -> Self {
        Self {
            plans: KeyedCache::new("plans"),
            history: KeyedCache::new("history"),
            statuses: KeyedCache::new("stage-status"),
        }
    }

    /// Drop every entry a mutation event makes stale. Returns the number of
    /// entries removed.
    pub fn apply(&self, event: &ProgressionEvent) -> usize {
        match event {
            ProgressionEvent::QuizSubmitted { key, .. } => {
                usize::from(self.history.invalidate(key))
                    + usize::from(self.statuses.invalidate(&key.status_key()))
            }
            ProgressionEvent::RevisionCompleted { key, .. } => {
                usize::from(self.history.invalidate(key))
            }
            ProgressionEvent::ActivityCompleted { plan_id, .. } => {
                self.plans.invalidate_where(|k| &k.plan_id == plan_id)
                    + self.statuses.invalidate_where(|k| &k.plan_id == plan_id)
            }
            ProgressionEvent::PlanRebalanced { plan_id } => {
                self.plans.invalidate_where(|k| &k.plan_id == plan_id)
            }
            ProgressionEvent::UsageFlushed { .. } | ProgressionEvent::UsageFlushFailed { .. } => 0,
        }
    }
}

impl Default for ProgressCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener for ProgressCaches {
    fn on_event(&self, event: &ProgressionEvent) {
        self.apply(event);
    }

    /// Missed events could have made anything stale
    fn on_lagged(&self, skipped: u64) {
        warn!(skipped = skipped, "Invalidation listener lagged, clearing all caches");
        self.plans.clear();
        self.history.clear();
        self.statuses.clear();
    }
}

/// Spawn a background task that invalidates caches on mutation events
pub fn spawn_invalidation_listener(
    caches: Arc<ProgressCaches>,
    event_bus: &EventBus,
) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, caches)
}
