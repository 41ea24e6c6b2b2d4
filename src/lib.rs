//! Lamad Progression - learner progression engine for study plans
//!
//! Turns raw learning-platform data into the navigation, gating and mastery
//! decisions a learner interface needs.
//!
//! ## Architecture
//!
//! - **Pure core**: plan indexing, attempt modes, concept mastery, stage
//!   gates and usage accounting are synchronous functions over owned data
//! - **Collaborators**: plans, attempt history, stage status and the usage
//!   ledger sit behind async traits implemented by the host application
//! - **Caches**: keyed by `(sub-chapter, stage)` and invalidated wholesale on
//!   mutation events
//!
//! ## Stages
//!
//! | Stage | Kind |
//! |-------|------|
//! | reading | content, no quiz |
//! | remember | quiz |
//! | understand | quiz |
//! | apply | quiz |
//! | analyze | quiz |
//!
//! ## Data Flow
//!
//! ```text
//! PlanDoc ──normalize──► IndexedPlan ──► Cursor
//! attempts + revisions ──resolve_mode──► AttemptMode
//! attempts + catalog ──aggregate_concepts──► ConceptAggregate
//! stage status + mode ──gate_stages──► StageGateReport
//! clock ──tick──► lump flushes ──► UsageLedger
//! ```

// Pure core
pub mod attempts;
pub mod gate;
pub mod mastery;
pub mod plan;
pub mod score;
pub mod stage;
pub mod usage;

// Evaluation and collaborators
pub mod cache;
pub mod engine;
pub mod events;
pub mod sources;

pub mod config;
pub mod error;

// Re-exports
pub use attempts::{resolve_mode, AttemptHistory, AttemptMode, ModeResolution, QuizAttempt};
pub use cache::{HistoryKey, KeyedCache, ProgressCaches};
pub use config::Config;
pub use engine::{ActivityView, ProgressSnapshot, ProgressionEngine};
pub use error::ProgressionError;
pub use events::{EventBus, ProgressionEvent};
pub use gate::{gate_stages, RenderDirective, StageAggregate, StageGateReport};
pub use mastery::{aggregate_concepts, ConceptAggregate, MasteryStatus};
pub use plan::{normalize, Cursor, IndexedPlan, PlanDoc, PlanState};
pub use score::ScoreRatio;
pub use sources::{AttemptHistorySource, PlanSource, ProgressionService, StageStatusSource};
pub use stage::Stage;
pub use usage::{tick, InMemoryUsageLedger, UsageKey, UsageLedger, UsageSession, UsageTimer};
