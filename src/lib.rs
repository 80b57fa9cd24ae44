// Finance Migration - Core Library
// Bulk migration of expenses and budgets with cross-entity link reconciliation.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod batch;        // Batch Splitter
pub mod config;       // MigrationConfig + link RetryPolicy
pub mod creator;      // Entity Creator (validation, category/payment lookups)
pub mod error;        // Error taxonomy
pub mod events;       // Linking events + in-process bus
pub mod id_map;       // Identifier Map (old id -> new id)
pub mod jobs;         // Job Tracker (sync + background jobs)
pub mod logging;      // tracing subscriber setup
pub mod model;        // Wire types: request, records, result
pub mod orchestrator; // Bulk Orchestrator
pub mod progress;     // Progress Tracker
pub mod reconciler;   // Link Reconciler
pub mod report;       // JSON / CSV result export
pub mod store;        // Entity Store trait + in-memory / SQLite backends

// Re-export commonly used types
pub use batch::{split, Batch};
pub use config::{MigrationConfig, RetryPolicy};
pub use creator::{EntityCreator, LookupCache};
pub use error::{BusError, CreationError, MigrationError, StoreError, ValidationError};
pub use events::{EventBus, InProcessBus, LinkEnvelope, LinkEvent, LinkPublisher, LINKING_TOPIC};
pub use id_map::{EntityKind, IdentifierMap};
pub use jobs::{ActiveJobs, JobContext, MigrationService};
pub use model::{
    BudgetMapping, BudgetRecord, BudgetResult, ExpenseDetails, ExpenseRecord, ExpenseResult,
    ExpenseType, ItemStatus, LinkWarning, MappingGroup, MappingRequest, MappingResult,
};
pub use orchestrator::{BulkOrchestrator, ExecutionMode};
pub use progress::{JobStatus, ProgressSnapshot, ProgressTracker};
pub use reconciler::{LinkOutcome, LinkReconciler};
pub use store::{EntityStore, InMemoryStore, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
