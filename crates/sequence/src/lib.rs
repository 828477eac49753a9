//! Outreach sequence engine: versioned multi-step sequences, per-prospect
//! enrollments, condition-driven advancement and window/budget gated sends.

pub mod calendar;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod persistence;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod state_machine;
pub mod store;
pub mod types;

pub use engine::SequenceEngine;
pub use error::{DefinitionError, IngestError, StoreError};
pub use evaluator::ConditionEvaluator;
pub use ingest::{EventIngest, InboundEvent, IngestOutcome};
pub use registry::SequenceRegistry;
pub use scheduler::{PassOutcome, PassReport, SchedulerPool, SchedulerSettings, SequenceScheduler};
pub use sender::{ChannelSender, SendOutcome, SendRequest};
pub use store::{EnrollmentStore, InMemoryEnrollmentStore};
