use outreach_core::OutreachError;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{EnrollmentStatus, EventKind, SequenceVersionId};

/// Rejections raised while publishing a sequence definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("sequence name must not be empty")]
    EmptyName,

    #[error("sequence must contain at least one step")]
    NoSteps,

    #[error("sequence must contain at least one active step")]
    NoActiveSteps,

    #[error("step numbers must be contiguous from 1: expected {expected}, found {found}")]
    StepNumbering { expected: u32, found: u32 },

    #[error("step {step} skips to unknown step {target}")]
    SkipTargetMissing { step: u32, target: u32 },

    #[error("step {step} skips backwards to step {target}")]
    BackwardSkip { step: u32, target: u32 },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid time range on {day}: {start}-{end}")]
    InvalidTimeRange {
        day: String,
        start: String,
        end: String,
    },

    #[error("step {step} can never send: the sending schedule has no usable window")]
    NoSendingWindow { step: u32 },

    #[error("unknown sequence {0}")]
    UnknownSequence(Uuid),
}

/// Enrollment Store failures. `VersionConflict` is the expected outcome of a
/// lost race, not a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("enrollment {0} not found")]
    NotFound(Uuid),

    #[error("prospect '{prospect_id}' already has active enrollment {existing} in this sequence")]
    AlreadyActive { prospect_id: String, existing: Uuid },

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("enrollment {0} is terminal")]
    Terminal(Uuid),

    #[error("enrollment {0} is leased by another worker")]
    Leased(Uuid),

    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("event kind '{0}' cannot be ingested")]
    UnsupportedKind(String),

    #[error("event id must not be empty")]
    MissingEventId,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn unsupported(kind: EventKind) -> Self {
        IngestError::UnsupportedKind(kind.as_str().to_string())
    }
}

/// Raised when an operation needs a sequence version the registry does not hold.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sequence version {0} not found")]
pub struct UnknownVersion(pub SequenceVersionId);

impl From<DefinitionError> for OutreachError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::UnknownSequence(_) => OutreachError::NotFound(err.to_string()),
            other => OutreachError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for OutreachError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => OutreachError::NotFound(err.to_string()),
            StoreError::Terminal(_) => OutreachError::Terminal(err.to_string()),
            StoreError::AlreadyActive { .. }
            | StoreError::VersionConflict { .. }
            | StoreError::Leased(_)
            | StoreError::InvalidTransition { .. } => OutreachError::Conflict(err.to_string()),
        }
    }
}

impl From<IngestError> for OutreachError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Store(store) => store.into(),
            other => OutreachError::Validation(other.to_string()),
        }
    }
}

impl From<UnknownVersion> for OutreachError {
    fn from(err: UnknownVersion) -> Self {
        OutreachError::NotFound(err.to_string())
    }
}
