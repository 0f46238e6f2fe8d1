//! Error types for the laboratory kernel
//!
//! [`LimsError`] is what callers see. Every variant is classified as
//! recoverable (the caller fixes input, re-prompts or reloads) or fatal for
//! the request. Storage and credential timeouts are the only retryable ones.

use crate::types::{AnalysisId, AnalysisStatus, ActorId, EntityRef, SampleId, SampleStatus};
use lims_conformity::{CatalogError, InputError, ParameterId};
use serde::{Deserialize, Serialize};

/// Field an operator has to correct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Measured value
    Value,
    /// Instrument reference
    Equipment,
    /// Notes or OOS justification
    Notes,
    /// Reason for a decision or retest
    Reason,
    /// Signing password
    Password,
    /// Current status of the record
    Status,
    /// Batch or intermediate link of a sample
    SampleLink,
    /// Parameter reference
    Parameter,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Value => "value",
            Self::Equipment => "equipment",
            Self::Notes => "notes",
            Self::Reason => "reason",
            Self::Password => "password",
            Self::Status => "status",
            Self::SampleLink => "sample_link",
            Self::Parameter => "parameter",
        };
        f.write_str(name)
    }
}

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Analysis at fault, `None` for action-level fields
    pub analysis_id: Option<AnalysisId>,
    /// Offending field
    pub field: Field,
    /// Operator-facing explanation
    pub message: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.analysis_id {
            Some(id) => write!(f, "analysis {id} {}: {}", self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Every violation found in one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// In the order they were found
    pub violations: Vec<FieldViolation>,
}

impl ValidationReport {
    /// Empty report
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report with a single action-level violation
    #[must_use]
    pub fn single(field: Field, message: impl Into<String>) -> Self {
        let mut report = Self::new();
        report.push(None, field, message);
        report
    }

    /// Record a violation
    pub fn push(&mut self, analysis_id: Option<AnalysisId>, field: Field, message: impl Into<String>) {
        self.violations.push(FieldViolation {
            analysis_id,
            field,
            message: message.into(),
        });
    }

    /// Append another report
    pub fn extend(&mut self, other: Self) {
        self.violations.extend(other.violations);
    }

    /// Nothing was flagged
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations for one analysis
    pub fn for_analysis(&self, id: AnalysisId) -> impl Iterator<Item = &FieldViolation> {
        self.violations
            .iter()
            .filter(move |v| v.analysis_id == Some(id))
    }

    /// Whether `field` of `analysis_id` is flagged
    #[must_use]
    pub fn flags(&self, analysis_id: Option<AnalysisId>, field: Field) -> bool {
        self.violations
            .iter()
            .any(|v| v.analysis_id == analysis_id && v.field == field)
    }

    /// `Ok(())` when empty, `ValidationFailed` otherwise
    ///
    /// # Errors
    /// [`LimsError::ValidationFailed`] carrying this report.
    pub fn into_result(self) -> Result<(), LimsError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(LimsError::ValidationFailed(self))
        }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// Illegal state changes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Hop not in the sample transition table
    #[error("illegal sample transition {from} -> {to}")]
    Sample {
        /// Current status
        from: SampleStatus,
        /// Requested status
        to: SampleStatus,
    },

    /// Analysis cannot make this move
    #[error("illegal transition of analysis {analysis_id}: {from} -> {to}")]
    Analysis {
        /// Analysis concerned
        analysis_id: AnalysisId,
        /// Current status
        from: AnalysisStatus,
        /// Requested status
        to: AnalysisStatus,
    },

    /// Sample is past analysis; results are frozen
    #[error("sample {sample_id} is {status} and no longer accepts results")]
    SampleLocked {
        /// Locked sample
        sample_id: SampleId,
        /// Its current status
        status: SampleStatus,
    },
}

/// Persistence failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The store did not answer in time
    #[error("storage timed out")]
    Timeout,

    /// Backend down or unreachable
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Insert collided with an existing key
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Audit log could not be appended
    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),
}

/// Audit chain failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Hash link broken at this position
    #[error("audit chain integrity violated at position {0}")]
    IntegrityViolation(usize),

    /// Event could not be serialized for hashing
    #[error("audit event could not be encoded: {0}")]
    Encoding(String),
}

/// Batch execution session misuse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Analysis outside the session
    #[error("analysis {0} is not part of this session")]
    UnknownAnalysis(AnalysisId),

    /// Cannot move past the signature step
    #[error("already at the signature step")]
    AtSignatureStep,

    /// Finalize called before every step was captured
    #[error("not at the signature step")]
    NotAtSignatureStep,

    /// Cannot step back from the first analysis
    #[error("already at the first step")]
    AtFirstStep,

    /// Justification offered for a conforming result
    #[error("current result is not out of specification")]
    NoJustificationNeeded,

    /// Operator input could not be normalized
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
}

/// Non-fatal findings surfaced alongside a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Result kept for audit but no specification applies; verdict indeterminate
    SpecificationNotFound {
        /// Committed analysis
        analysis_id: AnalysisId,
        /// Parameter without a specification
        parameter_id: ParameterId,
    },
    /// Client-supplied conformity flag disagreed with the recomputed verdict
    ConformityOverridden {
        /// Analysis whose flag was replaced
        analysis_id: AnalysisId,
    },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpecificationNotFound {
                analysis_id,
                parameter_id,
            } => write!(
                f,
                "no specification for parameter {parameter_id} (analysis {analysis_id}); conformity indeterminate"
            ),
            Self::ConformityOverridden { analysis_id } => {
                write!(f, "conformity of analysis {analysis_id} recomputed on commit")
            }
        }
    }
}

/// Main kernel error type
#[derive(Debug, thiserror::Error)]
pub enum LimsError {
    /// Missing value, equipment, justification or reason
    #[error("validation failed: {0}")]
    ValidationFailed(ValidationReport),

    /// Signature denied
    #[error("signature denied: credential could not be verified")]
    InvalidCredential,

    /// Credential service did not answer in time
    #[error("credential verification timed out after {timeout_ms}ms")]
    CredentialTimeout {
        /// Configured limit
        timeout_ms: u64,
    },

    /// Credential service unreachable
    #[error("credential service unavailable: {0}")]
    CredentialServiceUnavailable(String),

    /// Persisted state no longer matches what the caller saw
    #[error("{entity} was changed by someone else (expected {expected}, found {actual}); refresh and retry")]
    ConcurrentModification {
        /// Record that moved
        entity: EntityRef,
        /// Status the caller read
        expected: String,
        /// Status found at commit
        actual: String,
    },

    /// No effective specification for a parameter
    #[error("no specification for parameter {parameter_id}")]
    SpecificationNotFound {
        /// Parameter looked up
        parameter_id: ParameterId,
    },

    /// Persistence failure, nothing was applied
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// Move not allowed from the current status
    #[error("{0}")]
    IllegalTransition(#[from] TransitionError),

    /// Role or organization does not allow the action
    #[error("actor {actor_id} may not {action}")]
    Forbidden {
        /// Denied actor
        actor_id: ActorId,
        /// What was attempted
        action: String,
    },

    /// Referenced record does not exist
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// Catalog lookup failed
    #[error("specification catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// Batch execution session misuse
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl LimsError {
    /// Caller can act on the error and try again
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed(_)
                | Self::InvalidCredential
                | Self::CredentialTimeout { .. }
                | Self::ConcurrentModification { .. }
                | Self::SpecificationNotFound { .. }
                | Self::Session(_)
        ) || self.is_retryable()
    }

    /// Same request may succeed unchanged later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CredentialTimeout { .. } | Self::StorageFailure(StorageError::Timeout) => true,
            Self::Catalog(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Caller must reload state before retrying
    #[inline]
    #[must_use]
    pub fn requires_reload(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Validation report, if this is a validation failure
    #[must_use]
    pub fn validation_report(&self) -> Option<&ValidationReport> {
        match self {
            Self::ValidationFailed(report) => Some(report),
            _ => None,
        }
    }

    /// Shorthand for a single action-level validation failure
    #[must_use]
    pub fn invalid(field: Field, message: impl Into<String>) -> Self {
        Self::ValidationFailed(ValidationReport::single(field, message))
    }

    pub(crate) fn stale(entity: EntityRef, expected: impl ToString, actual: impl ToString) -> Self {
        Self::ConcurrentModification {
            entity,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
