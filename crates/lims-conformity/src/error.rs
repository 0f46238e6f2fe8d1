//! Error types for conformity evaluation and specification lookup

use crate::types::ParameterId;

/// Rejected operator input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// More than one decimal separator after normalization (`1.234,5`)
    #[error("value '{0}' has more than one decimal separator")]
    MultipleDecimalSeparators(String),
}

/// Specification catalog failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Catalog did not answer in time
    #[error("specification catalog timed out")]
    Timeout,

    /// Catalog is unreachable or returned garbage
    #[error("specification catalog unavailable: {0}")]
    Unavailable(String),

    /// Parameter referenced by a specification is unknown
    #[error("unknown parameter {0}")]
    UnknownParameter(ParameterId),
}

impl CatalogError {
    /// Check if the lookup may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
