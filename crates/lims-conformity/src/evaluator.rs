//! Conformity evaluator
//!
//! `evaluate` is a pure function of its inputs. It runs optimistically while
//! an operator types and again, authoritatively, when results are committed.

use crate::numeric::MeasuredValue;
use crate::types::Specification;
use serde::{Deserialize, Serialize};

/// Conformity verdict of one result against its specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Within every limit
    Pass,
    /// Out of specification
    Fail,
    /// No value or no applicable rule
    Indeterminate,
}

impl Verdict {
    /// `Some(true)` for pass, `Some(false)` for fail, `None` when unknown
    #[inline]
    #[must_use]
    pub fn is_conforming(self) -> Option<bool> {
        match self {
            Self::Pass => Some(true),
            Self::Fail => Some(false),
            Self::Indeterminate => None,
        }
    }

    /// Out of specification
    #[inline]
    #[must_use]
    pub fn is_fail(self) -> bool {
        self == Self::Fail
    }
}

/// Why a result failed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deviation {
    /// Under the lower limit
    BelowMin {
        /// Crossed limit
        limit: f64,
    },
    /// Over the upper limit
    AboveMax {
        /// Crossed limit
        limit: f64,
    },
    /// Text not among the accepted results
    TextMismatch,
}

/// Verdict plus the limit that was crossed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Pass, fail or indeterminate
    pub verdict: Verdict,
    /// Set only for a failing result
    pub deviation: Option<Deviation>,
}

impl Evaluation {
    const PASS: Self = Self {
        verdict: Verdict::Pass,
        deviation: None,
    };

    const INDETERMINATE: Self = Self {
        verdict: Verdict::Indeterminate,
        deviation: None,
    };

    fn fail(deviation: Deviation) -> Self {
        Self {
            verdict: Verdict::Fail,
            deviation: Some(deviation),
        }
    }
}

/// Evaluate a value against its specification
#[inline]
#[must_use]
pub fn evaluate(value: &MeasuredValue, spec: Option<&Specification>) -> Verdict {
    evaluate_detailed(value, spec).verdict
}

/// Evaluate and report which limit was crossed
///
/// Rules:
/// - no specification, missing value or non-finite number: indeterminate
/// - numeric below `min_value` or above `max_value`: fail
/// - text against a specification listing accepted text: pass on a
///   case-insensitive match, fail otherwise
/// - text without such a list: indeterminate
#[must_use]
pub fn evaluate_detailed(value: &MeasuredValue, spec: Option<&Specification>) -> Evaluation {
    let Some(spec) = spec else {
        return Evaluation::INDETERMINATE;
    };

    match value {
        MeasuredValue::Missing => Evaluation::INDETERMINATE,
        MeasuredValue::Numeric(v) if !v.is_finite() => Evaluation::INDETERMINATE,
        MeasuredValue::Numeric(v) => {
            if let Some(min) = spec.min_value {
                if *v < min {
                    return Evaluation::fail(Deviation::BelowMin { limit: min });
                }
            }
            if let Some(max) = spec.max_value {
                if *v > max {
                    return Evaluation::fail(Deviation::AboveMax { limit: max });
                }
            }
            Evaluation::PASS
        }
        MeasuredValue::Text(text) => {
            if spec.accepted_text.is_empty() {
                return Evaluation::INDETERMINATE;
            }
            let text = text.trim();
            if spec
                .accepted_text
                .iter()
                .any(|accepted| accepted.trim().eq_ignore_ascii_case(text))
            {
                Evaluation::PASS
            } else {
                Evaluation::fail(Deviation::TextMismatch)
            }
        }
    }
}
