//! Measured value parsing
//!
//! Operator input is text. It is normalized once at the boundary, decimal
//! comma becoming decimal point, and then either parses to a finite number or
//! stays textual. The evaluator only ever sees the parsed form.

use crate::error::InputError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?(\d+(\.\d+)?|\.\d+)$").expect("numeric pattern compiles"));

/// A measured value as handed to the evaluator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MeasuredValue {
    /// Nothing recorded
    #[default]
    Missing,
    /// Finite number after normalization
    Numeric(f64),
    /// Anything that is not a plain decimal number
    Text(String),
}

impl MeasuredValue {
    /// Parse raw operator text
    ///
    /// Blank input is `Missing`. `"7,5"` and `"7.5"` both give `Numeric(7.5)`.
    /// Exponents, `inf`, thousands separators and multiple decimal
    /// separators are not numbers and are kept verbatim as `Text`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Missing;
        }

        let normalized = normalize_decimal(trimmed);
        if NUMERIC.is_match(&normalized) {
            if let Ok(value) = normalized.parse::<f64>() {
                if value.is_finite() {
                    return Self::Numeric(value);
                }
            }
        }
        Self::Text(trimmed.to_string())
    }

    /// Whether a value was recorded at all
    #[inline]
    #[must_use]
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    /// Numeric reading, if any
    #[inline]
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual reading, if any
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl std::fmt::Display for MeasuredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => Ok(()),
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Text(t) => f.write_str(t),
        }
    }
}

/// Sanitize operator input for a result field
///
/// Numeric-looking input (digits, separators, sign) is normalized to a
/// decimal point and refused if it then carries more than one separator.
/// Other input is only trimmed so textual results survive.
///
/// # Errors
/// [`InputError::MultipleDecimalSeparators`] for input like `1.234,5`.
pub fn sanitize_input(raw: &str) -> Result<String, InputError> {
    let trimmed = raw.trim();
    let normalized = normalize_decimal(trimmed);
    let numeric_like = !normalized.is_empty()
        && normalized
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-');

    if !numeric_like {
        return Ok(trimmed.to_string());
    }
    if normalized.matches('.').count() > 1 {
        return Err(InputError::MultipleDecimalSeparators(trimmed.to_string()));
    }
    Ok(normalized)
}

fn normalize_decimal(input: &str) -> String {
    input.replace(',', ".")
}
