//! Parameter and specification types
//!
//! Shared by the resolver, the evaluator and the visibility policy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytical parameter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParameterId(pub Uuid);

impl ParameterId {
    /// Generate new parameter ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParameterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParameterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub Uuid);

impl ProductId {
    /// Generate new product ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sample type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleTypeId(pub Uuid);

impl SampleTypeId {
    /// Generate new sample type ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SampleTypeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SampleTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Specification row identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecificationId(pub Uuid);

impl SpecificationId {
    /// Generate new specification ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SpecificationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Laboratory discipline a parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterCategory {
    /// pH, brix, moisture and the like
    PhysicoChemical,
    /// Plate counts, pathogens
    Microbiological,
    /// Taste, odour, appearance
    Sensory,
}

/// Which disciplines a sample type is tested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    /// Physico-chemical and sensory parameters
    #[default]
    PhysicoChemical,
    /// Microbiological parameters only
    Microbiological,
    /// Every discipline
    Both,
}

impl TestCategory {
    /// Whether parameters of `category` are queued for this test category
    #[inline]
    #[must_use]
    pub fn includes(self, category: ParameterCategory) -> bool {
        match self {
            Self::PhysicoChemical => matches!(
                category,
                ParameterCategory::PhysicoChemical | ParameterCategory::Sensory
            ),
            Self::Microbiological => category == ParameterCategory::Microbiological,
            Self::Both => true,
        }
    }
}

/// Master-data view of an analytical parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter id
    pub id: ParameterId,
    /// Short code, e.g. `PH`
    pub code: String,
    /// Display name
    pub name: String,
    /// Default unit
    pub unit: Option<String>,
    /// Discipline; decides who may see the result
    pub category: ParameterCategory,
}

impl Parameter {
    /// Create a parameter with a fresh ID
    #[must_use]
    pub fn new(code: impl Into<String>, name: impl Into<String>, category: ParameterCategory) -> Self {
        Self {
            id: ParameterId::new(),
            code: code.into(),
            name: name.into(),
            unit: None,
            category,
        }
    }

    /// With unit
    #[inline]
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Where a specification applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecScope {
    /// Product specific; `sample_type_id = None` means any sample type
    Product {
        /// Product the limits belong to
        product_id: ProductId,
        /// Narrowing to one sample type
        sample_type_id: Option<SampleTypeId>,
    },
    /// Applies to every product for one sample type
    Global {
        /// Sample type the limits belong to
        sample_type_id: SampleTypeId,
    },
}

/// HACCP classification carried by a specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HaccpFlags {
    /// Parameter monitors a critical control point (PCC)
    pub critical_control_point: bool,
    /// Parameter belongs to an operational prerequisite programme
    pub prerequisite: bool,
}

/// A parameter specification row
///
/// Immutable once used in an evaluation. A newer version supersedes an older
/// one by deactivating it, the older row is kept so historical analyses can
/// be re-evaluated against the limits that applied at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    /// Row id
    pub id: SpecificationId,
    /// Parameter constrained
    pub parameter_id: ParameterId,
    /// Product or global scope
    pub scope: SpecScope,
    /// Inclusive lower limit
    pub min_value: Option<f64>,
    /// Inclusive upper limit
    pub max_value: Option<f64>,
    /// Nominal value, informative only
    pub target_value: Option<f64>,
    /// Unit the limits are expressed in
    pub unit: Option<String>,
    /// Accepted textual results, compared case-insensitively
    #[serde(default)]
    pub accepted_text: Vec<String>,
    /// HACCP classification
    #[serde(default)]
    pub haccp: HaccpFlags,
    /// Version number, increasing per parameter and scope
    pub version: u32,
    /// Only active rows are resolved
    pub active: bool,
}

impl Specification {
    /// Global specification for a sample type
    #[must_use]
    pub fn global(parameter_id: ParameterId, sample_type_id: SampleTypeId) -> Self {
        Self::with_scope(parameter_id, SpecScope::Global { sample_type_id })
    }

    /// Product specification, optionally narrowed to one sample type
    #[must_use]
    pub fn for_product(
        parameter_id: ParameterId,
        product_id: ProductId,
        sample_type_id: Option<SampleTypeId>,
    ) -> Self {
        Self::with_scope(
            parameter_id,
            SpecScope::Product {
                product_id,
                sample_type_id,
            },
        )
    }

    fn with_scope(parameter_id: ParameterId, scope: SpecScope) -> Self {
        Self {
            id: SpecificationId::new(),
            parameter_id,
            scope,
            min_value: None,
            max_value: None,
            target_value: None,
            unit: None,
            accepted_text: Vec::new(),
            haccp: HaccpFlags::default(),
            version: 1,
            active: true,
        }
    }

    /// With lower and upper limits
    #[inline]
    #[must_use]
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    /// With target value
    #[inline]
    #[must_use]
    pub fn with_target(mut self, target: f64) -> Self {
        self.target_value = Some(target);
        self
    }

    /// With unit
    #[inline]
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// With accepted textual results
    #[must_use]
    pub fn with_accepted_text<I, S>(mut self, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_text = accepted.into_iter().map(Into::into).collect();
        self
    }

    /// With HACCP flags
    #[inline]
    #[must_use]
    pub fn with_haccp(mut self, haccp: HaccpFlags) -> Self {
        self.haccp = haccp;
        self
    }

    /// With version number
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Human readable limits, e.g. `6 - 8 pH`
    #[must_use]
    pub fn limits_label(&self) -> String {
        let unit = self.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default();
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => format!("{min} - {max}{unit}"),
            (Some(min), None) => format!(">= {min}{unit}"),
            (None, Some(max)) => format!("<= {max}{unit}"),
            (None, None) if !self.accepted_text.is_empty() => self.accepted_text.join(" / "),
            (None, None) => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_category_includes() {
        assert!(TestCategory::PhysicoChemical.includes(ParameterCategory::Sensory));
        assert!(!TestCategory::PhysicoChemical.includes(ParameterCategory::Microbiological));
        assert!(TestCategory::Microbiological.includes(ParameterCategory::Microbiological));
        assert!(!TestCategory::Microbiological.includes(ParameterCategory::Sensory));
        assert!(TestCategory::Both.includes(ParameterCategory::Microbiological));
    }

    #[test]
    fn test_limits_label() {
        let spec = Specification::global(ParameterId::new(), SampleTypeId::new())
            .with_range(Some(6.0), Some(8.0))
            .with_unit("pH");
        assert_eq!(spec.limits_label(), "6 - 8 pH");

        let text = Specification::global(ParameterId::new(), SampleTypeId::new())
            .with_accepted_text(["Absent"]);
        assert_eq!(text.limits_label(), "Absent");
    }
}
