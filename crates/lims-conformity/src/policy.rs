//! Role policy
//!
//! Which parameters a role may see and which actions it may perform. Every
//! place that lists parameters for an actor goes through
//! [`visible_parameters`].

use crate::types::{Parameter, ParameterCategory};
use serde::{Deserialize, Serialize};

/// Laboratory roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Physico-chemical bench analyst
    LabAnalyst,
    /// Microbiology bench analyst
    MicroAnalyst,
    /// Technical reviewer
    QcSupervisor,
    /// Quality approver, releases or blocks lots
    QualityManager,
    /// Full access
    Admin,
}

/// Privileged actions checked against a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Create samples and record collection
    RegisterSample,
    /// Start analyses and sign results
    ExecuteAnalysis,
    /// Approve or reject under review
    TechnicalReview,
    /// Release, block and archive
    QualityRelease,
}

impl Role {
    /// Whether results of `category` are visible to this role
    #[inline]
    #[must_use]
    pub fn sees(self, category: ParameterCategory) -> bool {
        match self {
            Self::LabAnalyst => category != ParameterCategory::Microbiological,
            Self::MicroAnalyst => category == ParameterCategory::Microbiological,
            Self::QcSupervisor | Self::QualityManager | Self::Admin => true,
        }
    }

    /// Whether this role may perform `permission`
    #[must_use]
    pub fn may(self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Self::LabAnalyst | Self::MicroAnalyst => {
                matches!(permission, RegisterSample | ExecuteAnalysis)
            }
            Self::QcSupervisor => matches!(permission, RegisterSample | ExecuteAnalysis | TechnicalReview),
            Self::QualityManager => matches!(permission, RegisterSample | TechnicalReview | QualityRelease),
            Self::Admin => true,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LabAnalyst => "lab_analyst",
            Self::MicroAnalyst => "micro_analyst",
            Self::QcSupervisor => "qc_supervisor",
            Self::QualityManager => "quality_manager",
            Self::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Subset of `parameters` visible to `role`, order preserved
pub fn visible_parameters<'a, I>(role: Role, parameters: I) -> Vec<&'a Parameter>
where
    I: IntoIterator<Item = &'a Parameter>,
{
    parameters
        .into_iter()
        .filter(|p| role.sees(p.category))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<Parameter> {
        vec![
            Parameter::new("PH", "pH", ParameterCategory::PhysicoChemical),
            Parameter::new("ECOLI", "E. coli", ParameterCategory::Microbiological),
            Parameter::new("TASTE", "Taste", ParameterCategory::Sensory),
        ]
    }

    #[test]
    fn test_lab_analyst_excludes_micro() {
        let all = params();
        let codes: Vec<_> = visible_parameters(Role::LabAnalyst, &all)
            .into_iter()
            .map(|p| p.code.as_str())
            .collect();
        assert_eq!(codes, vec!["PH", "TASTE"]);
    }

    #[test]
    fn test_micro_analyst_only_micro() {
        let all = params();
        let visible = visible_parameters(Role::MicroAnalyst, &all);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].code, "ECOLI");
    }

    #[test]
    fn test_reviewers_see_everything() {
        let all = params();
        assert_eq!(visible_parameters(Role::QcSupervisor, &all).len(), 3);
        assert_eq!(visible_parameters(Role::Admin, &all).len(), 3);
    }

    #[test]
    fn test_permissions() {
        assert!(Role::LabAnalyst.may(Permission::ExecuteAnalysis));
        assert!(!Role::LabAnalyst.may(Permission::TechnicalReview));
        assert!(Role::QcSupervisor.may(Permission::TechnicalReview));
        assert!(!Role::QcSupervisor.may(Permission::QualityRelease));
        assert!(Role::QualityManager.may(Permission::QualityRelease));
        assert!(!Role::QualityManager.may(Permission::ExecuteAnalysis));
        assert!(Role::Admin.may(Permission::QualityRelease));
    }
}
