//! Per-sample read model
//!
//! What a sample screen or a certificate generator needs, already filtered
//! by the viewer's role.

#![allow(missing_docs)]

use crate::audit::{AuditAction, AuditEvent, CredentialCheck};
use crate::error::Warning;
use crate::types::{
    ActorId, Analysis, AnalysisId, AnalysisStatus, DeviationType, EventId, Sample, SampleStatus, Timestamp,
};
use lims_conformity::{visible_parameters, MeasuredValue, Parameter, ParameterCategory, ParameterId, Role, Specification, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One analysis as shown to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisView {
    pub analysis_id: AnalysisId,
    pub parameter_code: String,
    pub parameter_name: String,
    pub category: ParameterCategory,
    pub value: MeasuredValue,
    pub unit: Option<String>,
    pub verdict: Verdict,
    /// Specification snapshot the verdict was computed against
    pub specification: Option<Specification>,
    /// e.g. `6 - 8 pH`
    pub limits: Option<String>,
    pub analyst_id: Option<ActorId>,
    pub analyzed_at: Option<Timestamp>,
    pub status: AnalysisStatus,
    pub notes: Option<String>,
    pub deviation: Option<DeviationType>,
    pub is_retest: bool,
}

/// A signed step in the sample's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub event_id: EventId,
    pub action: AuditAction,
    pub actor_id: ActorId,
    pub actor_role: Role,
    pub signed_at: Timestamp,
    pub reason: Option<String>,
    pub signature_hash: Option<String>,
}

/// Everything known about one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDossier {
    pub sample: Sample,
    pub analyses: Vec<AnalysisView>,
    pub signatures: Vec<SignatureEntry>,
    /// Analyses still waiting for a value
    pub pending_actions: usize,
    pub warnings: Vec<Warning>,
    pub certificate_eligible: bool,
}

impl SampleDossier {
    /// Assemble the dossier as seen by `role`
    ///
    /// Analyses whose parameter is unknown or hidden from `role` are left out.
    #[must_use]
    pub fn build(
        role: Role,
        sample: Sample,
        analyses: &[Analysis],
        parameters: &HashMap<ParameterId, Parameter>,
        trail: &[AuditEvent],
    ) -> Self {
        let visible: HashSet<ParameterId> = visible_parameters(role, parameters.values())
            .into_iter()
            .map(|p| p.id)
            .collect();

        let mut views = Vec::with_capacity(analyses.len());
        let mut pending_actions = 0;
        let mut warnings = Vec::new();
        for analysis in analyses.iter().filter(|a| visible.contains(&a.parameter_id)) {
            let Some(parameter) = parameters.get(&analysis.parameter_id) else {
                continue;
            };
            if analysis.requires_action() {
                pending_actions += 1;
            }
            if analysis.status != AnalysisStatus::Invalidated
                && analysis.specification.is_none()
                && analysis.has_value()
            {
                warnings.push(Warning::SpecificationNotFound {
                    analysis_id: analysis.id,
                    parameter_id: analysis.parameter_id,
                });
            }
            views.push(AnalysisView {
                analysis_id: analysis.id,
                parameter_code: parameter.code.clone(),
                parameter_name: parameter.name.clone(),
                category: parameter.category,
                value: analysis.value.clone(),
                unit: analysis.unit.clone(),
                verdict: analysis.verdict,
                specification: analysis.specification.clone(),
                limits: analysis.specification.as_ref().map(Specification::limits_label),
                analyst_id: analysis.analyst_id,
                analyzed_at: analysis.analyzed_at,
                status: analysis.status,
                notes: analysis.notes.clone(),
                deviation: analysis.deviation,
                is_retest: analysis.is_retest,
            });
        }

        let signatures = trail
            .iter()
            .filter(|e| e.credential == CredentialCheck::Verified)
            .map(|e| SignatureEntry {
                event_id: e.event_id,
                action: e.action,
                actor_id: e.actor_id,
                actor_role: e.actor_role,
                signed_at: e.timestamp,
                reason: e.reason.clone(),
                signature_hash: e.signature_hash.clone(),
            })
            .collect();

        let certificate_eligible = sample.status == SampleStatus::Released;
        Self {
            sample,
            analyses: views,
            signatures,
            pending_actions,
            warnings,
            certificate_eligible,
        }
    }

    /// Out-of-specification results among the visible analyses
    pub fn non_conforming(&self) -> impl Iterator<Item = &AnalysisView> {
        self.analyses
            .iter()
            .filter(|a| a.status != AnalysisStatus::Invalidated && a.verdict.is_fail())
    }
}
