//! Sample lifecycle state machine
//!
//! The transition table is the single source of truth for sample status
//! changes. Callers plan a transition against the persisted sample here and
//! apply it through a unit of work guarded by the prior status.

use crate::error::{Field, LimsError, TransitionError, ValidationReport};
use crate::types::{Analysis, AnalysisId, EntityRef, Sample, SampleId, SampleStatus};
use serde::{Deserialize, Serialize};

/// Validates a status transition against the table.
pub fn validate_transition(from: SampleStatus, to: SampleStatus) -> Result<(), TransitionError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError::Sample { from, to })
    }
}

/// Statuses reachable from `from` in one hop
pub fn allowed_transitions(from: SampleStatus) -> &'static [SampleStatus] {
    use SampleStatus::*;
    match from {
        Draft => &[Registered],
        Registered => &[Collected, InAnalysis],
        Collected => &[InAnalysis],
        InAnalysis => &[UnderReview],
        UnderReview => &[Approved, Rejected],
        Approved => &[Released, Rejected],
        Released => &[Archived],
        Rejected => &[Archived],
        Archived => &[],
    }
}

fn allowed(from: SampleStatus, to: SampleStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Validate a multi-hop path, e.g. `collected -> in_analysis -> under_review`
/// applied by a single commit.
pub fn validate_path(path: &[SampleStatus]) -> Result<(), TransitionError> {
    path.windows(2)
        .try_for_each(|hop| validate_transition(hop[0], hop[1]))
}

/// What causes a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Draft registration confirmed
    RegistrationCompleted,
    /// Physical sample collected
    CollectionRecorded,
    /// First analysis of the sample started or committed
    FirstAnalysisStarted,
    /// Results handed to technical review
    SubmitForReview,
    /// Technical review accepts the results
    Approve,
    /// Technical review rejects the sample
    Reject,
    /// Quality releases the lot
    Release,
    /// Quality blocks the lot
    BlockLot,
    /// Closed sample moved to the archive
    Archive,
}

impl Trigger {
    /// Status the trigger leads to
    #[must_use]
    pub const fn target(self) -> SampleStatus {
        match self {
            Self::RegistrationCompleted => SampleStatus::Registered,
            Self::CollectionRecorded => SampleStatus::Collected,
            Self::FirstAnalysisStarted => SampleStatus::InAnalysis,
            Self::SubmitForReview => SampleStatus::UnderReview,
            Self::Approve => SampleStatus::Approved,
            Self::Reject | Self::BlockLot => SampleStatus::Rejected,
            Self::Release => SampleStatus::Released,
            Self::Archive => SampleStatus::Archived,
        }
    }

    /// Statuses the trigger may fire from
    #[must_use]
    pub const fn sources(self) -> &'static [SampleStatus] {
        match self {
            Self::RegistrationCompleted => &[SampleStatus::Draft],
            Self::CollectionRecorded => &[SampleStatus::Registered],
            Self::FirstAnalysisStarted => &[SampleStatus::Registered, SampleStatus::Collected],
            Self::SubmitForReview => &[SampleStatus::InAnalysis],
            Self::Approve | Self::Reject => &[SampleStatus::UnderReview],
            Self::Release | Self::BlockLot => &[SampleStatus::Approved],
            Self::Archive => &[SampleStatus::Released, SampleStatus::Rejected],
        }
    }

    /// Needs a signature through the gate
    #[must_use]
    pub const fn requires_signature(self) -> bool {
        !matches!(
            self,
            Self::RegistrationCompleted | Self::CollectionRecorded | Self::FirstAnalysisStarted
        )
    }

    /// Needs a non-empty reason
    #[must_use]
    pub const fn requires_reason(self) -> bool {
        matches!(self, Self::Reject | Self::BlockLot | Self::Archive)
    }
}

/// Every in-scope analysis has a recorded value
///
/// Vacuously true for a sample with nothing in scope.
#[must_use]
pub fn can_validate(analyses: &[Analysis]) -> bool {
    analyses
        .iter()
        .filter(|a| a.is_in_scope())
        .all(Analysis::has_value)
}

/// In-scope analyses still missing a value
#[must_use]
pub fn missing_values(analyses: &[Analysis]) -> Vec<AnalysisId> {
    analyses
        .iter()
        .filter(|a| a.is_in_scope() && !a.has_value())
        .map(|a| a.id)
        .collect()
}

/// A checked transition, ready to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTransition {
    /// Sample being moved
    pub sample_id: SampleId,
    /// Status the sample must still have at commit
    pub from: SampleStatus,
    /// Status after the commit
    pub to: SampleStatus,
    /// Cause of the move
    pub trigger: Trigger,
}

/// Check `trigger` against the persisted sample and its analyses
///
/// A sample that has already moved past the trigger's source (someone else
/// approved it first) yields `ConcurrentModification`; any other mismatch is
/// an illegal transition.
///
/// # Errors
/// `ConcurrentModification`, `IllegalTransition`, or `ValidationFailed` naming
/// every analysis without a value when submitting for review.
pub fn plan(sample: &Sample, trigger: Trigger, analyses: &[Analysis]) -> Result<PlannedTransition, LimsError> {
    let from = sample.status;
    let to = trigger.target();
    let sources = trigger.sources();

    if !sources.contains(&from) {
        let furthest = sources.iter().map(|s| s.progress()).max().unwrap_or(0);
        if from.progress() > furthest {
            return Err(LimsError::stale(EntityRef::Sample(sample.id), sources[0], from));
        }
        return Err(TransitionError::Sample { from, to }.into());
    }
    validate_transition(from, to)?;

    if to == SampleStatus::UnderReview && !can_validate(analyses) {
        let mut report = ValidationReport::new();
        for id in missing_values(analyses) {
            report.push(Some(id), Field::Value, "result required before review");
        }
        return Err(LimsError::ValidationFailed(report));
    }

    Ok(PlannedTransition {
        sample_id: sample.id,
        from,
        to,
        trigger,
    })
}

/// Status a sample reaches after results are committed
///
/// Samples still waiting to start enter analysis; once every in-scope
/// analysis has a value and `submit` is set the sample moves on to review.
/// Returns the hops taken, first element being `from`.
#[must_use]
pub fn advance_after_results(from: SampleStatus, analyses: &[Analysis], submit: bool) -> Vec<SampleStatus> {
    let mut path = vec![from];
    if matches!(from, SampleStatus::Registered | SampleStatus::Collected) {
        path.push(SampleStatus::InAnalysis);
    }
    if submit && path.last() == Some(&SampleStatus::InAnalysis) && can_validate(analyses) {
        path.push(SampleStatus::UnderReview);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorId, OrganizationId, PlantId};
    use chrono::Utc;
    use lims_conformity::{MeasuredValue, ParameterId, SampleTypeId, Specification};

    fn sample(status: SampleStatus) -> Sample {
        Sample {
            id: SampleId::new(),
            code: "X".into(),
            organization_id: OrganizationId::new(),
            plant_id: PlantId::new(),
            sample_type_id: SampleTypeId::new(),
            product_id: None,
            production_batch_id: None,
            intermediate_product_id: None,
            sampling_point_id: None,
            collected_at: None,
            collected_by: None,
            status,
            created_at: Utc::now(),
            created_by: ActorId::new(),
        }
    }

    fn specified(sample_id: SampleId, value: MeasuredValue) -> Analysis {
        let spec = Specification::global(ParameterId::new(), SampleTypeId::new());
        let mut a = Analysis::pending(sample_id, spec.parameter_id, Some(spec));
        a.value = value;
        a
    }

    #[test]
    fn test_table() {
        assert!(validate_transition(SampleStatus::UnderReview, SampleStatus::Approved).is_ok());
        assert!(validate_transition(SampleStatus::Approved, SampleStatus::Rejected).is_ok());
        assert!(validate_transition(SampleStatus::Rejected, SampleStatus::InAnalysis).is_err());
        assert!(validate_transition(SampleStatus::InAnalysis, SampleStatus::Approved).is_err());
        assert!(allowed_transitions(SampleStatus::Archived).is_empty());
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path(&[
            SampleStatus::Collected,
            SampleStatus::InAnalysis,
            SampleStatus::UnderReview
        ])
        .is_ok());
        assert!(validate_path(&[SampleStatus::Collected, SampleStatus::UnderReview]).is_err());
    }

    #[test]
    fn test_submit_requires_every_value() {
        let s = sample(SampleStatus::InAnalysis);
        let analyses = vec![
            specified(s.id, MeasuredValue::Numeric(1.0)),
            specified(s.id, MeasuredValue::Numeric(2.0)),
            specified(s.id, MeasuredValue::Missing),
        ];
        let err = plan(&s, Trigger::SubmitForReview, &analyses).unwrap_err();
        let report = err.validation_report().unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.flags(Some(analyses[2].id), Field::Value));
    }

    #[test]
    fn test_stale_vs_illegal() {
        let approved = sample(SampleStatus::Approved);
        assert!(plan(&approved, Trigger::Approve, &[]).unwrap_err().requires_reload());

        let in_analysis = sample(SampleStatus::InAnalysis);
        assert!(matches!(
            plan(&in_analysis, Trigger::Approve, &[]),
            Err(LimsError::IllegalTransition(_))
        ));

        let rejected = sample(SampleStatus::Rejected);
        assert!(plan(&rejected, Trigger::SubmitForReview, &[]).unwrap_err().requires_reload());
    }

    #[test]
    fn test_advance_after_results() {
        let s = sample(SampleStatus::Collected);
        let done = vec![specified(s.id, MeasuredValue::Numeric(1.0))];
        let open = vec![specified(s.id, MeasuredValue::Missing)];

        assert_eq!(
            advance_after_results(SampleStatus::Collected, &done, true),
            vec![SampleStatus::Collected, SampleStatus::InAnalysis, SampleStatus::UnderReview]
        );
        assert_eq!(
            advance_after_results(SampleStatus::Collected, &open, true),
            vec![SampleStatus::Collected, SampleStatus::InAnalysis]
        );
        assert_eq!(
            advance_after_results(SampleStatus::InAnalysis, &done, false),
            vec![SampleStatus::InAnalysis]
        );
    }

    #[test]
    fn test_signature_requirements() {
        assert!(!Trigger::FirstAnalysisStarted.requires_signature());
        assert!(Trigger::SubmitForReview.requires_signature());
        assert!(Trigger::Reject.requires_reason());
        assert!(!Trigger::Approve.requires_reason());
    }
}
