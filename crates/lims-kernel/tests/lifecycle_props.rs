//! Property tests for the sample lifecycle
//!
//! The transition table, trigger planning and the post-commit advance must
//! agree with each other for every status.

use chrono::Utc;
use lims_conformity::{MeasuredValue, ParameterId, SampleTypeId, Specification};
use lims_kernel::lifecycle::{advance_after_results, allowed_transitions, plan, validate_path, validate_transition};
use lims_kernel::{
    ActorId, Analysis, AnalysisStatus, LimsError, OrganizationId, PlantId, Sample, SampleId,
    SampleStatus, Trigger,
};
use proptest::prelude::*;

const STATUSES: [SampleStatus; 9] = [
    SampleStatus::Draft,
    SampleStatus::Registered,
    SampleStatus::Collected,
    SampleStatus::InAnalysis,
    SampleStatus::UnderReview,
    SampleStatus::Approved,
    SampleStatus::Rejected,
    SampleStatus::Released,
    SampleStatus::Archived,
];

const TRIGGERS: [Trigger; 9] = [
    Trigger::RegistrationCompleted,
    Trigger::CollectionRecorded,
    Trigger::FirstAnalysisStarted,
    Trigger::SubmitForReview,
    Trigger::Approve,
    Trigger::Reject,
    Trigger::Release,
    Trigger::BlockLot,
    Trigger::Archive,
];

fn status() -> impl Strategy<Value = SampleStatus> {
    proptest::sample::select(STATUSES.to_vec())
}

fn trigger() -> impl Strategy<Value = Trigger> {
    proptest::sample::select(TRIGGERS.to_vec())
}

fn sample(status: SampleStatus) -> Sample {
    Sample {
        id: SampleId::new(),
        code: "PROP".into(),
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

/// Analyses with values where `filled[i]`, some invalidated
fn analyses(sample_id: SampleId, filled: &[(bool, bool)]) -> Vec<Analysis> {
    filled
        .iter()
        .map(|&(has_value, invalidated)| {
            let spec = Specification::global(ParameterId::new(), SampleTypeId::new());
            let mut a = Analysis::pending(sample_id, spec.parameter_id, Some(spec));
            if has_value {
                a.value = MeasuredValue::Numeric(1.0);
                a.status = AnalysisStatus::Completed;
            }
            if invalidated {
                a.status = AnalysisStatus::Invalidated;
            }
            a
        })
        .collect()
}

proptest! {
    #[test]
    fn test_validate_matches_table(from in status(), to in status()) {
        prop_assert_eq!(
            validate_transition(from, to).is_ok(),
            allowed_transitions(from).contains(&to)
        );
    }

    #[test]
    fn test_no_way_back(from in status(), to in status()) {
        if validate_transition(from, to).is_ok() {
            prop_assert!(to.progress() > from.progress());
        }
    }

    #[test]
    fn test_plan_only_from_sources(from in status(), trigger in trigger()) {
        let s = sample(from);
        match plan(&s, trigger, &[]) {
            Ok(planned) => {
                prop_assert!(trigger.sources().contains(&from));
                prop_assert_eq!(planned.from, from);
                prop_assert_eq!(planned.to, trigger.target());
            }
            Err(LimsError::ConcurrentModification { .. }) => {
                prop_assert!(!trigger.sources().contains(&from));
            }
            Err(LimsError::IllegalTransition(_)) => {
                prop_assert!(!trigger.sources().contains(&from));
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    #[test]
    fn test_every_source_is_in_table(trigger in trigger()) {
        for from in trigger.sources() {
            prop_assert!(validate_transition(*from, trigger.target()).is_ok());
        }
    }

    #[test]
    fn test_submit_needs_every_in_scope_value(
        filled in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..6)
    ) {
        let s = sample(SampleStatus::InAnalysis);
        let rows = analyses(s.id, &filled);
        let complete = filled.iter().all(|&(has_value, invalidated)| has_value || invalidated);

        let planned = plan(&s, Trigger::SubmitForReview, &rows);
        prop_assert_eq!(planned.is_ok(), complete);
        if let Err(err) = planned {
            let report = err.validation_report().unwrap();
            let missing = filled.iter().filter(|&&(v, i)| !v && !i).count();
            prop_assert_eq!(report.violations.len(), missing);
        }
    }

    #[test]
    fn test_advance_path_is_always_legal(
        from in status(),
        submit in any::<bool>(),
        filled in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..6)
    ) {
        let s = sample(from);
        let rows = analyses(s.id, &filled);
        let path = advance_after_results(from, &rows, submit);
        prop_assert_eq!(path[0], from);
        prop_assert!(validate_path(&path).is_ok());
        if !submit {
            prop_assert!(!path.contains(&SampleStatus::UnderReview) || from == SampleStatus::UnderReview);
        }
    }
}

#[test]
fn test_terminal_statuses() {
    assert!(allowed_transitions(SampleStatus::Archived).is_empty());
    assert_eq!(allowed_transitions(SampleStatus::Rejected), &[SampleStatus::Archived]);
    assert_eq!(allowed_transitions(SampleStatus::Released), &[SampleStatus::Archived]);
}
