//! Audit trail, dossier and lot compliance tests

use lims_conformity::{ParameterCategory, Verdict};
use lims_kernel::{
    AnalysisStatus, AuditAction, Blocker, LabStore, LimsError, RegisterSample, SampleStatus,
    Warning,
};
use lims_test_utils::{Fixture, PASSWORD};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_full_lifecycle_is_chained_and_signed() {
    let fx = Fixture::new();
    let reg = fx.sample_under_review().await;
    let id = reg.sample.id;

    fx.kernel.approve(&fx.supervisor, PASSWORD, id, None).await.unwrap();
    fx.kernel
        .release(&fx.manager, PASSWORD, id, Some("Lot conforms"))
        .await
        .unwrap();

    let dossier = fx.kernel.dossier(&fx.manager, id).unwrap();
    assert!(dossier.certificate_eligible);
    assert_eq!(dossier.pending_actions, 0);
    assert!(dossier.warnings.is_empty());
    assert_eq!(dossier.non_conforming().count(), 0);
    assert!(dossier
        .analyses
        .iter()
        .all(|a| a.status == AnalysisStatus::Validated && a.verdict == Verdict::Pass));

    let signed: Vec<AuditAction> = dossier.signatures.iter().map(|s| s.action).collect();
    assert_eq!(
        signed,
        vec![
            AuditAction::BatchSignatureCompleted,
            AuditAction::ReviewApproved,
            AuditAction::LotReleased,
        ]
    );
    assert!(dossier.signatures.iter().all(|s| s.signature_hash.is_some()));
    assert_eq!(dossier.signatures[2].reason.as_deref(), Some("Lot conforms"));
    assert_eq!(dossier.signatures[2].actor_id, fx.manager.id);

    fx.kernel
        .archive(&fx.manager, PASSWORD, id, "Shelf life elapsed")
        .await
        .unwrap();
    let archived = fx.kernel.dossier(&fx.manager, id).unwrap();
    assert!(!archived.certificate_eligible);
    assert_eq!(archived.sample.status, SampleStatus::Archived);

    let verified = fx.kernel.verify_audit_chain().unwrap();
    assert_eq!(verified, fx.store.audit_log().len());
    let trail = fx.store.audit_trail(id).unwrap();
    assert_eq!(trail.first().unwrap().action, AuditAction::SampleRegistered);
    assert_eq!(trail.last().unwrap().action, AuditAction::SampleArchived);

    // nothing moves an archived sample
    let err = fx
        .kernel
        .release(&fx.manager, PASSWORD, id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LimsError::ConcurrentModification { .. } | LimsError::IllegalTransition(_)
    ));
}

#[tokio::test]
async fn test_dossier_respects_role_visibility() {
    let fx = Fixture::new();
    let reg = fx.sample_under_review().await;

    let bench = fx.kernel.dossier(&fx.analyst, reg.sample.id).unwrap();
    assert!(bench
        .analyses
        .iter()
        .all(|a| a.category != ParameterCategory::Microbiological));
    assert_eq!(bench.analyses.len(), 2);

    let micro = fx.kernel.dossier(&fx.micro_analyst, reg.sample.id).unwrap();
    assert_eq!(micro.analyses.len(), 1);
    assert_eq!(micro.analyses[0].parameter_code, "ECOLI");

    let ph = bench
        .analyses
        .iter()
        .find(|a| a.parameter_code == "PH")
        .unwrap();
    assert_eq!(ph.limits.as_deref(), Some("6 - 8 pH"));
    assert_eq!(ph.unit.as_deref(), Some("pH"));
}

#[tokio::test]
async fn test_captured_specification_outlives_withdrawal() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let brix = fx.analysis_for(&reg, fx.brix);

    let spec = fx.kernel.effective_specification(reg.sample.id, fx.brix).unwrap();
    assert_eq!(spec.min_value, Some(10.0));
    fx.catalog.deactivate(spec.id).unwrap();
    assert!(matches!(
        fx.kernel.effective_specification(reg.sample.id, fx.brix),
        Err(LimsError::SpecificationNotFound { .. })
    ));

    // the queued analysis still carries the specification it was registered with
    let receipt = fx
        .kernel
        .commit_result(&fx.analyst, PASSWORD, brix, fx.fields(fx.brix, "11.5"))
        .await
        .unwrap();
    assert!(receipt.warnings.is_empty());
    assert_eq!(fx.store.analysis(brix).unwrap().verdict, Verdict::Pass);
}

#[tokio::test]
async fn test_conformity_flag_is_recomputed() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);

    let receipt = fx
        .kernel
        .commit_result(
            &fx.analyst,
            PASSWORD,
            ph,
            fx.fields(fx.ph, "7.9").with_claimed_conforming(false),
        )
        .await
        .unwrap();
    assert_eq!(receipt.warnings, vec![Warning::ConformityOverridden { analysis_id: ph }]);
    assert_eq!(fx.store.analysis(ph).unwrap().verdict, Verdict::Pass);
}

#[tokio::test]
async fn test_lot_compliance() {
    let fx = Fixture::new();

    let empty = fx.kernel.lot_compliance(&fx.manager, fx.batch).unwrap();
    assert_eq!(empty.blockers, vec![Blocker::NoSamples]);

    let released = fx.sample_under_review().await;
    fx.kernel
        .approve(&fx.supervisor, PASSWORD, released.sample.id, None)
        .await
        .unwrap();
    fx.kernel
        .release(&fx.manager, PASSWORD, released.sample.id, None)
        .await
        .unwrap();
    assert!(fx.kernel.lot_compliance(&fx.manager, fx.batch).unwrap().is_releasable());

    let open = fx
        .kernel
        .register_sample(
            &fx.analyst,
            RegisterSample::new(fx.finished).with_batch(fx.batch),
        )
        .unwrap();
    let lot = fx.kernel.lot_compliance(&fx.manager, fx.batch).unwrap();
    assert_eq!(lot.samples.len(), 2);
    assert_eq!(
        lot.blockers,
        vec![Blocker::SampleNotReleased {
            sample_id: open.sample.id,
            code: open.sample.code.clone(),
            status: SampleStatus::Registered,
        }]
    );

    // another organization sees none of it
    let foreign = fx.kernel.lot_compliance(&fx.outsider, fx.batch).unwrap();
    assert_eq!(foreign.blockers, vec![Blocker::NoSamples]);
}

#[tokio::test]
async fn test_tampered_log_fails_verification() {
    let fx = Fixture::new();
    fx.sample_under_review().await;
    assert_eq!(fx.kernel.verify_audit_chain().unwrap(), 2);

    let mut events = fx.store.audit_log();
    events[0].reason = Some("rewritten".into());
    assert!(lims_kernel::audit::verify_chain(&events).is_err());
}
