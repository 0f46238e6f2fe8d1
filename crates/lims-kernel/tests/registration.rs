//! Registration and analysis record tests

use chrono::{Duration, TimeZone, Utc};
use lims_conformity::{Specification, SpecificationResolver};
use lims_kernel::signature::BatchEntry;
use lims_kernel::store::{CommitReceipt, UnitOfWork};
use lims_kernel::{
    Analysis, AnalysisId, AnalysisRecordManager, AnalysisStatus, AuditAction, AuditEvent, BatchId,
    EngineConfig, EntityRef, Field, LabStore, LimsError, MemoryStore, RegisterSample, Sample,
    SampleId, SampleStatus, SignedAction, StartOutcome, TransitionError,
};
use lims_test_utils::{Fixture, PASSWORD};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;

/// Store that keeps serving samples as they were when pinned
struct PinnedSamples {
    inner: Arc<MemoryStore>,
    pinned: HashMap<SampleId, Sample>,
}

impl LabStore for PinnedSamples {
    fn sample(&self, id: SampleId) -> Result<Sample, LimsError> {
        match self.pinned.get(&id) {
            Some(sample) => Ok(sample.clone()),
            None => self.inner.sample(id),
        }
    }

    fn sample_by_code(&self, code: &str) -> Result<Option<Sample>, LimsError> {
        self.inner.sample_by_code(code)
    }

    fn samples_for_batch(&self, batch_id: BatchId) -> Result<Vec<Sample>, LimsError> {
        self.inner.samples_for_batch(batch_id)
    }

    fn analyses_for_sample(&self, sample_id: SampleId) -> Result<Vec<Analysis>, LimsError> {
        self.inner.analyses_for_sample(sample_id)
    }

    fn analysis(&self, id: AnalysisId) -> Result<Analysis, LimsError> {
        self.inner.analysis(id)
    }

    fn audit_trail(&self, sample_id: SampleId) -> Result<Vec<AuditEvent>, LimsError> {
        self.inner.audit_trail(sample_id)
    }

    fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, LimsError> {
        self.inner.commit(work)
    }

    fn verify_audit_chain(&self) -> Result<usize, LimsError> {
        self.inner.verify_audit_chain()
    }
}

#[test]
fn test_codes_are_unique_per_minute() {
    let fx = Fixture::new();
    let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 0).unwrap();
    let request = || {
        RegisterSample::new(fx.finished)
            .with_batch(fx.batch)
            .collected(at, fx.analyst.id)
    };

    let codes: Vec<String> = (0..3)
        .map(|_| fx.kernel.register_sample(&fx.analyst, request()).unwrap().sample.code)
        .collect();
    assert_eq!(
        codes,
        vec![
            "OJ1L-FP-20260314-0905".to_string(),
            "OJ1L-FP-20260314-0905-1".to_string(),
            "OJ1L-FP-20260314-0905-2".to_string(),
        ]
    );
}

#[test]
fn test_registered_sample_carries_product_and_queue() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();

    assert_eq!(reg.sample.status, SampleStatus::Collected);
    assert_eq!(reg.sample.product_id, Some(fx.product));
    assert_eq!(reg.sample.organization_id, fx.org);
    assert_eq!(reg.sample.collected_by, Some(fx.analyst.id));

    let queued: Vec<_> = reg.analyses.iter().map(|a| a.parameter_id).collect();
    assert_eq!(queued, vec![fx.brix, fx.ecoli, fx.ph]);
    assert!(reg
        .analyses
        .iter()
        .all(|a| a.status == AnalysisStatus::Pending && a.specification.is_some()));

    let trail = fx.store.audit_trail(reg.sample.id).unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::SampleRegistered);
}

#[test]
fn test_finished_product_needs_a_link() {
    let fx = Fixture::new();
    let err = fx
        .kernel
        .register_sample(&fx.analyst, RegisterSample::new(fx.finished))
        .unwrap_err();
    assert!(err.validation_report().unwrap().flags(None, Field::SampleLink));
}

#[test]
fn test_queue_follows_test_category() {
    let fx = Fixture::new();
    fx.catalog.insert_specification(
        Specification::global(fx.brix, fx.raw_material).with_range(Some(9.0), None),
    );
    fx.catalog
        .insert_specification(Specification::global(fx.ecoli, fx.raw_material).with_accepted_text(["Absent"]));

    let reg = fx
        .kernel
        .register_sample(&fx.analyst, RegisterSample::new(fx.raw_material))
        .unwrap();
    assert_eq!(reg.sample.status, SampleStatus::Registered);
    assert!(reg.sample.code.starts_with("NOSKU-MP-"));
    assert_eq!(reg.analyses.len(), 1);
    assert_eq!(reg.analyses[0].parameter_id, fx.brix);
}

#[test]
fn test_mark_collected_once() {
    let fx = Fixture::new();
    let reg = fx
        .kernel
        .register_sample(&fx.analyst, RegisterSample::new(fx.finished).with_batch(fx.batch))
        .unwrap();
    assert_eq!(reg.sample.status, SampleStatus::Registered);

    let at = Utc::now();
    let collected = fx
        .kernel
        .mark_collected(&fx.analyst, reg.sample.id, at, Some(fx.micro_analyst.id))
        .unwrap();
    assert_eq!(collected.status, SampleStatus::Collected);

    let stored = fx.store.sample(reg.sample.id).unwrap();
    assert_eq!(stored.status, SampleStatus::Collected);
    assert_eq!(stored.collected_at, Some(at));
    assert_eq!(stored.collected_by, Some(fx.micro_analyst.id));

    let again = fx
        .kernel
        .mark_collected(&fx.analyst, reg.sample.id, at, None)
        .unwrap_err();
    assert!(again.requires_reload());
}

#[test]
fn test_start_is_idempotent() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);

    assert_eq!(fx.kernel.start_analysis(&fx.analyst, ph).unwrap(), StartOutcome::Started);
    assert_eq!(
        fx.kernel.start_analysis(&fx.analyst, ph).unwrap(),
        StartOutcome::AlreadyStarted
    );

    let analysis = fx.store.analysis(ph).unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Started);
    assert_eq!(analysis.analyst_id, Some(fx.analyst.id));
    assert_eq!(fx.store.sample(reg.sample.id).unwrap().status, SampleStatus::InAnalysis);

    let starts = fx
        .store
        .audit_trail(reg.sample.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::AnalysisStarted)
        .count();
    assert_eq!(starts, 1);

    // a second analysis does not move the sample again
    let brix = fx.analysis_for(&reg, fx.brix);
    assert_eq!(fx.kernel.start_analysis(&fx.analyst, brix).unwrap(), StartOutcome::Started);
    assert_eq!(fx.store.sample(reg.sample.id).unwrap().status, SampleStatus::InAnalysis);
}

#[test]
fn test_draft_needs_active_instrument() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);

    let retired = fx
        .kernel
        .record_result(
            &fx.analyst,
            ph,
            fx.fields(fx.ph, "7.0").with_equipment(fx.retired_meter),
        )
        .unwrap_err();
    assert!(retired.validation_report().unwrap().flags(Some(ph), Field::Equipment));

    let nothing = fx
        .kernel
        .record_result(&fx.analyst, ph, lims_kernel::ResultFields::default())
        .unwrap_err();
    let report = nothing.validation_report().unwrap();
    assert!(report.flags(Some(ph), Field::Value));
    assert!(report.flags(Some(ph), Field::Equipment));
    assert!(fx.store.analysis(ph).unwrap().draft.is_none());
}

#[tokio::test]
async fn test_retest_replaces_result() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);

    fx.kernel
        .commit_result(
            &fx.analyst,
            PASSWORD,
            ph,
            fx.fields(fx.ph, "9.4").with_notes("Reading drifted"),
        )
        .await
        .unwrap();

    let short = fx.kernel.request_retest(&fx.analyst, ph, "bad").unwrap_err();
    assert!(short.validation_report().unwrap().flags(Some(ph), Field::Reason));

    let retest = fx
        .kernel
        .request_retest(&fx.analyst, ph, "Electrode not calibrated")
        .unwrap();
    assert!(retest.is_retest);
    assert_eq!(retest.supersedes, Some(ph));
    assert_eq!(retest.status, AnalysisStatus::Pending);
    assert_eq!(retest.parameter_id, fx.ph);

    let old = fx.store.analysis(ph).unwrap();
    assert_eq!(old.status, AnalysisStatus::Invalidated);
    assert_eq!(
        old.notes.as_deref(),
        Some("INVALIDATED: Electrode not calibrated | Reading drifted")
    );

    let again = fx
        .kernel
        .request_retest(&fx.analyst, ph, "Electrode not calibrated")
        .unwrap_err();
    assert!(matches!(again, LimsError::IllegalTransition(TransitionError::Analysis { .. })));
    assert!(matches!(
        fx.kernel.start_analysis(&fx.analyst, ph),
        Err(LimsError::IllegalTransition(_))
    ));

    let trail = fx.store.audit_trail(reg.sample.id).unwrap();
    let event = trail.last().unwrap();
    assert_eq!(event.action, AuditAction::RetestRequested);
    assert_eq!(event.reason.as_deref(), Some("Electrode not calibrated"));

    // the retest shows up as a fresh step of the next session
    let session = fx.kernel.open_session(&fx.analyst, reg.sample.id).unwrap();
    assert!(session.analyses().iter().any(|a| a.analysis_id == retest.id));
    assert!(session.analyses().iter().all(|a| a.analysis_id != ph));
}

#[tokio::test]
async fn test_retest_loses_race_with_submit() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);
    fx.kernel
        .commit_result(&fx.analyst, PASSWORD, ph, fx.fields(fx.ph, "7.0"))
        .await
        .unwrap();
    let read_before_submit = fx.store.sample(reg.sample.id).unwrap();
    assert_eq!(read_before_submit.status, SampleStatus::InAnalysis);

    // the remaining results move the sample to review
    let entries = [fx.brix, fx.ecoli]
        .into_iter()
        .map(|parameter| BatchEntry {
            analysis_id: fx.analysis_for(&reg, parameter),
            fields: fx.fields(parameter, if parameter == fx.brix { "11.0" } else { "Absent" }),
        })
        .collect();
    fx.kernel
        .sign(
            &fx.supervisor,
            PASSWORD,
            SignedAction::CommitBatch {
                sample_id: reg.sample.id,
                entries,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.store.sample(reg.sample.id).unwrap().status, SampleStatus::UnderReview);

    let stale = PinnedSamples {
        inner: fx.store.clone(),
        pinned: HashMap::from([(reg.sample.id, read_before_submit)]),
    };
    let records = AnalysisRecordManager::new(
        Arc::new(stale),
        fx.master.clone(),
        SpecificationResolver::new(fx.catalog.clone()),
        EngineConfig::default(),
    );
    let err = records
        .request_retest(&fx.analyst, ph, "Electrode not calibrated")
        .unwrap_err();
    assert!(matches!(
        err,
        LimsError::ConcurrentModification {
            entity: EntityRef::Sample(id),
            ..
        } if id == reg.sample.id
    ));

    let analyses = fx.store.analyses_for_sample(reg.sample.id).unwrap();
    assert_eq!(analyses.len(), 3);
    assert!(analyses.iter().all(|a| a.status == AnalysisStatus::Completed));
    fx.kernel.approve(&fx.supervisor, PASSWORD, reg.sample.id, None).await.unwrap();
}

#[tokio::test]
async fn test_expired_calibration_blocks_results() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);
    let yesterday = (Utc::now() - Duration::days(1)).date_naive();
    fx.master.set_calibration_due(fx.ph_meter, Some(yesterday));

    let draft = fx
        .kernel
        .record_result(&fx.analyst, ph, fx.fields(fx.ph, "7.0"))
        .unwrap_err();
    assert!(draft.validation_report().unwrap().flags(Some(ph), Field::Equipment));

    let err = fx
        .kernel
        .commit_result(&fx.analyst, PASSWORD, ph, fx.fields(fx.ph, "7.0"))
        .await
        .unwrap_err();
    let report = err.validation_report().unwrap();
    let violation = report.for_analysis(ph).find(|v| v.field == Field::Equipment).unwrap();
    assert!(violation.message.contains("calibration expired"));
    assert_eq!(fx.store.analysis(ph).unwrap().status, AnalysisStatus::Pending);

    fx.master
        .set_calibration_due(fx.ph_meter, Some(yesterday + Duration::days(30)));
    fx.kernel
        .commit_result(&fx.analyst, PASSWORD, ph, fx.fields(fx.ph, "7.0"))
        .await
        .unwrap();
}

#[test]
fn test_start_checks_scope_before_idempotence() {
    let fx = Fixture::new();
    let reg = fx.register_fp_sample();
    let ph = fx.analysis_for(&reg, fx.ph);
    fx.kernel.start_analysis(&fx.analyst, ph).unwrap();

    assert!(matches!(
        fx.kernel.start_analysis(&fx.outsider, ph),
        Err(LimsError::Forbidden { .. })
    ));
    let ecoli = fx.analysis_for(&reg, fx.ecoli);
    fx.kernel.start_analysis(&fx.micro_analyst, ecoli).unwrap();
    assert!(matches!(
        fx.kernel.start_analysis(&fx.analyst, ecoli),
        Err(LimsError::Forbidden { .. })
    ));
}
