//! Analysis record manager
//!
//! Owns the per-parameter result: starting work, capturing drafts, the
//! authoritative commit of a signed result and retest requests.

use crate::access::{authorize, ensure_visible};
use crate::audit::{AuditAction, AuditEvent, Snapshot};
use crate::config::EngineConfig;
use crate::error::{Field, LimsError, TransitionError, ValidationReport, Warning};
use crate::lifecycle;
use crate::master::MasterData;
use crate::store::{LabStore, UnitOfWork};
use crate::types::{
    Actor, ActorId, Analysis, AnalysisId, AnalysisStatus, DeviationType, EquipmentId, ResultDraft,
    Sample, Timestamp,
};
use chrono::Utc;
use lims_conformity::{evaluate, MeasuredValue, Permission, Specification, SpecificationResolver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Operator-supplied result fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFields {
    /// Measured value
    pub value: MeasuredValue,
    /// Instrument used
    pub equipment_id: Option<EquipmentId>,
    /// Method reference
    pub method: Option<String>,
    /// Notes; required for an OOS result
    pub notes: Option<String>,
    /// Deviation class of an OOS result
    pub deviation: Option<DeviationType>,
    /// The client's own conformity opinion; advisory only
    pub claimed_conforming: Option<bool>,
}

impl ResultFields {
    /// Fields carrying a value
    #[must_use]
    pub fn new(value: MeasuredValue) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// With instrument
    #[inline]
    #[must_use]
    pub fn with_equipment(mut self, equipment_id: EquipmentId) -> Self {
        self.equipment_id = Some(equipment_id);
        self
    }

    /// With method reference
    #[inline]
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// With notes
    #[inline]
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// With deviation class
    #[inline]
    #[must_use]
    pub fn with_deviation(mut self, deviation: DeviationType) -> Self {
        self.deviation = Some(deviation);
        self
    }

    /// With the client's conformity opinion
    #[inline]
    #[must_use]
    pub fn with_claimed_conforming(mut self, conforming: bool) -> Self {
        self.claimed_conforming = Some(conforming);
        self
    }

    /// Notes with surrounding whitespace removed, `None` when blank
    #[must_use]
    pub fn justification(&self) -> Option<&str> {
        self.notes.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

/// Outcome of `StartAnalysis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// Moved to `started` by this call
    Started,
    /// Already started or beyond; nothing was written
    AlreadyStarted,
}

/// Who signs a commit, when, and under which session hash
#[derive(Debug, Clone, Copy)]
pub struct CommitContext<'a> {
    /// Signing analyst
    pub analyst: ActorId,
    /// Signature time
    pub at: Timestamp,
    /// Session hash of the signature
    pub signature_hash: &'a str,
    /// Deviation applied to an OOS result without one
    pub default_deviation: DeviationType,
}

/// The row to persist for a committed result
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedResult {
    /// Completed analysis row
    pub analysis: Analysis,
    /// Non-blocking findings
    pub warnings: Vec<Warning>,
}

/// Authoritative commit of one result
///
/// Recomputes conformity from `spec`; the client's opinion only produces a
/// warning when it disagrees.
///
/// # Errors
/// A report naming every field of this analysis that blocks signing.
pub fn commit_result(
    analysis: &Analysis,
    fields: &ResultFields,
    spec: Option<&Specification>,
    ctx: &CommitContext<'_>,
) -> Result<CommittedResult, ValidationReport> {
    let id = Some(analysis.id);
    let mut report = ValidationReport::new();

    if !analysis.status.is_open() {
        report.push(
            id,
            Field::Status,
            format!("result is {} and cannot be overwritten", analysis.status),
        );
    }
    if !fields.value.is_present() {
        report.push(id, Field::Value, "value required");
    } else if fields.equipment_id.is_none() {
        report.push(id, Field::Equipment, "instrument required for a recorded value");
    }

    let verdict = evaluate(&fields.value, spec);
    let notes = fields.justification();
    if verdict.is_fail() && notes.is_none() {
        report.push(id, Field::Notes, "justification required for out-of-specification result");
    }
    if !report.is_empty() {
        return Err(report);
    }

    let mut warnings = Vec::new();
    if spec.is_none() {
        tracing::warn!(analysis = %analysis.id, parameter = %analysis.parameter_id, "no specification; verdict indeterminate");
        warnings.push(Warning::SpecificationNotFound {
            analysis_id: analysis.id,
            parameter_id: analysis.parameter_id,
        });
    }
    if let Some(claimed) = fields.claimed_conforming {
        if verdict.is_conforming() != Some(claimed) {
            tracing::warn!(analysis = %analysis.id, claimed, ?verdict, "client conformity flag overridden");
            warnings.push(Warning::ConformityOverridden {
                analysis_id: analysis.id,
            });
        }
    }

    let deviation = if verdict.is_fail() {
        fields.deviation.or(Some(ctx.default_deviation))
    } else {
        fields.deviation
    };

    let mut committed = analysis.clone();
    committed.status = AnalysisStatus::Completed;
    committed.value = fields.value.clone();
    committed.equipment_id = fields.equipment_id;
    committed.method = fields.method.clone().or_else(|| analysis.method.clone());
    committed.notes = notes.map(str::to_string);
    committed.deviation = deviation;
    committed.verdict = verdict;
    committed.unit = spec
        .and_then(|s| s.unit.clone())
        .or_else(|| analysis.unit.clone());
    committed.specification = spec.cloned();
    committed.analyst_id = Some(ctx.analyst);
    committed.analyzed_at = Some(ctx.at);
    committed.signature_hash = Some(ctx.signature_hash.to_string());
    committed.draft = None;

    Ok(CommittedResult {
        analysis: committed,
        warnings,
    })
}

/// Per-analysis operations
#[derive(Clone)]
pub struct AnalysisRecordManager {
    store: Arc<dyn LabStore>,
    master: Arc<dyn MasterData>,
    resolver: SpecificationResolver,
    config: EngineConfig,
}

impl AnalysisRecordManager {
    /// Manager over the given collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn LabStore>,
        master: Arc<dyn MasterData>,
        resolver: SpecificationResolver,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            master,
            resolver,
            config,
        }
    }

    /// Owning sample, once the actor may work on this analysis at all
    fn scope(&self, actor: &Actor, analysis: &Analysis) -> Result<Sample, LimsError> {
        let sample = self.store.sample(analysis.sample_id)?;
        authorize(actor, &sample, Permission::ExecuteAnalysis)?;
        let parameter = self.resolver.parameter(analysis.parameter_id)?;
        ensure_visible(actor, &parameter)?;
        Ok(sample)
    }

    fn load(&self, actor: &Actor, analysis_id: AnalysisId) -> Result<(Analysis, Sample), LimsError> {
        let analysis = self.store.analysis(analysis_id)?;
        let sample = self.scope(actor, &analysis)?;
        if !sample.status.accepts_results() {
            return Err(TransitionError::SampleLocked {
                sample_id: sample.id,
                status: sample.status,
            }
            .into());
        }
        Ok((analysis, sample))
    }

    /// `StartAnalysis`: `pending -> started`, idempotent
    ///
    /// Starting the first analysis of a registered or collected sample moves
    /// the sample into analysis within the same unit of work.
    ///
    /// # Errors
    /// Invalidated analyses cannot be started; locked samples reject the call.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub fn start(&self, actor: &Actor, analysis_id: AnalysisId) -> Result<StartOutcome, LimsError> {
        let analysis = self.store.analysis(analysis_id)?;
        self.scope(actor, &analysis)?;
        match analysis.status {
            AnalysisStatus::Pending => {}
            AnalysisStatus::Invalidated => {
                return Err(TransitionError::Analysis {
                    analysis_id,
                    from: AnalysisStatus::Invalidated,
                    to: AnalysisStatus::Started,
                }
                .into())
            }
            _ => return Ok(StartOutcome::AlreadyStarted),
        }
        let (analysis, sample) = self.load(actor, analysis_id)?;

        let now = Utc::now();
        let mut started = analysis.clone();
        started.status = AnalysisStatus::Started;
        started.started_at = Some(now);
        started.analyst_id = Some(actor.id);

        let path = lifecycle::advance_after_results(sample.status, &[], false);
        lifecycle::validate_path(&path)?;
        let to = path.last().copied().unwrap_or(sample.status);

        let mut work = UnitOfWork::new();
        work.persist_analysis(started.clone(), AnalysisStatus::Pending);
        if to == sample.status {
            work.expect_sample_status(sample.id, sample.status);
        } else {
            work.persist_sample_status(sample.id, sample.status, to);
        }
        work.append_audit_event(AuditEvent::new(
            actor.id,
            actor.role,
            sample.id,
            AuditAction::AnalysisStarted,
            Snapshot::capture(sample.status, [&analysis]),
            Snapshot::capture(to, [&started]),
            now,
        ));

        match self.store.commit(work) {
            Ok(_) => {
                tracing::info!(analysis = %analysis_id, sample = %sample.code, status = %to, "analysis started");
                Ok(StartOutcome::Started)
            }
            Err(e) if e.requires_reload() => {
                let current = self.store.analysis(analysis_id)?;
                if current.status == AnalysisStatus::Pending || current.status == AnalysisStatus::Invalidated {
                    Err(e)
                } else {
                    Ok(StartOutcome::AlreadyStarted)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// `RecordResult`: validate and keep draft fields
    ///
    /// The persisted status is unchanged; only a signed commit completes the
    /// analysis.
    ///
    /// # Errors
    /// `ValidationFailed` naming value and equipment problems.
    #[tracing::instrument(skip(self, actor, fields), fields(actor = %actor.id))]
    pub fn record_result(
        &self,
        actor: &Actor,
        analysis_id: AnalysisId,
        fields: ResultFields,
    ) -> Result<ResultDraft, LimsError> {
        let (analysis, sample) = self.load(actor, analysis_id)?;
        let id = Some(analysis_id);

        let mut report = ValidationReport::new();
        if !analysis.status.is_open() {
            report.push(id, Field::Status, format!("result is {} and cannot be edited", analysis.status));
        }
        if !fields.value.is_present() {
            report.push(id, Field::Value, "value required");
        }
        if fields.equipment_id.is_none() {
            report.push(id, Field::Equipment, "instrument required");
        }
        let now = Utc::now();
        report.extend(self.check_equipment(analysis_id, &fields, now)?);
        report.into_result()?;

        let draft = ResultDraft {
            value: fields.value,
            equipment_id: fields.equipment_id,
            method: fields.method,
            notes: fields.notes,
            deviation: fields.deviation,
            recorded_by: actor.id,
            recorded_at: now,
        };
        let mut updated = analysis.clone();
        updated.draft = Some(draft.clone());

        let mut work = UnitOfWork::new();
        work.persist_analysis(updated, analysis.status)
            .expect_sample_status(sample.id, sample.status);
        self.store.commit(work)?;
        tracing::debug!(analysis = %analysis_id, "draft recorded");
        Ok(draft)
    }

    /// Instrument must exist, be active and be in calibration at `at`
    pub(crate) fn check_equipment(
        &self,
        analysis_id: AnalysisId,
        fields: &ResultFields,
        at: Timestamp,
    ) -> Result<ValidationReport, LimsError> {
        let mut report = ValidationReport::new();
        if let Some(equipment_id) = fields.equipment_id {
            match self.master.equipment(equipment_id)? {
                Some(e) if !e.active => report.push(
                    Some(analysis_id),
                    Field::Equipment,
                    format!("instrument {} is inactive", e.code),
                ),
                Some(e) if e.calibration_expired(at) => report.push(
                    Some(analysis_id),
                    Field::Equipment,
                    format!(
                        "instrument {} calibration expired on {}",
                        e.code,
                        e.next_calibration_date.map(|d| d.to_string()).unwrap_or_default()
                    ),
                ),
                Some(_) => {}
                None => report.push(Some(analysis_id), Field::Equipment, "unknown instrument"),
            }
        }
        Ok(report)
    }

    /// Authoritative commit of one result, including instrument checks
    ///
    /// # Errors
    /// `ValidationFailed` with every blocking field.
    pub fn prepare_commit(
        &self,
        analysis: &Analysis,
        fields: &ResultFields,
        spec: Option<&Specification>,
        ctx: &CommitContext<'_>,
    ) -> Result<CommittedResult, LimsError> {
        let equipment = self.check_equipment(analysis.id, fields, ctx.at)?;
        match commit_result(analysis, fields, spec, ctx) {
            Ok(committed) if equipment.is_empty() => Ok(committed),
            Ok(_) => Err(LimsError::ValidationFailed(equipment)),
            Err(mut report) => {
                report.extend(equipment);
                Err(LimsError::ValidationFailed(report))
            }
        }
    }

    /// `RequestRetest`: invalidate a result and queue a fresh analysis
    ///
    /// # Errors
    /// `ValidationFailed` for a short reason; locked samples reject the call.
    #[tracing::instrument(skip(self, actor, reason), fields(actor = %actor.id))]
    pub fn request_retest(&self, actor: &Actor, analysis_id: AnalysisId, reason: &str) -> Result<Analysis, LimsError> {
        let reason = reason.trim();
        if reason.chars().count() < self.config.min_retest_reason_len {
            return Err(LimsError::ValidationFailed({
                let mut report = ValidationReport::new();
                report.push(
                    Some(analysis_id),
                    Field::Reason,
                    format!("reason must have at least {} characters", self.config.min_retest_reason_len),
                );
                report
            }));
        }

        let (analysis, sample) = self.load(actor, analysis_id)?;
        if analysis.status == AnalysisStatus::Invalidated {
            return Err(TransitionError::Analysis {
                analysis_id,
                from: AnalysisStatus::Invalidated,
                to: AnalysisStatus::Invalidated,
            }
            .into());
        }

        let mut invalidated = analysis.clone();
        invalidated.status = AnalysisStatus::Invalidated;
        invalidated.notes = Some(match analysis.notes.as_deref() {
            Some(previous) if !previous.is_empty() => format!("INVALIDATED: {reason} | {previous}"),
            _ => format!("INVALIDATED: {reason}"),
        });

        let mut retest = Analysis::pending(sample.id, analysis.parameter_id, analysis.specification.clone());
        retest.unit = analysis.unit.clone();
        retest.is_retest = true;
        retest.supersedes = Some(analysis.id);

        let now = Utc::now();
        let mut work = UnitOfWork::new();
        work.persist_analysis(invalidated.clone(), analysis.status)
            .insert_analysis(retest.clone())
            .expect_sample_status(sample.id, sample.status)
            .append_audit_event(
                AuditEvent::new(
                    actor.id,
                    actor.role,
                    sample.id,
                    AuditAction::RetestRequested,
                    Snapshot::capture(sample.status, [&analysis]),
                    Snapshot::capture(sample.status, [&invalidated, &retest]),
                    now,
                )
                .with_reason(Some(reason.to_string())),
            );
        self.store.commit(work)?;
        tracing::info!(analysis = %analysis_id, retest = %retest.id, "retest requested");
        Ok(retest)
    }
}

impl std::fmt::Debug for AnalysisRecordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisRecordManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleId;
    use lims_conformity::{ParameterId, SampleTypeId, Verdict};

    fn ph(sample_id: SampleId) -> (Analysis, Specification) {
        let spec = Specification::global(ParameterId::new(), SampleTypeId::new())
            .with_range(Some(6.0), Some(8.0))
            .with_unit("pH");
        (Analysis::pending(sample_id, spec.parameter_id, Some(spec.clone())), spec)
    }

    fn ctx() -> CommitContext<'static> {
        CommitContext {
            analyst: ActorId::new(),
            at: Utc::now(),
            signature_hash: "hash",
            default_deviation: DeviationType::RealOos,
        }
    }

    #[test]
    fn test_commit_recomputes_verdict() {
        let (analysis, spec) = ph(SampleId::new());
        let fields = ResultFields::new(MeasuredValue::Numeric(7.5))
            .with_equipment(EquipmentId::new())
            .with_claimed_conforming(false);

        let committed = commit_result(&analysis, &fields, Some(&spec), &ctx()).unwrap();
        assert_eq!(committed.analysis.verdict, Verdict::Pass);
        assert_eq!(committed.analysis.status, AnalysisStatus::Completed);
        assert_eq!(committed.analysis.unit.as_deref(), Some("pH"));
        assert_eq!(committed.analysis.signature_hash.as_deref(), Some("hash"));
        assert_eq!(
            committed.warnings,
            vec![Warning::ConformityOverridden {
                analysis_id: analysis.id
            }]
        );
    }

    #[test]
    fn test_oos_requires_notes() {
        let (analysis, spec) = ph(SampleId::new());
        let fields = ResultFields::new(MeasuredValue::Numeric(9.0)).with_equipment(EquipmentId::new());
        let report = commit_result(&analysis, &fields, Some(&spec), &ctx()).unwrap_err();
        assert!(report.flags(Some(analysis.id), Field::Notes));

        let justified = fields.with_notes("re-sampled, confirmed");
        let committed = commit_result(&analysis, &justified, Some(&spec), &ctx()).unwrap();
        assert_eq!(committed.analysis.verdict, Verdict::Fail);
        assert_eq!(committed.analysis.deviation, Some(DeviationType::RealOos));
    }

    #[test]
    fn test_blank_notes_do_not_justify() {
        let (analysis, spec) = ph(SampleId::new());
        let fields = ResultFields::new(MeasuredValue::Numeric(9.0))
            .with_equipment(EquipmentId::new())
            .with_notes("   ");
        assert!(commit_result(&analysis, &fields, Some(&spec), &ctx()).is_err());
    }

    #[test]
    fn test_value_and_equipment_required() {
        let (analysis, spec) = ph(SampleId::new());
        let report = commit_result(&analysis, &ResultFields::default(), Some(&spec), &ctx()).unwrap_err();
        assert!(report.flags(Some(analysis.id), Field::Value));

        let no_equipment = ResultFields::new(MeasuredValue::Numeric(7.0));
        let report = commit_result(&analysis, &no_equipment, Some(&spec), &ctx()).unwrap_err();
        assert!(report.flags(Some(analysis.id), Field::Equipment));
    }

    #[test]
    fn test_signed_result_cannot_be_overwritten() {
        let (analysis, spec) = ph(SampleId::new());
        let fields = ResultFields::new(MeasuredValue::Numeric(7.0)).with_equipment(EquipmentId::new());
        let committed = commit_result(&analysis, &fields, Some(&spec), &ctx()).unwrap();
        let report = commit_result(&committed.analysis, &fields, Some(&spec), &ctx()).unwrap_err();
        assert!(report.flags(Some(analysis.id), Field::Status));
    }

    #[test]
    fn test_missing_spec_is_indeterminate_with_warning() {
        let analysis = Analysis::pending(SampleId::new(), ParameterId::new(), None);
        let fields = ResultFields::new(MeasuredValue::Numeric(42.0)).with_equipment(EquipmentId::new());
        let committed = commit_result(&analysis, &fields, None, &ctx()).unwrap();
        assert_eq!(committed.analysis.verdict, Verdict::Indeterminate);
        assert!(matches!(
            committed.warnings.as_slice(),
            [Warning::SpecificationNotFound { .. }]
        ));
    }
}
