//! Signature gate
//!
//! The only way to commit results or move a sample past analysis. Each call
//! re-verifies the actor's password, validates the whole payload, writes
//! every change plus one audit event as a single unit of work and then
//! fires the notification hook.

mod credentials;

pub use credentials::InMemoryCredentials;

use crate::access::{authorize, ensure_visible};
use crate::analysis::{AnalysisRecordManager, CommitContext, ResultFields};
use crate::audit::{AuditAction, AuditEvent, Snapshot};
use crate::config::EngineConfig;
use crate::error::{AuditError, Field, LimsError, StorageError, TransitionError, ValidationReport, Warning};
use crate::lifecycle::{self, Trigger};
use crate::notify::{Notification, Notifier, NoopNotifier};
use crate::store::{LabStore, UnitOfWork};
use crate::types::{
    Actor, ActorId, Analysis, AnalysisId, AnalysisStatus, EntityRef, EventId, Sample, SampleId,
    SampleStatus, Timestamp,
};
use async_trait::async_trait;
use chrono::Utc;
use lims_conformity::{Permission, ProductContext, SpecificationResolver};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Credential service failure, as opposed to a wrong password
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    /// Service answered too late
    #[error("credential service timed out")]
    Timeout,

    /// Service could not be reached
    #[error("credential service unreachable: {0}")]
    Unreachable(String),
}

/// Re-verifies an actor's password at signing time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` for a wrong password
    async fn verify(&self, actor_id: ActorId, secret: &str) -> Result<bool, VerifierError>;
}

/// One result of a batch commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Analysis to complete
    pub analysis_id: AnalysisId,
    /// Its result
    pub fields: ResultFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the results
    Approve,
    /// Reject the sample; needs a reason
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseDecision {
    /// Release the lot
    Release,
    /// Block the lot; needs a reason
    Block,
}

/// Actions that require a signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignedAction {
    /// Every result of a batch execution session; moves the sample to review
    /// once nothing in scope is missing
    CommitBatch {
        /// Sample executed
        sample_id: SampleId,
        /// Every buffered result
        entries: Vec<BatchEntry>,
    },
    /// A single result
    CommitResult {
        /// Analysis to complete
        analysis_id: AnalysisId,
        /// Its result
        fields: ResultFields,
    },
    /// Hand a fully analysed sample to review
    SubmitForReview {
        /// Sample to submit
        sample_id: SampleId,
    },
    /// Technical review decision
    Review {
        /// Sample under review
        sample_id: SampleId,
        /// Approve or reject
        decision: ReviewDecision,
        /// Required to reject or to approve an OOS result
        reason: Option<String>,
    },
    /// Quality decision on the lot
    Release {
        /// Approved sample
        sample_id: SampleId,
        /// Release or block
        decision: ReleaseDecision,
        /// Required to block
        reason: Option<String>,
    },
    /// Close a released or rejected sample
    Archive {
        /// Sample to archive
        sample_id: SampleId,
        /// Required
        reason: Option<String>,
    },
}

impl SignedAction {
    /// Stable name used in logs and the session hash
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CommitBatch { .. } => "commit_batch",
            Self::CommitResult { .. } => "commit_result",
            Self::SubmitForReview { .. } => "submit_for_review",
            Self::Review {
                decision: ReviewDecision::Approve,
                ..
            } => "approve",
            Self::Review {
                decision: ReviewDecision::Reject,
                ..
            } => "reject",
            Self::Release {
                decision: ReleaseDecision::Release,
                ..
            } => "release",
            Self::Release {
                decision: ReleaseDecision::Block,
                ..
            } => "block_lot",
            Self::Archive { .. } => "archive",
        }
    }
}

/// Outcome of a successful signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureReceipt {
    /// Audit event written by the commit
    pub event_id: EventId,
    /// Sample concerned
    pub sample_id: SampleId,
    /// Recorded action
    pub action: AuditAction,
    /// Sample status before
    pub from: SampleStatus,
    /// Sample status after
    pub to: SampleStatus,
    /// Hex SHA-256 over actor, action, time and payload
    pub signature_hash: String,
    /// Signature time
    pub signed_at: Timestamp,
    /// Analyses written, in payload order
    pub committed_analyses: Vec<AnalysisId>,
    /// Non-blocking findings
    pub warnings: Vec<Warning>,
}

/// Validated writes of one action, not yet committed
struct Prepared {
    work: UnitOfWork,
    sample_id: SampleId,
    action: AuditAction,
    from: SampleStatus,
    to: SampleStatus,
    committed: Vec<AnalysisId>,
    warnings: Vec<Warning>,
}

/// Re-verifies credentials and commits signed actions atomically
pub struct SignatureGate {
    store: Arc<dyn LabStore>,
    verifier: Arc<dyn CredentialVerifier>,
    resolver: SpecificationResolver,
    records: AnalysisRecordManager,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl SignatureGate {
    /// Gate with a no-op notifier
    #[must_use]
    pub fn new(
        store: Arc<dyn LabStore>,
        verifier: Arc<dyn CredentialVerifier>,
        resolver: SpecificationResolver,
        records: AnalysisRecordManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            resolver,
            records,
            notifier: Arc::new(NoopNotifier),
            config,
        }
    }

    /// With a notification hook
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sign and commit `action`
    ///
    /// Nothing is written unless the credential verifies and the whole
    /// payload validates.
    ///
    /// # Errors
    /// `InvalidCredential`, `CredentialTimeout` or
    /// `CredentialServiceUnavailable` before any read; `ValidationFailed`,
    /// `Forbidden`, `IllegalTransition` or `ConcurrentModification` from
    /// validation; `StorageFailure` from the commit. In every case no state
    /// changed.
    #[tracing::instrument(skip(self, actor, password, action), fields(actor = %actor.id, action = action.name()))]
    pub async fn sign(&self, actor: &Actor, password: &str, action: SignedAction) -> Result<SignatureReceipt, LimsError> {
        if password.is_empty() {
            return Err(LimsError::invalid(Field::Password, "password required to sign"));
        }
        self.verify(actor, password).await?;

        let now = Utc::now();
        let signature_hash = session_hash(actor, &action, now)?;
        let prepared = self.prepare(actor, &action, now, &signature_hash)?;
        let receipt = self.store.commit(prepared.work)?;
        let event_id = receipt.events.last().copied().unwrap_or_default();

        tracing::info!(
            sample = %prepared.sample_id,
            from = %prepared.from,
            to = %prepared.to,
            event = %event_id,
            analyses = prepared.committed.len(),
            "signed {}",
            prepared.action
        );

        let notification = Notification {
            sample_id: prepared.sample_id,
            event_id,
            action: prepared.action,
            status: prepared.to,
            certificate_eligible: prepared.to == SampleStatus::Released,
            committed_analyses: prepared.committed.len(),
        };
        if let Err(e) = self.notifier.notify(&notification) {
            tracing::warn!(sample = %prepared.sample_id, error = %e, "commit notification failed");
        }

        Ok(SignatureReceipt {
            event_id,
            sample_id: prepared.sample_id,
            action: prepared.action,
            from: prepared.from,
            to: prepared.to,
            signature_hash,
            signed_at: now,
            committed_analyses: prepared.committed,
            warnings: prepared.warnings,
        })
    }

    async fn verify(&self, actor: &Actor, password: &str) -> Result<(), LimsError> {
        let timeout = self.config.credential_timeout();
        let timeout_ms = self.config.credential_timeout_ms;
        match tokio::time::timeout(timeout, self.verifier.verify(actor.id, password)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                tracing::warn!(actor = %actor.id, "signature denied");
                Err(LimsError::InvalidCredential)
            }
            Ok(Err(VerifierError::Timeout)) | Err(_) => {
                tracing::warn!(actor = %actor.id, timeout_ms, "credential verification timed out");
                Err(LimsError::CredentialTimeout { timeout_ms })
            }
            Ok(Err(VerifierError::Unreachable(reason))) => Err(LimsError::CredentialServiceUnavailable(reason)),
        }
    }

    fn prepare(
        &self,
        actor: &Actor,
        action: &SignedAction,
        now: Timestamp,
        signature_hash: &str,
    ) -> Result<Prepared, LimsError> {
        match action {
            SignedAction::CommitBatch { sample_id, entries } => {
                let sample = self.store.sample(*sample_id)?;
                self.prepare_results(actor, &sample, entries, true, AuditAction::BatchSignatureCompleted, now, signature_hash)
            }
            SignedAction::CommitResult { analysis_id, fields } => {
                let analysis = self.store.analysis(*analysis_id)?;
                let sample = self.store.sample(analysis.sample_id)?;
                let entry = BatchEntry {
                    analysis_id: *analysis_id,
                    fields: fields.clone(),
                };
                self.prepare_results(
                    actor,
                    &sample,
                    std::slice::from_ref(&entry),
                    false,
                    AuditAction::ResultSigned,
                    now,
                    signature_hash,
                )
            }
            SignedAction::SubmitForReview { sample_id } => {
                let sample = self.store.sample(*sample_id)?;
                authorize(actor, &sample, Permission::ExecuteAnalysis)?;
                self.prepare_transition(actor, &sample, Trigger::SubmitForReview, None, now, signature_hash)
            }
            SignedAction::Review {
                sample_id,
                decision,
                reason,
            } => {
                let sample = self.store.sample(*sample_id)?;
                authorize(actor, &sample, Permission::TechnicalReview)?;
                let trigger = match decision {
                    ReviewDecision::Approve => Trigger::Approve,
                    ReviewDecision::Reject => Trigger::Reject,
                };
                self.prepare_transition(actor, &sample, trigger, reason.as_deref(), now, signature_hash)
            }
            SignedAction::Release {
                sample_id,
                decision,
                reason,
            } => {
                let sample = self.store.sample(*sample_id)?;
                authorize(actor, &sample, Permission::QualityRelease)?;
                let trigger = match decision {
                    ReleaseDecision::Release => Trigger::Release,
                    ReleaseDecision::Block => Trigger::BlockLot,
                };
                self.prepare_transition(actor, &sample, trigger, reason.as_deref(), now, signature_hash)
            }
            SignedAction::Archive { sample_id, reason } => {
                let sample = self.store.sample(*sample_id)?;
                authorize(actor, &sample, Permission::QualityRelease)?;
                self.prepare_transition(actor, &sample, Trigger::Archive, reason.as_deref(), now, signature_hash)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_results(
        &self,
        actor: &Actor,
        sample: &Sample,
        entries: &[BatchEntry],
        submit: bool,
        audit_action: AuditAction,
        now: Timestamp,
        signature_hash: &str,
    ) -> Result<Prepared, LimsError> {
        authorize(actor, sample, Permission::ExecuteAnalysis)?;
        if !sample.status.accepts_results() {
            return Err(TransitionError::SampleLocked {
                sample_id: sample.id,
                status: sample.status,
            }
            .into());
        }

        let mut analyses = self.store.analyses_for_sample(sample.id)?;
        let resolved = self.resolver.resolve(&ProductContext {
            product_id: sample.product_id,
            sample_type_id: sample.sample_type_id,
        })?;
        let ctx = CommitContext {
            analyst: actor.id,
            at: now,
            signature_hash,
            default_deviation: self.config.default_deviation,
        };

        let mut report = ValidationReport::new();
        let mut seen = HashSet::new();
        let mut originals = Vec::with_capacity(entries.len());
        let mut committed = Vec::with_capacity(entries.len());
        let mut warnings = Vec::new();

        for entry in entries {
            if !seen.insert(entry.analysis_id) {
                report.push(Some(entry.analysis_id), Field::Status, "listed more than once");
                continue;
            }
            let original = analyses
                .iter()
                .find(|a| a.id == entry.analysis_id)
                .cloned()
                .ok_or(LimsError::NotFound(EntityRef::Analysis(entry.analysis_id)))?;
            let parameter = self.resolver.parameter(original.parameter_id)?;
            ensure_visible(actor, &parameter)?;

            let spec = resolved
                .get(original.parameter_id)
                .or(original.specification.as_ref());
            match self.records.prepare_commit(&original, &entry.fields, spec, &ctx) {
                Ok(result) => {
                    warnings.extend(result.warnings);
                    committed.push(result.analysis);
                }
                Err(LimsError::ValidationFailed(r)) => report.extend(r),
                Err(e) => return Err(e),
            }
            originals.push(original);
        }
        report.into_result()?;

        for result in &committed {
            if let Some(slot) = analyses.iter_mut().find(|a| a.id == result.id) {
                *slot = result.clone();
            }
        }
        let path = lifecycle::advance_after_results(sample.status, &analyses, submit);
        lifecycle::validate_path(&path)?;
        let to = path.last().copied().unwrap_or(sample.status);
        if committed.is_empty() && to == sample.status {
            return Err(LimsError::invalid(Field::Value, "nothing to commit"));
        }

        let mut work = UnitOfWork::new();
        for (original, result) in originals.iter().zip(&committed) {
            work.persist_analysis(result.clone(), original.status);
        }
        if to == sample.status {
            work.expect_sample_status(sample.id, sample.status);
        } else {
            work.persist_sample_status(sample.id, sample.status, to);
        }
        work.append_audit_event(
            AuditEvent::new(
                actor.id,
                actor.role,
                sample.id,
                audit_action,
                Snapshot::capture(sample.status, &originals),
                Snapshot::capture(to, &committed),
                now,
            )
            .signed(signature_hash.to_string()),
        );

        Ok(Prepared {
            work,
            sample_id: sample.id,
            action: audit_action,
            from: sample.status,
            to,
            committed: committed.iter().map(|a| a.id).collect(),
            warnings,
        })
    }

    fn prepare_transition(
        &self,
        actor: &Actor,
        sample: &Sample,
        trigger: Trigger,
        reason: Option<&str>,
        now: Timestamp,
        signature_hash: &str,
    ) -> Result<Prepared, LimsError> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if trigger.requires_reason() && reason.is_none() {
            return Err(LimsError::invalid(Field::Reason, format!("a reason is required to {}", trigger_verb(trigger))));
        }

        let analyses = self.store.analyses_for_sample(sample.id)?;
        let planned = lifecycle::plan(sample, trigger, &analyses)?;

        if trigger == Trigger::Approve && reason.is_none() {
            let mut report = ValidationReport::new();
            for a in analyses.iter().filter(|a| a.is_in_scope() && a.verdict.is_fail()) {
                report.push(Some(a.id), Field::Reason, "approving a non-conforming result requires a reason");
            }
            report.into_result()?;
        }

        // review and release advance the analyses with the sample
        let promotion = match trigger {
            Trigger::Approve => Some((AnalysisStatus::Completed, AnalysisStatus::Reviewed)),
            Trigger::Release => Some((AnalysisStatus::Reviewed, AnalysisStatus::Validated)),
            _ => None,
        };
        let mut before: Vec<&Analysis> = Vec::new();
        let mut after: Vec<Analysis> = Vec::new();
        let mut work = UnitOfWork::new();
        if let Some((from, to)) = promotion {
            for a in analyses.iter().filter(|a| a.status == from) {
                let mut promoted = a.clone();
                promoted.status = to;
                work.persist_analysis(promoted.clone(), from);
                before.push(a);
                after.push(promoted);
            }
        }

        let audit_action = match trigger {
            Trigger::SubmitForReview => AuditAction::SubmittedForReview,
            Trigger::Approve => AuditAction::ReviewApproved,
            Trigger::Reject => AuditAction::ReviewRejected,
            Trigger::Release => AuditAction::LotReleased,
            Trigger::BlockLot => AuditAction::LotBlocked,
            _ => AuditAction::SampleArchived,
        };
        work.persist_sample_status(sample.id, planned.from, planned.to)
            .append_audit_event(
                AuditEvent::new(
                    actor.id,
                    actor.role,
                    sample.id,
                    audit_action,
                    Snapshot::capture(planned.from, before),
                    Snapshot::capture(planned.to, &after),
                    now,
                )
                .with_reason(reason.map(str::to_string))
                .signed(signature_hash.to_string()),
            );

        Ok(Prepared {
            work,
            sample_id: sample.id,
            action: audit_action,
            from: planned.from,
            to: planned.to,
            committed: after.iter().map(|a| a.id).collect(),
            warnings: Vec::new(),
        })
    }
}

impl std::fmt::Debug for SignatureGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn trigger_verb(trigger: Trigger) -> &'static str {
    match trigger {
        Trigger::Reject => "reject",
        Trigger::BlockLot => "block the lot",
        Trigger::Archive => "archive",
        _ => "proceed",
    }
}

/// Hex SHA-256 binding the signature to actor, action, time and payload
fn session_hash(actor: &Actor, action: &SignedAction, at: Timestamp) -> Result<String, LimsError> {
    let payload = serde_json::to_vec(action)
        .map_err(|e| StorageError::from(AuditError::Encoding(e.to_string())))?;

    let mut hasher = Sha256::new();
    hasher.update(actor.id.0.as_bytes());
    hasher.update(action.name().as_bytes());
    hasher.update([0]);
    hasher.update(at.timestamp_micros().to_le_bytes());
    hasher.update(&payload);
    Ok(hex::encode(hasher.finalize()))
}
