use crate::access::{authorize, ensure_scope};
use crate::analysis::{AnalysisRecordManager, ResultFields, StartOutcome};
use crate::compliance::LotCompliance;
use crate::config::EngineConfig;
use crate::error::{LimsError, TransitionError};
use crate::master::MasterData;
use crate::notify::Notifier;
use crate::read_model::SampleDossier;
use crate::registration::{RegisterSample, Registration, SampleRegistrar};
use crate::session::{BatchExecutionSession, SessionAnalysis, WorkingEntry};
use crate::signature::{
    CredentialVerifier, ReleaseDecision, ReviewDecision, SignatureGate, SignatureReceipt, SignedAction,
};
use crate::store::LabStore;
use crate::types::{Actor, ActorId, Analysis, AnalysisId, BatchId, ResultDraft, Sample, SampleId, Timestamp};
use chrono::Utc;
use lims_conformity::{
    visible_parameters, Parameter, ParameterId, Permission, ProductContext, Specification,
    SpecificationCatalog, SpecificationResolver,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Main entry point: every laboratory operation goes through here
pub struct LabKernel {
    config: EngineConfig,
    store: Arc<dyn LabStore>,
    resolver: SpecificationResolver,
    registrar: SampleRegistrar,
    records: AnalysisRecordManager,
    gate: SignatureGate,
}

impl LabKernel {
    /// Wire the kernel over its collaborators
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LabStore>,
        catalog: Arc<dyn SpecificationCatalog>,
        master: Arc<dyn MasterData>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let resolver = SpecificationResolver::new(catalog);
        let registrar = SampleRegistrar::new(store.clone(), master.clone(), resolver.clone());
        let records = AnalysisRecordManager::new(store.clone(), master, resolver.clone(), config.clone());
        let gate = SignatureGate::new(
            store.clone(),
            verifier,
            resolver.clone(),
            records.clone(),
            config.clone(),
        );
        Self {
            config,
            store,
            resolver,
            registrar,
            records,
            gate,
        }
    }

    /// Fire `notifier` after every signed commit
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.gate = self.gate.with_notifier(notifier);
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LabStore> {
        &self.store
    }

    /// Signature gate, e.g. to finalize a session
    #[must_use]
    pub fn gate(&self) -> &SignatureGate {
        &self.gate
    }

    /// Register a sample and queue its analyses
    ///
    /// # Errors
    /// See [`SampleRegistrar::register`].
    pub fn register_sample(&self, actor: &Actor, request: RegisterSample) -> Result<Registration, LimsError> {
        self.registrar.register(actor, request, Utc::now())
    }

    /// Record collection of a registered sample
    ///
    /// # Errors
    /// See [`SampleRegistrar::mark_collected`].
    pub fn mark_collected(
        &self,
        actor: &Actor,
        sample_id: SampleId,
        at: Timestamp,
        collector: Option<ActorId>,
    ) -> Result<Sample, LimsError> {
        self.registrar.mark_collected(actor, sample_id, at, collector)
    }

    /// # Errors
    /// See [`AnalysisRecordManager::start`].
    pub fn start_analysis(&self, actor: &Actor, analysis_id: AnalysisId) -> Result<StartOutcome, LimsError> {
        self.records.start(actor, analysis_id)
    }

    /// # Errors
    /// See [`AnalysisRecordManager::record_result`].
    pub fn record_result(
        &self,
        actor: &Actor,
        analysis_id: AnalysisId,
        fields: ResultFields,
    ) -> Result<ResultDraft, LimsError> {
        self.records.record_result(actor, analysis_id, fields)
    }

    /// # Errors
    /// See [`AnalysisRecordManager::request_retest`].
    pub fn request_retest(&self, actor: &Actor, analysis_id: AnalysisId, reason: &str) -> Result<Analysis, LimsError> {
        self.records.request_retest(actor, analysis_id, reason)
    }

    /// Open a batch execution session over the sample's open analyses
    ///
    /// Only analyses with a specification (current or captured) and a
    /// parameter visible to the actor are included, in queue order. Saved
    /// drafts prefill the buffer.
    ///
    /// # Errors
    /// `IllegalTransition` for samples that no longer accept results.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub fn open_session(&self, actor: &Actor, sample_id: SampleId) -> Result<BatchExecutionSession, LimsError> {
        let sample = self.store.sample(sample_id)?;
        authorize(actor, &sample, Permission::ExecuteAnalysis)?;
        if !sample.status.accepts_results() {
            return Err(TransitionError::SampleLocked {
                sample_id,
                status: sample.status,
            }
            .into());
        }

        let resolved = self.resolver.resolve(&context(&sample))?;
        let mut candidates: Vec<(Analysis, Parameter, Option<Specification>)> = Vec::new();
        for analysis in self.store.analyses_for_sample(sample_id)? {
            if !analysis.status.is_open() {
                continue;
            }
            let spec = resolved
                .get(analysis.parameter_id)
                .or(analysis.specification.as_ref())
                .cloned();
            if spec.is_none() {
                tracing::warn!(analysis = %analysis.id, "no specification; left out of session");
                continue;
            }
            let parameter = self.resolver.parameter(analysis.parameter_id)?;
            candidates.push((analysis, parameter, spec));
        }

        let visible: Vec<ParameterId> = visible_parameters(actor.role, candidates.iter().map(|(_, p, _)| p))
            .into_iter()
            .map(|p| p.id)
            .collect();

        let mut drafts = Vec::new();
        let mut steps = Vec::new();
        for (analysis, parameter, specification) in candidates {
            if !visible.contains(&parameter.id) {
                continue;
            }
            if let Some(draft) = analysis.draft {
                drafts.push((
                    analysis.id,
                    WorkingEntry {
                        raw_value: draft.value.to_string(),
                        equipment_id: draft.equipment_id,
                        method: draft.method,
                        notes: draft.notes.unwrap_or_default(),
                        deviation: draft.deviation,
                    },
                ));
            }
            steps.push(SessionAnalysis {
                analysis_id: analysis.id,
                parameter,
                specification,
            });
        }

        let session = drafts.into_iter().fold(
            BatchExecutionSession::new(sample_id, steps, self.config.default_deviation),
            |session, (id, entry)| session.with_entry(id, entry),
        );
        tracing::debug!(sample = %sample.code, steps = session.total_steps(), "session opened");
        Ok(session)
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn sign(&self, actor: &Actor, password: &str, action: SignedAction) -> Result<SignatureReceipt, LimsError> {
        self.gate.sign(actor, password, action).await
    }

    /// Sign a single result
    ///
    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn commit_result(
        &self,
        actor: &Actor,
        password: &str,
        analysis_id: AnalysisId,
        fields: ResultFields,
    ) -> Result<SignatureReceipt, LimsError> {
        self.sign(actor, password, SignedAction::CommitResult { analysis_id, fields })
            .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn submit_for_review(&self, actor: &Actor, password: &str, sample_id: SampleId) -> Result<SignatureReceipt, LimsError> {
        self.sign(actor, password, SignedAction::SubmitForReview { sample_id })
            .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn approve(
        &self,
        actor: &Actor,
        password: &str,
        sample_id: SampleId,
        reason: Option<&str>,
    ) -> Result<SignatureReceipt, LimsError> {
        self.sign(
            actor,
            password,
            SignedAction::Review {
                sample_id,
                decision: ReviewDecision::Approve,
                reason: reason.map(str::to_string),
            },
        )
        .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn reject(&self, actor: &Actor, password: &str, sample_id: SampleId, reason: &str) -> Result<SignatureReceipt, LimsError> {
        self.sign(
            actor,
            password,
            SignedAction::Review {
                sample_id,
                decision: ReviewDecision::Reject,
                reason: Some(reason.to_string()),
            },
        )
        .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn release(
        &self,
        actor: &Actor,
        password: &str,
        sample_id: SampleId,
        notes: Option<&str>,
    ) -> Result<SignatureReceipt, LimsError> {
        self.sign(
            actor,
            password,
            SignedAction::Release {
                sample_id,
                decision: ReleaseDecision::Release,
                reason: notes.map(str::to_string),
            },
        )
        .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn block_lot(&self, actor: &Actor, password: &str, sample_id: SampleId, reason: &str) -> Result<SignatureReceipt, LimsError> {
        self.sign(
            actor,
            password,
            SignedAction::Release {
                sample_id,
                decision: ReleaseDecision::Block,
                reason: Some(reason.to_string()),
            },
        )
        .await
    }

    /// # Errors
    /// See [`SignatureGate::sign`].
    pub async fn archive(&self, actor: &Actor, password: &str, sample_id: SampleId, reason: &str) -> Result<SignatureReceipt, LimsError> {
        self.sign(
            actor,
            password,
            SignedAction::Archive {
                sample_id,
                reason: Some(reason.to_string()),
            },
        )
        .await
    }

    /// Read model of a sample as seen by `actor`
    ///
    /// # Errors
    /// `NotFound`, `Forbidden` across organizations, catalog failures.
    pub fn dossier(&self, actor: &Actor, sample_id: SampleId) -> Result<SampleDossier, LimsError> {
        let sample = self.store.sample(sample_id)?;
        ensure_scope(actor, &sample)?;
        let analyses = self.store.analyses_for_sample(sample_id)?;
        let mut parameters = HashMap::new();
        for analysis in &analyses {
            if !parameters.contains_key(&analysis.parameter_id) {
                let parameter = self.resolver.parameter(analysis.parameter_id)?;
                parameters.insert(parameter.id, parameter);
            }
        }
        let trail = self.store.audit_trail(sample_id)?;
        Ok(SampleDossier::build(actor.role, sample, &analyses, &parameters, &trail))
    }

    /// Release blockers of a production batch, limited to the actor's
    /// organization
    ///
    /// # Errors
    /// Storage failures.
    pub fn lot_compliance(&self, actor: &Actor, batch_id: BatchId) -> Result<LotCompliance, LimsError> {
        let mut samples = Vec::new();
        for sample in self.store.samples_for_batch(batch_id)? {
            if sample.organization_id != actor.organization_id {
                continue;
            }
            let analyses = self.store.analyses_for_sample(sample.id)?;
            samples.push((sample, analyses));
        }
        Ok(LotCompliance::assess(batch_id, &samples))
    }

    /// Effective specification of `parameter_id` for a sample
    ///
    /// # Errors
    /// `SpecificationNotFound` when nothing applies.
    pub fn effective_specification(&self, sample_id: SampleId, parameter_id: ParameterId) -> Result<Specification, LimsError> {
        let sample = self.store.sample(sample_id)?;
        self.resolver
            .resolve(&context(&sample))?
            .get(parameter_id)
            .cloned()
            .ok_or(LimsError::SpecificationNotFound { parameter_id })
    }

    /// Verify the hash chain of the audit log; returns the event count
    ///
    /// # Errors
    /// `StorageFailure` wrapping the first broken link.
    pub fn verify_audit_chain(&self) -> Result<usize, LimsError> {
        self.store.verify_audit_chain()
    }
}

impl std::fmt::Debug for LabKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabKernel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn context(sample: &Sample) -> ProductContext {
    ProductContext {
        product_id: sample.product_id,
        sample_type_id: sample.sample_type_id,
    }
}
