//! Persistence contracts
//!
//! Writes are never issued one by one. Callers describe everything an action
//! changes in a [`UnitOfWork`] and the store applies it atomically, checking
//! every optimistic precondition first.

mod memory;

pub use memory::MemoryStore;

use crate::audit::AuditEvent;
use crate::error::LimsError;
use crate::types::{
    ActorId, Analysis, AnalysisId, AnalysisStatus, BatchId, EventId, Sample, SampleId, SampleStatus, Timestamp,
};

/// Rewrite of an existing analysis, guarded by the status the caller read
#[derive(Debug, Clone)]
pub struct AnalysisWrite {
    /// New row
    pub analysis: Analysis,
    /// Status the row must still have
    pub expected_status: AnalysisStatus,
}

/// Sample status change, guarded by the expected prior status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Sample to move
    pub sample_id: SampleId,
    /// Status it must still have
    pub from: SampleStatus,
    /// Status after the commit
    pub to: SampleStatus,
    /// Collection time and collector, set when recording a collection
    pub collected: Option<(Timestamp, ActorId)>,
}

/// Sample status that must still hold at commit time, with no change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGuard {
    /// Sample to check
    pub sample_id: SampleId,
    /// Status it must still have
    pub expected_status: SampleStatus,
}

/// Everything one action writes
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    /// Samples to insert
    pub new_samples: Vec<Sample>,
    /// Analyses to insert
    pub new_analyses: Vec<Analysis>,
    /// Guarded analysis rewrites
    pub analysis_writes: Vec<AnalysisWrite>,
    /// Guarded sample moves
    pub status_changes: Vec<StatusChange>,
    /// Sample statuses that must hold without a move
    pub sample_guards: Vec<SampleGuard>,
    /// Events appended to the chain
    pub audit_events: Vec<AuditEvent>,
}

impl UnitOfWork {
    /// Empty unit of work
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly registered sample
    pub fn insert_sample(&mut self, sample: Sample) -> &mut Self {
        self.new_samples.push(sample);
        self
    }

    /// Insert a new analysis row
    pub fn insert_analysis(&mut self, analysis: Analysis) -> &mut Self {
        self.new_analyses.push(analysis);
        self
    }

    /// `PersistAnalysis`: overwrite an analysis if its status is still `expected_status`
    pub fn persist_analysis(&mut self, analysis: Analysis, expected_status: AnalysisStatus) -> &mut Self {
        self.analysis_writes.push(AnalysisWrite {
            analysis,
            expected_status,
        });
        self
    }

    /// `PersistSampleStatus`: move a sample from `from` to `to`
    pub fn persist_sample_status(&mut self, sample_id: SampleId, from: SampleStatus, to: SampleStatus) -> &mut Self {
        self.status_changes.push(StatusChange {
            sample_id,
            from,
            to,
            collected: None,
        });
        self
    }

    /// Require the sample to still be in `status` without moving it
    ///
    /// Writes that touch only analyses add this so a concurrent lifecycle
    /// move of the owning sample is detected.
    pub fn expect_sample_status(&mut self, sample_id: SampleId, status: SampleStatus) -> &mut Self {
        self.sample_guards.push(SampleGuard {
            sample_id,
            expected_status: status,
        });
        self
    }

    /// Move a sample to `collected`, stamping when and by whom
    pub fn record_collection(
        &mut self,
        sample_id: SampleId,
        from: SampleStatus,
        at: Timestamp,
        by: ActorId,
    ) -> &mut Self {
        self.status_changes.push(StatusChange {
            sample_id,
            from,
            to: SampleStatus::Collected,
            collected: Some((at, by)),
        });
        self
    }

    /// `AppendAuditEvent`
    pub fn append_audit_event(&mut self, event: AuditEvent) -> &mut Self {
        self.audit_events.push(event);
        self
    }

    /// Nothing to write
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_samples.is_empty()
            && self.new_analyses.is_empty()
            && self.analysis_writes.is_empty()
            && self.status_changes.is_empty()
            && self.sample_guards.is_empty()
            && self.audit_events.is_empty()
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Ids of the appended audit events
    pub events: Vec<EventId>,
    /// Commit time
    pub committed_at: Timestamp,
}

/// Authoritative storage of samples, analyses and the audit trail
///
/// Adapters normalize whatever shape their backend returns into these
/// explicit types; optional relations come back as `Option`, collections as
/// `Vec`.
pub trait LabStore: Send + Sync {
    /// Load a sample
    ///
    /// # Errors
    /// `NotFound` or `StorageFailure`.
    fn sample(&self, id: SampleId) -> Result<Sample, LimsError>;

    /// Look up a sample by its human-readable code
    fn sample_by_code(&self, code: &str) -> Result<Option<Sample>, LimsError>;

    /// Samples taken from a production batch
    fn samples_for_batch(&self, batch_id: BatchId) -> Result<Vec<Sample>, LimsError>;

    /// Analyses of a sample in creation order
    fn analyses_for_sample(&self, sample_id: SampleId) -> Result<Vec<Analysis>, LimsError>;

    /// Load an analysis
    fn analysis(&self, id: AnalysisId) -> Result<Analysis, LimsError>;

    /// Audit events of a sample, oldest first
    fn audit_trail(&self, sample_id: SampleId) -> Result<Vec<AuditEvent>, LimsError>;

    /// Apply a unit of work atomically
    ///
    /// # Errors
    /// `ConcurrentModification` when any precondition no longer holds,
    /// `StorageFailure` on backend errors. Nothing is applied in either case.
    fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, LimsError>;

    /// Verify the hash chain of the full audit log
    fn verify_audit_chain(&self) -> Result<usize, LimsError>;
}
