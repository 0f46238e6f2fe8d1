//! Signature and audit events
//!
//! Append-only, hash-chained: every event stores the hash of its
//! predecessor, so editing or removing any event breaks verification of
//! everything after it.

use crate::error::AuditError;
use crate::types::{
    ActorId, Analysis, AnalysisId, AnalysisStatus, EventId, SampleId, SampleStatus, Timestamp,
};
use lims_conformity::{MeasuredValue, Role, Verdict};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Sample created
    SampleRegistered,
    /// Collection recorded
    SampleCollected,
    /// Analysis moved to `started`
    AnalysisStarted,
    /// Result invalidated and a retest queued
    RetestRequested,
    /// Single result signed
    ResultSigned,
    /// Batch execution session signed
    BatchSignatureCompleted,
    /// Sample handed to review
    SubmittedForReview,
    /// Technical review approved
    ReviewApproved,
    /// Technical review rejected
    ReviewRejected,
    /// Lot released by quality
    LotReleased,
    /// Lot blocked by quality
    LotBlocked,
    /// Sample archived
    SampleArchived,
}

impl AuditAction {
    /// Stable upper-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SampleRegistered => "SAMPLE_REGISTERED",
            Self::SampleCollected => "SAMPLE_COLLECTED",
            Self::AnalysisStarted => "ANALYSIS_STARTED",
            Self::RetestRequested => "RETEST_REQUESTED",
            Self::ResultSigned => "RESULT_SIGNED",
            Self::BatchSignatureCompleted => "BATCH_SIGNATURE_COMPLETED",
            Self::SubmittedForReview => "SUBMITTED_FOR_REVIEW",
            Self::ReviewApproved => "REVIEW_APPROVED",
            Self::ReviewRejected => "REVIEW_REJECTED",
            Self::LotReleased => "LOT_RELEASED",
            Self::LotBlocked => "LOT_BLOCKED",
            Self::SampleArchived => "SAMPLE_ARCHIVED",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of password re-verification for the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialCheck {
    /// Password re-verified for this action
    Verified,
    /// Unsigned action
    NotRequired,
}

/// State of one analysis inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    /// Analysis captured
    pub analysis_id: AnalysisId,
    /// Its status
    pub status: AnalysisStatus,
    /// Its value
    pub value: MeasuredValue,
    /// Its verdict
    pub verdict: Verdict,
}

impl From<&Analysis> for AnalysisSnapshot {
    fn from(a: &Analysis) -> Self {
        Self {
            analysis_id: a.id,
            status: a.status,
            value: a.value.clone(),
            verdict: a.verdict,
        }
    }
}

/// Sample status plus the analyses an action touched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Sample status at capture
    pub sample_status: SampleStatus,
    /// Touched analyses
    pub analyses: Vec<AnalysisSnapshot>,
}

impl Snapshot {
    /// Snapshot of `status` and `analyses`
    pub fn capture<'a>(status: SampleStatus, analyses: impl IntoIterator<Item = &'a Analysis>) -> Self {
        Self {
            sample_status: status,
            analyses: analyses.into_iter().map(AnalysisSnapshot::from).collect(),
        }
    }

    /// Status only
    #[must_use]
    pub fn status(status: SampleStatus) -> Self {
        Self {
            sample_status: status,
            analyses: Vec::new(),
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Time-ordered id
    pub event_id: EventId,
    /// When the action was committed
    pub timestamp: Timestamp,
    /// Who acted
    pub actor_id: ActorId,
    /// Role of the actor at the time
    pub actor_role: Role,
    /// Sample concerned
    pub sample_id: SampleId,
    /// What happened
    pub action: AuditAction,
    /// State before the action
    pub before: Snapshot,
    /// State after the action
    pub after: Snapshot,
    /// Stated reason, if any
    pub reason: Option<String>,
    /// Whether the password was re-verified
    pub credential: CredentialCheck,
    /// Session hash of a signed action
    pub signature_hash: Option<String>,
    /// Hash of the previous event, zero for the first
    pub prev_hash: [u8; 32],
    /// SHA-256 over this event and `prev_hash`
    pub hash: [u8; 32],
}

impl AuditEvent {
    /// New event; the chain hashes are set when it is appended
    #[must_use]
    pub fn new(
        actor_id: ActorId,
        actor_role: Role,
        sample_id: SampleId,
        action: AuditAction,
        before: Snapshot,
        after: Snapshot,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp,
            actor_id,
            actor_role,
            sample_id,
            action,
            before,
            after,
            reason: None,
            credential: CredentialCheck::NotRequired,
            signature_hash: None,
            prev_hash: [0u8; 32],
            hash: [0u8; 32],
        }
    }

    /// With reason
    #[inline]
    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    /// Mark as signed with a verified credential
    #[inline]
    #[must_use]
    pub fn signed(mut self, signature_hash: String) -> Self {
        self.credential = CredentialCheck::Verified;
        self.signature_hash = Some(signature_hash);
        self
    }

    /// Hex form of the chain hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Hash chain of audit events
///
/// Not synchronized on its own; the owning store appends under its write
/// lock so events land atomically with the state they describe.
#[derive(Debug, Default, Clone)]
pub struct AuditChain {
    events: Vec<AuditEvent>,
}

impl AuditChain {
    /// Chain `event` onto the tail without appending it
    ///
    /// # Errors
    /// [`AuditError::Encoding`] when snapshots cannot be encoded.
    pub fn seal(&self, tail: Option<&AuditEvent>, mut event: AuditEvent) -> Result<AuditEvent, AuditError> {
        let prev_hash = tail
            .or_else(|| self.events.last())
            .map_or([0u8; 32], |e| e.hash);
        event.prev_hash = prev_hash;
        event.hash = compute_hash(&event)?;
        Ok(event)
    }

    /// Append events previously sealed against this chain
    pub fn extend_sealed(&mut self, events: impl IntoIterator<Item = AuditEvent>) {
        self.events.extend(events);
    }

    /// Seal and append a single event
    ///
    /// # Errors
    /// See [`AuditChain::seal`].
    pub fn append(&mut self, event: AuditEvent) -> Result<EventId, AuditError> {
        let sealed = self.seal(None, event)?;
        let id = sealed.event_id;
        self.events.push(sealed);
        Ok(id)
    }

    /// Events in append order
    #[must_use]
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Most recent event
    #[must_use]
    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// No events yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Verify the whole chain
    ///
    /// # Errors
    /// See [`verify_chain`].
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.events)
    }
}

/// Verify a complete chain starting from the genesis event
///
/// # Errors
/// [`AuditError::IntegrityViolation`] with the position of the first event
/// whose link or content hash does not match.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), AuditError> {
    let mut prev = [0u8; 32];
    for (i, e) in events.iter().enumerate() {
        if e.prev_hash != prev {
            return Err(AuditError::IntegrityViolation(i));
        }
        let expected = compute_hash(e)?;
        if e.hash != expected {
            return Err(AuditError::IntegrityViolation(i));
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(event: &AuditEvent) -> Result<[u8; 32], AuditError> {
    let snapshots = serde_json::to_vec(&(&event.before, &event.after))
        .map_err(|e| AuditError::Encoding(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(event.event_id.0.to_bytes());
    hasher.update(event.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(event.actor_id.0.as_bytes());
    hasher.update(event.actor_role.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(event.sample_id.0.as_bytes());
    hasher.update(event.action.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(&snapshots);
    hasher.update([0]);
    hasher.update(event.reason.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update([u8::from(event.credential == CredentialCheck::Verified)]);
    hasher.update(event.signature_hash.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(event.prev_hash);
    Ok(hasher.finalize().into())
}
