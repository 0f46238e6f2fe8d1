//! Batch execution session
//!
//! Step-by-step capture of every open analysis of one sample, followed by a
//! single signature. The working buffer lives only in the session; nothing
//! reaches the store until [`BatchExecutionSession::finalize`] succeeds.

use crate::analysis::ResultFields;
use crate::error::{Field, LimsError, SessionError, ValidationReport};
use crate::signature::{BatchEntry, SignatureGate, SignatureReceipt, SignedAction};
use crate::types::{Actor, AnalysisId, DeviationType, EquipmentId, SampleId};
use indexmap::IndexMap;
use lims_conformity::{evaluate, sanitize_input, MeasuredValue, Parameter, Specification, Verdict};
use serde::{Deserialize, Serialize};

/// One analysis to execute, with its effective specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnalysis {
    /// Analysis row the step writes
    pub analysis_id: AnalysisId,
    /// Measured parameter
    pub parameter: Parameter,
    /// Limits used for the live verdict
    pub specification: Option<Specification>,
}

/// Unsigned fields of one analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingEntry {
    /// Sanitized operator input
    pub raw_value: String,
    /// Instrument used
    pub equipment_id: Option<EquipmentId>,
    /// Method reference, if any
    pub method: Option<String>,
    /// Operator notes; the justification of an OOS result
    pub notes: String,
    /// Deviation class of an OOS result
    pub deviation: Option<DeviationType>,
}

impl WorkingEntry {
    /// Parsed value of the raw input
    #[must_use]
    pub fn value(&self) -> MeasuredValue {
        MeasuredValue::parse(&self.raw_value)
    }

    /// Value and instrument are both present
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.value().is_present() && self.equipment_id.is_some()
    }

    fn has_notes(&self) -> bool {
        !self.notes.trim().is_empty()
    }

    fn to_fields(&self) -> ResultFields {
        ResultFields {
            value: self.value(),
            equipment_id: self.equipment_id,
            method: self.method.clone(),
            notes: self.has_notes().then(|| self.notes.trim().to_string()),
            deviation: self.deviation,
            claimed_conforming: None,
        }
    }
}

/// Whether the session has anything to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// At least one analysis to execute
    Collecting,
    /// No applicable analyses; the session opens at the signature step
    NothingToExecute,
}

/// Result of trying to move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Moved to the next analysis
    Moved {
        /// Zero-based step now current
        step: usize,
    },
    /// Every analysis captured; ready to sign
    AtSignature,
    /// Out of specification with no notes; supply a justification first
    JustificationRequired {
        /// Out-of-specification analysis
        analysis_id: AnalysisId,
    },
}

/// Transient execution session for one sample
#[derive(Debug, Clone)]
pub struct BatchExecutionSession {
    sample_id: SampleId,
    analyses: Vec<SessionAnalysis>,
    buffer: IndexMap<AnalysisId, WorkingEntry>,
    step: usize,
    default_deviation: DeviationType,
}

impl BatchExecutionSession {
    /// Session over `analyses`, in execution order
    #[must_use]
    pub fn new(sample_id: SampleId, analyses: Vec<SessionAnalysis>, default_deviation: DeviationType) -> Self {
        let buffer = analyses
            .iter()
            .map(|a| (a.analysis_id, WorkingEntry::default()))
            .collect();
        Self {
            sample_id,
            analyses,
            buffer,
            step: 0,
            default_deviation,
        }
    }

    /// Seed the buffer, e.g. from a saved draft
    #[must_use]
    pub fn with_entry(mut self, analysis_id: AnalysisId, entry: WorkingEntry) -> Self {
        if let Some(slot) = self.buffer.get_mut(&analysis_id) {
            *slot = entry;
        }
        self
    }

    /// Sample under execution
    #[must_use]
    pub fn sample_id(&self) -> SampleId {
        self.sample_id
    }

    /// Steps in execution order
    #[must_use]
    pub fn analyses(&self) -> &[SessionAnalysis] {
        &self.analyses
    }

    /// Analyses plus the signature step
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.analyses.len() + 1
    }

    /// Zero-based step pointer
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Pointer is past the last analysis
    #[must_use]
    pub fn is_at_signature(&self) -> bool {
        self.step == self.analyses.len()
    }

    /// Collecting, or nothing to execute
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.analyses.is_empty() {
            SessionState::NothingToExecute
        } else {
            SessionState::Collecting
        }
    }

    /// Analysis of the current step, `None` at the signature step
    #[must_use]
    pub fn current(&self) -> Option<&SessionAnalysis> {
        self.analyses.get(self.step)
    }

    /// Buffered fields of one analysis
    #[must_use]
    pub fn entry(&self, analysis_id: AnalysisId) -> Option<&WorkingEntry> {
        self.buffer.get(&analysis_id)
    }

    fn entry_mut(&mut self, analysis_id: AnalysisId) -> Result<&mut WorkingEntry, SessionError> {
        self.buffer
            .get_mut(&analysis_id)
            .ok_or(SessionError::UnknownAnalysis(analysis_id))
    }

    fn specification(&self, analysis_id: AnalysisId) -> Option<&Specification> {
        self.analyses
            .iter()
            .find(|a| a.analysis_id == analysis_id)
            .and_then(|a| a.specification.as_ref())
    }

    /// Set the value from raw operator input
    ///
    /// # Errors
    /// [`SessionError::Input`] for input such as `7.5.1`.
    pub fn set_value(&mut self, analysis_id: AnalysisId, raw: &str) -> Result<(), SessionError> {
        let clean = sanitize_input(raw)?;
        self.entry_mut(analysis_id)?.raw_value = clean;
        Ok(())
    }

    /// Set the instrument
    ///
    /// # Errors
    /// [`SessionError::UnknownAnalysis`].
    pub fn set_equipment(&mut self, analysis_id: AnalysisId, equipment_id: EquipmentId) -> Result<(), SessionError> {
        self.entry_mut(analysis_id)?.equipment_id = Some(equipment_id);
        Ok(())
    }

    /// Set the method reference
    ///
    /// # Errors
    /// [`SessionError::UnknownAnalysis`].
    pub fn set_method(&mut self, analysis_id: AnalysisId, method: impl Into<String>) -> Result<(), SessionError> {
        self.entry_mut(analysis_id)?.method = Some(method.into());
        Ok(())
    }

    /// Replace the notes
    ///
    /// # Errors
    /// [`SessionError::UnknownAnalysis`].
    pub fn set_notes(&mut self, analysis_id: AnalysisId, notes: impl Into<String>) -> Result<(), SessionError> {
        self.entry_mut(analysis_id)?.notes = notes.into();
        Ok(())
    }

    /// Classify the deviation
    ///
    /// # Errors
    /// [`SessionError::UnknownAnalysis`].
    pub fn set_deviation(&mut self, analysis_id: AnalysisId, deviation: DeviationType) -> Result<(), SessionError> {
        self.entry_mut(analysis_id)?.deviation = Some(deviation);
        Ok(())
    }

    /// Live verdict of the buffered value
    ///
    /// # Errors
    /// [`SessionError::UnknownAnalysis`].
    pub fn verdict(&self, analysis_id: AnalysisId) -> Result<Verdict, SessionError> {
        let entry = self
            .buffer
            .get(&analysis_id)
            .ok_or(SessionError::UnknownAnalysis(analysis_id))?;
        Ok(evaluate(&entry.value(), self.specification(analysis_id)))
    }

    fn check_entry(&self, analysis_id: AnalysisId, entry: &WorkingEntry, report: &mut ValidationReport) {
        let id = Some(analysis_id);
        if !entry.value().is_present() {
            report.push(id, Field::Value, "value required");
        }
        if entry.equipment_id.is_none() {
            report.push(id, Field::Equipment, "instrument required");
        }
    }

    /// Move to the next step
    ///
    /// # Errors
    /// `ValidationFailed` when the current entry lacks value or instrument,
    /// [`SessionError::AtSignatureStep`] at the end.
    pub fn advance(&mut self) -> Result<AdvanceOutcome, LimsError> {
        let Some(current) = self.current() else {
            return Err(SessionError::AtSignatureStep.into());
        };
        let analysis_id = current.analysis_id;
        let entry = self
            .buffer
            .get(&analysis_id)
            .ok_or(SessionError::UnknownAnalysis(analysis_id))?;

        let mut report = ValidationReport::new();
        self.check_entry(analysis_id, entry, &mut report);
        report.into_result()?;

        if self.verdict(analysis_id)?.is_fail() && !entry.has_notes() {
            return Ok(AdvanceOutcome::JustificationRequired { analysis_id });
        }

        self.step += 1;
        Ok(if self.is_at_signature() {
            AdvanceOutcome::AtSignature
        } else {
            AdvanceOutcome::Moved { step: self.step }
        })
    }

    /// Justify the current out-of-specification result and advance
    ///
    /// # Errors
    /// `ValidationFailed` for a blank reason,
    /// [`SessionError::NoJustificationNeeded`] when the result conforms.
    pub fn supply_oos_justification(&mut self, reason: &str) -> Result<AdvanceOutcome, LimsError> {
        let Some(current) = self.current() else {
            return Err(SessionError::AtSignatureStep.into());
        };
        let analysis_id = current.analysis_id;
        if !self.verdict(analysis_id)?.is_fail() {
            return Err(SessionError::NoJustificationNeeded.into());
        }
        let reason = reason.trim();
        if reason.is_empty() {
            let mut report = ValidationReport::new();
            report.push(Some(analysis_id), Field::Notes, "justification required");
            return Err(LimsError::ValidationFailed(report));
        }

        let default_deviation = self.default_deviation;
        let entry = self.entry_mut(analysis_id)?;
        entry.notes = reason.to_string();
        entry.deviation.get_or_insert(default_deviation);
        self.advance()
    }

    /// Step back; from the signature step into the last analysis
    ///
    /// # Errors
    /// [`SessionError::AtFirstStep`].
    pub fn retreat(&mut self) -> Result<usize, SessionError> {
        if self.step == 0 {
            return Err(SessionError::AtFirstStep);
        }
        self.step -= 1;
        Ok(self.step)
    }

    /// Every buffered result, in execution order
    #[must_use]
    pub fn payload(&self) -> Vec<BatchEntry> {
        self.buffer
            .iter()
            .map(|(id, entry)| BatchEntry {
                analysis_id: *id,
                fields: entry.to_fields(),
            })
            .collect()
    }

    /// Check every entry, as finalize does
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();
        for (id, entry) in &self.buffer {
            self.check_entry(*id, entry, &mut report);
            let oos = evaluate(&entry.value(), self.specification(*id)).is_fail();
            if oos && !entry.has_notes() {
                report.push(Some(*id), Field::Notes, "justification required for out-of-specification result");
            }
        }
        report
    }

    /// Sign the whole buffer as one atomic commit
    ///
    /// The session is consumed on success and handed back inside the error
    /// otherwise, so the operator can correct it and try again.
    ///
    /// # Errors
    /// [`FinalizeError`] wrapping the session and the cause.
    pub async fn finalize(self, gate: &SignatureGate, actor: &Actor, password: &str) -> Result<SignatureReceipt, FinalizeError> {
        if !self.is_at_signature() {
            return Err(self.fail(SessionError::NotAtSignatureStep.into()));
        }
        let report = self.validate();
        if !report.is_empty() {
            return Err(self.fail(LimsError::ValidationFailed(report)));
        }

        let action = SignedAction::CommitBatch {
            sample_id: self.sample_id,
            entries: self.payload(),
        };
        match gate.sign(actor, password, action).await {
            Ok(receipt) => Ok(receipt),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(self, error: LimsError) -> FinalizeError {
        FinalizeError {
            session: Box::new(self),
            error,
        }
    }
}

/// Failed finalize; the session is returned intact
#[derive(Debug, thiserror::Error)]
#[error("finalize failed: {error}")]
pub struct FinalizeError {
    /// The session, unchanged
    pub session: Box<BatchExecutionSession>,
    /// Why finalize failed
    #[source]
    pub error: LimsError,
}

impl FinalizeError {
    /// Split into the session and the cause
    #[must_use]
    pub fn into_parts(self) -> (BatchExecutionSession, LimsError) {
        (*self.session, self.error)
    }
}
