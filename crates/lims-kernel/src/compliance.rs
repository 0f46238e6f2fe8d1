//! Lot compliance
//!
//! Whether every sample of a production batch has been signed off and is
//! free of out-of-specification results.

use crate::types::{Analysis, AnalysisId, AnalysisStatus, BatchId, Sample, SampleId, SampleStatus};
use lims_conformity::ParameterId;
use serde::{Deserialize, Serialize};

/// Reason a lot cannot be released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Blocker {
    /// The batch has no samples at all
    NoSamples,
    /// Sample still in the workflow
    SampleNotReleased {
        /// Open sample
        sample_id: SampleId,
        /// Its code
        code: String,
        /// Where it is in the workflow
        status: SampleStatus,
    },
    /// A valid result is out of specification
    OutOfSpecification {
        /// Sample holding the result
        sample_id: SampleId,
        /// Failing analysis
        analysis_id: AnalysisId,
        /// Its parameter
        parameter_id: ParameterId,
    },
}

/// Compliance of one production batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotCompliance {
    /// Batch assessed
    pub batch_id: BatchId,
    /// Samples taken from it
    pub samples: Vec<SampleId>,
    /// Everything preventing release
    pub blockers: Vec<Blocker>,
}

impl LotCompliance {
    /// Assess a batch from its samples and their analyses
    #[must_use]
    pub fn assess(batch_id: BatchId, samples: &[(Sample, Vec<Analysis>)]) -> Self {
        let mut blockers = Vec::new();
        if samples.is_empty() {
            blockers.push(Blocker::NoSamples);
        }
        for (sample, analyses) in samples {
            let settled = matches!(
                sample.status,
                SampleStatus::Released | SampleStatus::Rejected | SampleStatus::Archived
            );
            if !settled {
                blockers.push(Blocker::SampleNotReleased {
                    sample_id: sample.id,
                    code: sample.code.clone(),
                    status: sample.status,
                });
            }
            blockers.extend(
                analyses
                    .iter()
                    .filter(|a| a.status != AnalysisStatus::Invalidated && a.verdict.is_fail())
                    .map(|a| Blocker::OutOfSpecification {
                        sample_id: sample.id,
                        analysis_id: a.id,
                        parameter_id: a.parameter_id,
                    }),
            );
        }
        Self {
            batch_id,
            samples: samples.iter().map(|(s, _)| s.id).collect(),
            blockers,
        }
    }

    /// Nothing blocks release
    #[must_use]
    pub fn is_releasable(&self) -> bool {
        self.blockers.is_empty()
    }
}
