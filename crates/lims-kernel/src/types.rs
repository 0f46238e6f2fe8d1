//! Core domain types
//!
//! Identifiers, statuses and the two persisted entities: [`Sample`] and
//! [`Analysis`]. Every relation is either an explicit `Option` or an explicit
//! collection.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use lims_conformity::{
    MeasuredValue, ParameterId, ProductId, Role, SampleTypeId, Specification, Verdict,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Wall-clock timestamp, always UTC
pub type Timestamp = DateTime<Utc>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random ID
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Sample identifier
    SampleId
);
uuid_id!(
    /// Analysis (parameter result) identifier
    AnalysisId
);
uuid_id!(
    /// User identifier
    ActorId
);
uuid_id!(
    /// Instrument identifier
    EquipmentId
);
uuid_id!(
    /// Tenant identifier
    OrganizationId
);
uuid_id!(
    /// Plant identifier within an organization
    PlantId
);
uuid_id!(
    /// Production batch (lot) identifier
    BatchId
);
uuid_id!(
    /// Intermediate product identifier
    IntermediateId
);
uuid_id!(
    /// Sampling point identifier
    SamplingPointId
);

/// Audit event identifier (ULID, sortable by creation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl EventId {
    /// Generate new event ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity named in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Sample(SampleId),
    Analysis(AnalysisId),
    Actor(ActorId),
    SampleType(SampleTypeId),
    Batch(BatchId),
    Intermediate(IntermediateId),
    SamplingPoint(SamplingPointId),
    Equipment(EquipmentId),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sample(id) => write!(f, "sample {id}"),
            Self::Analysis(id) => write!(f, "analysis {id}"),
            Self::Actor(id) => write!(f, "actor {id}"),
            Self::SampleType(id) => write!(f, "sample type {id}"),
            Self::Batch(id) => write!(f, "batch {id}"),
            Self::Intermediate(id) => write!(f, "intermediate product {id}"),
            Self::SamplingPoint(id) => write!(f, "sampling point {id}"),
            Self::Equipment(id) => write!(f, "equipment {id}"),
        }
    }
}

/// Sample lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Draft,
    Registered,
    Collected,
    InAnalysis,
    UnderReview,
    Approved,
    Rejected,
    Released,
    Archived,
}

impl SampleStatus {
    /// Snake-case name as persisted
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Registered => "registered",
            Self::Collected => "collected",
            Self::InAnalysis => "in_analysis",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Released => "released",
            Self::Archived => "archived",
        }
    }

    /// Results of a locked sample can no longer be written
    #[inline]
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Released | Self::Archived
        )
    }

    /// Whether analysts may still capture results
    #[inline]
    #[must_use]
    pub const fn accepts_results(self) -> bool {
        matches!(self, Self::Registered | Self::Collected | Self::InAnalysis)
    }

    /// Position along the forward flow, used to tell stale requests from
    /// illegal ones
    #[must_use]
    pub const fn progress(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Registered => 1,
            Self::Collected => 2,
            Self::InAnalysis => 3,
            Self::UnderReview => 4,
            Self::Approved => 5,
            Self::Rejected | Self::Released => 6,
            Self::Archived => 7,
        }
    }
}

impl std::fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-analysis status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Started,
    Completed,
    Reviewed,
    Validated,
    Invalidated,
}

impl AnalysisStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Reviewed => "reviewed",
            Self::Validated => "validated",
            Self::Invalidated => "invalidated",
        }
    }

    /// Result may still be committed
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an out-of-specification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationType {
    /// Product genuinely out of specification
    #[default]
    RealOos,
    LaboratoryError,
    SamplingError,
    Other,
}

/// The person performing an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub organization_id: OrganizationId,
    pub plant_id: PlantId,
    pub role: Role,
}

impl Actor {
    /// Create an actor with a fresh ID
    #[must_use]
    pub fn new(name: impl Into<String>, organization_id: OrganizationId, plant_id: PlantId, role: Role) -> Self {
        Self {
            id: ActorId::new(),
            name: name.into(),
            organization_id,
            plant_id,
            role,
        }
    }
}

/// A physical sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub code: String,
    pub organization_id: OrganizationId,
    pub plant_id: PlantId,
    pub sample_type_id: SampleTypeId,
    /// Product derived at registration from the batch or intermediate link
    pub product_id: Option<ProductId>,
    pub production_batch_id: Option<BatchId>,
    pub intermediate_product_id: Option<IntermediateId>,
    pub sampling_point_id: Option<SamplingPointId>,
    pub collected_at: Option<Timestamp>,
    pub collected_by: Option<ActorId>,
    pub status: SampleStatus,
    pub created_at: Timestamp,
    pub created_by: ActorId,
}

/// Draft fields captured by `RecordResult`, not yet signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDraft {
    pub value: MeasuredValue,
    pub equipment_id: Option<EquipmentId>,
    pub method: Option<String>,
    pub notes: Option<String>,
    pub deviation: Option<DeviationType>,
    pub recorded_by: ActorId,
    pub recorded_at: Timestamp,
}

/// One parameter result of a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: AnalysisId,
    pub sample_id: SampleId,
    pub parameter_id: ParameterId,
    pub status: AnalysisStatus,
    pub value: MeasuredValue,
    pub unit: Option<String>,
    pub equipment_id: Option<EquipmentId>,
    pub method: Option<String>,
    pub analyst_id: Option<ActorId>,
    pub started_at: Option<Timestamp>,
    pub analyzed_at: Option<Timestamp>,
    pub notes: Option<String>,
    pub deviation: Option<DeviationType>,
    pub verdict: Verdict,
    /// Specification effective when the result was captured
    pub specification: Option<Specification>,
    /// Session hash of the signature that committed this result
    pub signature_hash: Option<String>,
    pub is_retest: bool,
    pub supersedes: Option<AnalysisId>,
    pub draft: Option<ResultDraft>,
}

impl Analysis {
    /// New pending analysis for a parameter
    #[must_use]
    pub fn pending(sample_id: SampleId, parameter_id: ParameterId, specification: Option<Specification>) -> Self {
        let unit = specification.as_ref().and_then(|s| s.unit.clone());
        Self {
            id: AnalysisId::new(),
            sample_id,
            parameter_id,
            status: AnalysisStatus::Pending,
            value: MeasuredValue::Missing,
            unit,
            equipment_id: None,
            method: None,
            analyst_id: None,
            started_at: None,
            analyzed_at: None,
            notes: None,
            deviation: None,
            verdict: Verdict::Indeterminate,
            specification,
            signature_hash: None,
            is_retest: false,
            supersedes: None,
            draft: None,
        }
    }

    /// A recorded value exists
    #[inline]
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.value.is_present()
    }

    /// Counts towards completeness: not invalidated and either specified or
    /// already carrying a value
    #[must_use]
    pub fn is_in_scope(&self) -> bool {
        self.status != AnalysisStatus::Invalidated
            && (self.specification.is_some() || self.has_value())
    }

    /// Still waiting for a value against a known specification
    #[must_use]
    pub fn requires_action(&self) -> bool {
        self.is_in_scope() && self.specification.is_some() && !self.has_value()
    }
}
