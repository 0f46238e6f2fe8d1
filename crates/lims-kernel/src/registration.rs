//! Sample registration
//!
//! Creates the sample, derives its product, generates the sample code and
//! queues one pending analysis per applicable parameter.

use crate::access::{authorize, require};
use crate::audit::{AuditAction, AuditEvent, Snapshot};
use crate::error::{Field, LimsError};
use crate::lifecycle::{self, Trigger};
use crate::master::MasterData;
use crate::store::{LabStore, UnitOfWork};
use crate::types::{
    Actor, ActorId, Analysis, BatchId, EntityRef, IntermediateId, PlantId, Sample, SampleId,
    SampleStatus, SamplingPointId, Timestamp,
};
use lims_conformity::{
    IntermediateLink, Permission, ProductContext, ProductLinkage, SampleTypeId,
    SpecificationResolver, FINISHED_PRODUCT_PREFIX, INTERMEDIATE_PRODUCT_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSample {
    /// Sample type; drives the code and the analysis queue
    pub sample_type_id: SampleTypeId,
    /// Production batch, required for finished product
    pub production_batch_id: Option<BatchId>,
    /// Intermediate product, required for intermediates
    pub intermediate_product_id: Option<IntermediateId>,
    /// Where the sample was drawn
    pub sampling_point_id: Option<SamplingPointId>,
    /// Registering an already collected sample skips `registered`
    pub collected_at: Option<Timestamp>,
    /// Collector; defaults to the registering actor
    pub collected_by: Option<ActorId>,
    /// Defaults to the registering actor's plant
    pub plant_id: Option<PlantId>,
}

impl RegisterSample {
    /// Request for a sample of `sample_type_id`
    #[must_use]
    pub fn new(sample_type_id: SampleTypeId) -> Self {
        Self {
            sample_type_id,
            production_batch_id: None,
            intermediate_product_id: None,
            sampling_point_id: None,
            collected_at: None,
            collected_by: None,
            plant_id: None,
        }
    }

    /// With production batch
    #[must_use]
    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.production_batch_id = Some(batch_id);
        self
    }

    /// With intermediate product
    #[must_use]
    pub fn with_intermediate(mut self, intermediate_id: IntermediateId) -> Self {
        self.intermediate_product_id = Some(intermediate_id);
        self
    }

    /// With sampling point
    #[must_use]
    pub fn with_sampling_point(mut self, sampling_point_id: SamplingPointId) -> Self {
        self.sampling_point_id = Some(sampling_point_id);
        self
    }

    /// Already collected at `at` by `by`
    #[must_use]
    pub fn collected(mut self, at: Timestamp, by: ActorId) -> Self {
        self.collected_at = Some(at);
        self.collected_by = Some(by);
        self
    }

    /// At another plant of the organization
    #[must_use]
    pub fn at_plant(mut self, plant_id: PlantId) -> Self {
        self.plant_id = Some(plant_id);
        self
    }
}

/// A registered sample with its analysis queue
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// Persisted sample
    pub sample: Sample,
    /// Queued analyses, one per applicable parameter
    pub analyses: Vec<Analysis>,
}

/// Code prefix when neither product nor sampling point is known
const NO_SKU: &str = "NOSKU";
/// Code prefix when the sampling point has no code
const NO_SAMPLING_POINT: &str = "NOSP";

/// Base sample code, e.g. `SKU1-FP-20260314-0930`
#[must_use]
pub fn sample_code(prefix: &str, type_code: &str, at: Timestamp) -> String {
    format!("{prefix}-{type_code}-{}", at.format("%Y%m%d-%H%M"))
}

/// Registers samples
#[derive(Clone)]
pub struct SampleRegistrar {
    store: Arc<dyn LabStore>,
    master: Arc<dyn MasterData>,
    resolver: SpecificationResolver,
}

impl SampleRegistrar {
    /// Registrar over the given collaborators
    #[must_use]
    pub fn new(store: Arc<dyn LabStore>, master: Arc<dyn MasterData>, resolver: SpecificationResolver) -> Self {
        Self { store, master, resolver }
    }

    /// `RegisterSample`
    ///
    /// # Errors
    /// `ValidationFailed` when a finished or intermediate product sample has
    /// no batch or intermediate link, `NotFound` for unknown master data.
    #[tracing::instrument(skip(self, actor, request), fields(actor = %actor.id))]
    pub fn register(&self, actor: &Actor, request: RegisterSample, now: Timestamp) -> Result<Registration, LimsError> {
        require(actor, Permission::RegisterSample)?;

        let sample_type = self
            .master
            .sample_type(request.sample_type_id)?
            .ok_or(LimsError::NotFound(EntityRef::SampleType(request.sample_type_id)))?;
        let type_code = sample_type.code.trim().to_ascii_uppercase();

        let batch = match request.production_batch_id {
            Some(id) => Some(self.master.batch(id)?.ok_or(LimsError::NotFound(EntityRef::Batch(id)))?),
            None => None,
        };
        let intermediate = match request.intermediate_product_id {
            Some(id) => Some(
                self.master
                    .intermediate(id)?
                    .ok_or(LimsError::NotFound(EntityRef::Intermediate(id)))?,
            ),
            None => None,
        };
        let sampling_point = match request.sampling_point_id {
            Some(id) => Some(
                self.master
                    .sampling_point(id)?
                    .ok_or(LimsError::NotFound(EntityRef::SamplingPoint(id)))?,
            ),
            None => None,
        };

        let needs_link =
            type_code.starts_with(FINISHED_PRODUCT_PREFIX) || type_code.starts_with(INTERMEDIATE_PRODUCT_PREFIX);
        if needs_link && batch.is_none() && intermediate.is_none() {
            return Err(LimsError::invalid(
                Field::SampleLink,
                format!("{type_code} samples must be linked to a production batch or intermediate product"),
            ));
        }

        let intermediate_link = match &intermediate {
            Some(ip) => {
                let batch_product_id = match ip.batch_id {
                    Some(batch_id) => self.master.batch(batch_id)?.map(|b| b.product_id),
                    None => None,
                };
                Some(IntermediateLink {
                    product_id: ip.product_id,
                    batch_product_id,
                })
            }
            None => None,
        };
        let linkage = ProductLinkage {
            sample_type_code: type_code.clone(),
            batch_product_id: batch.as_ref().map(|b| b.product_id),
            intermediate: intermediate_link,
        };
        let product_id = linkage.product();

        let prefix = match (product_id, &sampling_point) {
            (Some(id), _) => self
                .master
                .product(id)?
                .map_or_else(|| NO_SKU.to_string(), |p| p.sku),
            (None, Some(sp)) if !sp.code.trim().is_empty() => sp.code.clone(),
            (None, Some(_)) => NO_SAMPLING_POINT.to_string(),
            (None, None) => NO_SKU.to_string(),
        };
        let code = self.unique_code(&sample_code(&prefix, &type_code, request.collected_at.unwrap_or(now)))?;

        let status = if request.collected_at.is_some() {
            SampleStatus::Collected
        } else {
            SampleStatus::Registered
        };
        let mut path = vec![SampleStatus::Draft, Trigger::RegistrationCompleted.target()];
        if status == SampleStatus::Collected {
            path.push(SampleStatus::Collected);
        }
        lifecycle::validate_path(&path)?;

        let sample = Sample {
            id: SampleId::new(),
            code,
            organization_id: actor.organization_id,
            plant_id: request.plant_id.unwrap_or(actor.plant_id),
            sample_type_id: sample_type.id,
            product_id,
            production_batch_id: request.production_batch_id,
            intermediate_product_id: request.intermediate_product_id,
            sampling_point_id: request.sampling_point_id,
            collected_at: request.collected_at,
            collected_by: request
                .collected_at
                .map(|_| request.collected_by.unwrap_or(actor.id)),
            status,
            created_at: now,
            created_by: actor.id,
        };

        let resolved = self.resolver.resolve(&ProductContext {
            product_id,
            sample_type_id: sample_type.id,
        })?;
        let mut queue = Vec::with_capacity(resolved.len());
        for (parameter_id, spec) in resolved.iter() {
            let parameter = self.resolver.parameter(*parameter_id)?;
            if sample_type.test_category.includes(parameter.category) {
                queue.push((parameter.code, Analysis::pending(sample.id, *parameter_id, Some(spec.clone()))));
            }
        }
        queue.sort_by(|a, b| a.0.cmp(&b.0));
        let analyses: Vec<Analysis> = queue.into_iter().map(|(_, a)| a).collect();

        let mut work = UnitOfWork::new();
        work.insert_sample(sample.clone());
        for analysis in &analyses {
            work.insert_analysis(analysis.clone());
        }
        work.append_audit_event(AuditEvent::new(
            actor.id,
            actor.role,
            sample.id,
            AuditAction::SampleRegistered,
            Snapshot::status(SampleStatus::Draft),
            Snapshot::capture(status, &analyses),
            now,
        ));
        self.store.commit(work)?;

        tracing::info!(
            sample = %sample.code,
            status = %status,
            analyses = analyses.len(),
            "sample registered"
        );
        Ok(Registration { sample, analyses })
    }

    fn unique_code(&self, base: &str) -> Result<String, LimsError> {
        if self.store.sample_by_code(base)?.is_none() {
            return Ok(base.to_string());
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}-{n}");
            if self.store.sample_by_code(&candidate)?.is_none() {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// `MarkCollected`: `registered -> collected`, unsigned
    ///
    /// # Errors
    /// `IllegalTransition` unless the sample is `registered`.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub fn mark_collected(
        &self,
        actor: &Actor,
        sample_id: SampleId,
        at: Timestamp,
        collector: Option<ActorId>,
    ) -> Result<Sample, LimsError> {
        let sample = self.store.sample(sample_id)?;
        authorize(actor, &sample, Permission::RegisterSample)?;
        let planned = lifecycle::plan(&sample, Trigger::CollectionRecorded, &[])?;
        let collector = collector.unwrap_or(actor.id);

        let mut work = UnitOfWork::new();
        work.record_collection(sample.id, planned.from, at, collector)
            .append_audit_event(AuditEvent::new(
                actor.id,
                actor.role,
                sample.id,
                AuditAction::SampleCollected,
                Snapshot::status(planned.from),
                Snapshot::status(planned.to),
                at,
            ));
        self.store.commit(work)?;
        tracing::info!(sample = %sample.code, "sample collected");

        let mut collected = sample;
        collected.status = planned.to;
        collected.collected_at = Some(at);
        collected.collected_by = Some(collector);
        Ok(collected)
    }
}

impl std::fmt::Debug for SampleRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRegistrar").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sample_code_format() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 0).unwrap();
        assert_eq!(sample_code("SKU1", "FP", at), "SKU1-FP-20260314-0905");
    }
}
