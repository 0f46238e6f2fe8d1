//! Testing utilities for the LIMS workspace
//!
//! A seeded kernel over in-memory collaborators, plus credential verifier
//! and notifier doubles.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::Utc;
use lims_conformity::{
    InMemoryCatalog, MeasuredValue, Parameter, ParameterCategory, ParameterId, ProductId, Role,
    SampleTypeId, Specification, TestCategory,
};
use lims_kernel::master::InMemoryMasterData;
use lims_kernel::notify::NotifyError;
use lims_kernel::signature::BatchEntry;
use lims_kernel::{
    Actor, ActorId, AnalysisId, BatchId, CredentialVerifier, EngineConfig, EquipmentId,
    InMemoryCredentials, LabKernel, MemoryStore, Notification, Notifier, OrganizationId, PlantId,
    RegisterSample, Registration, ResultFields, SignedAction, VerifierError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Password of every fixture actor
pub const PASSWORD: &str = "correct horse battery";

/// Kernel seeded with a small juice plant
///
/// Finished product sample type `FP` (all disciplines) for product `OJ1L`,
/// batch `L-001`, with three specifications:
/// - pH 6 - 8 (product specific)
/// - Brix 10 - 12 (global)
/// - E. coli `Absent` (global, microbiological)
pub struct Fixture {
    pub kernel: LabKernel,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub master: Arc<InMemoryMasterData>,
    pub credentials: Arc<InMemoryCredentials>,
    pub org: OrganizationId,
    pub plant: PlantId,
    pub analyst: Actor,
    pub micro_analyst: Actor,
    pub supervisor: Actor,
    pub manager: Actor,
    pub outsider: Actor,
    pub ph: ParameterId,
    pub brix: ParameterId,
    pub ecoli: ParameterId,
    pub finished: SampleTypeId,
    pub raw_material: SampleTypeId,
    pub product: ProductId,
    pub batch: BatchId,
    pub ph_meter: EquipmentId,
    pub refractometer: EquipmentId,
    pub incubator: EquipmentId,
    pub retired_meter: EquipmentId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Fixture whose gate uses `verifier` instead of the password store
    pub fn with_verifier(config: EngineConfig, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self::build(config, Some(verifier))
    }

    fn build(config: EngineConfig, verifier: Option<Arc<dyn CredentialVerifier>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let master = Arc::new(InMemoryMasterData::new());
        let credentials = Arc::new(InMemoryCredentials::new());

        let ph = catalog.insert_parameter(
            Parameter::new("PH", "pH", ParameterCategory::PhysicoChemical).with_unit("pH"),
        );
        let brix = catalog.insert_parameter(
            Parameter::new("BRIX", "Brix", ParameterCategory::PhysicoChemical).with_unit("°Bx"),
        );
        let ecoli = catalog.insert_parameter(Parameter::new(
            "ECOLI",
            "Escherichia coli",
            ParameterCategory::Microbiological,
        ));

        let finished = master.add_sample_type("FP", "Finished product", TestCategory::Both);
        let raw_material = master.add_sample_type("MP", "Raw material", TestCategory::PhysicoChemical);
        let product = master.add_product("OJ1L", "Orange juice 1 L");
        let batch = master.add_batch("L-001", product);
        let ph_meter = master.add_equipment("PH-01", "pH meter", true);
        let refractometer = master.add_equipment("RF-01", "Refractometer", true);
        let incubator = master.add_equipment("INC-01", "Incubator", true);
        let retired_meter = master.add_equipment("PH-00", "Retired pH meter", false);

        catalog.insert_specification(
            Specification::for_product(ph, product, Some(finished))
                .with_range(Some(6.0), Some(8.0))
                .with_unit("pH"),
        );
        catalog.insert_specification(
            Specification::global(brix, finished)
                .with_range(Some(10.0), Some(12.0))
                .with_unit("°Bx"),
        );
        catalog.insert_specification(
            Specification::global(ecoli, finished).with_accepted_text(["Absent"]),
        );

        let org = OrganizationId::new();
        let plant = PlantId::new();
        let analyst = Actor::new("Bench analyst", org, plant, Role::LabAnalyst);
        let micro_analyst = Actor::new("Micro analyst", org, plant, Role::MicroAnalyst);
        let supervisor = Actor::new("QC supervisor", org, plant, Role::QcSupervisor);
        let manager = Actor::new("Quality manager", org, plant, Role::QualityManager);
        let outsider = Actor::new("Other tenant", OrganizationId::new(), PlantId::new(), Role::Admin);
        for actor in [&analyst, &micro_analyst, &supervisor, &manager, &outsider] {
            credentials.set_password(actor.id, PASSWORD);
        }

        let verifier = verifier.unwrap_or_else(|| credentials.clone() as Arc<dyn CredentialVerifier>);
        let kernel = LabKernel::new(config, store.clone(), catalog.clone(), master.clone(), verifier);

        Self {
            kernel,
            store,
            catalog,
            master,
            credentials,
            org,
            plant,
            analyst,
            micro_analyst,
            supervisor,
            manager,
            outsider,
            ph,
            brix,
            ecoli,
            finished,
            raw_material,
            product,
            batch,
            ph_meter,
            refractometer,
            incubator,
            retired_meter,
        }
    }

    /// Attach a notifier to the kernel
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.kernel = self.kernel.with_notifier(notifier);
        self
    }

    /// Register a collected finished-product sample of the fixture batch
    pub fn register_fp_sample(&self) -> Registration {
        self.kernel
            .register_sample(
                &self.supervisor,
                RegisterSample::new(self.finished)
                    .with_batch(self.batch)
                    .collected(Utc::now(), self.analyst.id),
            )
            .expect("fixture registration")
    }

    /// Register a sample and sign conforming results for all of it, leaving
    /// it under review
    pub async fn sample_under_review(&self) -> Registration {
        let registration = self.register_fp_sample();
        let entries = [(self.ph, "7.1"), (self.brix, "11.0"), (self.ecoli, "Absent")]
            .into_iter()
            .map(|(parameter, raw)| BatchEntry {
                analysis_id: self.analysis_for(&registration, parameter),
                fields: self.fields(parameter, raw),
            })
            .collect();
        self.kernel
            .sign(
                &self.supervisor,
                PASSWORD,
                SignedAction::CommitBatch {
                    sample_id: registration.sample.id,
                    entries,
                },
            )
            .await
            .expect("fixture results");
        registration
    }

    /// Analysis of `parameter` in a registration
    pub fn analysis_for(&self, registration: &Registration, parameter: ParameterId) -> AnalysisId {
        registration
            .analyses
            .iter()
            .find(|a| a.parameter_id == parameter)
            .map(|a| a.id)
            .expect("parameter queued")
    }

    /// Instrument used for `parameter`
    pub fn instrument_for(&self, parameter: ParameterId) -> EquipmentId {
        if parameter == self.ph {
            self.ph_meter
        } else if parameter == self.brix {
            self.refractometer
        } else {
            self.incubator
        }
    }

    /// Result fields with the right instrument
    pub fn fields(&self, parameter: ParameterId, raw: &str) -> ResultFields {
        ResultFields::new(MeasuredValue::parse(raw)).with_equipment(self.instrument_for(parameter))
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifier whose backend cannot be reached
#[derive(Debug, Default)]
pub struct UnreachableVerifier;

#[async_trait]
impl CredentialVerifier for UnreachableVerifier {
    async fn verify(&self, _actor_id: ActorId, _secret: &str) -> Result<bool, VerifierError> {
        Err(VerifierError::Unreachable("connection refused".into()))
    }
}

/// Verifier that answers only after `delay`
#[derive(Debug)]
pub struct SlowVerifier {
    pub delay: Duration,
}

#[async_trait]
impl CredentialVerifier for SlowVerifier {
    async fn verify(&self, _actor_id: ActorId, _secret: &str) -> Result<bool, VerifierError> {
        tokio::time::sleep(self.delay).await;
        Ok(true)
    }
}

/// Notifier that always fails
#[derive(Debug, Default)]
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("webhook returned 503".into()))
    }
}

/// Notifier that keeps every notification
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.received.lock().push(notification.clone());
        Ok(())
    }
}
