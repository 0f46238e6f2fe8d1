//! Read-only master data lookups
//!
//! Sample types, products, batches, intermediates, sampling points and
//! instruments are maintained elsewhere; the engine only reads them.

#![allow(missing_docs)]

use crate::error::LimsError;
use crate::types::{BatchId, EquipmentId, IntermediateId, SamplingPointId, Timestamp};
use chrono::{NaiveDate, NaiveTime};
use lims_conformity::{ProductId, SampleTypeId, TestCategory};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleType {
    pub id: SampleTypeId,
    /// Short code; `FP`/`IP` prefixes mark finished and intermediate product
    pub code: String,
    pub name: String,
    pub test_category: TestCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionBatch {
    pub id: BatchId,
    pub code: String,
    pub product_id: ProductId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateProduct {
    pub id: IntermediateId,
    pub code: String,
    pub product_id: Option<ProductId>,
    pub batch_id: Option<BatchId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingPoint {
    pub id: SamplingPointId,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub code: String,
    pub name: String,
    /// Retired or out-of-service instruments are inactive
    pub active: bool,
    /// Calibration is due on this date; from then on results cannot be signed
    pub next_calibration_date: Option<NaiveDate>,
}

impl Equipment {
    /// Calibration due date has passed at `at`
    #[must_use]
    pub fn calibration_expired(&self, at: Timestamp) -> bool {
        self.next_calibration_date
            .is_some_and(|due| due.and_time(NaiveTime::MIN).and_utc() < at)
    }
}

/// Master data collaborator
pub trait MasterData: Send + Sync {
    fn sample_type(&self, id: SampleTypeId) -> Result<Option<SampleType>, LimsError>;
    fn product(&self, id: ProductId) -> Result<Option<Product>, LimsError>;
    fn batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, LimsError>;
    fn intermediate(&self, id: IntermediateId) -> Result<Option<IntermediateProduct>, LimsError>;
    fn sampling_point(&self, id: SamplingPointId) -> Result<Option<SamplingPoint>, LimsError>;
    fn equipment(&self, id: EquipmentId) -> Result<Option<Equipment>, LimsError>;
}

/// In-memory master data
#[derive(Debug, Default)]
pub struct InMemoryMasterData {
    sample_types: RwLock<HashMap<SampleTypeId, SampleType>>,
    products: RwLock<HashMap<ProductId, Product>>,
    batches: RwLock<HashMap<BatchId, ProductionBatch>>,
    intermediates: RwLock<HashMap<IntermediateId, IntermediateProduct>>,
    sampling_points: RwLock<HashMap<SamplingPointId, SamplingPoint>>,
    equipment: RwLock<HashMap<EquipmentId, Equipment>>,
}

impl InMemoryMasterData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample_type(&self, code: &str, name: &str, test_category: TestCategory) -> SampleTypeId {
        let id = SampleTypeId::new();
        self.sample_types.write().insert(
            id,
            SampleType {
                id,
                code: code.to_string(),
                name: name.to_string(),
                test_category,
            },
        );
        id
    }

    pub fn add_product(&self, sku: &str, name: &str) -> ProductId {
        let id = ProductId::new();
        self.products.write().insert(
            id,
            Product {
                id,
                sku: sku.to_string(),
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_batch(&self, code: &str, product_id: ProductId) -> BatchId {
        let id = BatchId::new();
        self.batches.write().insert(
            id,
            ProductionBatch {
                id,
                code: code.to_string(),
                product_id,
            },
        );
        id
    }

    pub fn add_intermediate(&self, code: &str, product_id: Option<ProductId>, batch_id: Option<BatchId>) -> IntermediateId {
        let id = IntermediateId::new();
        self.intermediates.write().insert(
            id,
            IntermediateProduct {
                id,
                code: code.to_string(),
                product_id,
                batch_id,
            },
        );
        id
    }

    pub fn add_sampling_point(&self, code: &str, name: &str) -> SamplingPointId {
        let id = SamplingPointId::new();
        self.sampling_points.write().insert(
            id,
            SamplingPoint {
                id,
                code: code.to_string(),
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_equipment(&self, code: &str, name: &str, active: bool) -> EquipmentId {
        let id = EquipmentId::new();
        self.equipment.write().insert(
            id,
            Equipment {
                id,
                code: code.to_string(),
                name: name.to_string(),
                active,
                next_calibration_date: None,
            },
        );
        id
    }

    /// Set or clear the calibration due date of an instrument
    pub fn set_calibration_due(&self, id: EquipmentId, due: Option<NaiveDate>) {
        if let Some(equipment) = self.equipment.write().get_mut(&id) {
            equipment.next_calibration_date = due;
        }
    }
}

impl MasterData for InMemoryMasterData {
    fn sample_type(&self, id: SampleTypeId) -> Result<Option<SampleType>, LimsError> {
        Ok(self.sample_types.read().get(&id).cloned())
    }

    fn product(&self, id: ProductId) -> Result<Option<Product>, LimsError> {
        Ok(self.products.read().get(&id).cloned())
    }

    fn batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, LimsError> {
        Ok(self.batches.read().get(&id).cloned())
    }

    fn intermediate(&self, id: IntermediateId) -> Result<Option<IntermediateProduct>, LimsError> {
        Ok(self.intermediates.read().get(&id).cloned())
    }

    fn sampling_point(&self, id: SamplingPointId) -> Result<Option<SamplingPoint>, LimsError> {
        Ok(self.sampling_points.read().get(&id).cloned())
    }

    fn equipment(&self, id: EquipmentId) -> Result<Option<Equipment>, LimsError> {
        Ok(self.equipment.read().get(&id).cloned())
    }
}
