//! Specification resolver
//!
//! Picks the one effective specification per parameter for a sample's
//! product and sample type.

use crate::error::CatalogError;
use crate::types::{Parameter, ParameterId, ProductId, SampleTypeId, SpecScope, Specification, SpecificationId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Sample-type code prefix of finished-product samples
pub const FINISHED_PRODUCT_PREFIX: &str = "FP";
/// Sample-type code prefix of intermediate-product samples
pub const INTERMEDIATE_PRODUCT_PREFIX: &str = "IP";

/// Intermediate product a sample is linked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntermediateLink {
    /// Product the intermediate is made for, when recorded
    pub product_id: Option<ProductId>,
    /// Product of the production batch the intermediate belongs to
    pub batch_product_id: Option<ProductId>,
}

/// What a sample is linked to, as needed to derive its product
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductLinkage {
    /// Code of the sample type; `FP`/`IP` prefixes decide the rule
    pub sample_type_code: String,
    /// Product of the linked production batch
    pub batch_product_id: Option<ProductId>,
    /// Linked intermediate product
    pub intermediate: Option<IntermediateLink>,
}

impl ProductLinkage {
    /// Derive the product a sample is tested against
    ///
    /// Finished-product samples always take the batch product. Intermediate
    /// samples, by prefix or by link, take the intermediate's product, then
    /// the intermediate's batch product, then the sample's own batch product.
    #[must_use]
    pub fn product(&self) -> Option<ProductId> {
        let code = self.sample_type_code.trim().to_ascii_uppercase();
        if code.starts_with(FINISHED_PRODUCT_PREFIX) {
            return self.batch_product_id;
        }
        if code.starts_with(INTERMEDIATE_PRODUCT_PREFIX) || self.intermediate.is_some() {
            if let Some(link) = self.intermediate {
                return link
                    .product_id
                    .or(link.batch_product_id)
                    .or(self.batch_product_id);
            }
        }
        self.batch_product_id
    }
}

/// Resolution context of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductContext {
    /// Derived product, if any
    pub product_id: Option<ProductId>,
    /// Sample type of the sample
    pub sample_type_id: SampleTypeId,
}

/// Product/spec catalog consulted by the resolver
pub trait SpecificationCatalog: Send + Sync {
    /// Every row that may apply: product rows for `product_id` and global rows
    /// for `sample_type_id`. Inactive rows may be included.
    fn candidates(
        &self,
        product_id: Option<ProductId>,
        sample_type_id: SampleTypeId,
    ) -> Result<Vec<Specification>, CatalogError>;

    /// Parameter master data
    fn parameter(&self, id: ParameterId) -> Result<Option<Parameter>, CatalogError>;
}

/// The effective specification for each parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpecifications {
    by_parameter: BTreeMap<ParameterId, Specification>,
}

impl ResolvedSpecifications {
    /// Specification for one parameter
    #[inline]
    #[must_use]
    pub fn get(&self, parameter_id: ParameterId) -> Option<&Specification> {
        self.by_parameter.get(&parameter_id)
    }

    /// Iterate in parameter order
    pub fn iter(&self) -> impl Iterator<Item = (&ParameterId, &Specification)> {
        self.by_parameter.iter()
    }

    /// Parameters with a specification
    pub fn parameter_ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.by_parameter.keys().copied()
    }

    /// Number of parameters with a specification
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_parameter.len()
    }

    /// Nothing resolved
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_parameter.is_empty()
    }
}

impl FromIterator<Specification> for ResolvedSpecifications {
    fn from_iter<I: IntoIterator<Item = Specification>>(iter: I) -> Self {
        Self {
            by_parameter: iter.into_iter().map(|s| (s.parameter_id, s)).collect(),
        }
    }
}

// (scope, sample-type match, version)
type Rank = (u8, u8, u32);

fn rank(spec: &Specification, ctx: &ProductContext) -> Option<Rank> {
    if !spec.active {
        return None;
    }
    match spec.scope {
        SpecScope::Product {
            product_id,
            sample_type_id,
        } => {
            if ctx.product_id != Some(product_id) {
                return None;
            }
            match sample_type_id {
                Some(st) if st == ctx.sample_type_id => Some((2, 1, spec.version)),
                Some(_) => None,
                None => Some((2, 0, spec.version)),
            }
        }
        SpecScope::Global { sample_type_id } => {
            (sample_type_id == ctx.sample_type_id).then_some((1, 1, spec.version))
        }
    }
}

/// Choose the effective specification per parameter from raw candidates
///
/// Product rows beat global rows, exact sample-type rows beat type-agnostic
/// ones, newer versions beat older ones. Remaining ties go to the greater
/// row id so the choice does not depend on candidate order.
#[must_use]
pub fn select_effective(candidates: &[Specification], ctx: &ProductContext) -> ResolvedSpecifications {
    let mut best: BTreeMap<ParameterId, (Rank, SpecificationId, &Specification)> = BTreeMap::new();

    for spec in candidates {
        let Some(r) = rank(spec, ctx) else { continue };
        let key = (r, spec.id);
        let replace = best
            .get(&spec.parameter_id)
            .map_or(true, |(cur_rank, cur_id, _)| (*cur_rank, *cur_id) < key);
        if replace {
            best.insert(spec.parameter_id, (r, spec.id, spec));
        }
    }

    best.into_values().map(|(_, _, spec)| spec.clone()).collect()
}

/// Resolves specifications through a catalog
#[derive(Clone)]
pub struct SpecificationResolver {
    catalog: Arc<dyn SpecificationCatalog>,
}

impl SpecificationResolver {
    /// Create a resolver over `catalog`
    #[must_use]
    pub fn new(catalog: Arc<dyn SpecificationCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve the effective specifications for a context
    ///
    /// # Errors
    /// Propagates catalog failures.
    pub fn resolve(&self, ctx: &ProductContext) -> Result<ResolvedSpecifications, CatalogError> {
        let candidates = self.catalog.candidates(ctx.product_id, ctx.sample_type_id)?;
        let resolved = select_effective(&candidates, ctx);
        tracing::debug!(
            candidates = candidates.len(),
            resolved = resolved.len(),
            product = ?ctx.product_id,
            "resolved specifications"
        );
        Ok(resolved)
    }

    /// Parameter master data
    ///
    /// # Errors
    /// [`CatalogError::UnknownParameter`] when the catalog has no such row.
    pub fn parameter(&self, id: ParameterId) -> Result<Parameter, CatalogError> {
        self.catalog
            .parameter(id)?
            .ok_or(CatalogError::UnknownParameter(id))
    }

    /// Underlying catalog
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn SpecificationCatalog> {
        &self.catalog
    }
}

impl std::fmt::Debug for SpecificationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecificationResolver").finish_non_exhaustive()
    }
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    parameters: RwLock<HashMap<ParameterId, Parameter>>,
    specifications: RwLock<Vec<Specification>>,
}

impl InMemoryCatalog {
    /// Empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter
    pub fn insert_parameter(&self, parameter: Parameter) -> ParameterId {
        let id = parameter.id;
        self.parameters.write().insert(id, parameter);
        id
    }

    /// Register a specification row
    pub fn insert_specification(&self, spec: Specification) -> SpecificationId {
        let id = spec.id;
        self.specifications.write().push(spec);
        id
    }

    /// Deactivate `old` and register `new` as its successor version
    ///
    /// # Errors
    /// [`CatalogError::Unavailable`] when `old` does not exist.
    pub fn supersede(&self, old: SpecificationId, mut new: Specification) -> Result<SpecificationId, CatalogError> {
        let mut specs = self.specifications.write();
        let previous = specs
            .iter_mut()
            .find(|s| s.id == old)
            .ok_or_else(|| CatalogError::Unavailable(format!("specification {} not found", old.0)))?;
        previous.active = false;
        new.version = previous.version + 1;
        new.active = true;
        let id = new.id;
        specs.push(new);
        Ok(id)
    }

    /// Withdraw a specification without a successor
    ///
    /// # Errors
    /// [`CatalogError::Unavailable`] when `id` does not exist.
    pub fn deactivate(&self, id: SpecificationId) -> Result<(), CatalogError> {
        let mut specs = self.specifications.write();
        let spec = specs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CatalogError::Unavailable(format!("specification {} not found", id.0)))?;
        spec.active = false;
        Ok(())
    }
}

impl SpecificationCatalog for InMemoryCatalog {
    fn candidates(
        &self,
        product_id: Option<ProductId>,
        sample_type_id: SampleTypeId,
    ) -> Result<Vec<Specification>, CatalogError> {
        Ok(self
            .specifications
            .read()
            .iter()
            .filter(|s| match s.scope {
                SpecScope::Product { product_id: p, .. } => Some(p) == product_id,
                SpecScope::Global { sample_type_id: st } => st == sample_type_id,
            })
            .cloned()
            .collect())
    }

    fn parameter(&self, id: ParameterId) -> Result<Option<Parameter>, CatalogError> {
        Ok(self.parameters.read().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(product: Option<ProductId>, st: SampleTypeId) -> ProductContext {
        ProductContext {
            product_id: product,
            sample_type_id: st,
        }
    }

    #[test]
    fn test_product_spec_beats_global() {
        let param = ParameterId::new();
        let product = ProductId::new();
        let st = SampleTypeId::new();

        let global = Specification::global(param, st).with_range(Some(1.0), Some(2.0));
        let scoped = Specification::for_product(param, product, None).with_range(Some(5.0), Some(6.0));

        let resolved = select_effective(&[global.clone(), scoped.clone()], &ctx(Some(product), st));
        assert_eq!(resolved.get(param), Some(&scoped));

        // without product the global row applies
        let resolved = select_effective(&[global.clone(), scoped], &ctx(None, st));
        assert_eq!(resolved.get(param), Some(&global));
    }

    #[test]
    fn test_exact_sample_type_beats_type_agnostic() {
        let param = ParameterId::new();
        let product = ProductId::new();
        let st = SampleTypeId::new();

        let agnostic = Specification::for_product(param, product, None);
        let exact = Specification::for_product(param, product, Some(st));
        let other_type = Specification::for_product(param, product, Some(SampleTypeId::new()))
            .with_version(9);

        let resolved = select_effective(&[agnostic, exact.clone(), other_type], &ctx(Some(product), st));
        assert_eq!(resolved.get(param), Some(&exact));
    }

    #[test]
    fn test_inactive_rows_ignored_and_newer_version_wins() {
        let param = ParameterId::new();
        let st = SampleTypeId::new();
        let mut old = Specification::global(param, st);
        old.active = false;
        let v2 = Specification::global(param, st).with_version(2);
        let v3 = Specification::global(param, st).with_version(3);

        let resolved = select_effective(&[old, v3.clone(), v2], &ctx(None, st));
        assert_eq!(resolved.get(param), Some(&v3));
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_catalog_supersede() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let param = catalog.insert_parameter(Parameter::new("PH", "pH", crate::ParameterCategory::PhysicoChemical));
        let st = SampleTypeId::new();
        let v1 = catalog.insert_specification(Specification::global(param, st).with_range(Some(6.0), Some(8.0)));
        catalog
            .supersede(v1, Specification::global(param, st).with_range(Some(6.5), Some(7.5)))
            .unwrap();

        let resolver = SpecificationResolver::new(catalog);
        let resolved = resolver.resolve(&ctx(None, st)).unwrap();
        let spec = resolved.get(param).unwrap();
        assert_eq!(spec.version, 2);
        assert_eq!(spec.min_value, Some(6.5));
    }

    #[test]
    fn test_product_derivation() {
        let batch_product = ProductId::new();
        let ip_product = ProductId::new();
        let link = IntermediateLink {
            product_id: Some(ip_product),
            batch_product_id: None,
        };

        let fp = ProductLinkage {
            sample_type_code: "FP-01".into(),
            batch_product_id: Some(batch_product),
            intermediate: Some(link),
        };
        assert_eq!(fp.product(), Some(batch_product));

        let ip = ProductLinkage {
            sample_type_code: "IP".into(),
            batch_product_id: Some(batch_product),
            intermediate: Some(link),
        };
        assert_eq!(ip.product(), Some(ip_product));

        let ip_without_product = ProductLinkage {
            sample_type_code: "ip".into(),
            batch_product_id: Some(batch_product),
            intermediate: Some(IntermediateLink::default()),
        };
        assert_eq!(ip_without_product.product(), Some(batch_product));

        let water = ProductLinkage {
            sample_type_code: "AGUA".into(),
            ..ProductLinkage::default()
        };
        assert_eq!(water.product(), None);
    }
}
