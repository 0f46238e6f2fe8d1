//! LIMS Conformity - specification resolution and result evaluation
//!
//! The storage-free half of the laboratory engine:
//! - Parameter and specification types
//! - Operator input normalization
//! - The conformity evaluator (pass / fail / indeterminate)
//! - Effective specification resolution per product and sample type
//! - Role policy for parameter visibility
//!
//! # Example
//!
//! ```rust,ignore
//! use lims_conformity::{evaluate, MeasuredValue, Specification, Verdict};
//!
//! let spec = Specification::global(ph, water).with_range(Some(6.0), Some(8.0));
//! assert_eq!(evaluate(&MeasuredValue::parse("7,5"), Some(&spec)), Verdict::Pass);
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod evaluator;
pub mod numeric;
pub mod policy;
pub mod resolver;
pub mod types;

pub use error::{CatalogError, InputError};
pub use evaluator::{evaluate, evaluate_detailed, Deviation, Evaluation, Verdict};
pub use numeric::{sanitize_input, MeasuredValue};
pub use policy::{visible_parameters, Permission, Role};
pub use resolver::{
    select_effective, InMemoryCatalog, IntermediateLink, ProductContext, ProductLinkage,
    ResolvedSpecifications, SpecificationCatalog, SpecificationResolver, FINISHED_PRODUCT_PREFIX,
    INTERMEDIATE_PRODUCT_PREFIX,
};
pub use types::{
    HaccpFlags, Parameter, ParameterCategory, ParameterId, ProductId, SampleTypeId, SpecScope,
    Specification, SpecificationId, TestCategory,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
