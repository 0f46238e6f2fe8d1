//! LIMS Kernel - sample analytical lifecycle engine
//!
//! Takes a sample from registration through analysis, review and release:
//! - Sample registration and analysis queueing
//! - Analysis records: start, drafts, signed commits, retests
//! - Batch execution sessions with a single closing signature
//! - The sample lifecycle state machine
//! - The signature gate: credential re-verification plus atomic commit
//! - A hash-chained audit trail
//!
//! Everything is reached through [`LabKernel`].

#![warn(unreachable_pub)]

pub mod analysis;
pub mod audit;
pub mod compliance;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod master;
pub mod notify;
pub mod read_model;
pub mod registration;
pub mod session;
pub mod signature;
pub mod store;
pub mod telemetry;
pub mod types;

mod access;
mod handle;

pub use analysis::{AnalysisRecordManager, ResultFields, StartOutcome};
pub use audit::{AuditAction, AuditEvent};
pub use compliance::{Blocker, LotCompliance};
pub use config::{EngineConfig, LogConfig};
pub use error::*;
pub use handle::LabKernel;
pub use lifecycle::Trigger;
pub use notify::{BroadcastNotifier, NoopNotifier, Notification, Notifier};
pub use read_model::{AnalysisView, SampleDossier, SignatureEntry};
pub use registration::{RegisterSample, Registration};
pub use session::{AdvanceOutcome, BatchExecutionSession, FinalizeError, SessionState};
pub use signature::{
    CredentialVerifier, InMemoryCredentials, ReleaseDecision, ReviewDecision, SignatureGate,
    SignatureReceipt, SignedAction, VerifierError,
};
pub use store::{LabStore, MemoryStore};
pub use types::*;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
