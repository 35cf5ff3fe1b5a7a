//! appctl controller library.
//!
//! This crate primarily ships a `controller` binary, but exposes the
//! reconciler, worker and in-memory control plane so they can be driven
//! from integration tests.

pub mod client;
pub mod collector;
pub mod config;
pub mod confirm;
pub mod context;
pub mod error;
pub mod executor;
pub mod memory;
pub mod reconciler;
pub mod subordinate;
pub mod ticker;
pub mod worker;

pub use client::{ClientError, ClientResult, ControlPlane};
pub use context::{Interrupted, ReconcileContext};
pub use error::{ReconcileError, ReconcileResult};
pub use executor::ReconcileReport;
pub use memory::InMemoryControlPlane;
pub use reconciler::{ReconcileAction, Reconciled, Reconciler, ReconcilerSettings};
pub use worker::{ControllerWorker, WorkQueue, WorkerConfig};
