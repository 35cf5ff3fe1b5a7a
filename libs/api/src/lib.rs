//! # appctl-api
//!
//! Object model shared by the appctl controller and its tests.
//!
//! ## Objects
//!
//! - [`App`]: the user-authored declaration (desired state)
//! - [`Pod`]: a single workload unit owned by an `App`
//! - [`Deployment`]: the optional redis subordinate owned by an `App`
//!
//! All objects carry [`ObjectMeta`]; ownership between them is expressed
//! with [`OwnerReference`] so the control plane can garbage-collect
//! children when their owner is removed.
//!
//! Resource amounts use [`Quantity`], which understands the control
//! plane's quantity syntax and compares by amount rather than spelling.

mod app;
mod error;
mod meta;
mod quantity;
mod workload;

pub use app::*;
pub use error::ApiError;
pub use meta::*;
pub use quantity::Quantity;
pub use workload::*;
