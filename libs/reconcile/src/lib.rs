//! Reconciliation planning primitives.
//!
//! This library holds the pure half of the appctl reconciliation loop:
//! given a declaration and what was observed, decide what to change.
//! Key concepts:
//!
//! - **Desired state**: what the declaration asks for ([`DesiredWorkload`],
//!   [`DesiredSubordinate`]).
//! - **Observed state**: the workload units and subordinate that exist.
//! - **Plan**: the ordered actions that move observed toward desired
//!   ([`WorkloadPlan`], [`SubordinateAction`]).
//!
//! # Invariants
//!
//! - Planning performs no I/O and is deterministic given the same inputs
//! - Applying a plan and planning again yields an empty plan
//! - Surplus units are chosen by observed order alone

mod desired;
mod error;
mod plan;
mod retry;
mod subordinate;

use std::time::Duration;

pub use desired::DesiredWorkload;
pub use error::PlanError;
pub use plan::{
    plan_workload, select_victims, unit_index, unit_name, unit_names, WorkloadAction, WorkloadPlan,
};
pub use retry::{BackoffPolicy, RetryTracker};
pub use subordinate::{
    correct_replicas, plan_subordinate, subordinate_state, DesiredSubordinate, SubordinateAction,
    SubordinatePolicy, SubordinateState, DEFAULT_REDIS_IMAGE,
};

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default poll period while waiting for a deletion to complete.
pub const DEFAULT_DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of re-read-and-retry attempts after a write conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Default window after which a key's failure count resets.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
