//! Workload action planning.
//!
//! A plan is a pure function of the desired workload and the observed
//! units. It is computed in two passes:
//!
//! 1. Drift pass: every observed unit whose managed container differs from
//!    the declaration gets an update carrying the corrected values.
//! 2. Cardinality pass: missing units get creates; surplus units get
//!    deletes, taken from the end of the observed sequence.
//!
//! Actions are applied updates first, then creates, then deletes.

use std::collections::BTreeSet;

use appctl_api::{ObjectKey, Pod};

use crate::DesiredWorkload;

/// A single change to apply against the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadAction {
    /// Replace a unit with drift-corrected content.
    Update(Pod),
    /// Create a new unit.
    Create(Pod),
    /// Delete a unit.
    Delete(ObjectKey),
}

impl WorkloadAction {
    /// Short name of the action, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadAction::Update(_) => "update",
            WorkloadAction::Create(_) => "create",
            WorkloadAction::Delete(_) => "delete",
        }
    }
}

/// Ordered set of actions for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadPlan {
    pub updates: Vec<Pod>,
    pub creates: Vec<Pod>,
    pub deletes: Vec<ObjectKey>,
}

impl WorkloadPlan {
    /// Returns true if nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.creates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of actions.
    pub fn len(&self) -> usize {
        self.updates.len() + self.creates.len() + self.deletes.len()
    }

    /// Actions in execution order: updates, creates, deletes.
    pub fn into_actions(self) -> impl Iterator<Item = WorkloadAction> {
        self.updates
            .into_iter()
            .map(WorkloadAction::Update)
            .chain(self.creates.into_iter().map(WorkloadAction::Create))
            .chain(self.deletes.into_iter().map(WorkloadAction::Delete))
    }
}

/// Compute the actions that move `observed` to `desired`.
pub fn plan_workload(desired: &DesiredWorkload, observed: &[Pod]) -> WorkloadPlan {
    let updates = observed
        .iter()
        .filter(|unit| desired.has_drift(unit))
        .map(|unit| {
            let mut corrected = unit.clone();
            desired.correct_drift(&mut corrected);
            corrected
        })
        .collect();

    let target = desired.replicas as usize;
    let current = observed.len();

    let creates = if current < target {
        let taken: BTreeSet<&str> = observed.iter().map(Pod::name).collect();
        unit_names(&desired.app_name, current, target - current, &taken)
            .into_iter()
            .map(|name| desired.new_unit(name))
            .collect()
    } else {
        Vec::new()
    };

    let deletes = if current > target {
        select_victims(observed, current - target)
    } else {
        Vec::new()
    };

    WorkloadPlan {
        updates,
        creates,
        deletes,
    }
}

/// Name of the unit at `index`.
pub fn unit_name(app_name: &str, index: usize) -> String {
    format!("{app_name}-{index}")
}

/// Index of a unit name built by [`unit_name`], if it is one.
pub fn unit_index(app_name: &str, name: &str) -> Option<usize> {
    name.strip_prefix(app_name)?.strip_prefix('-')?.parse().ok()
}

/// Generate `count` sequential names starting at `start`.
///
/// Indexes whose name is already taken are skipped, so a gap left by an
/// earlier deletion can never produce a collision.
pub fn unit_names(app_name: &str, start: usize, count: usize, taken: &BTreeSet<&str>) -> Vec<String> {
    (start..)
        .map(|index| unit_name(app_name, index))
        .filter(|name| !taken.contains(name.as_str()))
        .take(count)
        .collect()
}

/// Pick `count` units to delete, last observed first.
///
/// Observed order is the only tie-break; no unit is preferred over another
/// for any other reason.
pub fn select_victims(observed: &[Pod], count: usize) -> Vec<ObjectKey> {
    observed.iter().rev().take(count).map(Pod::key).collect()
}
