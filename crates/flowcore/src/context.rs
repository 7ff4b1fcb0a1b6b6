//! Per-instance execution context.
//!
//! The instance owns a base map of fields. Outside of any parallel block the
//! single active cursor writes straight into the base. Inside a parallel block
//! every branch writes into a private overlay; the overlay of the cursor that
//! forked is frozen in the join table for as long as the split is open, so the
//! data every branch reads stays stable until the join merges it back.
//!
//! Merge order at a join is fixed: the frozen parent overlay first, then each
//! branch overlay in declaration order. A later branch therefore wins when two
//! branches write the same key.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ContextData = BTreeMap<String, Value>;

/// Instance-unique identifier of one execution of a split node
pub type SplitId = u64;

/// One enclosing parallel block of a cursor, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFrame {
    pub split: SplitId,
    pub branch: usize,
}

/// Waiting set of an open split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinState {
    pub split_node: usize,
    pub join_node: usize,
    pub branches: usize,
    pub parent_scope: Vec<ScopeFrame>,
    /// Overlay of the forking cursor; read-only until the join completes.
    pub parent_overlay: ContextData,
    /// Overlays of branches that reached the join, keyed by branch index.
    pub arrived: BTreeMap<usize, ContextData>,
}

impl JoinState {
    pub fn is_complete(&self) -> bool {
        self.arrived.len() == self.branches
    }
}

/// Result of the last branch arriving at a join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRelease {
    pub join_node: usize,
    pub scope: Vec<ScopeFrame>,
    pub overlay: ContextData,
    /// Keys that more than one branch wrote with different values.
    pub conflicts: Vec<String>,
}

/// Outcome of a branch arriving at its join
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival {
    Waiting { arrived: usize, branches: usize },
    Released(JoinRelease),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub data: ContextData,
    pub joins: BTreeMap<SplitId, JoinState>,
    next_split: SplitId,
}

impl ExecutionContext {
    pub fn new(data: ContextData) -> Self {
        Self {
            data,
            joins: BTreeMap::new(),
            next_split: 0,
        }
    }

    /// Layered read view for a cursor with the given scope and overlay.
    pub fn view<'a>(&'a self, scope: &[ScopeFrame], overlay: &'a ContextData) -> ContextView<'a> {
        let mut layers = Vec::with_capacity(scope.len() + 2);
        layers.push(&self.data);
        for frame in scope {
            if let Some(join) = self.joins.get(&frame.split) {
                layers.push(&join.parent_overlay);
            }
        }
        layers.push(overlay);
        ContextView { layers }
    }

    /// Record step writes for a cursor. A cursor outside every split owns
    /// the base directly.
    pub fn apply_writes(&mut self, scope: &[ScopeFrame], overlay: &mut ContextData, writes: ContextData) {
        if scope.is_empty() {
            self.data.extend(writes);
        } else {
            overlay.extend(writes);
        }
    }

    /// Open a split, freezing the forking cursor's overlay.
    pub fn fork(
        &mut self,
        split_node: usize,
        join_node: usize,
        branches: usize,
        parent_scope: Vec<ScopeFrame>,
        parent_overlay: ContextData,
    ) -> SplitId {
        let id = self.next_split;
        self.next_split += 1;
        self.joins.insert(
            id,
            JoinState {
                split_node,
                join_node,
                branches,
                parent_scope,
                parent_overlay,
                arrived: BTreeMap::new(),
            },
        );
        id
    }

    /// Register a branch at its join. The merge happens here, under the
    /// caller's exclusive borrow, once every branch has arrived.
    ///
    /// Returns `None` when the split is unknown (it was withdrawn by a
    /// cancellation) so a stale cursor can never be counted.
    pub fn arrive(&mut self, frame: ScopeFrame, overlay: ContextData) -> Option<Arrival> {
        let join = self.joins.get_mut(&frame.split)?;
        if frame.branch >= join.branches {
            return None;
        }
        join.arrived.insert(frame.branch, overlay);
        if !join.is_complete() {
            return Some(Arrival::Waiting {
                arrived: join.arrived.len(),
                branches: join.branches,
            });
        }

        let join = self.joins.remove(&frame.split)?;
        let (overlay, conflicts) = merge_overlays(join.parent_overlay, join.arrived);
        Some(Arrival::Released(JoinRelease {
            join_node: join.join_node,
            scope: join.parent_scope,
            overlay,
            conflicts,
        }))
    }

    /// Remove a cancelled branch from every join it could still count
    /// towards.
    pub fn withdraw(&mut self, scope: &[ScopeFrame]) {
        for frame in scope {
            if let Some(join) = self.joins.get_mut(&frame.split) {
                join.arrived.remove(&frame.branch);
            }
        }
    }

    /// Drop every open split; used when the instance is cancelled or faults.
    pub fn close_all_joins(&mut self) {
        self.joins.clear();
    }

    /// Fold a released top-level overlay into the base.
    pub fn commit(&mut self, overlay: ContextData) {
        self.data.extend(overlay);
    }
}

/// Merge branch overlays over the parent overlay in ascending branch order.
///
/// Returns the merged map and the keys on which branches disagreed.
pub fn merge_overlays(
    parent: ContextData,
    branches: impl IntoIterator<Item = (usize, ContextData)>,
) -> (ContextData, Vec<String>) {
    let mut ordered: Vec<(usize, ContextData)> = branches.into_iter().collect();
    ordered.sort_by_key(|(i, _)| *i);

    let mut merged = parent;
    let mut written_by: BTreeMap<String, Value> = BTreeMap::new();
    let mut conflicts = Vec::new();

    for (branch, overlay) in ordered {
        for (key, value) in overlay {
            if let Some(previous) = written_by.get(&key) {
                if *previous != value && !conflicts.contains(&key) {
                    tracing::warn!(key = %key, branch, "Branch overwrites a value written by an earlier branch");
                    conflicts.push(key.clone());
                }
            }
            written_by.insert(key.clone(), value.clone());
            merged.insert(key, value);
        }
    }

    (merged, conflicts)
}

/// Read-only layered view over base, frozen parent overlays and the cursor's
/// own overlay
#[derive(Debug, Clone)]
pub struct ContextView<'a> {
    layers: Vec<&'a ContextData>,
}

impl<'a> ContextView<'a> {
    pub fn from_data(data: &'a ContextData) -> Self {
        Self { layers: vec![data] }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Flatten the layers into a single map.
    pub fn snapshot(&self) -> ContextData {
        let mut flat = ContextData::new();
        for layer in &self.layers {
            flat.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        flat
    }
}
