//! Snapshot forest traversal.
//!
//! Snapshots form a forest of backend-owned nodes; names are unique only
//! by convention, so lookups enforce cardinality over the whole forest.

use crate::error::{DriverError, DriverResult};
use crate::types::SnapshotNode;

/// Every node in the forest whose name equals `name` (case-sensitive).
/// Traversal order is not part of the contract, only the match set.
pub(crate) fn collect_matches<'a>(
    forest: &'a [SnapshotNode],
    name: &str,
) -> Vec<&'a SnapshotNode> {
    let mut found = Vec::new();
    let mut stack: Vec<&SnapshotNode> = forest.iter().collect();
    while let Some(node) = stack.pop() {
        if node.name == name {
            found.push(node);
        }
        stack.extend(node.children.iter());
    }
    found
}

/// Resolve exactly one node named `name` anywhere in the forest.
pub(crate) fn resolve_unique<'a>(
    forest: &'a [SnapshotNode],
    name: &str,
) -> DriverResult<&'a SnapshotNode> {
    let matches = collect_matches(forest, name);
    match matches.len() {
        0 => Err(DriverError::not_found(format!("no snapshot named '{name}'"))),
        1 => Ok(matches[0]),
        n => Err(DriverError::ambiguous(format!(
            "{n} snapshots named '{name}'"
        ))),
    }
}
