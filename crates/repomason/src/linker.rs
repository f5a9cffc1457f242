//! Wires package nodes into a DAG by matching provides to requires within
//! each release.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::errors::ConfigError;
use crate::node::{BuildGraph, NodeId};

/// Resolve every node's dependencies.
///
/// Two nodes of one release claiming the same binary name is a
/// configuration error. A require with no producer in the same release is
/// satisfied externally (by the distribution archive) and contributes no
/// edge. A node providing one of its own build requirements does not
/// depend on itself.
pub fn link(graph: &BuildGraph) -> Result<(), ConfigError> {
    let mut producers: BTreeMap<(String, String), NodeId> = BTreeMap::new();

    for (id, node) in graph.nodes() {
        let release = node.release.uid();
        for binary in &node.bin_provides {
            let key = (binary.clone(), release.clone());
            if let Some(&other) = producers.get(&key) {
                return Err(ConfigError(format!(
                    "{} and {} both provide {} on {}",
                    graph.node(other).name,
                    node.name,
                    binary,
                    node.release,
                )));
            }
            producers.insert(key, id);
        }
    }

    for (id, node) in graph.nodes() {
        let release = node.release.uid();
        let deps: BTreeSet<NodeId> = node
            .bin_requires
            .iter()
            .filter_map(|binary| producers.get(&(binary.clone(), release.clone())))
            .copied()
            .filter(|&dep| dep != id)
            .collect();
        node.resolve(deps.into_iter().collect())?;
    }

    Ok(())
}

/// Nodes reachable from `id` through `depends_on`, including `id` itself.
pub fn closure(graph: &BuildGraph, id: NodeId) -> BTreeSet<NodeId> {
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    seen.insert(id);
    queue.push_back(id);

    while let Some(current) = queue.pop_front() {
        for &dep in graph.node(current).depends_on() {
            if seen.insert(dep) {
                queue.push_back(dep);
            }
        }
    }

    seen
}
