use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Load factor of a single host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub host: String,
    pub load_factor: f32,
}

impl NodeLoad {
    pub fn new(host: impl Into<String>, load_factor: f32) -> Self {
        Self {
            host: host.into(),
            load_factor,
        }
    }
}

/// Snapshot of current load per host, as reported by the service registry.
///
/// Read-only from the engine's point of view. Hosts are kept in name order so
/// iteration is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    nodes: BTreeMap<String, NodeLoad>,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, replacing any previous entry for the same host.
    pub fn add_node_load(&mut self, load: NodeLoad) {
        self.nodes.insert(load.host.clone(), load);
    }

    pub fn with_node(mut self, host: impl Into<String>, load_factor: f32) -> Self {
        self.add_node_load(NodeLoad::new(host, load_factor));
        self
    }

    pub fn get(&self, host: &str) -> Option<&NodeLoad> {
        self.nodes.get(host)
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.nodes.contains_key(host)
    }

    pub fn node_loads(&self) -> impl Iterator<Item = &NodeLoad> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Admission arithmetic for a single node.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadPolicy {
    /// Accept jobs whose own load exceeds the node's maximum. Such a job could
    /// never be admitted anywhere, so the excess is forgiven instead.
    pub accept_exceeding_max_load: bool,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            accept_exceeding_max_load: true,
        }
    }
}

impl LoadPolicy {
    pub fn new(accept_exceeding_max_load: bool) -> Self {
        Self {
            accept_exceeding_max_load,
        }
    }

    /// Decide whether a node at `current_load` can absorb a job of `job_load`.
    ///
    /// `counts_job_load_already` is true when `current_load` was sampled
    /// with the job already accounted for (the registry counts dispatching
    /// jobs against their target host). Reaching `max_load` exactly is
    /// accepted; only exceeding it is rejected.
    pub fn can_accept(
        &self,
        current_load: f32,
        job_load: f32,
        max_load: f32,
        counts_job_load_already: bool,
    ) -> bool {
        let mut projected = if counts_job_load_already {
            current_load
        } else {
            current_load + job_load
        };

        if self.accept_exceeding_max_load && job_load > max_load {
            projected -= job_load - max_load;
        }

        projected <= max_load
    }
}

/// Pick the host a failed-over operation should move to.
///
/// Candidates are hosts other than `exclude` whose current load is below
/// their maximum. The least loaded wins; ties go to the lower host name.
pub fn select_alternate_host(
    current: &SystemLoad,
    max: &SystemLoad,
    exclude: Option<&str>,
) -> Option<String> {
    current
        .node_loads()
        .filter(|node| Some(node.host.as_str()) != exclude)
        .filter(|node| {
            max.get(&node.host)
                .map(|limit| node.load_factor < limit.load_factor)
                .unwrap_or(false)
        })
        .min_by(|a, b| {
            a.load_factor
                .total_cmp(&b.load_factor)
                .then_with(|| a.host.cmp(&b.host))
        })
        .map(|node| node.host.clone())
}
