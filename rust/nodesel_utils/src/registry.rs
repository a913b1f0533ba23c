// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Node registry
//!
//! The static map from node index to capacity vector. Built once at boot
//! from configuration-shaped `NodeSpec` records, then read-only apart from
//! each node's scheduling state and running-job count.
//!
//! A spec names either a single node ("tux3") or a bracketed range
//! ("tux[0-15]"), which expands to one node per index with the same
//! capacity vector. Indices are assigned densely in declaration order, so
//! consecutive names land on consecutive indices and the linear selector's
//! notion of a "run" matches the config's ordering.

use anyhow::bail;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::nodeset::read_nodelist;
use crate::NodeSet;

lazy_static! {
    static ref HOSTRANGE_RE: Regex = Regex::new(r"^([A-Za-z0-9_.-]+)\[([0-9,-]+)\]$").unwrap();
}

/// Whether the selector trusts configured capacities or live values.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum FastSchedule {
    Off,
    #[default]
    Strict,
    Advisory,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum NodeState {
    #[default]
    Idle,
    Allocated,
    Down,
    Drained,
    Draining,
}

impl NodeState {
    /// Whether a node in this state may receive new work.
    pub fn usable(&self) -> bool {
        matches!(self, NodeState::Idle | NodeState::Allocated)
    }
}

/// Configuration-shaped description of one node or one bracketed range.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub coord: Option<Vec<u16>>,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    #[serde(default)]
    pub real_memory: u64,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Node {
    index: usize,
    name: String,
    coord: Option<Vec<u16>>,
    cpus: u16,
    sockets: u16,
    cores: u16,
    threads: u16,
    real_memory: u64,
    state: NodeState,
    run_job_count: u16,
    features: BTreeSet<String>,
}

impl Node {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coord(&self) -> Option<&[u16]> {
        self.coord.as_deref()
    }

    pub fn cpus(&self) -> u16 {
        self.cpus
    }

    pub fn sockets(&self) -> u16 {
        self.sockets
    }

    pub fn cores(&self) -> u16 {
        self.cores
    }

    pub fn threads(&self) -> u16 {
        self.threads
    }

    pub fn real_memory(&self) -> u64 {
        self.real_memory
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn run_job_count(&self) -> u16 {
        self.run_job_count
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }
}

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    by_name: BTreeMap<String, usize>,
    fast_schedule: FastSchedule,
}

impl NodeRegistry {
    /// Build the registry, expanding bracketed ranges and validating each
    /// capacity vector. Under `FastSchedule::Strict` the configured CPU
    /// count must equal `sockets * cores * threads`; otherwise it may
    /// exceed the product but never fall short.
    pub fn new(specs: &[NodeSpec], fast_schedule: FastSchedule) -> Result<NodeRegistry> {
        let mut nodes = Vec::new();
        let mut by_name = BTreeMap::new();

        for spec in specs {
            let product = spec.sockets as u32 * spec.cores as u32 * spec.threads as u32;
            if product == 0 {
                bail!("Node {} has a zero-sized board layout", spec.name);
            }
            match fast_schedule {
                FastSchedule::Strict => {
                    if spec.cpus as u32 != product {
                        bail!(
                            "Node {}: cpus ({}) != sockets*cores*threads ({})",
                            spec.name,
                            spec.cpus,
                            product
                        );
                    }
                }
                _ => {
                    if (spec.cpus as u32) < product {
                        bail!(
                            "Node {}: cpus ({}) < sockets*cores*threads ({})",
                            spec.name,
                            spec.cpus,
                            product
                        );
                    }
                }
            }

            for name in expand_hostrange(&spec.name)? {
                let index = nodes.len();
                if by_name.insert(name.clone(), index).is_some() {
                    bail!("Found duplicate node name {}", name);
                }
                nodes.push(Node {
                    index,
                    name,
                    coord: spec.coord.clone(),
                    cpus: spec.cpus,
                    sockets: spec.sockets,
                    cores: spec.cores,
                    threads: spec.threads,
                    real_memory: spec.real_memory,
                    state: NodeState::Idle,
                    run_job_count: 0,
                    features: spec.features.iter().cloned().collect(),
                });
            }
        }

        if nodes.is_empty() {
            bail!("Node registry is empty");
        }

        Ok(NodeRegistry {
            nodes,
            by_name,
            fast_schedule,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn fast_schedule(&self) -> FastSchedule {
        self.fast_schedule
    }

    /// Look up a node by dense index. Indices come from NodeSets sized to
    /// this registry; anything else is corruption.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|&idx| &self.nodes[idx])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// A full-width NodeSet with every node set.
    pub fn span(&self) -> NodeSet {
        let mut set = NodeSet::new(self.nodes.len());
        set.set_all();
        set
    }

    /// NodeSet of nodes whose state admits new work.
    pub fn usable(&self) -> NodeSet {
        let mut set = NodeSet::new(self.nodes.len());
        for node in &self.nodes {
            if node.state.usable() {
                set.set_node(node.index).unwrap();
            }
        }
        set
    }

    pub fn set_state(&mut self, index: usize, state: NodeState) {
        self.nodes[index].state = state;
    }

    /// Bump a node's running-job count. Callers hold the selector mutex.
    pub fn inc_run_count(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.run_job_count = node
            .run_job_count
            .checked_add(1)
            .expect("run_job_count overflow");
        node.state = NodeState::Allocated;
    }

    /// Drop a node's running-job count on job completion. An underflow
    /// means the bookkeeping is corrupt and the process must not continue
    /// scheduling.
    pub fn dec_run_count(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.run_job_count = node
            .run_job_count
            .checked_sub(1)
            .expect("run_job_count underflow");
        if node.run_job_count == 0 && node.state == NodeState::Allocated {
            node.state = NodeState::Idle;
        }
    }
}

/// Expand "tux[0-15]" into its member names; a plain name expands to
/// itself.
pub fn expand_hostrange(name: &str) -> Result<Vec<String>> {
    match HOSTRANGE_RE.captures(name) {
        Some(caps) => {
            let prefix = caps.get(1).unwrap().as_str();
            let indices = read_nodelist(caps.get(2).unwrap().as_str())?;
            if indices.is_empty() {
                bail!("Empty host range in {}", name);
            }
            Ok(indices
                .iter()
                .map(|i| format!("{}{}", prefix, i))
                .collect())
        }
        None => {
            if name.contains('[') || name.contains(']') {
                bail!("Malformed host range {}", name);
            }
            Ok(vec![name.to_string()])
        }
    }
}
