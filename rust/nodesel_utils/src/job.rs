// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Job demand model
//!
//! What a pending job asks of the selector: node and CPU floors, placement
//! constraints, sharing policy, connection geometry for the 3-D allocator,
//! and the multi-core caps consumed by the available-CPU reducer and the
//! task binding engine.
//!
//! A JobRequest is built by the scheduler, passed by value, and never owns
//! nodes. Partitions are referred to by id and resolved through the
//! SelectorContext.

use anyhow::bail;
use anyhow::Result;

use crate::NodeSet;

/// Whether a partition may co-schedule this job with others on a node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ShareMode {
    #[default]
    None,
    Yes,
    User,
    Mcs,
}

/// Per-axis connection demanded of the 3-D interconnect.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnType {
    #[default]
    Torus,
    Mesh,
    /// Fractional allocation inside a single base partition.
    Small,
    /// Torus if the wiring allows it, else mesh.
    Nav,
}

/// Per-axis deny-pass bits. An allocation whose bounding box would route
/// through a denied axis of some base partition is rejected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassMask(pub u32);

impl PassMask {
    pub const X: u32 = 1 << 0;
    pub const Y: u32 = 1 << 1;
    pub const Z: u32 = 1 << 2;

    pub fn denies(&self, axis: usize) -> bool {
        self.0 & (1 << axis) != 0
    }

    pub fn deny(&mut self, axis: usize) {
        self.0 |= 1 << axis;
    }
}

/// Multi-core request constraints: caps and floors on the socket, core and
/// thread axes plus per-level task density. Zero density means unlimited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MultiCore {
    pub min_sockets: u16,
    pub max_sockets: u16,
    pub min_cores: u16,
    pub max_cores: u16,
    pub min_threads: u16,
    pub max_threads: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
}

impl Default for MultiCore {
    fn default() -> Self {
        Self {
            min_sockets: 1,
            max_sockets: u16::MAX,
            min_cores: 1,
            max_cores: u16::MAX,
            min_threads: 1,
            max_threads: u16::MAX,
            ntasks_per_socket: 0,
            ntasks_per_core: 0,
        }
    }
}

/// How to bind each task's CPU mask.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BindType {
    #[default]
    None,
    Rank,
    Map,
    Mask,
    LdRank,
    LdMap,
    LdMask,
}

/// Binding granularity: the smallest unit a task mask is rounded to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Granularity {
    #[default]
    Thread,
    Core,
    Socket,
    /// Locality domain; sockets stand in where no NUMA table exists.
    Ldom,
}

/// Outer task placement order across the node's sockets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Distribution {
    #[default]
    Block,
    Cyclic,
    Plane,
    Arbitrary,
}

/// Placement order within a socket once the outer order picked it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InnerDistribution {
    #[default]
    Block,
    Cyclic,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TaskDist {
    pub outer: Distribution,
    pub inner: InnerDistribution,
}

/// Specialized cores (or, with `threads`, individual threads) reserved for
/// system use and carved out of every task mask.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoreSpec {
    pub count: u16,
    pub threads: bool,
}

#[derive(Clone, Debug)]
pub struct JobRequest {
    pub job_id: u32,
    pub partition_id: u32,
    pub user_id: u32,
    pub group_id: u32,

    pub min_nodes: u32,
    pub max_nodes: u32,
    pub min_cpus: u32,
    pub cpus_per_task: u16,
    pub tasks_per_node: u16,

    pub required: Option<NodeSet>,
    pub contiguous: bool,
    pub shared: ShareMode,

    pub conn_type: Vec<ConnType>,
    pub geometry: Option<Vec<u16>>,
    pub rotate: bool,
    pub elongate: bool,
    pub deny_pass: PassMask,
    /// Counts of 1/16, 1/8, 1/4, 1/2 and full-midplane sub-blocks, smallest
    /// first.
    pub small_blocks: [u16; 5],

    pub mc: MultiCore,

    pub bind_type: BindType,
    pub cpu_bind: Option<String>,
    pub granularity: Granularity,
    pub task_dist: TaskDist,
    pub core_spec: Option<CoreSpec>,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            job_id: 0,
            partition_id: 0,
            user_id: 0,
            group_id: 0,
            min_nodes: 1,
            max_nodes: u32::MAX,
            min_cpus: 1,
            cpus_per_task: 1,
            tasks_per_node: 0,
            required: None,
            contiguous: false,
            shared: ShareMode::None,
            conn_type: vec![],
            geometry: None,
            rotate: false,
            elongate: false,
            deny_pass: PassMask::default(),
            small_blocks: [0; 5],
            mc: MultiCore::default(),
            bind_type: BindType::None,
            cpu_bind: None,
            granularity: Granularity::Thread,
            task_dist: TaskDist::default(),
            core_spec: None,
        }
    }
}

impl JobRequest {
    /// Structural sanity against a candidate set. Resource sufficiency is
    /// the selectors' business; this only rejects requests that could never
    /// be satisfiable.
    pub fn validate(&self, candidate: &NodeSet) -> Result<()> {
        if self.min_nodes > self.max_nodes {
            bail!(
                "Job {}: min_nodes ({}) > max_nodes ({})",
                self.job_id,
                self.min_nodes,
                self.max_nodes
            );
        }
        if candidate.is_empty() {
            bail!("Job {}: empty candidate set", self.job_id);
        }
        if let Some(req) = &self.required {
            if !candidate.is_superset(req) {
                bail!(
                    "Job {}: required nodes are not all candidates",
                    self.job_id
                );
            }
        }
        if let Some(geo) = &self.geometry {
            let volume: u64 = geo.iter().map(|&g| g as u64).product();
            if volume != self.min_nodes as u64 {
                bail!(
                    "Job {}: geometry volume ({}) != min_nodes ({})",
                    self.job_id,
                    volume,
                    self.min_nodes
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bounds() {
        let candidate = NodeSet::from_nodelist("0-7", 16).unwrap();
        let mut job = JobRequest {
            min_nodes: 4,
            max_nodes: 2,
            ..Default::default()
        };
        assert!(job.validate(&candidate).is_err());
        job.max_nodes = 8;
        assert!(job.validate(&candidate).is_ok());
        assert!(job.validate(&NodeSet::new(16)).is_err());
    }

    #[test]
    fn test_validate_required_subset() {
        let candidate = NodeSet::from_nodelist("0-7", 16).unwrap();
        let job = JobRequest {
            required: Some(NodeSet::from_nodelist("6-9", 16).unwrap()),
            ..Default::default()
        };
        assert!(job.validate(&candidate).is_err());
    }

    #[test]
    fn test_validate_geometry_volume() {
        let candidate = NodeSet::from_nodelist("0-63", 64).unwrap();
        let mut job = JobRequest {
            min_nodes: 8,
            geometry: Some(vec![2, 2, 2]),
            ..Default::default()
        };
        assert!(job.validate(&candidate).is_ok());
        job.geometry = Some(vec![2, 2, 3]);
        assert!(job.validate(&candidate).is_err());
    }

    #[test]
    fn test_pass_mask() {
        let mut mask = PassMask::default();
        assert!(!mask.denies(1));
        mask.deny(1);
        assert!(mask.denies(1));
        assert_eq!(mask.0, PassMask::Y);
    }
}
