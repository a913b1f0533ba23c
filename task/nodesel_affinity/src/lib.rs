// Copyright (c) nodesel contributors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Task affinity engine
//!
//! Realizes a job's allocation on a single node: for each task, produce
//! the CPU mask the node daemon binds it to. Explicit binds (map / mask /
//! rank, per CPU or per locality domain) are parsed and validated against
//! the allocation; automatic binds distribute tasks block- or cyclic-wise
//! over the node's sockets, cores and threads, then widen to the requested
//! granularity.
//!
//! All computation happens in abstract (configuration) CPU numbering.
//! Machines whose OS numbers CPUs differently apply the context's
//! block map exactly once, at [`to_physical`].

mod bind;
use bind::explicit_masks;

mod dist;
use dist::distribute_block;
use dist::distribute_cyclic;
use dist::DistRequest;

use anyhow::Result;
use log::info;
use thiserror::Error;

use nodesel_utils::context::SelectorConfig;
use nodesel_utils::context::CORE_DEFAULT_DIST_BLOCK;
use nodesel_utils::context::TASK_PARAM_AUTOBIND_CORES;
use nodesel_utils::context::TASK_PARAM_AUTOBIND_SOCKETS;
use nodesel_utils::context::TASK_PARAM_AUTOBIND_THREADS;
use nodesel_utils::context::TASK_PARAM_VERBOSE;
use nodesel_utils::job::BindType;
use nodesel_utils::job::Distribution;
use nodesel_utils::job::Granularity;
use nodesel_utils::CpuMask;
use nodesel_utils::JobRequest;
use nodesel_utils::Node;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BindError {
    #[error("invalid bind request: {0}")]
    InvalidRequest(String),
    #[error("cannot satisfy distribution: {0}")]
    Unsatisfiable(String),
}

/// The board shape of one node, in abstract numbering: CPU id =
/// (socket * cores + core) * threads + thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeLayout {
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
}

impl NodeLayout {
    pub fn nr_cpus(&self) -> usize {
        self.sockets as usize * self.cores as usize * self.threads as usize
    }

    pub fn nr_cores(&self) -> usize {
        self.sockets as usize * self.cores as usize
    }

    pub fn from_node(node: &Node) -> Self {
        Self {
            sockets: node.sockets(),
            cores: node.cores(),
            threads: node.threads(),
        }
    }
}

fn effective_granularity(job: &JobRequest, config: &SelectorConfig) -> Granularity {
    if job.bind_type == BindType::None {
        let p = config.task_plugin_param;
        if p & TASK_PARAM_AUTOBIND_THREADS != 0 {
            return Granularity::Thread;
        }
        if p & TASK_PARAM_AUTOBIND_CORES != 0 {
            return Granularity::Core;
        }
        if p & TASK_PARAM_AUTOBIND_SOCKETS != 0 {
            return Granularity::Socket;
        }
    }
    job.granularity
}

/// Strip the specialized cores (or threads) a job reserves for system use
/// out of the availability mask. Specialization claims the highest ids.
fn clear_core_spec(layout: &NodeLayout, avail: &mut CpuMask, job: &JobRequest) {
    let Some(spec) = job.core_spec else { return };
    let n = layout.nr_cpus();
    if spec.threads {
        for cpu in n.saturating_sub(spec.count as usize)..n {
            avail.clear_cpu(cpu).unwrap();
        }
    } else {
        let threads = layout.threads as usize;
        let total_cores = layout.nr_cores();
        for core in total_cores.saturating_sub(spec.count as usize)..total_cores {
            for t in 0..threads {
                avail.clear_cpu(core * threads + t).unwrap();
            }
        }
    }
}

/// One CPU mask per task, in abstract numbering. Deterministic: identical
/// inputs produce identical mask sets.
pub fn compute_masks(
    layout: &NodeLayout,
    allowed: &CpuMask,
    job: &JobRequest,
    num_tasks: usize,
    config: &SelectorConfig,
) -> Result<Vec<CpuMask>, BindError> {
    if num_tasks == 0 {
        return Err(BindError::InvalidRequest("zero tasks".into()));
    }
    if allowed.len() != layout.nr_cpus() {
        return Err(BindError::InvalidRequest(format!(
            "allocation mask is {} wide, node has {} CPUs",
            allowed.len(),
            layout.nr_cpus()
        )));
    }

    let mut avail = allowed.clone();
    clear_core_spec(layout, &mut avail, job);
    let verbose = config.task_plugin_param & TASK_PARAM_VERBOSE != 0;

    if job.bind_type != BindType::None {
        return explicit_masks(layout, &avail, job, num_tasks, verbose);
    }

    let dreq = DistRequest {
        layout,
        avail: &avail,
        num_tasks,
        cpus_per_task: job.cpus_per_task.max(1),
        ntasks_per_socket: job.mc.ntasks_per_socket,
        ntasks_per_core: job.mc.ntasks_per_core,
        threads_per_core: job.mc.max_threads.min(layout.threads).max(1),
    };
    let block = match job.task_dist.outer {
        Distribution::Block => true,
        Distribution::Cyclic => false,
        // Plane and arbitrary layouts are the scheduler's business; down
        // here they fall back to the configured default.
        _ => config.select_type_param & CORE_DEFAULT_DIST_BLOCK != 0,
    };
    let masks = if block {
        distribute_block(&dreq)?
    } else {
        distribute_cyclic(&dreq, job.task_dist.inner)?
    };

    let group = match effective_granularity(job, config) {
        Granularity::Thread => 1,
        Granularity::Core => layout.threads as usize,
        Granularity::Socket | Granularity::Ldom => {
            layout.cores as usize * layout.threads as usize
        }
    };
    let masks: Vec<CpuMask> = masks
        .iter()
        .map(|m| m.widen_to_group(group).and(&avail))
        .collect();

    if verbose {
        for (task, mask) in masks.iter().enumerate() {
            info!("task {}: bound to {}", task, mask);
        }
    }
    Ok(masks)
}

/// Translate an abstract mask into the machine's CPU numbering. An empty
/// map means the numbering is already sequential.
pub fn to_physical(mask: &CpuMask, block_map: &[usize]) -> Result<CpuMask> {
    if block_map.is_empty() {
        return Ok(mask.clone());
    }
    mask.remap(block_map)
}
