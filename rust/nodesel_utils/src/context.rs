// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Selector context
//!
//! One explicit context object replaces the file-scope globals a selector
//! would otherwise lean on: the node registry, the partition table, the
//! running-job list, tunables, and the abstract-to-physical CPU numbering
//! maps.
//!
//! The context is created once at boot and handed by reference into every
//! selector call. All mutable state (run counts, the running-job list) sits
//! behind a single mutex; selection for distinct jobs is serialized on it,
//! so the effect of one `commit` is observable by the next `test`.

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::registry::NodeRegistry;
use crate::NodeSet;

/// `select_type_param` bit: treat unknown task distributions as block.
pub const CORE_DEFAULT_DIST_BLOCK: u32 = 1 << 0;

/// `task_plugin_param` bits.
pub const TASK_PARAM_VERBOSE: u32 = 1 << 0;
pub const TASK_PARAM_AUTOBIND_THREADS: u32 = 1 << 1;
pub const TASK_PARAM_AUTOBIND_CORES: u32 = 1 << 2;
pub const TASK_PARAM_AUTOBIND_SOCKETS: u32 = 1 << 3;

/// Partition `max_share` field: bit 15 is the FORCE flag, the low 15 bits
/// carry the over-subscription cap.
pub const SHARED_FORCE: u16 = 1 << 15;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub select_type_param: u32,
    #[serde(default)]
    pub task_plugin_param: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PartitionConfig {
    pub id: u32,
    pub name: String,
    /// Raw max_share word: low 15 bits cap, bit 15 forces sharing.
    #[serde(default)]
    pub max_share: u16,
    /// Member nodes as an index list, e.g. "0-15".
    pub nodes: String,
}

impl PartitionConfig {
    pub fn share_cap(&self) -> u16 {
        self.max_share & !SHARED_FORCE
    }

    pub fn shared_force(&self) -> bool {
        self.max_share & SHARED_FORCE != 0
    }
}

/// A partition resolved against the registry.
#[derive(Clone, Debug)]
pub struct Partition {
    config: PartitionConfig,
    span: NodeSet,
}

impl Partition {
    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn share_cap(&self) -> u16 {
        self.config.share_cap()
    }

    pub fn shared_force(&self) -> bool {
        self.config.shared_force()
    }

    pub fn span(&self) -> &NodeSet {
        &self.span
    }
}

/// A job the selector has committed and not yet finished. Arrival order is
/// preserved; the mate finder depends on it.
#[derive(Clone, Debug)]
pub struct RunningJob {
    pub job_id: u32,
    pub partition_id: u32,
    pub nodes: NodeSet,
}

/// The mutable half of the context, guarded by the selector mutex.
#[derive(Debug)]
pub struct SelectorState {
    pub registry: NodeRegistry,
    pub running: Vec<RunningJob>,
}

#[derive(Debug)]
pub struct SelectorContext {
    state: Mutex<SelectorState>,
    partitions: Vec<Partition>,
    config: SelectorConfig,
    block_map: Vec<usize>,
    block_map_inv: Vec<usize>,
}

impl SelectorContext {
    /// Assemble the context. `block_map` translates abstract CPU ids into
    /// the machine's numbering; `None` means the numbering is sequential.
    pub fn new(
        registry: NodeRegistry,
        partition_configs: Vec<PartitionConfig>,
        config: SelectorConfig,
        block_map: Option<Vec<usize>>,
    ) -> Result<SelectorContext> {
        let nr_nodes = registry.len();
        let mut partitions: Vec<Partition> = Vec::new();
        for pc in partition_configs {
            if partitions.iter().any(|p| p.id() == pc.id) {
                bail!("Duplicate partition id {}", pc.id);
            }
            let span = NodeSet::from_nodelist(&pc.nodes, nr_nodes)?;
            if span.is_empty() {
                bail!("Partition {} has no nodes", pc.name);
            }
            partitions.push(Partition { config: pc, span });
        }

        let block_map = match block_map {
            Some(map) => {
                check_permutation(&map)?;
                map
            }
            None => vec![],
        };
        let block_map_inv = invert_map(&block_map);

        Ok(SelectorContext {
            state: Mutex::new(SelectorState {
                registry,
                running: Vec::new(),
            }),
            partitions,
            config,
            block_map,
            block_map_inv,
        })
    }

    /// Take the selector mutex. Poisoning means a selector panicked with
    /// the registry half-updated; continuing to schedule would corrupt
    /// allocations, so propagate the panic.
    pub fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().expect("selector state poisoned")
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, id: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id() == id)
    }

    /// Abstract-to-physical CPU map; empty means identity.
    pub fn block_map(&self) -> &[usize] {
        &self.block_map
    }

    pub fn block_map_inv(&self) -> &[usize] {
        &self.block_map_inv
    }

    /// Finalize an assignment: bump per-node run counts and append to the
    /// running list. The caller already holds no lock; this takes it.
    pub fn commit(&self, job_id: u32, partition_id: u32, nodes: &NodeSet) {
        let mut state = self.lock();
        for node in nodes.iter() {
            state.registry.inc_run_count(node);
        }
        state.running.push(RunningJob {
            job_id,
            partition_id,
            nodes: nodes.clone(),
        });
    }

    /// Tear down a finished job's bookkeeping. Unknown ids are a scheduler
    /// bug but harmless to the registry, so they only warn.
    pub fn finish(&self, job_id: u32) {
        let mut state = self.lock();
        let Some(pos) = state.running.iter().position(|rj| rj.job_id == job_id) else {
            log::warn!("finish() for unknown job {}", job_id);
            return;
        };
        let done = state.running.remove(pos);
        for node in done.nodes.iter() {
            state.registry.dec_run_count(node);
        }
    }

    pub fn is_running(&self, job_id: u32) -> bool {
        self.lock().running.iter().any(|rj| rj.job_id == job_id)
    }
}

fn check_permutation(map: &[usize]) -> Result<()> {
    let mut seen = vec![false; map.len()];
    for &target in map {
        if target >= map.len() || seen[target] {
            bail!("block_map is not a permutation of 0..{}", map.len());
        }
        seen[target] = true;
    }
    Ok(())
}

fn invert_map(map: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; map.len()];
    for (from, &to) in map.iter().enumerate() {
        inv[to] = from;
    }
    inv
}
