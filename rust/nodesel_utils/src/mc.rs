// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Multi-core available-CPU reducer
//!
//! Given a node's reported board layout and a job's multi-core constraints,
//! compute how many CPUs of that node the job can actually use. Every node
//! the linear selector draws goes through this reduction, so a job asking
//! for `--cores-per-socket`-style caps sees a smaller node than the raw
//! CPU count suggests.
//!
//! Worked example: a node reports 2 sockets x 4 cores x 2 threads = 16
//! CPUs. A job with `max_cores = 2`, `cpus_per_task = 3` reduces to
//! 2 x 2 x 2 = 8 usable CPUs, then clips to a multiple of the task width:
//! `(8 / 3) * 3 = 6`. With `tasks_per_node = 1` it would clip further to
//! `1 * 3 = 3`.

use crate::job::MultiCore;
use crate::registry::FastSchedule;
use crate::registry::Node;

/// Number of this node's CPUs usable under the job's constraints. Zero
/// means the node cannot host the job at all (e.g. fewer sockets than the
/// job's floor).
pub fn avail_cpus(
    node: &Node,
    cpus_per_task: u16,
    tasks_per_node: u16,
    mc: &MultiCore,
    fast_schedule: FastSchedule,
) -> u16 {
    let sockets = node.sockets();
    let cores = node.cores();
    let threads = node.threads();

    if sockets < mc.min_sockets || cores < mc.min_cores || threads < mc.min_threads {
        return 0;
    }

    let s = sockets.min(mc.max_sockets) as u32;
    let c = cores.min(mc.max_cores) as u32;
    let t = threads.min(mc.max_threads) as u32;

    let product = sockets as u32 * cores as u32 * threads as u32;
    let prelim = s * c * t;

    // When no axis cap binds, the node's configured CPU count governs; a
    // node may legitimately report more CPUs than the board product under
    // Off/Advisory scheduling.
    let mut avail = if prelim == product {
        match fast_schedule {
            FastSchedule::Strict => prelim,
            _ => node.cpus() as u32,
        }
    } else {
        prelim.min(node.cpus() as u32)
    };

    let cpt = cpus_per_task.max(1) as u32;
    avail = (avail / cpt) * cpt;

    let mut max_tasks = u32::MAX;
    if tasks_per_node > 0 {
        max_tasks = max_tasks.min(tasks_per_node as u32);
    }
    if mc.ntasks_per_socket > 0 {
        max_tasks = max_tasks.min(mc.ntasks_per_socket as u32 * s);
    }
    if mc.ntasks_per_core > 0 {
        max_tasks = max_tasks.min(mc.ntasks_per_core as u32 * s * c);
    }
    if max_tasks != u32::MAX {
        avail = avail.min(max_tasks * cpt);
    }

    avail.min(u16::MAX as u32) as u16
}
