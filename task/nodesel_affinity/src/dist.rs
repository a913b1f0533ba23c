// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Automatic task distribution. Masks are computed in abstract CPU
//! numbering, where CPU id = (socket * cores + core) * threads + thread;
//! the physical translation happens once, at the edge.
//!
//! Block packs tasks onto consecutive available CPUs, so the first socket
//! fills before the second is touched. Cyclic rotates sockets per task
//! and keeps a per-socket cursor, so consecutive tasks land on alternate
//! sockets. Both honor per-core and per-socket task caps and the
//! threads-per-core ceiling; a core at its ceiling is skipped whole.
//!
//! Tasks never share a processing unit: when the caps leave too few PUs
//! for the requested task set, distribution fails rather than
//! over-subscribing (upstream CPU accounting is expected to have sized the
//! task set to the node).

use nodesel_utils::job::InnerDistribution;
use nodesel_utils::CpuMask;

use crate::BindError;
use crate::NodeLayout;

pub(crate) struct DistRequest<'a> {
    pub layout: &'a NodeLayout,
    pub avail: &'a CpuMask,
    pub num_tasks: usize,
    pub cpus_per_task: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub threads_per_core: u16,
}

struct Caps {
    core_tasks: Vec<u16>,
    socket_tasks: Vec<u16>,
    core_threads_used: Vec<u16>,
}

impl Caps {
    fn new(layout: &NodeLayout) -> Self {
        Self {
            core_tasks: vec![0; layout.nr_cores()],
            socket_tasks: vec![0; layout.sockets as usize],
            core_threads_used: vec![0; layout.nr_cores()],
        }
    }

    fn charge_task(&mut self, cores: &[usize], sockets: &[usize]) {
        for &c in cores {
            self.core_tasks[c] += 1;
        }
        for &s in sockets {
            self.socket_tasks[s] += 1;
        }
    }
}

pub(crate) fn distribute_block(req: &DistRequest) -> Result<Vec<CpuMask>, BindError> {
    let layout = req.layout;
    let n = layout.nr_cpus();
    let threads = layout.threads as usize;
    let per_socket = layout.cores as usize * threads;
    let mut caps = Caps::new(layout);
    let mut masks = Vec::with_capacity(req.num_tasks);
    let mut cpu = 0usize;

    for task in 0..req.num_tasks {
        let mut mask = CpuMask::new(n);
        let mut got: u16 = 0;
        let mut touched_cores: Vec<usize> = Vec::new();
        let mut touched_sockets: Vec<usize> = Vec::new();

        while got < req.cpus_per_task && cpu < n {
            let core = cpu / threads;
            let socket = cpu / per_socket;

            if req.ntasks_per_core > 0
                && caps.core_tasks[core] >= req.ntasks_per_core
                && !touched_cores.contains(&core)
            {
                cpu = (core + 1) * threads;
                continue;
            }
            if req.ntasks_per_socket > 0
                && caps.socket_tasks[socket] >= req.ntasks_per_socket
                && !touched_sockets.contains(&socket)
            {
                cpu = (socket + 1) * per_socket;
                continue;
            }
            if caps.core_threads_used[core] >= req.threads_per_core {
                // Ceiling reached: the core's remaining threads are dead
                // weight, jump past them.
                cpu = (core + 1) * threads;
                continue;
            }
            if !req.avail.test_cpu(cpu) {
                cpu += 1;
                continue;
            }

            mask.set_cpu(cpu).map_err(|e| BindError::InvalidRequest(e.to_string()))?;
            got += 1;
            caps.core_threads_used[core] += 1;
            if !touched_cores.contains(&core) {
                touched_cores.push(core);
            }
            if !touched_sockets.contains(&socket) {
                touched_sockets.push(socket);
            }
            cpu += 1;
        }

        if got < req.cpus_per_task {
            return Err(BindError::Unsatisfiable(format!(
                "task {} needs {} CPUs, node exhausted",
                task, req.cpus_per_task
            )));
        }
        caps.charge_task(&touched_cores, &touched_sockets);
        masks.push(mask);
    }
    Ok(masks)
}

/// Position `pos` of a socket's scan sequence: block order walks the
/// socket's CPUs by id, cyclic order walks core-to-core at one thread
/// layer before descending to the next.
fn seq_cpu(layout: &NodeLayout, socket: usize, pos: usize, inner: InnerDistribution) -> usize {
    let cores = layout.cores as usize;
    let threads = layout.threads as usize;
    let base = socket * cores * threads;
    match inner {
        InnerDistribution::Block => base + pos,
        InnerDistribution::Cyclic => {
            let core = pos % cores;
            let thread = pos / cores;
            base + core * threads + thread
        }
    }
}

pub(crate) fn distribute_cyclic(
    req: &DistRequest,
    inner: InnerDistribution,
) -> Result<Vec<CpuMask>, BindError> {
    let layout = req.layout;
    let n = layout.nr_cpus();
    let threads = layout.threads as usize;
    let nr_sockets = layout.sockets as usize;
    let per_socket = layout.cores as usize * threads;

    let mut caps = Caps::new(layout);
    let mut cursor = vec![0usize; nr_sockets];
    let mut taken = CpuMask::new(n);
    let mut masks = Vec::with_capacity(req.num_tasks);
    let mut rr = 0usize;

    for task in 0..req.num_tasks {
        let mut mask = CpuMask::new(n);
        let mut got: u16 = 0;
        let mut touched_cores: Vec<usize> = Vec::new();
        let mut touched_sockets: Vec<usize> = Vec::new();
        let start = rr;
        rr += 1;

        'grab: while got < req.cpus_per_task {
            for probe in 0..nr_sockets {
                let s = (start + probe) % nr_sockets;
                if req.ntasks_per_socket > 0
                    && caps.socket_tasks[s] >= req.ntasks_per_socket
                    && !touched_sockets.contains(&s)
                {
                    continue;
                }
                for k in 0..per_socket {
                    let pos = (cursor[s] + k) % per_socket;
                    let cpu = seq_cpu(layout, s, pos, inner);
                    let core = cpu / threads;
                    if taken.test_cpu(cpu)
                        || !req.avail.test_cpu(cpu)
                        || caps.core_threads_used[core] >= req.threads_per_core
                    {
                        continue;
                    }
                    if req.ntasks_per_core > 0
                        && caps.core_tasks[core] >= req.ntasks_per_core
                        && !touched_cores.contains(&core)
                    {
                        continue;
                    }

                    mask.set_cpu(cpu).map_err(|e| BindError::InvalidRequest(e.to_string()))?;
                    taken.set_cpu(cpu).unwrap();
                    got += 1;
                    caps.core_threads_used[core] += 1;
                    if !touched_cores.contains(&core) {
                        touched_cores.push(core);
                    }
                    if !touched_sockets.contains(&s) {
                        touched_sockets.push(s);
                    }
                    cursor[s] = (pos + 1) % per_socket;
                    continue 'grab;
                }
            }
            return Err(BindError::Unsatisfiable(format!(
                "task {} needs {} CPUs, node exhausted",
                task, req.cpus_per_task
            )));
        }
        caps.charge_task(&touched_cores, &touched_sockets);
        masks.push(mask);
    }
    Ok(masks)
}
