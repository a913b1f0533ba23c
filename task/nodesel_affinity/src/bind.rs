// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Explicit CPU binds: the user hands over a bind list (hex masks or CPU
//! ids) or asks for rank binding, and each task picks its entry by task id
//! modulo list length. User-supplied masks are validated against the
//! job's allocation: a mask with no overlap is replaced by the whole
//! allocation with a warning, a partial overlap is silently intersected.
//!
//! The Ld variants address locality domains instead of CPUs; with no NUMA
//! table a domain is a socket.

use log::info;
use log::warn;

use nodesel_utils::job::BindType;
use nodesel_utils::parse_bind_id;
use nodesel_utils::pick_bind_entry;
use nodesel_utils::CpuMask;
use nodesel_utils::JobRequest;

use crate::BindError;
use crate::NodeLayout;

/// All CPUs of one locality domain.
fn ldom_span(layout: &NodeLayout, ldom: usize) -> CpuMask {
    let n = layout.nr_cpus();
    let per = layout.cores as usize * layout.threads as usize;
    let mut mask = CpuMask::new(n);
    for cpu in ldom * per..(ldom + 1) * per {
        if cpu < n {
            mask.set_cpu(cpu).unwrap();
        }
    }
    mask
}

fn raw_mask(
    layout: &NodeLayout,
    job: &JobRequest,
    task: usize,
) -> Result<CpuMask, BindError> {
    let n = layout.nr_cpus();
    let nr_ldoms = layout.sockets as usize;

    let entry = |task: usize| -> Result<&str, BindError> {
        let bind = job
            .cpu_bind
            .as_deref()
            .ok_or_else(|| BindError::InvalidRequest("missing cpu-bind list".into()))?;
        pick_bind_entry(bind, task).map_err(|e| BindError::InvalidRequest(e.to_string()))
    };

    match job.bind_type {
        BindType::Rank => Ok(CpuMask::single(task % n, n).unwrap()),
        BindType::LdRank => Ok(ldom_span(layout, task % nr_ldoms)),
        BindType::Map => {
            let id = parse_bind_id(entry(task)?)
                .map_err(|e| BindError::InvalidRequest(e.to_string()))?;
            if id < n {
                Ok(CpuMask::single(id, n).unwrap())
            } else {
                // Out-of-range id: leave it to allocation validation.
                Ok(CpuMask::new(n))
            }
        }
        BindType::Mask => CpuMask::from_hex(entry(task)?, n)
            .map_err(|e| BindError::InvalidRequest(e.to_string())),
        BindType::LdMap => {
            let id = parse_bind_id(entry(task)?)
                .map_err(|e| BindError::InvalidRequest(e.to_string()))?;
            if id < nr_ldoms {
                Ok(ldom_span(layout, id))
            } else {
                Ok(CpuMask::new(n))
            }
        }
        BindType::LdMask => {
            let ldoms = CpuMask::from_hex(entry(task)?, nr_ldoms)
                .map_err(|e| BindError::InvalidRequest(e.to_string()))?;
            let mut mask = CpuMask::new(n);
            for ldom in ldoms.iter() {
                mask = mask.or(&ldom_span(layout, ldom));
            }
            Ok(mask)
        }
        BindType::None => Err(BindError::InvalidRequest(
            "explicit bind invoked without a bind type".into(),
        )),
    }
}

/// One mask per task from the job's explicit bind request.
pub(crate) fn explicit_masks(
    layout: &NodeLayout,
    allowed: &CpuMask,
    job: &JobRequest,
    num_tasks: usize,
    verbose: bool,
) -> Result<Vec<CpuMask>, BindError> {
    let mut masks = Vec::with_capacity(num_tasks);
    for task in 0..num_tasks {
        let raw = raw_mask(layout, job, task)?;
        let inter = raw.and(allowed);
        let mask = if inter.is_empty() {
            warn!(
                "task {}: user bind mask {} disjoint from allocation, using full allocation",
                task, raw
            );
            allowed.clone()
        } else {
            inter
        };
        if verbose {
            info!("task {}: bound to {}", task, mask);
        }
        masks.push(mask);
    }
    Ok(masks)
}
