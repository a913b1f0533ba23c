// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Run fit
//!
//! The best-fit core of the linear selector. A *run* is a maximal sequence
//! of consecutive node indices all present in the eligible set. The
//! algorithm scans the eligible set once to build the run list, pre-claims
//! any required nodes along the way, then repeatedly consumes the run that
//! best fits the remaining demand:
//!
//! 1. a run holding required nodes beats any run without,
//! 2. a run sufficient to finish the job beats an insufficient one,
//! 3. among sufficient runs, the one whose CPU capacity sits closest to
//!    the job's CPU ask wins,
//! 4. among insufficient runs, the one offering the most CPUs wins.
//!
//! A run with required nodes is consumed by walking outward from the first
//! required index (rightward to the run's end, then leftward) and stops as
//! soon as demand is met; a plain run is drained whole, capped only by the
//! job's node ceiling. Either way the run is then marked consumed and is
//! never revisited, even if only partially drawn.

use nodesel_utils::avail_cpus;
use nodesel_utils::registry::NodeRegistry;
use nodesel_utils::JobRequest;
use nodesel_utils::NodeSet;

use crate::SelectError;

#[derive(Debug)]
struct Run {
    start: usize,
    end: usize,
    /// Unclaimed node count; required members are pre-claimed and not
    /// counted here.
    nodes: u32,
    /// CPUs offered by the unclaimed nodes.
    cpus: i64,
    /// First required index inside the run, if any.
    req: Option<usize>,
}

/// How close a run's capacity sits to the job's total CPU ask. Smaller is
/// a tighter fit.
fn cpu_slack(run: &Run, job: &JobRequest) -> i64 {
    (run.cpus - job.min_cpus as i64).abs()
}

/// Whether `avail` more nodes can finish the job. When the requested node
/// count exceeds the floor, the slack between them has already been folded
/// into the remaining-node counter.
fn enough_nodes(avail: u32, rem_nodes: i64, min_nodes: u32, req_nodes: u32) -> bool {
    let needed = if req_nodes > min_nodes {
        rem_nodes + min_nodes as i64 - req_nodes as i64
    } else {
        rem_nodes
    };
    avail as i64 >= needed
}

/// Reduce `eligible` to a best-fit selection for `job`, or say why none
/// exists. The caller guarantees `job.required`, if set, is a subset of
/// `eligible`.
pub(crate) fn run_fit(
    registry: &NodeRegistry,
    job: &JobRequest,
    eligible: &NodeSet,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<NodeSet, SelectError> {
    let nr_nodes = registry.len();
    let required = job.required.as_ref();

    if let Some(req) = required {
        if req.weight() as u32 > max_nodes {
            return Err(SelectError::InvalidRequest(format!(
                "{} required nodes exceed max_nodes {}",
                req.weight(),
                max_nodes
            )));
        }
    }

    let mut picked = NodeSet::new(nr_nodes);
    let mut rem_nodes = min_nodes.max(req_nodes) as i64;
    let mut rem_cpus = job.min_cpus as i64;
    let mut budget = max_nodes as i64;
    let mut cpus_on = vec![0i64; nr_nodes];

    let mut runs: Vec<Run> = Vec::new();
    let mut cur: Option<Run> = None;
    for index in 0..nr_nodes {
        if !eligible.test_node(index) {
            if let Some(run) = cur.take() {
                runs.push(run);
            }
            continue;
        }
        let cpus = avail_cpus(
            registry.node(index),
            job.cpus_per_task,
            job.tasks_per_node,
            &job.mc,
            registry.fast_schedule(),
        ) as i64;
        cpus_on[index] = cpus;
        let run = cur.get_or_insert_with(|| Run {
            start: index,
            end: index,
            nodes: 0,
            cpus: 0,
            req: None,
        });
        run.end = index;
        if required.is_some_and(|r| r.test_node(index)) {
            picked.set_node(index).unwrap();
            rem_nodes -= 1;
            rem_cpus -= cpus;
            budget -= 1;
            if run.req.is_none() {
                run.req = Some(index);
            }
        } else {
            run.nodes += 1;
            run.cpus += cpus;
        }
    }
    if let Some(run) = cur.take() {
        runs.push(run);
    }

    // Required nodes alone may already satisfy the demand.
    while rem_nodes > 0 || rem_cpus > 0 {
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        for (i, run) in runs.iter().enumerate() {
            if run.nodes == 0 {
                continue;
            }
            let sufficient = run.cpus >= rem_cpus
                && enough_nodes(run.nodes, rem_nodes, min_nodes, req_nodes);
            let better = match best {
                None => true,
                Some(b) => {
                    let incumbent = &runs[b];
                    if incumbent.req.is_none() != run.req.is_none() {
                        run.req.is_some()
                    } else if sufficient != best_sufficient {
                        sufficient
                    } else if sufficient {
                        cpu_slack(run, job) < cpu_slack(incumbent, job)
                    } else {
                        run.cpus > incumbent.cpus
                    }
                }
            };
            if better {
                best = Some(i);
                best_sufficient = sufficient;
            }
        }
        let Some(bi) = best else { break };
        if job.contiguous && !best_sufficient {
            return Err(SelectError::NoContiguousRun);
        }

        let (start, end, req) = (runs[bi].start, runs[bi].end, runs[bi].req);
        if let Some(req_index) = req {
            for i in req_index..=end {
                if budget <= 0 || (rem_nodes <= 0 && rem_cpus <= 0) {
                    break;
                }
                if picked.test_node(i) {
                    continue;
                }
                picked.set_node(i).unwrap();
                rem_nodes -= 1;
                rem_cpus -= cpus_on[i];
                budget -= 1;
            }
            for i in (start..req_index).rev() {
                if budget <= 0 || (rem_nodes <= 0 && rem_cpus <= 0) {
                    break;
                }
                if picked.test_node(i) {
                    continue;
                }
                picked.set_node(i).unwrap();
                rem_nodes -= 1;
                rem_cpus -= cpus_on[i];
                budget -= 1;
            }
        } else {
            for i in start..=end {
                if budget <= 0 {
                    break;
                }
                if picked.test_node(i) {
                    continue;
                }
                picked.set_node(i).unwrap();
                rem_nodes -= 1;
                rem_cpus -= cpus_on[i];
                budget -= 1;
            }
        }

        // Consumed, fully or not. Never revisited.
        runs[bi].nodes = 0;
        runs[bi].cpus = 0;
    }

    if rem_nodes > 0 {
        Err(SelectError::NotEnoughNodes)
    } else if rem_cpus > 0 {
        Err(SelectError::NotEnoughCpus)
    } else {
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesel_utils::registry::{FastSchedule, NodeSpec};

    /// 16 nodes of 8 CPUs each (2 sockets x 2 cores x 2 threads).
    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            &[NodeSpec {
                name: "tux[0-15]".into(),
                coord: None,
                cpus: 8,
                sockets: 2,
                cores: 2,
                threads: 2,
                real_memory: 1024,
                features: vec![],
            }],
            FastSchedule::Strict,
        )
        .unwrap()
    }

    fn nodes(list: &str) -> NodeSet {
        NodeSet::from_nodelist(list, 16).unwrap()
    }

    #[test]
    fn test_three_runs_best_fit() {
        // Runs {0-3}, {5-8}, {10-12}: 6 nodes / 48 CPUs lands on the two
        // largest runs.
        let reg = registry();
        let job = JobRequest {
            min_nodes: 6,
            min_cpus: 48,
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("0-3,5-8,10-12"), 6, u32::MAX, 0).unwrap();
        assert_eq!(got, nodes("0-3,5-8"));
    }

    #[test]
    fn test_required_node_pulls_its_run() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 3,
            min_cpus: 24,
            required: Some(nodes("11")),
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("0-3,5-8,10-12"), 3, u32::MAX, 0).unwrap();
        assert_eq!(got, nodes("10-12"));
    }

    #[test]
    fn test_contiguous_without_big_run_fails() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 6,
            min_cpus: 1,
            contiguous: true,
            ..Default::default()
        };
        assert!(matches!(
            run_fit(&reg, &job, &nodes("0-3,5-8"), 6, u32::MAX, 0),
            Err(SelectError::NoContiguousRun)
        ));
    }

    #[test]
    fn test_contiguous_single_run_succeeds() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 3,
            min_cpus: 24,
            contiguous: true,
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("0-3,5-8"), 3, u32::MAX, 0).unwrap();
        // The whole winning run is drained.
        assert_eq!(got, nodes("0-3"));
    }

    #[test]
    fn test_outward_walk_from_required() {
        // Required node in the middle of a run: rightward first, then
        // leftward, stopping once demand is met.
        let reg = registry();
        let job = JobRequest {
            min_nodes: 3,
            min_cpus: 24,
            required: Some(nodes("6")),
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("5-8"), 3, u32::MAX, 0).unwrap();
        assert_eq!(got, nodes("6-8"));
    }

    #[test]
    fn test_max_nodes_caps_the_walk() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 2,
            min_cpus: 16,
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("0-7"), 2, 2, 0).unwrap();
        assert_eq!(got, nodes("0-1"));
    }

    #[test]
    fn test_too_many_required_is_invalid() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 1,
            min_cpus: 1,
            required: Some(nodes("0-3")),
            ..Default::default()
        };
        assert!(matches!(
            run_fit(&reg, &job, &nodes("0-7"), 1, 2, 0),
            Err(SelectError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_partially_drawn_run_is_never_revisited() {
        // The required run is capped by max_nodes with CPUs still owed.
        // The leftovers in the same run must not be re-offered.
        let reg = registry();
        let job = JobRequest {
            min_nodes: 1,
            min_cpus: 24,
            required: Some(nodes("0")),
            ..Default::default()
        };
        assert!(matches!(
            run_fit(&reg, &job, &nodes("0-5"), 1, 2, 0),
            Err(SelectError::NotEnoughCpus)
        ));
    }

    #[test]
    fn test_not_enough_nodes() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 9,
            min_cpus: 1,
            ..Default::default()
        };
        assert!(matches!(
            run_fit(&reg, &job, &nodes("0-7"), 9, u32::MAX, 0),
            Err(SelectError::NotEnoughNodes)
        ));
    }

    #[test]
    fn test_req_nodes_above_min_raises_demand() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 2,
            min_cpus: 16,
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &nodes("0-7"), 2, u32::MAX, 5).unwrap();
        assert_eq!(got.weight(), 8); // whole run drained, >= 5 nodes
    }

    #[test]
    fn test_monotonicity_growing_candidate_keeps_success() {
        let reg = registry();
        let job = JobRequest {
            min_nodes: 6,
            min_cpus: 48,
            ..Default::default()
        };
        let small = run_fit(&reg, &job, &nodes("0-3,5-8,10-12"), 6, u32::MAX, 0).unwrap();
        // Adding node 4 merges the first two runs; still a success, with
        // at least as many CPUs.
        let grown = run_fit(&reg, &job, &nodes("0-8,10-12"), 6, u32::MAX, 0).unwrap();
        assert!(grown.weight() * 8 >= small.weight() * 8);
        assert_eq!(grown, nodes("0-8"));
    }

    #[test]
    fn test_result_is_subset_and_bounded() {
        let reg = registry();
        let candidate = nodes("0-3,5-8,10-12");
        let job = JobRequest {
            min_nodes: 6,
            min_cpus: 48,
            ..Default::default()
        };
        let got = run_fit(&reg, &job, &candidate, 6, u32::MAX, 0).unwrap();
        assert!(candidate.is_superset(&got));
        assert!(got.weight() >= 6);
    }
}
