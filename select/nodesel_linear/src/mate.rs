// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Job-mate lookup: when a partition over-subscribes, a new job can land
//! exactly on top of a running job of the same shape instead of carving a
//! fresh selection. The haystack is the running-job list in arrival order,
//! so repeated queries with identical inputs return the same mate.

use nodesel_utils::context::SelectorState;
use nodesel_utils::JobRequest;
use nodesel_utils::NodeSet;

/// First running job on `job`'s partition whose node count is exactly
/// `want_nodes` and whose nodes are all eligible for the new job.
pub(crate) fn find_mate(
    state: &SelectorState,
    job: &JobRequest,
    eligible: &NodeSet,
    want_nodes: u32,
) -> Option<NodeSet> {
    state
        .running
        .iter()
        .find(|rj| {
            rj.partition_id == job.partition_id
                && rj.nodes.weight() as u32 == want_nodes
                && eligible.is_superset(&rj.nodes)
        })
        .map(|rj| rj.nodes.clone())
}
