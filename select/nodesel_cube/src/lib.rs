// Copyright (c) nodesel contributors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cube node selector
//!
//! The 3-D topology allocator: carves axis-aligned sub-cuboids out of a
//! torus/mesh machine, honoring connection type, rotation, elongation and
//! pass-through deny rules, and sub-dividing single base partitions into
//! fractional blocks for small jobs.
//!
//! Selection returns a [`CoordBox`] rather than a plain bitmap; the box
//! carries the member coordinates and, through the selector context's node
//! registry, maps onto node indices for the scheduler. The wire ledger
//! lives behind the selector's mutex; consecutive allocations observe one
//! another's reservations.
//!
//! The plugin's job-state hooks are not stubs here: clusters of this shape
//! carry a per-node control filesystem whose pseudo-files change ownership
//! with the job, and a polling health agent drains nodes whose control
//! file disappears.

mod geometry;
pub use geometry::HIGHEST_DIMENSIONS;

mod grid;
pub use grid::CoordBox;
pub use grid::Grid;

mod subblock;
pub use subblock::SmallBlockCounts;
pub use subblock::SubBlockLedger;
pub use subblock::MIDPLANE_NODE_COUNT;
pub use subblock::NODECARD_NODE_COUNT;
pub use subblock::SUB_BLOCK_SLOTS;

mod hooks;

mod health;
pub use health::HealthAgent;
pub use health::POLL_INTERVAL;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Result;
use thiserror::Error;

use nodesel_utils::JobRequest;
use nodesel_utils::NodeSet;
use nodesel_utils::SelectorContext;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TopoError {
    #[error("no geometry/position pair fits")]
    NoFit,
    #[error("bad geometry: {0}")]
    BadGeometry(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub struct CubeSelector {
    ctx: Arc<SelectorContext>,
    grid: Mutex<Grid>,
    control_dir: PathBuf,
}

impl CubeSelector {
    pub fn new(
        ctx: Arc<SelectorContext>,
        dims: [u16; 3],
        control_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            ctx,
            grid: Mutex::new(Grid::new(dims)?),
            control_dir: control_dir.into(),
        })
    }

    pub fn context(&self) -> &SelectorContext {
        &self.ctx
    }

    pub(crate) fn grid(&self) -> MutexGuard<'_, Grid> {
        self.grid.lock().expect("grid ledger poisoned")
    }

    pub(crate) fn control_dir(&self) -> &PathBuf {
        &self.control_dir
    }

    /// Configure a base partition to refuse through-traffic on `axis`.
    pub fn set_deny_pass(&self, coord: [u16; 3], axis: usize) {
        self.grid().set_deny_pass(coord, axis);
    }

    /// Carve a box (or fractional sub-block) for `job`.
    pub fn allocate(&self, job: &JobRequest) -> Result<CoordBox, TopoError> {
        self.grid().allocate(job)
    }

    /// Release a previously allocated box.
    pub fn free(&self, block_id: u32) -> Result<()> {
        self.grid().free(block_id)
    }

    /// Resolve a box's coordinates to registry node indices. Nodes without
    /// a coordinate never match; a box coordinate with no node is a
    /// configuration error.
    pub fn to_nodeset(&self, coord_box: &CoordBox) -> Result<NodeSet> {
        let state = self.ctx.lock();
        let registry = &state.registry;
        let mut set = NodeSet::new(registry.len());
        for coord in &coord_box.coords {
            let node = registry
                .nodes()
                .iter()
                .find(|n| n.coord() == Some(&coord[..]))
                .ok_or_else(|| {
                    anyhow::anyhow!("no registry node at coordinate {:?}", coord)
                })?;
            set.set_node(node.index())?;
        }
        Ok(set)
    }

    /// Finalize an allocation: resolve its nodes, bump their run counts
    /// and remember the job.
    pub fn commit(&self, job: &JobRequest, coord_box: &CoordBox) -> Result<()> {
        let nodes = self.to_nodeset(coord_box)?;
        self.ctx.commit(job.job_id, job.partition_id, &nodes);
        Ok(())
    }
}
