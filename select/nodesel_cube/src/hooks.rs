// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Job-state hooks with real side effects. The grid ledger persists as an
//! opaque JSON blob in whatever directory the scheduler supplies, and each
//! node carries a control pseudo-file whose ownership tracks the job that
//! occupies it: handed to the job's owner on begin, back to root on fini.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::warn;
use nix::unistd::chown;
use nix::unistd::Gid;
use nix::unistd::Uid;

use nodesel_utils::JobRequest;
use nodesel_utils::SelectPlugin;

use crate::grid::Grid;
use crate::CubeSelector;

const STATE_FILE: &str = "cube_state.json";

impl CubeSelector {
    /// Control pseudo-file for one node.
    fn control_file(&self, node_name: &str) -> PathBuf {
        self.control_dir().join(node_name)
    }

    /// Names of the nodes a committed job occupies.
    fn job_node_names(&self, job_id: u32) -> Vec<String> {
        let state = self.context().lock();
        let Some(rj) = state.running.iter().find(|rj| rj.job_id == job_id) else {
            return vec![];
        };
        rj.nodes
            .iter()
            .map(|index| state.registry.node(index).name().to_string())
            .collect()
    }
}

impl SelectPlugin for CubeSelector {
    fn state_save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create state file {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &*self.grid())
            .with_context(|| format!("Failed to write state file {}", path.display()))?;
        Ok(())
    }

    fn state_restore(&self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            // Nothing saved yet; first boot starts from an empty grid.
            warn!("no saved state at {}", path.display());
            return Ok(());
        }
        let file = File::open(&path)
            .with_context(|| format!("Failed to open state file {}", path.display()))?;
        let restored: Grid = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        *self.grid() = restored;
        Ok(())
    }

    fn job_begin(&self, job: &JobRequest) -> Result<()> {
        for name in self.job_node_names(job.job_id) {
            let path = self.control_file(&name);
            chown(
                &path,
                Some(Uid::from_raw(job.user_id)),
                Some(Gid::from_raw(job.group_id)),
            )
            .with_context(|| {
                format!("Failed to hand {} to uid {}", path.display(), job.user_id)
            })?;
        }
        Ok(())
    }

    fn job_fini(&self, job: &JobRequest) -> Result<()> {
        for name in self.job_node_names(job.job_id) {
            let path = self.control_file(&name);
            // Teardown keeps going even when a node's control file is
            // already gone; the health agent drains such nodes.
            if let Err(e) = chown(&path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0))) {
                warn!("Failed to reclaim {}: {}", path.display(), e);
            }
        }
        self.context().finish(job.job_id);
        Ok(())
    }

    fn job_ready(&self, job: &JobRequest) -> bool {
        self.context().is_running(job.job_id)
    }
}
