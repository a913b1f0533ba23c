// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The seam between the scheduler loop and a selector plugin's job-state
//! hooks. Commodity clusters take the default no-ops; hardware with a
//! per-node control filesystem overrides the lot.

use anyhow::Result;
use std::path::Path;

use crate::job::JobRequest;

pub trait SelectPlugin {
    /// Persist plugin state into `dir` as an opaque blob. The scheduler
    /// picks the directory; the blob's format is the plugin's own.
    fn state_save(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn state_restore(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Called after the scheduler commits an allocation, outside the
    /// selector's critical section. May block on filesystem calls.
    fn job_begin(&self, _job: &JobRequest) -> Result<()> {
        Ok(())
    }

    fn job_fini(&self, _job: &JobRequest) -> Result<()> {
        Ok(())
    }

    /// Whether the job's allocation is ready for task launch.
    fn job_ready(&self, job: &JobRequest) -> bool;
}
