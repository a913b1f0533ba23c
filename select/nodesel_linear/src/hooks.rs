// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Job-state hooks for commodity clusters: no control filesystem to touch,
//! so everything but run-count bookkeeping stays a stub.

use anyhow::Result;

use nodesel_utils::JobRequest;
use nodesel_utils::SelectPlugin;

use crate::LinearSelector;

impl SelectPlugin for LinearSelector {
    fn job_fini(&self, job: &JobRequest) -> Result<()> {
        self.context().finish(job.job_id);
        Ok(())
    }

    fn job_ready(&self, job: &JobRequest) -> bool {
        self.context().is_running(job.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nodesel_utils::context::{PartitionConfig, SelectorConfig};
    use nodesel_utils::registry::{FastSchedule, NodeRegistry, NodeSpec};
    use nodesel_utils::{NodeSet, SelectorContext};

    #[test]
    fn test_hooks_lifecycle() {
        let reg = NodeRegistry::new(
            &[NodeSpec {
                name: "n[0-3]".into(),
                coord: None,
                cpus: 8,
                sockets: 2,
                cores: 2,
                threads: 2,
                real_memory: 0,
                features: vec![],
            }],
            FastSchedule::Strict,
        )
        .unwrap();
        let ctx = Arc::new(
            SelectorContext::new(
                reg,
                vec![PartitionConfig {
                    id: 1,
                    name: "p".into(),
                    max_share: 1,
                    nodes: "0-3".into(),
                }],
                SelectorConfig::default(),
                None,
            )
            .unwrap(),
        );
        let sel = LinearSelector::new(ctx);
        let job = JobRequest {
            job_id: 5,
            partition_id: 1,
            ..Default::default()
        };

        // state_save/state_restore/job_begin are stubs here.
        let dir = std::env::temp_dir();
        assert!(sel.state_save(&dir).is_ok());
        assert!(sel.state_restore(&dir).is_ok());
        assert!(sel.job_begin(&job).is_ok());

        assert!(!sel.job_ready(&job));
        sel.commit(&job, &NodeSet::from_nodelist("0-1", 4).unwrap());
        assert!(sel.job_ready(&job));
        sel.job_fini(&job).unwrap();
        assert!(!sel.job_ready(&job));
        assert_eq!(sel.context().lock().registry.node(0).run_job_count(), 0);
    }
}
