// Copyright (c) nodesel contributors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Control-filesystem health agent. A single long-lived thread polls each
//! node's control pseudo-file; nodes whose file cannot be stat'd are
//! batched into a drain request for the scheduler. Start is guarded
//! against double invocation, and shutdown is cooperative: the stop flag
//! is honored at the next poll boundary.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use log::warn;

/// Default poll cadence on production clusters; tests shrink it.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct HealthAgent {
    control_dir: PathBuf,
    nodes: Vec<String>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HealthAgent {
    pub fn new(control_dir: impl Into<PathBuf>, nodes: Vec<String>, interval: Duration) -> Self {
        Self {
            control_dir: control_dir.into(),
            nodes,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the polling thread. `on_drain` receives the names of nodes
    /// whose control file is missing; it runs on the agent thread, once
    /// per poll that finds anything.
    pub fn start(&self, on_drain: impl Fn(Vec<String>) + Send + 'static) -> Result<()> {
        let mut slot = self.thread.lock().expect("health agent lock poisoned");
        if slot.is_some() {
            bail!("health agent already running");
        }
        self.stop.store(false, Ordering::Relaxed);

        let stop = self.stop.clone();
        let dir = self.control_dir.clone();
        let nodes = self.nodes.clone();
        let interval = self.interval;
        *slot = Some(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut drain: Vec<String> = Vec::new();
                for name in &nodes {
                    if fs::metadata(dir.join(name)).is_err() {
                        drain.push(name.clone());
                    }
                }
                if !drain.is_empty() {
                    warn!("health agent: {} node(s) unreachable", drain.len());
                    on_drain(drain);
                }
                thread::sleep(interval);
            }
        }));
        Ok(())
    }

    /// Request shutdown and wait for the thread to pass its next poll
    /// boundary. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self
            .thread
            .lock()
            .expect("health agent lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
