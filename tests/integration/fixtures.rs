//! Test fixtures for integration tests.
//!
//! Provides a scripted worker whose behavior (delay, failure, vote) is
//! fixed at construction, plus a config with intervals short enough for
//! tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive::worker::MSG_VOTE_REQUEST;
use hive::{Capability, Error, Result, SwarmConfig, Task, Worker, WorkerCore, WorkerId};

/// Swarm config with intervals short enough for tests.
pub fn fast_config() -> SwarmConfig {
    SwarmConfig {
        distribution_interval_secs: 0.01,
        message_poll_timeout_secs: 0.01,
        result_poll_interval_secs: 0.01,
        health_check_interval_secs: 0.05,
        task_timeout_secs: 5.0,
        result_grace_secs: 2.0,
        ..Default::default()
    }
}

/// A worker with scripted behavior.
pub struct ScriptedWorker {
    core: WorkerCore,
    delay: Duration,
    always_fail: bool,
    vote_option: Option<String>,
    vote_confidence: f64,
    executions: AtomicUsize,
    peak_load: AtomicUsize,
}

impl ScriptedWorker {
    pub fn builder(name: &str) -> ScriptedWorkerBuilder {
        ScriptedWorkerBuilder {
            name: name.to_string(),
            capabilities: Vec::new(),
            max_concurrent: 1,
            delay: Duration::ZERO,
            always_fail: false,
            vote_option: None,
            vote_confidence: 1.0,
        }
    }

    /// An "analyze"-capable worker with concurrency limit 1.
    pub fn analyzer(name: &str) -> Arc<Self> {
        Self::builder(name).capability("analyze").build()
    }

    /// How many times `perform` ran.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Highest concurrent load observed during execution.
    pub fn peak_load(&self) -> usize {
        self.peak_load.load(Ordering::SeqCst)
    }
}

pub struct ScriptedWorkerBuilder {
    name: String,
    capabilities: Vec<String>,
    max_concurrent: usize,
    delay: Duration,
    always_fail: bool,
    vote_option: Option<String>,
    vote_confidence: f64,
}

impl ScriptedWorkerBuilder {
    pub fn capability(mut self, name: &str) -> Self {
        self.capabilities.push(name.to_string());
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn votes(mut self, option: &str, confidence: f64) -> Self {
        self.vote_option = Some(option.to_string());
        self.vote_confidence = confidence;
        self
    }

    pub fn build(self) -> Arc<ScriptedWorker> {
        let mut core = WorkerCore::new(&self.name, self.max_concurrent);
        for capability in &self.capabilities {
            core = core.with_capability(Capability::new(capability, ""));
        }
        Arc::new(ScriptedWorker {
            core,
            delay: self.delay,
            always_fail: self.always_fail,
            vote_option: self.vote_option,
            vote_confidence: self.vote_confidence,
            executions: AtomicUsize::new(0),
            peak_load: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    async fn perform(&self, task: &Task) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.peak_load
            .fetch_max(self.core.current_load(), Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail {
            return Err(Error::TaskRejected {
                reason: "scripted failure".to_string(),
            });
        }
        Ok(json!({
            "worker": self.core.name(),
            "echo": task.content,
        }))
    }

    async fn answer(&self, kind: &str, _content: &Value, _sender: WorkerId) -> Option<Value> {
        if kind == MSG_VOTE_REQUEST {
            if let Some(option) = &self.vote_option {
                return Some(json!({
                    "option": option,
                    "confidence": self.vote_confidence,
                    "rationale": format!("{} always votes {}", self.core.name(), option),
                }));
            }
        }
        None
    }
}
