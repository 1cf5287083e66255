//! Runtime - Owned Tokio Runtime for Flows
//!
//! Flows run synchronous trampolines, so they go to the blocking pool;
//! timers and `park_on` futures run on the async workers.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use flowline_core::{
    Activation, Flow, FlowManager, FlowOutcome, FlowResult, Resumable, Task, TokioManager, Value,
};
use std::future::Future;
use std::sync::Arc;

pub struct Runtime {
    runtime: tokio::runtime::Runtime,
    manager: Arc<TokioManager>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_name(config.thread_name.clone())
            .max_blocking_threads(config.max_blocking_threads);
        if let Some(workers) = config.worker_threads {
            builder.worker_threads(workers);
        }
        let runtime = builder.build().map_err(RuntimeError::Build)?;
        let manager = Arc::new(TokioManager::new(runtime.handle().clone()));
        tracing::debug!(
            workers = ?config.worker_threads,
            max_blocking = config.max_blocking_threads,
            "flow runtime started"
        );
        Ok(Self {
            runtime,
            manager,
            config,
        })
    }

    /// Runtime configured from the environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn manager(&self) -> Arc<dyn FlowManager> {
        self.manager.clone()
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    pub fn task(&self, name: impl Into<String>) -> Task {
        Task::new(name, self.manager())
    }

    /// Run a task-less flow on the calling thread until it parks or ends.
    pub fn start(&self, body: Arc<dyn Resumable>, arg: impl Into<Value>) -> FlowResult<FlowOutcome> {
        Flow::start(self.manager(), body, arg)
    }

    /// Run a task-less flow on a worker.
    pub fn spawn(&self, body: Arc<dyn Resumable>, arg: impl Into<Value>) -> Activation {
        let _guard = self.runtime.enter();
        Flow::spawn(self.manager(), body, arg)
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
