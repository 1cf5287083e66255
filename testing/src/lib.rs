//! Test utilities for Flowline.
//!
//! - [`TestRuntime`]: a small multi-thread runtime with bounded waits
//! - [`MemoryStorage`]: in-memory [`Storage`] for passivation tests
//! - [`RecordingListener`]: records task life-cycle events
//! - [`wait_until`]: poll a condition from a test thread

use flowline_core::{
    Flow, FlowId, FlowManager, FlowResult, Signal, SignalKind, Storage, StorageError, Task,
    TaskListener, Value,
};
use flowline_runtime::{Runtime, RuntimeConfig};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Upper bound for every blocking wait in tests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestRuntime {
    runtime: Runtime,
}

impl TestRuntime {
    pub fn new() -> Self {
        let config = RuntimeConfig {
            worker_threads: Some(2),
            max_blocking_threads: 64,
            thread_name: "flowline-test".to_string(),
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::new(config).expect("test runtime");
        Self { runtime }
    }

    pub fn manager(&self) -> Arc<dyn FlowManager> {
        self.runtime.manager()
    }

    pub fn task(&self, name: &str) -> Task {
        self.runtime.task(name)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Drive `future` to completion, panicking after [`DEFAULT_TIMEOUT`].
    pub fn wait<F: Future>(&self, future: F) -> F::Output {
        self.runtime
            .block_on(async { tokio::time::timeout(DEFAULT_TIMEOUT, future).await })
            .expect("future did not complete in time")
    }

    /// Final result of `flow`, panicking if it does not end in time.
    pub fn join(&self, flow: &Flow) -> FlowResult<Value> {
        flow.join_timeout(DEFAULT_TIMEOUT)
            .expect("flow did not end in time")
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Install test logging once; later calls are no-ops.
pub fn init_tracing() {
    let _ = flowline_runtime::init_tracing("warn,flowline_core=debug");
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
pub struct MemoryStorage {
    image: Mutex<Option<Vec<u8>>>,
    stores: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.image.lock().clone()
    }

    /// Overwrite the stored bytes, e.g. to simulate corruption.
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.image.lock() = Some(bytes);
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

impl Storage for MemoryStorage {
    fn store(&self, image: &[u8]) -> Result<(), StorageError> {
        *self.image.lock() = Some(image.to_vec());
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>, StorageError> {
        self.image.lock().clone().ok_or(StorageError::Empty)
    }

    fn discard(&self) -> Result<(), StorageError> {
        *self.image.lock() = None;
        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Started(FlowId),
    Suspended(FlowId, SignalKind),
    Ended { flow: FlowId, ok: bool },
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }
}

impl TaskListener for RecordingListener {
    fn flow_started(&self, _task: &Task, flow: &Flow) {
        self.events.lock().push(ListenerEvent::Started(flow.id()));
    }

    fn flow_suspended(&self, _task: &Task, flow: &Flow, signal: &Signal) {
        self.events
            .lock()
            .push(ListenerEvent::Suspended(flow.id(), signal.kind().clone()));
    }

    fn flow_ended(&self, _task: &Task, flow: &Flow, result: &FlowResult<Value>) {
        self.events.lock().push(ListenerEvent::Ended {
            flow: flow.id(),
            ok: result.is_ok(),
        });
    }
}
