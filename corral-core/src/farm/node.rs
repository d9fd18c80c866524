//! Adaptive stage nodes
//!
//! Every farm stage (the emitter, each worker, the collector) is wrapped in
//! an [`AdaptiveNode`]. The stage's own thread announces itself here at its
//! first service entry; afterwards the node exposes the thread's affinity
//! handle to the manager and publishes per-window load/throughput samples.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::arch::platform::{Platform, ThreadHandler};

/// Statistics a stage publishes for one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StageSample {
    /// Fraction of the window the stage spent processing, in [0, 100].
    pub load_percentage: f64,
    /// Items processed during the window.
    pub tasks_count: u64,
}

/// User hooks run on the stage's own thread.
pub trait StageHooks: Send + Sync {
    /// Called once, after the stage thread has registered with the platform.
    fn adaptive_svc_init(&self) {}
}

/// Errors a node can report before its thread exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The platform façade was never attached to this node.
    #[error("platform not attached to this node")]
    PlatformNotAttached,

    /// The stage thread has not run yet.
    #[error("stage thread not initialized")]
    NotInitialized,
}

/// Per-stage adapter between the data plane and the manager.
pub struct AdaptiveNode {
    name: String,
    hooks: Option<Arc<dyn StageHooks>>,
    platform: Mutex<Option<Arc<dyn Platform>>>,
    handler: Mutex<Option<Arc<dyn ThreadHandler>>>,
    created: Mutex<bool>,
    created_cv: Condvar,
    active: AtomicBool,
    tasks: CachePadded<AtomicU64>,
    busy_nanos: CachePadded<AtomicU64>,
    window_started: Mutex<Instant>,
}

impl AdaptiveNode {
    /// Create a node for the stage called `name`.
    pub fn new(name: &str) -> Self {
        Self::with_hooks_opt(name, None)
    }

    /// Create a node whose thread runs `hooks` after registration.
    pub fn with_hooks(name: &str, hooks: Arc<dyn StageHooks>) -> Self {
        Self::with_hooks_opt(name, Some(hooks))
    }

    fn with_hooks_opt(name: &str, hooks: Option<Arc<dyn StageHooks>>) -> Self {
        Self {
            name: name.to_string(),
            hooks,
            platform: Mutex::new(None),
            handler: Mutex::new(None),
            created: Mutex::new(false),
            created_cv: Condvar::new(),
            active: AtomicBool::new(true),
            tasks: CachePadded::new(AtomicU64::new(0)),
            busy_nanos: CachePadded::new(AtomicU64::new(0)),
            window_started: Mutex::new(Instant::now()),
        }
    }

    /// The stage name this node wraps.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the platform façade. Done by the farm wrapper before the
    /// stage threads start.
    pub fn attach_platform(&self, platform: Arc<dyn Platform>) {
        *self.platform.lock().expect("node platform lock poisoned") = Some(platform);
    }

    /// Announce the stage thread. Must be called from the stage's own
    /// thread at its first service entry; later calls are no-ops.
    pub fn on_thread_start(&self) -> Result<(), NodeError> {
        {
            let mut created = self.created.lock().expect("node creation lock poisoned");
            if *created {
                return Ok(());
            }
            let platform = self
                .platform
                .lock()
                .expect("node platform lock poisoned")
                .clone()
                .ok_or(NodeError::PlatformNotAttached)?;
            let handler = platform.thread_handler();
            *self.handler.lock().expect("node handler lock poisoned") = Some(handler);
            *self.window_started.lock().expect("node window lock poisoned") = Instant::now();
            *created = true;
            self.created_cv.notify_all();
        }
        if let Some(hooks) = &self.hooks {
            hooks.adaptive_svc_init();
        }
        Ok(())
    }

    /// Block until [`on_thread_start`](Self::on_thread_start) has fired.
    pub fn wait_thread_creation(&self) {
        let mut created = self.created.lock().expect("node creation lock poisoned");
        while !*created {
            created = self
                .created_cv
                .wait(created)
                .expect("node creation lock poisoned");
        }
    }

    /// The affinity handle of the stage thread.
    pub fn thread_handler(&self) -> Result<Arc<dyn ThreadHandler>, NodeError> {
        self.handler
            .lock()
            .expect("node handler lock poisoned")
            .clone()
            .ok_or(NodeError::NotInitialized)
    }

    /// Count `n` processed items into the current window.
    pub fn record_tasks(&self, n: u64) {
        self.tasks.fetch_add(n, Ordering::Relaxed);
    }

    /// Count processing time into the current window.
    pub fn record_busy(&self, busy: Duration) {
        self.busy_nanos
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Take the sample for the window that ends now and start a new one.
    pub fn get_and_reset_sample(&self) -> StageSample {
        let tasks_count = self.tasks.swap(0, Ordering::AcqRel);
        let busy = self.busy_nanos.swap(0, Ordering::AcqRel);

        let mut started = self.window_started.lock().expect("node window lock poisoned");
        let now = Instant::now();
        let window = now.duration_since(*started);
        *started = now;

        let load_percentage = if window.is_zero() {
            0.0
        } else {
            (busy as f64 / window.as_nanos() as f64 * 100.0).min(100.0)
        };

        StageSample {
            load_percentage,
            tasks_count,
        }
    }

    /// Mark this stage as participating in the data plane.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Mark this stage as parked; the data plane should stop feeding it.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the data plane should feed this stage.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;
    use std::sync::atomic::AtomicUsize;

    fn sim_platform() -> Arc<SimPlatform> {
        Arc::new(SimPlatform::builder().topology(1, 2, 1).build())
    }

    #[test]
    fn test_handler_before_thread_start() {
        let node = AdaptiveNode::new("worker-0");
        assert_eq!(node.thread_handler().err(), Some(NodeError::NotInitialized));
    }

    #[test]
    fn test_thread_start_without_platform() {
        let node = AdaptiveNode::new("worker-0");
        assert_eq!(
            node.on_thread_start().err(),
            Some(NodeError::PlatformNotAttached)
        );
    }

    #[test]
    fn test_thread_start_registers_handler() {
        let node = AdaptiveNode::new("worker-0");
        node.attach_platform(sim_platform());
        node.on_thread_start().unwrap();
        assert!(node.thread_handler().is_ok());

        // A second entry into the service routine is a no-op.
        node.on_thread_start().unwrap();
    }

    #[test]
    fn test_wait_thread_creation_unblocks() {
        let node = Arc::new(AdaptiveNode::new("worker-0"));
        node.attach_platform(sim_platform());

        let waiter = {
            let node = node.clone();
            std::thread::spawn(move || node.wait_thread_creation())
        };
        let starter = {
            let node = node.clone();
            std::thread::spawn(move || node.on_thread_start().unwrap())
        };
        starter.join().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_hooks_run_after_registration() {
        struct CountingHooks(AtomicUsize);
        impl StageHooks for CountingHooks {
            fn adaptive_svc_init(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Arc::new(CountingHooks(AtomicUsize::new(0)));
        let node = AdaptiveNode::with_hooks("emitter", hooks.clone());
        node.attach_platform(sim_platform());
        node.on_thread_start().unwrap();
        node.on_thread_start().unwrap();
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sample_reset() {
        let node = AdaptiveNode::new("worker-0");
        node.record_tasks(5);
        node.record_tasks(2);

        let sample = node.get_and_reset_sample();
        assert_eq!(sample.tasks_count, 7);

        let sample = node.get_and_reset_sample();
        assert_eq!(sample.tasks_count, 0);
    }

    #[test]
    fn test_load_is_clamped() {
        let node = AdaptiveNode::new("worker-0");
        node.record_busy(Duration::from_secs(3600));
        let sample = node.get_and_reset_sample();
        assert_eq!(sample.load_percentage, 100.0);
    }

    #[test]
    fn test_activation_flag() {
        let node = AdaptiveNode::new("worker-0");
        assert!(node.is_active());
        node.deactivate();
        assert!(!node.is_active());
        node.activate();
        assert!(node.is_active());
    }
}
