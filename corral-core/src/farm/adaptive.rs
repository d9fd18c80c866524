//! The adaptive farm wrapper
//!
//! A thin coordinator around an external data-plane farm: it validates the
//! parameters, attaches the platform to every stage node, and runs the
//! adaptivity manager around the backend's own run/wait lifecycle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use crate::arch::platform::Platform;
use crate::farm::manager::{self, FarmStages, ManagerHandle};
use crate::farm::node::AdaptiveNode;
use crate::farm::params::{Parameters, ValidationError};

/// The external data-plane farm the wrapper coordinates.
///
/// The item scheduling between emitter, workers and collector lives
/// entirely behind this trait; corral only drives its lifecycle.
pub trait FarmBackend: Send {
    /// Start the data-plane farm. Must not block.
    fn run(&mut self) -> Result<()>;

    /// Block until the data-plane farm has drained.
    fn wait(&mut self) -> Result<()>;
}

/// An adaptive farm: parameters, stage nodes, backend and manager.
pub struct AdaptiveFarm {
    params: Parameters,
    platform: Arc<dyn Platform>,
    stages: FarmStages,
    backend: Box<dyn FarmBackend>,
    manager: Option<ManagerHandle>,
    first_run_done: bool,
}

impl AdaptiveFarm {
    /// Validate `params` and assemble the farm. A validation error aborts
    /// construction; the manager is never started with bad parameters.
    pub fn new(
        params: Parameters,
        platform: Arc<dyn Platform>,
        stages: FarmStages,
        backend: Box<dyn FarmBackend>,
    ) -> Result<Self, ValidationError> {
        let params = params.validate(platform.as_ref())?;
        Ok(Self {
            params,
            platform,
            stages,
            backend,
            manager: None,
            first_run_done: false,
        })
    }

    /// The normalized parameters the manager runs with.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Start the farm. The first run attaches the platform to every stage
    /// node and starts the manager; later runs only restart the backend.
    pub fn run(&mut self) -> Result<()> {
        if !self.first_run_done {
            for node in self.stages.all() {
                node.attach_platform(self.platform.clone());
            }
        }

        self.backend
            .run()
            .context("failed to start the farm backend")?;

        if !self.first_run_done {
            self.manager = Some(manager::start(
                self.params.clone(),
                self.platform.clone(),
                self.stages.clone(),
            ));
            tracing::debug!("adaptivity manager started");
        }
        self.first_run_done = true;
        Ok(())
    }

    /// Stop and join the manager, then wait for the backend to drain.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(manager) = self.manager.take() {
            manager.stop();
            manager
                .join()
                .context("the adaptivity manager failed")?;
        }
        self.backend.wait()
    }
}

/// A stage thread spawned through [`spawn_stage`].
pub struct StageThread {
    name: String,
    handle: JoinHandle<Result<()>>,
}

impl StageThread {
    /// The stage name this thread runs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the stage to finish and surface its error, if any.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| anyhow!("stage '{}' panicked", self.name))?
    }
}

/// Spawn a named OS thread for a stage: the thread registers with its
/// node first, then runs `body`. Backends use this to wire their stage
/// threads into the control plane.
pub fn spawn_stage<F>(
    name: &str,
    node: Arc<AdaptiveNode>,
    body: F,
) -> std::io::Result<StageThread>
where
    F: FnOnce(Arc<AdaptiveNode>) -> Result<()> + Send + 'static,
{
    let thread_name = name.to_string();
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        node.on_thread_start()
            .context("stage thread registration failed")?;
        body(node)
    })?;
    Ok(StageThread {
        name: thread_name,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;
    use crate::farm::params::MappingStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct StubBackend {
        runs: Arc<AtomicUsize>,
        waits: Arc<AtomicUsize>,
    }

    impl FarmBackend for StubBackend {
        fn run(&mut self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn wait(&mut self) -> Result<()> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn farm_stages(workers: usize) -> FarmStages {
        FarmStages {
            emitter: Some(Arc::new(AdaptiveNode::new("emitter"))),
            workers: (0..workers)
                .map(|i| Arc::new(AdaptiveNode::new(&format!("worker-{i}"))))
                .collect(),
            collector: Some(Arc::new(AdaptiveNode::new("collector"))),
        }
    }

    #[test]
    fn test_validation_aborts_construction() {
        let platform = Arc::new(SimPlatform::builder().build());
        let params = Parameters {
            underload_threshold_farm: 95.0,
            ..Parameters::default()
        };
        let result = AdaptiveFarm::new(
            params,
            platform as Arc<dyn Platform>,
            farm_stages(2),
            Box::<StubBackend>::default(),
        );
        assert_eq!(result.err(), Some(ValidationError::ThresholdsInvalid));
    }

    #[test]
    fn test_run_wait_lifecycle() {
        let platform = Arc::new(SimPlatform::builder().topology(1, 8, 1).build());
        let stages = farm_stages(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let waits = Arc::new(AtomicUsize::new(0));
        let backend = StubBackend {
            runs: runs.clone(),
            waits: waits.clone(),
        };
        let params = Parameters {
            strategy_mapping: MappingStrategy::Linear,
            sampling_interval: Duration::from_millis(20),
            ..Parameters::default()
        };

        let mut farm = AdaptiveFarm::new(
            params,
            platform.clone() as Arc<dyn Platform>,
            stages.clone(),
            Box::new(backend),
        )
        .unwrap();

        farm.run().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The stage threads come up after the backend started; the manager
        // is already waiting for them.
        let threads: Vec<StageThread> = stages
            .all()
            .map(|node| spawn_stage(node.name(), node.clone(), |_| Ok(())).unwrap())
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        farm.wait().unwrap();
        assert_eq!(waits.load(Ordering::SeqCst), 1);

        // A second run restarts the backend but never re-creates the
        // manager or re-attaches the platform.
        farm.run().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(farm.manager.is_none());
        farm.wait().unwrap();
        assert_eq!(waits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spawn_stage_registers_node() {
        let platform = Arc::new(SimPlatform::builder().build());
        let node = Arc::new(AdaptiveNode::new("worker-0"));
        node.attach_platform(platform as Arc<dyn Platform>);

        let counter = Arc::new(AtomicUsize::new(0));
        let thread_counter = counter.clone();
        let thread = spawn_stage("worker-0", node.clone(), move |node| {
            assert!(node.thread_handler().is_ok());
            thread_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        node.wait_thread_creation();
        thread.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_stage_without_platform_fails() {
        let node = Arc::new(AdaptiveNode::new("worker-0"));
        let thread = spawn_stage("worker-0", node, |_| Ok(())).unwrap();
        assert!(thread.join().is_err());
    }
}
