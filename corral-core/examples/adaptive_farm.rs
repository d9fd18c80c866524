//! Adaptive farm example for Corral.
//!
//! This example runs a toy emitter-workers-collector farm over the
//! simulated platform and lets the manager adapt the worker count and
//! frequency to a throughput target. The data plane is plain std mpsc;
//! real deployments plug their own farm runtime in behind `FarmBackend`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;

use corral_core::arch::{Platform, SimPlatform};
use corral_core::farm::{
    spawn_stage, AdaptiveFarm, AdaptiveNode, FarmBackend, FarmStages, FrequencyStrategy,
    MappingStrategy, Parameters, StageThread,
};

const ITEMS: u64 = 50_000;

struct DemoBackend {
    stages: FarmStages,
    threads: Vec<StageThread>,
    collected: Arc<AtomicU64>,
}

impl FarmBackend for DemoBackend {
    fn run(&mut self) -> Result<()> {
        let workers = self.stages.workers.clone();
        let (to_collector, from_workers) = mpsc::channel::<u64>();

        let mut worker_txs = Vec::new();
        for worker in &workers {
            let (tx, rx) = mpsc::channel::<u64>();
            worker_txs.push(tx);
            let to_collector = to_collector.clone();
            let thread = spawn_stage(worker.name(), worker.clone(), move |node| {
                while let Ok(item) = rx.recv() {
                    let started = Instant::now();
                    // Some jittery busy work standing in for a real kernel.
                    let spin = rand::thread_rng().gen_range(20_000..80_000);
                    let mut acc = item;
                    for i in 0..spin {
                        acc = acc.wrapping_mul(31).wrapping_add(i);
                    }
                    node.record_busy(started.elapsed());
                    node.record_tasks(1);
                    if to_collector.send(acc).is_err() {
                        break;
                    }
                }
                Ok(())
            })?;
            self.threads.push(thread);
        }
        drop(to_collector);

        let emitter = self.stages.emitter.clone().expect("demo farm has an emitter");
        let emitter_name = emitter.name().to_string();
        let emitter_workers = workers.clone();
        let thread = spawn_stage(&emitter_name, emitter, move |node| {
            let mut next = 0usize;
            for item in 0..ITEMS {
                // Round-robin over the workers the manager keeps active.
                let worker = loop {
                    let candidate = next % worker_txs.len();
                    next += 1;
                    if emitter_workers[candidate].is_active() {
                        break candidate;
                    }
                };
                if worker_txs[worker].send(item).is_err() {
                    break;
                }
                node.record_tasks(1);
            }
            Ok(())
        })?;
        self.threads.push(thread);

        let collector = self
            .stages
            .collector
            .clone()
            .expect("demo farm has a collector");
        let collector_name = collector.name().to_string();
        let collected = self.collected.clone();
        let thread = spawn_stage(&collector_name, collector, move |node| {
            while from_workers.recv().is_ok() {
                node.record_tasks(1);
                collected.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })?;
        self.threads.push(thread);

        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        for thread in self.threads.drain(..) {
            thread.join()?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // A simulated 8-core machine with one frequency domain.
    let platform = Arc::new(SimPlatform::builder().topology(1, 8, 1).build());

    let stages = FarmStages {
        emitter: Some(Arc::new(AdaptiveNode::new("emitter"))),
        workers: (0..4)
            .map(|i| Arc::new(AdaptiveNode::new(&format!("worker-{i}"))))
            .collect(),
        collector: Some(Arc::new(AdaptiveNode::new("collector"))),
    };

    let params = Parameters {
        strategy_mapping: MappingStrategy::Linear,
        strategy_frequencies: FrequencyStrategy::PowerConservative,
        required_bandwidth: 5_000.0,
        max_bandwidth_variation: 20.0,
        num_samples: 3,
        sampling_interval: Duration::from_millis(100),
        stabilization_period: 2,
        ..Parameters::default()
    };

    let collected = Arc::new(AtomicU64::new(0));
    let backend = DemoBackend {
        stages: stages.clone(),
        threads: Vec::new(),
        collected: collected.clone(),
    };

    let mut farm = AdaptiveFarm::new(
        params,
        platform.clone() as Arc<dyn Platform>,
        stages,
        Box::new(backend),
    )?;

    farm.run()?;

    // Give the control loop a few sampling windows to react before the
    // farm is torn down.
    std::thread::sleep(Duration::from_secs(2));
    farm.wait()?;

    println!("collected {} items", collected.load(Ordering::Relaxed));
    println!("programming calls observed by the simulated platform:");
    for op in platform.ops() {
        println!("  {:?}", op);
    }
    Ok(())
}
