//! The adaptivity manager
//!
//! A dedicated control thread that maps stages onto cores, programs the
//! frequency domains, parks unused cores and samples worker load. When the
//! user contract is violated it searches for the cheapest
//! (frequency, workers) configuration that restores it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::arch::frequency::{governor_available_everywhere, Frequency, FrequencyDomain, Governor};
use crate::arch::platform::Platform;
use crate::arch::topology::{VirtualCore, VirtualCoreId};
use crate::farm::node::{AdaptiveNode, NodeError, StageSample};
use crate::farm::params::{FrequencyStrategy, MappingStrategy, Parameters, UnusedCoreStrategy};

/// Unrecoverable manager failures.
#[derive(Debug, Error)]
pub enum AdaptError {
    /// A governor, frequency or affinity call was refused with every
    /// fallback exhausted. Partial success would leave the machine in
    /// inconsistent governors, so the manager gives up.
    #[error("platform programming failed: {what}")]
    PlatformProgrammingFailed { what: String },

    /// The domains disagree on their frequency lists; the manager assumes
    /// a uniform machine.
    #[error("frequency domains expose different frequency lists")]
    NonUniformFrequencyDomains,

    /// A mapping strategy validation should have rejected.
    #[error("mapping strategy {0:?} is not supported")]
    UnsupportedStrategy(MappingStrategy),

    /// The topology has fewer virtual cores than stages to place.
    #[error("not enough virtual cores to map every stage")]
    NotEnoughCores,

    /// A stage failed to register its thread.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// The manager thread panicked.
    #[error("the manager thread panicked")]
    ManagerPanicked,
}

/// The stage nodes of a farm, handed to the manager at start.
#[derive(Clone, Default)]
pub struct FarmStages {
    /// The emitter, when the farm has one.
    pub emitter: Option<Arc<AdaptiveNode>>,
    /// The worker pool.
    pub workers: Vec<Arc<AdaptiveNode>>,
    /// The collector, when the farm has one.
    pub collector: Option<Arc<AdaptiveNode>>,
}

impl FarmStages {
    /// Every stage node, in emitter-workers-collector order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<AdaptiveNode>> {
        self.emitter
            .iter()
            .chain(self.workers.iter())
            .chain(self.collector.iter())
    }
}

#[derive(Default)]
struct StopFlag {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// Handle to a running manager.
pub struct ManagerHandle {
    shared: Arc<StopFlag>,
    handle: Option<JoinHandle<Result<(), AdaptError>>>,
}

impl ManagerHandle {
    /// Request a stop. Returns immediately; the manager exits after the
    /// current sleep/sample cycle, without actuating.
    pub fn stop(&self) {
        let mut stop = self.shared.stop.lock().expect("manager stop lock poisoned");
        *stop = true;
        self.shared.cv.notify_all();
    }

    /// Wait for the manager to exit and surface its fatal error, if any.
    pub fn join(mut self) -> Result<(), AdaptError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| AdaptError::ManagerPanicked)?,
            None => Ok(()),
        }
    }
}

/// Spawn the manager on its own control thread.
pub(crate) fn start(
    params: Parameters,
    platform: Arc<dyn Platform>,
    stages: FarmStages,
) -> ManagerHandle {
    let shared = Arc::new(StopFlag::default());
    let thread_shared = shared.clone();
    let handle = thread::Builder::new()
        .name("corral-manager".to_string())
        .spawn(move || {
            let mut manager = AdaptivityManager::new(params, platform, stages, thread_shared);
            let result = manager.run();
            if let Err(err) = &result {
                tracing::error!("adaptivity manager failed: {err}");
            }
            result
        })
        .expect("Failed to spawn the manager thread");
    ManagerHandle {
        shared,
        handle: Some(handle),
    }
}

struct AdaptivityManager {
    params: Parameters,
    platform: Arc<dyn Platform>,
    stages: FarmStages,
    shared: Arc<StopFlag>,

    max_num_workers: usize,
    current_num_workers: usize,
    current_frequency: Option<Frequency>,
    available_frequencies: Vec<Frequency>,

    emitter_vc: Option<VirtualCore>,
    collector_vc: Option<VirtualCore>,
    worker_vcs: Vec<VirtualCore>,
    unused_vcs: Vec<VirtualCore>,
    scalable_vcs: Vec<VirtualCore>,

    samples: Vec<Vec<StageSample>>,
    next_sample: usize,
    windows_seen: usize,
    stabilization_left: u32,
}

fn vc_ids(vcs: &[VirtualCore]) -> Vec<VirtualCoreId> {
    vcs.iter().map(|vc| vc.id).collect()
}

impl AdaptivityManager {
    fn new(
        params: Parameters,
        platform: Arc<dyn Platform>,
        stages: FarmStages,
        shared: Arc<StopFlag>,
    ) -> Self {
        let max_num_workers = stages.workers.len();
        let samples = vec![vec![StageSample::default(); params.num_samples]; max_num_workers];
        Self {
            params,
            platform,
            stages,
            shared,
            max_num_workers,
            current_num_workers: max_num_workers,
            current_frequency: None,
            available_frequencies: Vec::new(),
            emitter_vc: None,
            collector_vc: None,
            worker_vcs: Vec::new(),
            unused_vcs: Vec::new(),
            scalable_vcs: Vec::new(),
            samples,
            next_sample: 0,
            windows_seen: 0,
            stabilization_left: 0,
        }
    }

    fn run(&mut self) -> Result<(), AdaptError> {
        self.map_and_set_frequencies()?;
        self.sampling_loop()
    }

    /// One-shot startup: wait for the stage threads, place them, park the
    /// leftover cores and program the initial P-state.
    fn map_and_set_frequencies(&mut self) -> Result<(), AdaptError> {
        for node in self.stages.all() {
            node.wait_thread_creation();
        }

        match self.params.strategy_mapping {
            MappingStrategy::No => {
                // No affinity changes and no frequency changes at all.
                tracing::debug!("mapping disabled, leaving placement and frequencies alone");
                return Ok(());
            }
            MappingStrategy::Os => {
                if self.params.sensitive_emitter || self.params.sensitive_collector {
                    tracing::warn!(
                        "sensitive stages need a placement-controlling mapping, ignoring"
                    );
                }
                // Placement stays with the OS; frequency programming (if
                // any) has to target every domain.
                self.scalable_vcs = self.platform.topology().virtual_cores();
            }
            MappingStrategy::Linear | MappingStrategy::Auto => {
                self.map_linear()?;
            }
            MappingStrategy::CacheEfficient => {
                return Err(AdaptError::UnsupportedStrategy(MappingStrategy::CacheEfficient));
            }
        }

        if self.params.strategy_frequencies.programs_pstates() {
            self.setup_initial_pstate()?;
        }
        Ok(())
    }

    /// Linear placement: draw cores in an order that exhausts distinct
    /// physical cores before touching SMT siblings.
    fn map_linear(&mut self) -> Result<(), AdaptError> {
        let topology = self.platform.topology().clone();
        let mut unused: VecDeque<VirtualCore> = topology.linear_candidates().into();

        let emitter = self.stages.emitter.clone();
        let collector = self.stages.collector.clone();
        let workers = self.stages.workers.clone();

        let mut emitter_placed = false;
        let mut collector_placed = false;

        if self.params.strategy_frequencies != FrequencyStrategy::No
            && (self.params.sensitive_emitter || self.params.sensitive_collector)
        {
            let scalable_count = workers.len()
                + usize::from(emitter.is_some() && !self.params.sensitive_emitter)
                + usize::from(collector.is_some() && !self.params.sensitive_collector);
            let scalable_candidates: Vec<VirtualCore> =
                unused.iter().take(scalable_count).copied().collect();

            // Physical cores of the domains untouched by any scalable
            // candidate can run flat out without affecting the workers.
            let covering: HashSet<usize> = self
                .platform
                .domains_covering(&vc_ids(&scalable_candidates))
                .iter()
                .map(|domain| domain.id())
                .collect();
            let mut performance_cores: Vec<VirtualCore> = Vec::new();
            let mut seen_physical: HashSet<usize> = HashSet::new();
            for domain in self.platform.domains() {
                if covering.contains(&domain.id()) {
                    continue;
                }
                for vc_id in domain.virtual_cores() {
                    if let Some(vc) = topology.virtual_core(vc_id) {
                        if seen_physical.insert(vc.physical_core) {
                            performance_cores.push(vc);
                        }
                    }
                }
            }

            if performance_cores.is_empty() {
                tracing::warn!(
                    "no isolated frequency domain available, sensitive stages map like the others"
                );
            } else {
                let mut next = 0usize;
                if self.params.sensitive_emitter {
                    if let Some(emitter) = &emitter {
                        let vc = performance_cores[next % performance_cores.len()];
                        next += 1;
                        self.pin(emitter, vc)?;
                        self.force_top_frequency(vc)?;
                        self.emitter_vc = Some(vc);
                        emitter_placed = true;
                    }
                }
                if self.params.sensitive_collector {
                    if let Some(collector) = &collector {
                        let vc = performance_cores[next % performance_cores.len()];
                        self.pin(collector, vc)?;
                        self.force_top_frequency(vc)?;
                        self.collector_vc = Some(vc);
                        collector_placed = true;
                    }
                }
                // The pinned cores are spoken for; nobody else lands there
                // and the unused-core policy must not touch them.
                unused.retain(|vc| {
                    Some(*vc) != self.emitter_vc && Some(*vc) != self.collector_vc
                });
            }
        }

        // Emitter, workers, collector, in that order.
        if let Some(emitter) = &emitter {
            if !emitter_placed {
                let vc = unused.pop_front().ok_or(AdaptError::NotEnoughCores)?;
                self.pin(emitter, vc)?;
                self.emitter_vc = Some(vc);
                self.scalable_vcs.push(vc);
            }
        }
        for worker in &workers {
            let vc = unused.pop_front().ok_or(AdaptError::NotEnoughCores)?;
            self.pin(worker, vc)?;
            self.worker_vcs.push(vc);
            self.scalable_vcs.push(vc);
        }
        if let Some(collector) = &collector {
            if !collector_placed {
                let vc = unused.pop_front().ok_or(AdaptError::NotEnoughCores)?;
                self.pin(collector, vc)?;
                self.collector_vc = Some(vc);
                self.scalable_vcs.push(vc);
            }
        }

        self.unused_vcs = unused.into_iter().collect();
        self.treat_unused_cores()
    }

    /// Pin a stage's thread to a virtual core.
    fn pin(&self, node: &AdaptiveNode, vc: VirtualCore) -> Result<(), AdaptError> {
        let handler = node.thread_handler()?;
        if !handler.move_to(vc.id) {
            return Err(AdaptError::PlatformProgrammingFailed {
                what: format!("moving stage '{}' to virtual core {}", node.name(), vc.id),
            });
        }
        tracing::debug!(stage = node.name(), vc = vc.id, "pinned stage thread");
        Ok(())
    }

    /// Force the domain of a sensitive stage's core to its top frequency.
    fn force_top_frequency(&self, vc: VirtualCore) -> Result<(), AdaptError> {
        for domain in self.platform.domains_covering(&[vc.id]) {
            if domain.set_governor(Governor::Performance) {
                continue;
            }
            if domain.set_governor(Governor::Userspace) && domain.set_highest_userspace() {
                continue;
            }
            return Err(AdaptError::PlatformProgrammingFailed {
                what: format!("forcing top frequency on domain {}", domain.id()),
            });
        }
        Ok(())
    }

    /// Apply the unused-core policy to the cores nobody was pinned to.
    fn treat_unused_cores(&mut self) -> Result<(), AdaptError> {
        match self.effective_unused_strategy() {
            UnusedCoreStrategy::None => {}
            UnusedCoreStrategy::Off => {
                for vc in &self.unused_vcs {
                    if vc.hot_pluggable && !self.platform.hot_unplug(vc.id) {
                        tracing::warn!(vc = vc.id, "hot-unplug refused");
                    }
                }
            }
            UnusedCoreStrategy::LowestFrequency => {
                for domain in self.platform.domains_complete(&vc_ids(&self.unused_vcs)) {
                    if domain.set_governor(Governor::Powersave) {
                        continue;
                    }
                    if domain.set_governor(Governor::Userspace) && domain.set_lowest_userspace() {
                        continue;
                    }
                    return Err(AdaptError::PlatformProgrammingFailed {
                        what: format!("downclocking unused domain {}", domain.id()),
                    });
                }
            }
            UnusedCoreStrategy::Auto => unreachable!("auto is resolved before dispatch"),
        }
        Ok(())
    }

    /// Resolve `Auto` against what the hardware supports.
    fn effective_unused_strategy(&self) -> UnusedCoreStrategy {
        match self.params.strategy_unused_vc {
            UnusedCoreStrategy::Auto => {
                if self.unused_vcs.iter().any(|vc| vc.hot_pluggable) {
                    UnusedCoreStrategy::Off
                } else {
                    let domains = self.platform.domains();
                    if governor_available_everywhere(&domains, Governor::Powersave)
                        || governor_available_everywhere(&domains, Governor::Userspace)
                    {
                        UnusedCoreStrategy::LowestFrequency
                    } else {
                        UnusedCoreStrategy::None
                    }
                }
            }
            strategy => strategy,
        }
    }

    /// Snapshot the frequency list and start from the highest frequency.
    fn setup_initial_pstate(&mut self) -> Result<(), AdaptError> {
        let domains = self.platform.domains();
        let first = domains
            .first()
            .ok_or_else(|| AdaptError::PlatformProgrammingFailed {
                what: "no frequency domain available".to_string(),
            })?;
        let available = first.available_frequencies();

        // The whole machine is assumed uniform; refuse to run otherwise.
        if domains
            .iter()
            .any(|domain| domain.available_frequencies() != available)
        {
            return Err(AdaptError::NonUniformFrequencyDomains);
        }
        if available.is_empty() {
            return Err(AdaptError::PlatformProgrammingFailed {
                what: "domains expose no discrete frequencies".to_string(),
            });
        }

        let top = available[available.len() - 1];
        self.available_frequencies = available;
        self.update_pstate(&self.scalable_vcs.clone(), top)?;
        self.current_frequency = Some(top);
        Ok(())
    }

    /// Program governor and frequency on every domain covering `vcs`.
    fn update_pstate(&self, vcs: &[VirtualCore], frequency: Frequency) -> Result<(), AdaptError> {
        let governor = self.params.frequency_governor;
        for domain in self.platform.domains_covering(&vc_ids(vcs)) {
            if !domain.set_governor(governor) {
                return Err(AdaptError::PlatformProgrammingFailed {
                    what: format!("setting governor {governor:?} on domain {}", domain.id()),
                });
            }
            if governor != Governor::Userspace {
                let available = domain.available_frequencies();
                let lower = match self.params.frequency_lower_bound {
                    0 => available.first().copied().unwrap_or(0),
                    bound => bound,
                };
                let upper = match self.params.frequency_upper_bound {
                    0 => available.last().copied().unwrap_or(0),
                    bound => bound,
                };
                if !domain.set_governor_bounds(lower, upper) {
                    return Err(AdaptError::PlatformProgrammingFailed {
                        what: format!("bounding domain {} to [{lower}, {upper}]", domain.id()),
                    });
                }
            } else if self.params.strategy_frequencies != FrequencyStrategy::Os
                && !domain.set_userspace_frequency(frequency)
            {
                return Err(AdaptError::PlatformProgrammingFailed {
                    what: format!("setting {frequency} kHz on domain {}", domain.id()),
                });
            }
        }
        Ok(())
    }

    /// The periodic control loop.
    fn sampling_loop(&mut self) -> Result<(), AdaptError> {
        let interval = self.params.sampling_interval;
        loop {
            // The lock guards only the stop flag and is released for the
            // whole sleep, so stop() is never latency-bound to the interval.
            {
                let stop = self.shared.stop.lock().expect("manager stop lock poisoned");
                if *stop {
                    break;
                }
                let (stop, _) = self
                    .shared
                    .cv
                    .wait_timeout_while(stop, interval, |stop| !*stop)
                    .expect("manager stop lock poisoned");
                if *stop {
                    break;
                }
            }

            self.collect_samples();
            self.windows_seen += 1;
            if self.windows_seen < self.params.num_samples {
                // The ring is not primed yet; averages would be skewed.
                continue;
            }
            if self.stabilization_left > 0 {
                self.stabilization_left -= 1;
                continue;
            }

            let monitored = self.monitored_value();
            if self.is_contract_violated(monitored) {
                let (frequency, num_workers) = self.get_new_configuration(monitored);
                tracing::info!(
                    monitored,
                    ?frequency,
                    num_workers,
                    "contract violated, reconfiguring"
                );
                self.apply_configuration(frequency, num_workers)?;
            }
        }
        tracing::debug!("manager stopped");
        Ok(())
    }

    /// Read and reset every active worker's sample into the ring.
    fn collect_samples(&mut self) {
        for worker in 0..self.current_num_workers {
            self.samples[worker][self.next_sample] =
                self.stages.workers[worker].get_and_reset_sample();
        }
        self.next_sample = (self.next_sample + 1) % self.params.num_samples;
    }

    /// The quantity the contract is checked against: farm bandwidth in
    /// bandwidth mode, mean worker load otherwise.
    fn monitored_value(&self) -> f64 {
        if self.params.required_bandwidth > 0.0 {
            let tasks: u64 = self.samples[..self.current_num_workers]
                .iter()
                .flatten()
                .map(|sample| sample.tasks_count)
                .sum();
            tasks as f64
                / (self.params.num_samples as f64 * self.params.sampling_interval.as_secs_f64())
        } else if self.current_num_workers == 0 {
            0.0
        } else {
            let load: f64 = self.samples[..self.current_num_workers]
                .iter()
                .map(|ring| {
                    ring.iter().map(|sample| sample.load_percentage).sum::<f64>()
                        / self.params.num_samples as f64
                })
                .sum();
            load / self.current_num_workers as f64
        }
    }

    /// Whether `monitored` breaks the user contract.
    fn is_contract_violated(&self, monitored: f64) -> bool {
        if self.params.required_bandwidth > 0.0 {
            let required = self.params.required_bandwidth;
            (monitored - required).abs() > required * self.params.max_bandwidth_variation / 100.0
        } else {
            monitored < self.params.underload_threshold_farm
                || monitored > self.params.overload_threshold_farm
        }
    }

    /// Predict the monitored value under an alternative configuration.
    fn estimated_monitored_value(
        &self,
        monitored: f64,
        frequency: Option<Frequency>,
        num_workers: usize,
    ) -> f64 {
        if self.current_num_workers == 0 {
            return monitored;
        }
        let current = self.current_frequency.unwrap_or(1) as f64 * self.current_num_workers as f64;
        let candidate = frequency.unwrap_or(1) as f64 * num_workers as f64;
        if self.params.required_bandwidth > 0.0 {
            // More compute, more throughput.
            monitored * candidate / current
        } else {
            // More compute, less relative load.
            monitored * current / candidate
        }
    }

    /// The cheapest (frequency, workers) pair whose estimate satisfies the
    /// contract; the current configuration when none does.
    fn get_new_configuration(&self, monitored: f64) -> (Option<Frequency>, usize) {
        let candidates: Vec<Option<Frequency>> = if self.available_frequencies.is_empty() {
            // No frequency axis to explore; only the worker count varies.
            vec![self.current_frequency]
        } else {
            self.available_frequencies.iter().map(|f| Some(*f)).collect()
        };

        let mut best: Option<(f64, Option<Frequency>, usize)> = None;
        for num_workers in 1..=self.max_num_workers {
            for &frequency in &candidates {
                let estimate = self.estimated_monitored_value(monitored, frequency, num_workers);
                if self.is_contract_violated(estimate) {
                    continue;
                }
                let power = self
                    .params
                    .power_model
                    .estimated_power(frequency.unwrap_or(1), num_workers);
                if best.map_or(true, |(cheapest, _, _)| power < cheapest) {
                    best = Some((power, frequency, num_workers));
                }
            }
        }

        match best {
            Some((_, frequency, num_workers)) => (frequency, num_workers),
            None => (self.current_frequency, self.current_num_workers),
        }
    }

    /// Actuate a configuration chosen by the search.
    fn apply_configuration(
        &mut self,
        frequency: Option<Frequency>,
        num_workers: usize,
    ) -> Result<(), AdaptError> {
        if num_workers == self.current_num_workers && frequency == self.current_frequency {
            return Ok(());
        }

        if num_workers != self.current_num_workers {
            for (index, worker) in self.stages.workers.iter().enumerate() {
                if index < num_workers {
                    worker.activate();
                } else {
                    worker.deactivate();
                }
            }
            self.current_num_workers = num_workers;
        }

        if let Some(frequency) = frequency {
            if Some(frequency) != self.current_frequency
                && self.params.strategy_frequencies.programs_pstates()
            {
                self.update_pstate(&self.scalable_vcs.clone(), frequency)?;
                self.current_frequency = Some(frequency);
            }
        }

        self.stabilization_left = self.params.stabilization_period;
        Ok(())
    }
}
