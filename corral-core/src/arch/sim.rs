//! Simulated platform
//!
//! An in-memory stand-in for real hardware: synthetic topology, programmable
//! frequency domains (one per cpu package), and thread handlers that record
//! affinity moves instead of performing them. Tests and demos inject it where
//! production code would use the local platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::arch::frequency::{Frequency, FrequencyDomain, Governor};
use crate::arch::platform::{EnergyReading, Platform, ThreadHandler};
use crate::arch::topology::{Topology, VirtualCoreId};

/// A hardware programming call observed by the simulated platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// A governor switch on a domain.
    SetGovernor { domain: usize, governor: Governor },
    /// A governor bounds update on a domain.
    SetGovernorBounds {
        domain: usize,
        lower: Frequency,
        upper: Frequency,
    },
    /// An explicit frequency setpoint on a domain.
    SetUserspaceFrequency { domain: usize, frequency: Frequency },
    /// A highest-frequency setpoint on a domain.
    SetHighestUserspace { domain: usize },
    /// A lowest-frequency setpoint on a domain.
    SetLowestUserspace { domain: usize },
    /// A hot-unplug request for a virtual core.
    HotUnplug { vc: VirtualCoreId },
    /// An affinity move of a handled thread.
    MoveThread { handler: usize, vc: VirtualCoreId },
}

#[derive(Default)]
struct SimState {
    ops: Mutex<Vec<SimOp>>,
    moves: Mutex<HashMap<usize, VirtualCoreId>>,
    next_handler: AtomicUsize,
}

impl SimState {
    fn record(&self, op: SimOp) {
        self.ops.lock().expect("sim op log poisoned").push(op);
    }
}

/// Calls the simulated hardware should refuse.
#[derive(Debug, Clone, Default)]
struct SimFailures {
    governors: Vec<Governor>,
    userspace_setpoints: bool,
    moves: bool,
    hot_unplug: bool,
}

/// Builder for [`SimPlatform`].
pub struct SimPlatformBuilder {
    cpus: usize,
    cores_per_cpu: usize,
    siblings: usize,
    hot_pluggable: bool,
    governors: Vec<Governor>,
    frequencies: Vec<Frequency>,
    domain_frequencies: HashMap<usize, Vec<Frequency>>,
    failures: SimFailures,
    energy: Option<f64>,
}

impl SimPlatformBuilder {
    fn new() -> Self {
        Self {
            cpus: 1,
            cores_per_cpu: 2,
            siblings: 1,
            hot_pluggable: false,
            governors: Governor::ALL.to_vec(),
            frequencies: vec![1_000_000, 1_500_000, 2_000_000],
            domain_frequencies: HashMap::new(),
            failures: SimFailures::default(),
            energy: None,
        }
    }

    /// Shape of the synthetic topology: packages x cores x siblings.
    pub fn topology(mut self, cpus: usize, cores_per_cpu: usize, siblings: usize) -> Self {
        self.cpus = cpus;
        self.cores_per_cpu = cores_per_cpu;
        self.siblings = siblings;
        self
    }

    /// Mark every virtual core as hot-pluggable.
    pub fn hot_pluggable(mut self, hot_pluggable: bool) -> Self {
        self.hot_pluggable = hot_pluggable;
        self
    }

    /// Governors supported by every domain.
    pub fn governors(mut self, governors: &[Governor]) -> Self {
        self.governors = governors.to_vec();
        self
    }

    /// Discrete frequencies supported by every domain, ascending. kHz.
    pub fn frequencies(mut self, frequencies: &[Frequency]) -> Self {
        self.frequencies = frequencies.to_vec();
        self
    }

    /// Override the frequency list of a single domain.
    pub fn domain_frequencies(mut self, domain: usize, frequencies: &[Frequency]) -> Self {
        self.domain_frequencies.insert(domain, frequencies.to_vec());
        self
    }

    /// Refuse every attempt to switch to `governor`.
    pub fn fail_governor(mut self, governor: Governor) -> Self {
        self.failures.governors.push(governor);
        self
    }

    /// Refuse every explicit/highest/lowest frequency setpoint.
    pub fn fail_userspace_setpoints(mut self) -> Self {
        self.failures.userspace_setpoints = true;
        self
    }

    /// Refuse every affinity move.
    pub fn fail_moves(mut self) -> Self {
        self.failures.moves = true;
        self
    }

    /// Refuse every hot-unplug request.
    pub fn fail_hot_unplug(mut self) -> Self {
        self.failures.hot_unplug = true;
        self
    }

    /// Expose an energy counter snapshot.
    pub fn energy(mut self, package_joules: f64) -> Self {
        self.energy = Some(package_joules);
        self
    }

    /// Assemble the platform.
    pub fn build(self) -> SimPlatform {
        let topology = Topology::synthetic(self.cpus, self.cores_per_cpu, self.siblings)
            .with_hot_pluggable(self.hot_pluggable);
        let state = Arc::new(SimState::default());

        let domains = topology
            .cpus()
            .iter()
            .map(|cpu| {
                let vcs: Vec<VirtualCoreId> = cpu
                    .physical_cores
                    .iter()
                    .flat_map(|core| core.virtual_cores.iter().map(|vc| vc.id))
                    .collect();
                let frequencies = self
                    .domain_frequencies
                    .get(&cpu.id)
                    .cloned()
                    .unwrap_or_else(|| self.frequencies.clone());
                Arc::new(SimDomain {
                    id: cpu.id,
                    vcs,
                    governors: self.governors.clone(),
                    frequencies,
                    failures: self.failures.clone(),
                    current_governor: Mutex::new(None),
                    current_frequency: Mutex::new(None),
                    bounds: Mutex::new(None),
                    state: state.clone(),
                })
            })
            .collect();

        SimPlatform {
            topology,
            domains,
            state,
            failures: self.failures,
            energy: self.energy,
        }
    }
}

struct SimDomain {
    id: usize,
    vcs: Vec<VirtualCoreId>,
    governors: Vec<Governor>,
    frequencies: Vec<Frequency>,
    failures: SimFailures,
    current_governor: Mutex<Option<Governor>>,
    current_frequency: Mutex<Option<Frequency>>,
    bounds: Mutex<Option<(Frequency, Frequency)>>,
    state: Arc<SimState>,
}

impl FrequencyDomain for SimDomain {
    fn id(&self) -> usize {
        self.id
    }

    fn virtual_cores(&self) -> Vec<VirtualCoreId> {
        self.vcs.clone()
    }

    fn current_governor(&self) -> Option<Governor> {
        *self.current_governor.lock().expect("sim domain poisoned")
    }

    fn current_frequency(&self) -> Option<Frequency> {
        *self.current_frequency.lock().expect("sim domain poisoned")
    }

    fn available_governors(&self) -> Vec<Governor> {
        self.governors.clone()
    }

    fn available_frequencies(&self) -> Vec<Frequency> {
        self.frequencies.clone()
    }

    fn set_governor(&self, governor: Governor) -> bool {
        self.state.record(SimOp::SetGovernor {
            domain: self.id,
            governor,
        });
        if !self.governors.contains(&governor) || self.failures.governors.contains(&governor) {
            return false;
        }
        *self.current_governor.lock().expect("sim domain poisoned") = Some(governor);
        true
    }

    fn set_governor_bounds(&self, lower: Frequency, upper: Frequency) -> bool {
        self.state.record(SimOp::SetGovernorBounds {
            domain: self.id,
            lower,
            upper,
        });
        if lower > upper
            || !self.frequencies.contains(&lower)
            || !self.frequencies.contains(&upper)
        {
            return false;
        }
        *self.bounds.lock().expect("sim domain poisoned") = Some((lower, upper));
        true
    }

    fn set_userspace_frequency(&self, frequency: Frequency) -> bool {
        self.state.record(SimOp::SetUserspaceFrequency {
            domain: self.id,
            frequency,
        });
        if self.failures.userspace_setpoints
            || self.current_governor() != Some(Governor::Userspace)
            || !self.frequencies.contains(&frequency)
        {
            return false;
        }
        *self.current_frequency.lock().expect("sim domain poisoned") = Some(frequency);
        true
    }

    fn set_highest_userspace(&self) -> bool {
        self.state.record(SimOp::SetHighestUserspace { domain: self.id });
        match self.frequencies.last().copied() {
            Some(top) if !self.failures.userspace_setpoints => {
                *self.current_frequency.lock().expect("sim domain poisoned") = Some(top);
                true
            }
            _ => false,
        }
    }

    fn set_lowest_userspace(&self) -> bool {
        self.state.record(SimOp::SetLowestUserspace { domain: self.id });
        match self.frequencies.first().copied() {
            Some(bottom) if !self.failures.userspace_setpoints => {
                *self.current_frequency.lock().expect("sim domain poisoned") = Some(bottom);
                true
            }
            _ => false,
        }
    }
}

struct SimThreadHandler {
    id: usize,
    fail_moves: bool,
    state: Arc<SimState>,
}

impl ThreadHandler for SimThreadHandler {
    fn move_to(&self, vc: VirtualCoreId) -> bool {
        self.state.record(SimOp::MoveThread {
            handler: self.id,
            vc,
        });
        if self.fail_moves {
            return false;
        }
        self.state
            .moves
            .lock()
            .expect("sim move map poisoned")
            .insert(self.id, vc);
        true
    }
}

/// The simulated platform.
pub struct SimPlatform {
    topology: Topology,
    domains: Vec<Arc<SimDomain>>,
    state: Arc<SimState>,
    failures: SimFailures,
    energy: Option<f64>,
}

impl SimPlatform {
    /// Start building a simulated platform.
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder::new()
    }

    /// Every programming call observed so far, in order.
    pub fn ops(&self) -> Vec<SimOp> {
        self.state.ops.lock().expect("sim op log poisoned").clone()
    }

    /// Forget the calls observed so far.
    pub fn clear_ops(&self) {
        self.state.ops.lock().expect("sim op log poisoned").clear();
    }

    /// Where each handler's thread was last moved to.
    pub fn thread_moves(&self) -> HashMap<usize, VirtualCoreId> {
        self.state.moves.lock().expect("sim move map poisoned").clone()
    }
}

impl Platform for SimPlatform {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn domains(&self) -> Vec<Arc<dyn FrequencyDomain>> {
        self.domains
            .iter()
            .map(|domain| domain.clone() as Arc<dyn FrequencyDomain>)
            .collect()
    }

    fn thread_handler(&self) -> Arc<dyn ThreadHandler> {
        let id = self.state.next_handler.fetch_add(1, Ordering::Relaxed);
        Arc::new(SimThreadHandler {
            id,
            fail_moves: self.failures.moves,
            state: self.state.clone(),
        })
    }

    fn hot_unplug(&self, vc: VirtualCoreId) -> bool {
        self.state.record(SimOp::HotUnplug { vc });
        if self.failures.hot_unplug {
            return false;
        }
        self.topology
            .virtual_core(vc)
            .map(|vc| vc.hot_pluggable)
            .unwrap_or(false)
    }

    fn read_energy(&self) -> Option<EnergyReading> {
        self.energy.map(|package_joules| EnergyReading { package_joules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_domain_programming() {
        let platform = SimPlatform::builder()
            .topology(1, 2, 1)
            .frequencies(&[1_000_000, 2_000_000])
            .build();
        let domain = &platform.domains()[0];

        assert!(domain.set_governor(Governor::Userspace));
        assert_eq!(domain.current_governor(), Some(Governor::Userspace));
        assert!(domain.set_userspace_frequency(2_000_000));
        assert_eq!(domain.current_frequency(), Some(2_000_000));

        // Frequencies outside the advertised list are refused.
        assert!(!domain.set_userspace_frequency(1_700_000));

        assert_eq!(
            platform.ops(),
            vec![
                SimOp::SetGovernor {
                    domain: 0,
                    governor: Governor::Userspace
                },
                SimOp::SetUserspaceFrequency {
                    domain: 0,
                    frequency: 2_000_000
                },
                SimOp::SetUserspaceFrequency {
                    domain: 0,
                    frequency: 1_700_000
                },
            ]
        );
    }

    #[test]
    fn test_sim_governor_failure_injection() {
        let platform = SimPlatform::builder()
            .fail_governor(Governor::Performance)
            .build();
        let domain = &platform.domains()[0];
        assert!(!domain.set_governor(Governor::Performance));
        assert!(domain.set_governor(Governor::Powersave));
    }

    #[test]
    fn test_sim_thread_handler_records_moves() {
        let platform = SimPlatform::builder().topology(1, 4, 1).build();
        let first = platform.thread_handler();
        let second = platform.thread_handler();
        assert!(first.move_to(3));
        assert!(second.move_to(1));
        assert!(first.move_to(2));

        let moves = platform.thread_moves();
        assert_eq!(moves.get(&0), Some(&2));
        assert_eq!(moves.get(&1), Some(&1));
    }

    #[test]
    fn test_sim_energy_reading() {
        let platform = SimPlatform::builder().energy(42.5).build();
        assert_eq!(platform.read_energy().map(|r| r.package_joules), Some(42.5));
        assert!(SimPlatform::builder().build().read_energy().is_none());
    }

    #[test]
    fn test_sim_hot_unplug_respects_pluggability() {
        let pluggable = SimPlatform::builder().hot_pluggable(true).build();
        assert!(pluggable.hot_unplug(0));

        let fixed = SimPlatform::builder().build();
        assert!(!fixed.hot_unplug(0));
    }
}
