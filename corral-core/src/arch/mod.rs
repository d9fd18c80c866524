//! Hardware view
//!
//! This module is responsible for:
//! - Modelling the topology (cpus, physical cores, virtual cores)
//! - Modelling frequency domains and governors
//! - Providing platform façades: local, remote, and simulated

pub mod frequency;
pub mod local;
pub mod platform;
pub mod sim;
pub mod topology;

pub use frequency::{governor_available_everywhere, Frequency, FrequencyDomain, Governor};
pub use local::LocalPlatform;
pub use platform::{platform_from, Communicator, EnergyReading, Platform, ThreadHandler};
pub use sim::{SimOp, SimPlatform, SimPlatformBuilder};
pub use topology::{
    Cpu, CpuId, PhysicalCore, PhysicalCoreId, Topology, VirtualCore, VirtualCoreId,
};

/// Detect the topology of the machine we are running on.
pub fn detect_topology() -> Topology {
    LocalPlatform::detect().topology().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_topology() {
        let topology = detect_topology();
        println!("Detected {} virtual cores", topology.virtual_cores().len());
        assert!(!topology.virtual_cores().is_empty());
    }
}
