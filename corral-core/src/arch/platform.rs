//! Platform façade
//!
//! The uniform hardware view the control plane consumes: topology,
//! frequency domains, energy counters and per-thread affinity handles.
//! Obtained either in-process ([`local::LocalPlatform`](crate::arch::local))
//! or through an opaque remote transport ([`Communicator`]).

use std::sync::Arc;

use anyhow::Result;

use crate::arch::frequency::FrequencyDomain;
use crate::arch::local::LocalPlatform;
use crate::arch::topology::{Topology, VirtualCoreId};

/// An OS handle to one stage's thread.
pub trait ThreadHandler: Send + Sync {
    /// Pin the handled thread to the given virtual core.
    fn move_to(&self, vc: VirtualCoreId) -> bool;
}

/// A snapshot of the package energy counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyReading {
    /// Energy consumed by the cpu packages since an arbitrary origin.
    pub package_joules: f64,
}

/// Uniform view over the hardware the manager reconfigures.
pub trait Platform: Send + Sync {
    /// The machine topology.
    fn topology(&self) -> &Topology;

    /// All frequency domains of the machine.
    fn domains(&self) -> Vec<Arc<dyn FrequencyDomain>>;

    /// An affinity handle for the calling thread.
    fn thread_handler(&self) -> Arc<dyn ThreadHandler>;

    /// Hot-unplug a virtual core. Returns false when refused.
    fn hot_unplug(&self, vc: VirtualCoreId) -> bool;

    /// Read the package energy counters, when the platform exposes them.
    fn read_energy(&self) -> Option<EnergyReading> {
        None
    }

    /// The domains containing *any* of the given virtual cores.
    fn domains_covering(&self, vcs: &[VirtualCoreId]) -> Vec<Arc<dyn FrequencyDomain>> {
        self.domains()
            .into_iter()
            .filter(|domain| vcs.iter().any(|vc| domain.contains(*vc)))
            .collect()
    }

    /// The domains *entirely contained within* the given virtual cores.
    fn domains_complete(&self, vcs: &[VirtualCoreId]) -> Vec<Arc<dyn FrequencyDomain>> {
        self.domains()
            .into_iter()
            .filter(|domain| {
                let owned = domain.virtual_cores();
                !owned.is_empty() && owned.iter().all(|vc| vcs.contains(vc))
            })
            .collect()
    }
}

/// An opaque transport to a remotely managed machine.
///
/// The wire protocol lives entirely behind this trait; the platform a
/// communicator hands back behaves exactly like a local one.
pub trait Communicator: Send + Sync {
    /// Connect and return the remote machine's platform façade.
    fn connect_platform(&self) -> Result<Arc<dyn Platform>>;
}

/// Obtain a platform: remote when a communicator is given, local otherwise.
pub fn platform_from(communicator: Option<Arc<dyn Communicator>>) -> Result<Arc<dyn Platform>> {
    match communicator {
        Some(communicator) => communicator.connect_platform(),
        None => Ok(Arc::new(LocalPlatform::detect())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;

    #[test]
    fn test_domains_covering_and_complete() {
        // 2 packages x 2 cores x 1 sibling, one domain per package:
        // domain 0 owns vcs {0, 1}, domain 1 owns vcs {2, 3}.
        let platform = SimPlatform::builder().topology(2, 2, 1).build();

        let covering = platform.domains_covering(&[1]);
        assert_eq!(covering.len(), 1);
        assert_eq!(covering[0].id(), 0);

        // Domain 1 is entirely inside {2, 3}; domain 0 is only touched.
        let complete = platform.domains_complete(&[1, 2, 3]);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].id(), 1);

        assert!(platform.domains_complete(&[0]).is_empty());
    }

    #[test]
    fn test_platform_from_local() {
        let platform = platform_from(None).unwrap();
        assert!(!platform.topology().virtual_cores().is_empty());
    }

    struct SimCommunicator;

    impl Communicator for SimCommunicator {
        fn connect_platform(&self) -> Result<Arc<dyn Platform>> {
            Ok(Arc::new(SimPlatform::builder().topology(1, 2, 1).build()))
        }
    }

    #[test]
    fn test_platform_from_communicator() {
        let platform = platform_from(Some(Arc::new(SimCommunicator))).unwrap();
        assert_eq!(platform.topology().virtual_cores().len(), 2);
    }
}
