//! Frequency domains and governors
//!
//! A frequency domain is a set of virtual cores whose P-state is jointly
//! controlled. Domains expose the governors and discrete frequencies they
//! support, plus programming operations that report success as a boolean.

use std::sync::Arc;

use crate::arch::topology::VirtualCoreId;

/// A cpu frequency, in kHz.
pub type Frequency = u64;

/// Kernel policy controlling frequency selection within a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Governor {
    /// Run at the highest available frequency.
    Performance,

    /// Run at an explicit frequency chosen by the manager.
    Userspace,

    /// Run at the lowest available frequency.
    Powersave,

    /// Let the kernel scale aggressively with load.
    Ondemand,

    /// Let the kernel scale gradually with load.
    Conservative,
}

impl Governor {
    /// All governors a domain could possibly support.
    pub const ALL: [Governor; 5] = [
        Governor::Performance,
        Governor::Userspace,
        Governor::Powersave,
        Governor::Ondemand,
        Governor::Conservative,
    ];
}

/// A set of virtual cores sharing a P-state.
pub trait FrequencyDomain: Send + Sync {
    /// Stable id of this domain.
    fn id(&self) -> usize;

    /// The virtual cores whose frequency this domain controls.
    fn virtual_cores(&self) -> Vec<VirtualCoreId>;

    /// The governor currently driving this domain, when known.
    fn current_governor(&self) -> Option<Governor>;

    /// The current frequency of this domain, when known.
    fn current_frequency(&self) -> Option<Frequency>;

    /// Governors this domain supports.
    fn available_governors(&self) -> Vec<Governor>;

    /// Discrete frequencies this domain supports, ascending. May be empty.
    fn available_frequencies(&self) -> Vec<Frequency>;

    /// Switch the domain to the given governor.
    fn set_governor(&self, governor: Governor) -> bool;

    /// Constrain the governor to the `[lower, upper]` frequency range.
    fn set_governor_bounds(&self, lower: Frequency, upper: Frequency) -> bool;

    /// Program an explicit frequency (requires the userspace governor).
    fn set_userspace_frequency(&self, frequency: Frequency) -> bool;

    /// Program the highest available frequency.
    fn set_highest_userspace(&self) -> bool;

    /// Program the lowest available frequency.
    fn set_lowest_userspace(&self) -> bool;

    /// Whether this domain controls the given virtual core.
    fn contains(&self, vc: VirtualCoreId) -> bool {
        self.virtual_cores().contains(&vc)
    }
}

/// Whether `governor` is supported by every domain. False when there are no
/// domains at all.
pub fn governor_available_everywhere(
    domains: &[Arc<dyn FrequencyDomain>],
    governor: Governor,
) -> bool {
    !domains.is_empty()
        && domains
            .iter()
            .all(|domain| domain.available_governors().contains(&governor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;
    use crate::arch::platform::Platform;

    #[test]
    fn test_governor_available_everywhere_empty() {
        assert!(!governor_available_everywhere(&[], Governor::Userspace));
    }

    #[test]
    fn test_governor_available_everywhere() {
        let platform = SimPlatform::builder()
            .topology(1, 2, 1)
            .governors(&[Governor::Userspace, Governor::Performance])
            .build();
        let domains = platform.domains();
        assert!(governor_available_everywhere(&domains, Governor::Userspace));
        assert!(!governor_available_everywhere(&domains, Governor::Powersave));
    }
}
