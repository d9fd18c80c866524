//! Adaptivity parameters and validation
//!
//! This module defines the configuration the manager runs under and the
//! validation that must succeed before the farm is ever constructed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::arch::frequency::{governor_available_everywhere, Frequency, FrequencyDomain, Governor};
use crate::arch::platform::{Communicator, Platform};
use crate::farm::power::{PowerModel, QuadraticPowerModel};

/// How the manager controls P-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyStrategy {
    /// Frequencies are left alone.
    No,

    /// The OS governor stays in charge; the manager may only bound it.
    Os,

    /// The manager picks explicit frequencies, preferring the cheapest
    /// configuration that satisfies the contract.
    PowerConservative,
}

impl FrequencyStrategy {
    /// Whether this strategy programs explicit P-states.
    pub fn programs_pstates(&self) -> bool {
        !matches!(self, FrequencyStrategy::No | FrequencyStrategy::Os)
    }
}

/// How stage threads are placed onto virtual cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStrategy {
    /// No mapping at all; the manager also leaves frequencies alone.
    No,

    /// Placement is delegated to the OS scheduler.
    Os,

    /// One stage per virtual core, physical cores first, SMT last.
    Linear,

    /// Reserved; rejected by validation.
    CacheEfficient,

    /// Currently equivalent to [`Linear`](MappingStrategy::Linear).
    Auto,
}

/// What happens to cores nobody was pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedCoreStrategy {
    /// Leave them alone.
    None,

    /// Hot-unplug every unused core that supports it.
    Off,

    /// Force the lowest frequency on domains made entirely of unused cores.
    LowestFrequency,

    /// Pick between Off, LowestFrequency and None from what the hardware
    /// supports.
    Auto,
}

/// Why a parameter set was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A load threshold is outside [0, 100], or an underload threshold is
    /// above its overload counterpart.
    #[error("load thresholds out of range or inverted")]
    ThresholdsInvalid,

    /// The platform cannot support the requested frequency strategy: it has
    /// no frequency domains, or explicit control was requested without the
    /// userspace governor.
    #[error("the requested frequency strategy is unsupported on this platform")]
    StrategyFrequencyUnsupported,

    /// A sensitive emitter/collector needs PERFORMANCE or USERSPACE, and
    /// neither is available.
    #[error("sensitive stages need the performance or userspace governor")]
    EcSensitiveMissingGovernors,

    /// Sensitive stages were requested without a frequency strategy.
    #[error("sensitive stages require a frequency strategy")]
    EcSensitiveWrongFStrategy,

    /// The chosen governor is not available on every frequency domain.
    #[error("the chosen governor is not available on every domain")]
    GovernorUnsupported,

    /// The cache-efficient mapping strategy is reserved.
    #[error("the cache-efficient mapping strategy is not supported")]
    StrategyMappingUnsupported,

    /// Frequency bounds were given with a strategy that cannot honor them,
    /// or are not present in the available-frequency list.
    #[error("invalid frequency bounds")]
    InvalidFrequencyBounds,
}

/// Configuration of the adaptive farm.
#[derive(Clone)]
pub struct Parameters {
    /// Remote transport; `None` selects the local platform.
    pub communicator: Option<Arc<dyn Communicator>>,

    /// P-state control strategy.
    pub strategy_frequencies: FrequencyStrategy,

    /// Governor applied to scalable domains.
    pub frequency_governor: Governor,

    /// Thread-to-core placement scheme.
    pub strategy_mapping: MappingStrategy,

    /// Treatment of cores nobody was pinned to.
    pub strategy_unused_vc: UnusedCoreStrategy,

    /// Pin the emitter to a dedicated maximum-frequency domain.
    pub sensitive_emitter: bool,

    /// Pin the collector to a dedicated maximum-frequency domain.
    pub sensitive_collector: bool,

    /// Ring depth for load/throughput averaging.
    pub num_samples: usize,

    /// Period of the control loop.
    pub sampling_interval: Duration,

    /// Lower bound of the farm load band, percent.
    pub underload_threshold_farm: f64,

    /// Upper bound of the farm load band, percent.
    pub overload_threshold_farm: f64,

    /// Lower bound of the per-worker load band, percent.
    pub underload_threshold_worker: f64,

    /// Upper bound of the per-worker load band, percent.
    pub overload_threshold_worker: f64,

    /// Target throughput in items per second; nonzero switches the
    /// contract to bandwidth mode.
    pub required_bandwidth: f64,

    /// Tolerated deviation around the bandwidth target, percent.
    pub max_bandwidth_variation: f64,

    /// Whether the collector participates in remapping.
    pub migrate_collector: bool,

    /// Sample windows ignored after a reconfiguration.
    pub stabilization_period: u32,

    /// Lower clamp for governor bounds; 0 means the domain minimum.
    pub frequency_lower_bound: Frequency,

    /// Upper clamp for governor bounds; 0 means the domain maximum.
    pub frequency_upper_bound: Frequency,

    /// Model ranking candidate configurations by estimated power.
    pub power_model: Arc<dyn PowerModel>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            communicator: None,
            strategy_frequencies: FrequencyStrategy::No,
            frequency_governor: Governor::Userspace,
            strategy_mapping: MappingStrategy::Os,
            strategy_unused_vc: UnusedCoreStrategy::None,
            sensitive_emitter: false,
            sensitive_collector: false,
            num_samples: 10,
            sampling_interval: Duration::from_secs(1),
            underload_threshold_farm: 80.0,
            overload_threshold_farm: 90.0,
            underload_threshold_worker: 80.0,
            overload_threshold_worker: 90.0,
            required_bandwidth: 0.0,
            max_bandwidth_variation: 5.0,
            migrate_collector: true,
            stabilization_period: 4,
            frequency_lower_bound: 0,
            frequency_upper_bound: 0,
            power_model: Arc::new(QuadraticPowerModel),
        }
    }
}

impl fmt::Debug for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameters")
            .field("strategy_frequencies", &self.strategy_frequencies)
            .field("frequency_governor", &self.frequency_governor)
            .field("strategy_mapping", &self.strategy_mapping)
            .field("strategy_unused_vc", &self.strategy_unused_vc)
            .field("sensitive_emitter", &self.sensitive_emitter)
            .field("sensitive_collector", &self.sensitive_collector)
            .field("num_samples", &self.num_samples)
            .field("sampling_interval", &self.sampling_interval)
            .field("required_bandwidth", &self.required_bandwidth)
            .finish()
    }
}

impl Parameters {
    /// Validate against the platform and return the normalized copy the
    /// manager will run with: the governor is forced to userspace for
    /// strategies that program explicit P-states, and absent frequency
    /// bounds are defaulted to the domain minimum/maximum.
    pub fn validate(&self, platform: &dyn Platform) -> Result<Parameters, ValidationError> {
        let mut p = self.clone();

        let thresholds = [
            p.underload_threshold_farm,
            p.overload_threshold_farm,
            p.underload_threshold_worker,
            p.overload_threshold_worker,
        ];
        if p.underload_threshold_farm > p.overload_threshold_farm
            || p.underload_threshold_worker > p.overload_threshold_worker
            || thresholds.iter().any(|t| *t < 0.0 || *t > 100.0)
        {
            return Err(ValidationError::ThresholdsInvalid);
        }

        let domains = platform.domains();

        if p.strategy_frequencies != FrequencyStrategy::No {
            if domains.is_empty() {
                return Err(ValidationError::StrategyFrequencyUnsupported);
            }

            if p.strategy_frequencies != FrequencyStrategy::Os {
                // Explicit P-state control needs the userspace governor.
                p.frequency_governor = Governor::Userspace;
                if !governor_available_everywhere(&domains, Governor::Userspace) {
                    return Err(ValidationError::StrategyFrequencyUnsupported);
                }
            }

            if (p.sensitive_emitter || p.sensitive_collector)
                && !governor_available_everywhere(&domains, Governor::Performance)
                && !governor_available_everywhere(&domains, Governor::Userspace)
            {
                return Err(ValidationError::EcSensitiveMissingGovernors);
            }

            if !governor_available_everywhere(&domains, p.frequency_governor) {
                return Err(ValidationError::GovernorUnsupported);
            }
        } else if p.sensitive_emitter || p.sensitive_collector {
            return Err(ValidationError::EcSensitiveWrongFStrategy);
        }

        if p.strategy_mapping == MappingStrategy::CacheEfficient {
            return Err(ValidationError::StrategyMappingUnsupported);
        }

        if p.frequency_lower_bound != 0 || p.frequency_upper_bound != 0 {
            // Bounds only make sense when the OS stays in charge.
            if p.strategy_frequencies != FrequencyStrategy::Os {
                return Err(ValidationError::InvalidFrequencyBounds);
            }
            let available = domains
                .first()
                .map(|domain| domain.available_frequencies())
                .unwrap_or_default();
            if available.is_empty() {
                return Err(ValidationError::InvalidFrequencyBounds);
            }

            if p.frequency_lower_bound != 0 {
                if !available.contains(&p.frequency_lower_bound) {
                    return Err(ValidationError::InvalidFrequencyBounds);
                }
            } else {
                p.frequency_lower_bound = available[0];
            }

            if p.frequency_upper_bound != 0 {
                if !available.contains(&p.frequency_upper_bound) {
                    return Err(ValidationError::InvalidFrequencyBounds);
                }
            } else {
                p.frequency_upper_bound = available[available.len() - 1];
            }
        }

        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPlatform;

    fn full_platform() -> SimPlatform {
        SimPlatform::builder().topology(2, 2, 1).build()
    }

    fn bare_platform() -> SimPlatform {
        // Domains exist but support no governor and no discrete frequency,
        // like the read-only local view.
        SimPlatform::builder()
            .topology(1, 2, 1)
            .governors(&[])
            .frequencies(&[])
            .build()
    }

    #[test]
    fn test_defaults_validate() {
        let params = Parameters::default();
        assert!(params.validate(&full_platform()).is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let params = Parameters {
            underload_threshold_farm: 95.0,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::ThresholdsInvalid)
        );

        let params = Parameters {
            overload_threshold_worker: 130.0,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::ThresholdsInvalid)
        );
    }

    #[test]
    fn test_frequency_strategy_needs_programmable_domains() {
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::PowerConservative,
            ..Parameters::default()
        };
        assert!(params.validate(&full_platform()).is_ok());
        assert_eq!(
            params.validate(&bare_platform()).err(),
            Some(ValidationError::StrategyFrequencyUnsupported)
        );
    }

    #[test]
    fn test_governor_forced_to_userspace() {
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::PowerConservative,
            frequency_governor: Governor::Ondemand,
            ..Parameters::default()
        };
        let normalized = params.validate(&full_platform()).unwrap();
        assert_eq!(normalized.frequency_governor, Governor::Userspace);
    }

    #[test]
    fn test_sensitive_without_frequency_strategy() {
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::No,
            sensitive_emitter: true,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::EcSensitiveWrongFStrategy)
        );
    }

    #[test]
    fn test_sensitive_needs_suitable_governor() {
        let platform = SimPlatform::builder()
            .topology(2, 2, 1)
            .governors(&[Governor::Ondemand])
            .build();
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::Os,
            frequency_governor: Governor::Ondemand,
            sensitive_collector: true,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&platform).err(),
            Some(ValidationError::EcSensitiveMissingGovernors)
        );
    }

    #[test]
    fn test_governor_must_cover_every_domain() {
        let platform = SimPlatform::builder()
            .topology(2, 2, 1)
            .governors(&[Governor::Userspace])
            .build();
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::Os,
            frequency_governor: Governor::Conservative,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&platform).err(),
            Some(ValidationError::GovernorUnsupported)
        );
    }

    #[test]
    fn test_cache_efficient_rejected() {
        let params = Parameters {
            strategy_mapping: MappingStrategy::CacheEfficient,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::StrategyMappingUnsupported)
        );
    }

    #[test]
    fn test_bounds_need_os_strategy() {
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::PowerConservative,
            frequency_upper_bound: 2_000_000,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::InvalidFrequencyBounds)
        );
    }

    #[test]
    fn test_bounds_must_exist_in_frequency_list() {
        // With 1.0/1.5/2.0 GHz available, a 1.7 GHz bound matches nothing.
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::Os,
            frequency_upper_bound: 1_700_000,
            ..Parameters::default()
        };
        assert_eq!(
            params.validate(&full_platform()).err(),
            Some(ValidationError::InvalidFrequencyBounds)
        );
    }

    #[test]
    fn test_absent_bounds_default_to_domain_range() {
        let params = Parameters {
            strategy_frequencies: FrequencyStrategy::Os,
            frequency_lower_bound: 1_500_000,
            ..Parameters::default()
        };
        let normalized = params.validate(&full_platform()).unwrap();
        assert_eq!(normalized.frequency_lower_bound, 1_500_000);
        assert_eq!(normalized.frequency_upper_bound, 2_000_000);
    }

    #[test]
    fn test_validation_is_total_over_enum_combinations() {
        // Every combination of enum-valued options must classify as Ok or
        // one of the documented errors without panicking; on a fully
        // capable platform the only rejection is the reserved mapping.
        let platform = full_platform();
        let frequency_strategies = [
            FrequencyStrategy::No,
            FrequencyStrategy::Os,
            FrequencyStrategy::PowerConservative,
        ];
        let mappings = [
            MappingStrategy::No,
            MappingStrategy::Os,
            MappingStrategy::Linear,
            MappingStrategy::CacheEfficient,
            MappingStrategy::Auto,
        ];
        let unused = [
            UnusedCoreStrategy::None,
            UnusedCoreStrategy::Off,
            UnusedCoreStrategy::LowestFrequency,
            UnusedCoreStrategy::Auto,
        ];

        for strategy_frequencies in frequency_strategies {
            for governor in Governor::ALL {
                for strategy_mapping in mappings {
                    for strategy_unused_vc in unused {
                        for sensitive in [false, true] {
                            let params = Parameters {
                                strategy_frequencies,
                                frequency_governor: governor,
                                strategy_mapping,
                                strategy_unused_vc,
                                sensitive_emitter: sensitive,
                                sensitive_collector: sensitive,
                                ..Parameters::default()
                            };
                            let result = params.validate(&platform);
                            match result {
                                Ok(_) => {}
                                Err(ValidationError::StrategyMappingUnsupported) => {
                                    assert_eq!(
                                        strategy_mapping,
                                        MappingStrategy::CacheEfficient
                                    );
                                }
                                Err(ValidationError::EcSensitiveWrongFStrategy) => {
                                    assert!(sensitive);
                                    assert_eq!(
                                        strategy_frequencies,
                                        FrequencyStrategy::No
                                    );
                                }
                                Err(other) => {
                                    panic!("unexpected rejection {other:?} for {params:?}")
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
