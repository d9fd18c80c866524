//! Corral Core - adaptive control for streaming worker farms
//!
//! A farm is the classic emitter-workers-collector pipeline. Corral wraps
//! an existing farm runtime and adds a control loop that pins stages to
//! cores, chooses how many workers stay active, and selects per-domain
//! frequencies so that a user contract (a throughput target or a load
//! band) is satisfied at minimum estimated power.
//!
//! The data plane is not corral's business: items move between stages
//! inside an external [`farm::FarmBackend`]. Corral observes the stages
//! through [`farm::AdaptiveNode`]s and reconfigures the machine through a
//! [`arch::Platform`] façade, which can be local, remote, or simulated.

/// Hardware view: topology, frequency domains, platform façades
pub mod arch;

/// Adaptive farm: nodes, parameters, manager and wrapper
pub mod farm;
