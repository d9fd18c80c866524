//! Adaptive farm
//!
//! This module is responsible for:
//! - Wrapping farm stages into adaptive nodes that publish samples
//! - Validating the adaptivity parameters
//! - Running the adaptivity manager around an external farm backend

pub mod adaptive;
pub mod manager;
pub mod node;
pub mod params;
pub mod power;

pub use adaptive::{spawn_stage, AdaptiveFarm, FarmBackend, StageThread};
pub use manager::{AdaptError, FarmStages, ManagerHandle};
pub use node::{AdaptiveNode, NodeError, StageHooks, StageSample};
pub use params::{
    FrequencyStrategy, MappingStrategy, Parameters, UnusedCoreStrategy, ValidationError,
};
pub use power::{LinearPowerModel, PowerModel, QuadraticPowerModel};
