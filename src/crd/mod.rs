//! Custom Resource Definitions for the GPU Fleet Operator
//!
//! This module contains all CRD types:
//! - GPUDevice: one record per physical GPU
//! - GPUNodeState: per-node inventory and bootstrap status
//! - Condition: status condition shared by both

pub mod condition;
pub mod gpu_device;
pub mod gpu_node_state;

pub use condition::{condition_is_true, find_condition, set_condition, Condition, ConditionStatus};
pub use gpu_device::*;
pub use gpu_node_state::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
