//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that adapters implement, keeping
//! the reconciliation engine independent of the cluster API and of HTTP.

pub mod ports;

pub use ports::*;
