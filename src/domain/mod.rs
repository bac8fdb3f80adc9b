//! Domain layer - Core entities and port definitions
//!
//! This module defines the records the engine reconciles and the traits
//! (ports) that providers and the controller client implement.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
