//! Controller Facades
//!
//! Implementations of [`crate::domain::ports::ControllerFacade`]. The wire
//! client to a remote controller lives outside this crate.

pub mod memory;

pub use memory::*;
