//! Domain layer - Core types and port definitions
//!
//! Defines the traits (ports) the platform adapters, command channels and
//! pod APIs implement, and the value types passed between them.

pub mod ports;

pub use ports::*;
