#![forbid(unsafe_code)]
//! ExtentFS public API facade.
//!
//! Re-exports the engine from `efs-core` through a stable external
//! interface. This is the crate downstream consumers (CLI, tools) depend
//! on.

pub use efs_core::*;
