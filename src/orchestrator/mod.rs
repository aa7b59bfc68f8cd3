//! Module orchestration.
//!
//! Covers module lifecycle management, crash restart, and per-job output
//! capture.

pub mod job_log;
pub mod module_manager;

pub use module_manager::ModuleManager;
