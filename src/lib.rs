#![forbid(unsafe_code)]

//! Supervisor for the worker processes of a multi-process game server.
//!
//! The [`ModuleManager`] decides how many jobs each module runs, builds
//! their environments, starts and stops them through a [`JobScheduler`],
//! and restarts jobs that crash. The [`manifest`] builder writes the
//! mods/bots manifest the modules read at startup. The [`control`] socket
//! lets a worker ask the launcher to shut down.

pub mod config;
pub mod control;
pub mod errors;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;

pub use config::LauncherConfig;
pub use errors::{AppError, Result};
pub use orchestrator::ModuleManager;
pub use scheduler::JobScheduler;
