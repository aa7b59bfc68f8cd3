//! Error types shared across the launcher.

use std::fmt::{Display, Formatter};

/// Shared launcher result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Launcher error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Lifecycle call named a module absent from the descriptor table.
    UnknownModule(String),
    /// Package identifier could not be resolved to an entry script.
    Resolve(String),
    /// Job scheduler rejected an `add`, `start`, `stop` or `remove` call.
    Scheduler(String),
    /// Manifest serialization or write failure.
    Manifest(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Control socket setup failure.
    Ipc(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::UnknownModule(name) => write!(f, "unknown module: {name}"),
            Self::Resolve(msg) => write!(f, "resolve: {msg}"),
            Self::Scheduler(msg) => write!(f, "scheduler: {msg}"),
            Self::Manifest(msg) => write!(f, "manifest: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Manifest(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
