//! Domain model module declarations.

pub mod manifest;
pub mod module;
