//! Mods/bots manifest read by the launched modules at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Contents of the manifest file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Mod entry scripts, package-resolved first, then local scripts.
    pub mods: Vec<String>,
    /// Bot name to bot directory.
    pub bots: BTreeMap<String, String>,
}
