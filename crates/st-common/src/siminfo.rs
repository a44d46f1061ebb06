//! Simulation identity written into report documents.

use serde::{Deserialize, Serialize};

/// Identity of the running simulation.
///
/// Report writers take this as an explicit argument; there is no
/// process-wide instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationInfo {
    pub name: String,
    pub sim_version: String,
    /// Version of the telemetry framework. Serialized under the key the
    /// structured report format has always used.
    #[serde(rename = "sparta_version")]
    pub framework_version: String,
    /// Command line or seed needed to reproduce the run.
    pub reproduction: String,
}

impl SimulationInfo {
    pub fn new(name: impl Into<String>, sim_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sim_version: sim_version.into(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
            reproduction: String::new(),
        }
    }

    pub fn with_reproduction(mut self, reproduction: impl Into<String>) -> Self {
        self.reproduction = reproduction.into();
        self
    }

    /// Header pairs emitted by the tabular formatters.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sim_name", self.name.clone()),
            ("sim_version", self.sim_version.clone()),
            ("sparta_version", self.framework_version.clone()),
            ("reproduction", self.reproduction.clone()),
        ]
    }
}

impl Default for SimulationInfo {
    fn default() -> Self {
        Self::new("simulation", "0.0.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_framework_version_key() {
        let info = SimulationInfo::new("core_model", "1.2").with_reproduction("--seed 4");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "core_model");
        assert_eq!(json["reproduction"], "--seed 4");
        assert!(json.get("sparta_version").is_some());
    }
}
