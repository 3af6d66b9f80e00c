use serde::{Deserialize, Serialize};

/// Tunables shared by a container and all of its rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// A row runs lazy garbage collection every this many writes (0 disables)
    pub gc_write_interval: u32,
    /// Payload summaries in diagnostic records are cut to this many chars
    pub max_payload_summary: usize,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            gc_write_interval: 16,
            max_payload_summary: 64,
        }
    }
}
