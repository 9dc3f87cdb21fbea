//! Engine configuration.

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::wire::DEFAULT_BUFFER_SIZE;

/// Tunables for the execution engine.
///
/// Every field has a working default; deserializing `{}` yields the same
/// configuration as [`EngineConfig::default`]. Buffer sizes of `0` select
/// the built-in default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduling priority for the worker thread. Advisory on hosts
    /// without priority control.
    pub worker_priority: i32,
    /// CPU core to pin the worker to, or `-1` for no affinity.
    pub core_affinity: i32,
    /// Worker thread stack size in bytes.
    pub stack_size: usize,
    /// Receive buffer size in bytes, `0` for the default.
    pub rx_buffer_size: usize,
    /// Transmit buffer size in bytes, `0` for the default.
    pub tx_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_priority: 5,
            core_affinity: -1,
            stack_size: 256 * 1024,
            rx_buffer_size: 0,
            tx_buffer_size: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Effective receive buffer size after default substitution.
    pub fn effective_rx_size(&self) -> usize {
        if self.rx_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.rx_buffer_size
        }
    }

    /// Effective transmit buffer size after default substitution.
    pub fn effective_tx_size(&self) -> usize {
        if self.tx_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.tx_buffer_size
        }
    }
}
