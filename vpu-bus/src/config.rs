use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hw::COMMAND_QUEUE_DEPTH;

/// Firmware timeout for sequence init and the teardown drain.
pub const VPU_ENC_TIMEOUT_MS: u64 = 60_000;
pub const IRQ_FIFO_CAPACITY: usize = 16;

/// Per-session tunables of the encode engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum encode commands outstanding at once.
    pub queue_depth_cap: usize,
    pub setup_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub irq_fifo_capacity: usize,
    /// Source buffers the caller wants; 0 takes the hardware minimum.
    pub requested_source_buffers: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth_cap: COMMAND_QUEUE_DEPTH,
            setup_timeout_ms: VPU_ENC_TIMEOUT_MS,
            drain_timeout_ms: VPU_ENC_TIMEOUT_MS,
            irq_fifo_capacity: IRQ_FIFO_CAPACITY,
            requested_source_buffers: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth_cap == 0 {
            return Err(ConfigError::QueueDepth);
        }
        if self.irq_fifo_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                param: "irq_fifo_capacity",
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        Ok(())
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"queue_depth_cap": 1}"#).unwrap();
        assert_eq!(cfg.queue_depth_cap, 1);
        assert_eq!(cfg.setup_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.irq_fifo_capacity, 16);
    }

    #[test]
    fn zero_cap_rejected() {
        let cfg = EngineConfig {
            queue_depth_cap: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::QueueDepth));
    }
}
