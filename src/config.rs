use std::sync::LazyLock;

use serde::Deserialize;
use vpu_bus::{config::EngineConfig, format::PixelFormat, params::EncodeParams};

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "VPU_ENC_CONFIG";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    device: String,
    sessions: Vec<JobConfig>,
}

/// One encode job fed with synthetic frames.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub id: String,
    pub source: PixelFormat,
    pub codec: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub destination_buffers: u32,
    /// Simulated IDR interval, 0 for a single leading IDR.
    pub gop_size: u64,
    pub params: Option<EncodeParams>,
    pub engine: EngineConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            id: "enc0".to_string(),
            source: PixelFormat::Yuv420,
            codec: PixelFormat::Hevc,
            width: 416,
            height: 240,
            frames: 60,
            destination_buffers: 4,
            gop_size: 30,
            params: None,
            engine: EngineConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn encode_params(&self) -> EncodeParams {
        self.params
            .clone()
            .unwrap_or_else(|| EncodeParams::for_codec(self.codec))
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            device: "vpu0".to_string(),
            sessions: vec![JobConfig::default()],
        }
    }
}

impl DemoConfig {
    pub fn load() -> Self {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Self::default();
        };
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("config {} unusable, using defaults: {:#}", path, e);
                Self::default()
            }
        }
    }

    fn from_file(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn sessions(&self) -> &[JobConfig] {
        &self.sessions
    }
}

pub fn config() -> &'static DemoConfig {
    static CONFIG: LazyLock<DemoConfig> = LazyLock::new(DemoConfig::load);
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "sessions": [
                { "id": "cam1", "codec": "h264", "frames": 10,
                  "engine": { "queue_depth_cap": 1 } }
            ]
        }"#;
        let config: DemoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device(), "vpu0");
        let job = &config.sessions()[0];
        assert_eq!(job.id, "cam1");
        assert_eq!(job.codec, PixelFormat::H264);
        assert_eq!(job.width, 416);
        assert_eq!(job.engine.queue_depth_cap, 1);
        assert_eq!(job.engine.setup_timeout_ms, 60_000);
        assert_eq!(job.encode_params(), EncodeParams::for_codec(PixelFormat::H264));
    }
}
