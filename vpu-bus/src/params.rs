//! Encode parameters and the firmware open parameters derived from them.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::format::{FrameFormat, PixelFormat};

pub const QP_MIN: u32 = 0;
pub const QP_MAX: u32 = 63;
pub const DEFAULT_MIN_QP: u32 = 8;
pub const DEFAULT_MAX_QP: u32 = 51;
pub const VBV_MIN_MS: u32 = 10;
pub const VBV_MAX_MS: u32 = 3000;
pub const DEFAULT_FRAME_RATE: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H264Profile {
    Baseline,
    ConstrainedBaseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444Predictive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HevcProfile {
    Main,
    MainStillPicture,
    Main10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", content = "profile", rename_all = "lowercase")]
pub enum Profile {
    H264(H264Profile),
    Hevc(HevcProfile),
}

impl Profile {
    /// Firmware profile code.
    pub fn code(&self) -> u32 {
        match self {
            Profile::H264(p) => match p {
                H264Profile::Baseline | H264Profile::ConstrainedBaseline => 1,
                H264Profile::Main => 2,
                H264Profile::Extended => 3,
                H264Profile::High => 4,
                H264Profile::High10 => 5,
                H264Profile::High422 => 6,
                H264Profile::High444Predictive => 7,
            },
            Profile::Hevc(p) => match p {
                HevcProfile::Main => 1,
                HevcProfile::Main10 => 2,
                HevcProfile::MainStillPicture => 3,
            },
        }
    }

    /// Internal bit depth implied by the profile.
    pub fn bit_depth(&self) -> u32 {
        match self {
            Profile::H264(
                H264Profile::High10 | H264Profile::High422 | H264Profile::High444Predictive,
            ) => 10,
            Profile::Hevc(HevcProfile::Main10) => 10,
            _ => 8,
        }
    }

    pub fn codec(&self) -> PixelFormat {
        match self {
            Profile::H264(_) => PixelFormat::H264,
            Profile::Hevc(_) => PixelFormat::Hevc,
        }
    }

    pub fn default_for(codec: PixelFormat) -> Self {
        match codec {
            PixelFormat::H264 => Profile::H264(H264Profile::Baseline),
            _ => Profile::Hevc(HevcProfile::Main),
        }
    }
}

/// Codec level as `major * 10 + minor` (e.g. 41 for level 4.1).
/// H.264 level 1b is written as 9.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", content = "level", rename_all = "lowercase")]
pub enum Level {
    H264(u32),
    Hevc(u32),
}

impl Level {
    const H264_LEVELS: [u32; 16] = [9, 10, 11, 12, 13, 20, 21, 22, 30, 31, 32, 40, 41, 42, 50, 51];
    const HEVC_LEVELS: [u32; 10] = [10, 20, 21, 30, 31, 40, 41, 50, 51, 52];

    /// Firmware level code; HEVC levels are scaled by 3 (general_level_idc).
    pub fn code(&self) -> u32 {
        match self {
            Level::H264(l) => *l,
            Level::Hevc(l) => l * 3,
        }
    }

    pub fn codec(&self) -> PixelFormat {
        match self {
            Level::H264(_) => PixelFormat::H264,
            Level::Hevc(_) => PixelFormat::Hevc,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Level::H264(l) => Self::H264_LEVELS.contains(l),
            Level::Hevc(l) => Self::HEVC_LEVELS.contains(l),
        }
    }

    pub fn default_for(codec: PixelFormat) -> Self {
        match codec {
            PixelFormat::H264 => Level::H264(10),
            _ => Level::Hevc(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpRange {
    pub min: u32,
    pub max: u32,
}

impl Default for QpRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_QP,
            max: DEFAULT_MAX_QP,
        }
    }
}

impl QpRange {
    fn validate(&self) -> Result<(), ConfigError> {
        for (param, value) in [("min_qp", self.min), ("max_qp", self.max)] {
            if value > QP_MAX {
                return Err(ConfigError::OutOfRange {
                    param,
                    value: value as i64,
                    min: QP_MIN as i64,
                    max: QP_MAX as i64,
                });
            }
        }
        if self.min > self.max {
            return Err(ConfigError::QpOrder {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Per-session encode settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeParams {
    pub profile: Profile,
    pub level: Level,
    pub qp_i: QpRange,
    pub qp_p: QpRange,
    pub qp_b: QpRange,
    pub hflip: bool,
    pub vflip: bool,
    /// Degrees clockwise: 0, 90, 180 or 270.
    pub rotation: u32,
    /// VBV buffer size in milliseconds.
    pub vbv_size: u32,
    /// Frames per second.
    pub frame_rate: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self::for_codec(PixelFormat::CODEC[0])
    }
}

impl EncodeParams {
    pub fn for_codec(codec: PixelFormat) -> Self {
        Self {
            profile: Profile::default_for(codec),
            level: Level::default_for(codec),
            qp_i: QpRange::default(),
            qp_p: QpRange::default(),
            qp_b: QpRange::default(),
            hflip: false,
            vflip: false,
            rotation: 0,
            vbv_size: VBV_MAX_MS,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }

    /// Applies the same QP bounds to every frame type.
    pub fn with_qp(mut self, min: u32, max: u32) -> Self {
        let range = QpRange { min, max };
        self.qp_i = range;
        self.qp_p = range;
        self.qp_b = range;
        self
    }

    /// Sets the frame rate from a time-per-frame fraction. A zero term
    /// leaves the current rate in place.
    pub fn set_time_per_frame(&mut self, numerator: u32, denominator: u32) {
        if numerator != 0 && denominator != 0 {
            self.frame_rate = denominator / numerator;
        }
    }

    /// Mirror bitmask understood by the firmware: bit 1 horizontal, bit 0 vertical.
    pub fn mirror_direction(&self) -> u32 {
        ((self.hflip as u32) << 1) | self.vflip as u32
    }

    pub fn bit_depth(&self) -> u32 {
        self.profile.bit_depth()
    }

    pub fn validate(&self, codec: PixelFormat) -> Result<(), ConfigError> {
        if self.profile.codec() != codec {
            return Err(ConfigError::CodecMismatch {
                what: "profile",
                codec,
            });
        }
        if self.level.codec() != codec {
            return Err(ConfigError::CodecMismatch {
                what: "level",
                codec,
            });
        }
        if !self.level.is_valid() {
            let value = match self.level {
                Level::H264(l) | Level::Hevc(l) => l,
            };
            return Err(ConfigError::OutOfRange {
                param: "level",
                value: value as i64,
                min: 9,
                max: 52,
            });
        }
        self.qp_i.validate()?;
        self.qp_p.validate()?;
        self.qp_b.validate()?;
        if self.rotation % 90 != 0 || self.rotation >= 360 {
            return Err(ConfigError::Rotation(self.rotation));
        }
        if !(VBV_MIN_MS..=VBV_MAX_MS).contains(&self.vbv_size) {
            return Err(ConfigError::OutOfRange {
                param: "vbv_size",
                value: self.vbv_size as i64,
                min: VBV_MIN_MS as i64,
                max: VBV_MAX_MS as i64,
            });
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::OutOfRange {
                param: "frame_rate",
                value: 0,
                min: 1,
                max: u32::MAX as i64,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GopPreset {
    /// I frame followed by single-reference P frames.
    IppSingle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshType {
    NonIrap,
    Cra,
    Idr,
}

/// Everything the firmware needs to open an encoder instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParam {
    pub codec: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub vbv_size: u32,
    pub profile: u32,
    pub level: u32,
    pub bit_depth: u32,
    pub qp_i: QpRange,
    pub qp_p: QpRange,
    pub qp_b: QpRange,
    pub cbcr_interleave: bool,
    pub nv21: bool,
    pub line_buf_int_en: bool,
    pub gop_preset: GopPreset,
    pub refresh_type: RefreshType,
    pub intra_qp: u32,
    /// -1 lets rate control pick the first QP.
    pub initial_rc_qp: i32,
    pub tmvp_enable: bool,
    pub max_num_merge: u32,
    pub sao_enable: bool,
    pub transform8x8_enable: bool,
    pub cu_level_rc_enable: bool,
    pub hvs_qp_enable: bool,
    pub hvs_qp_scale: u32,
    pub hvs_max_delta_qp: u32,
    pub strong_intra_smooth_enable: bool,
    pub entropy_coding_mode: u32,
    pub rc_weight_param: u32,
    pub rc_weight_buf: u32,
    pub lambda_scaling_enable: bool,
}

impl Default for OpenParam {
    fn default() -> Self {
        Self {
            codec: PixelFormat::CODEC[0],
            width: 0,
            height: 0,
            frame_rate: DEFAULT_FRAME_RATE,
            vbv_size: VBV_MAX_MS,
            profile: 0,
            level: 0,
            bit_depth: 8,
            qp_i: QpRange::default(),
            qp_p: QpRange::default(),
            qp_b: QpRange::default(),
            cbcr_interleave: false,
            nv21: false,
            line_buf_int_en: true,
            gop_preset: GopPreset::IppSingle,
            refresh_type: RefreshType::NonIrap,
            intra_qp: 30,
            initial_rc_qp: -1,
            tmvp_enable: true,
            max_num_merge: 2,
            sao_enable: true,
            transform8x8_enable: true,
            cu_level_rc_enable: true,
            hvs_qp_enable: true,
            hvs_qp_scale: 2,
            hvs_max_delta_qp: 10,
            strong_intra_smooth_enable: true,
            entropy_coding_mode: 1,
            rc_weight_param: 16,
            rc_weight_buf: 128,
            lambda_scaling_enable: true,
        }
    }
}

impl OpenParam {
    pub fn new(src: &FrameFormat, dst: &FrameFormat, params: &EncodeParams) -> Self {
        Self {
            codec: dst.pixel_format,
            width: dst.width,
            height: dst.height,
            frame_rate: params.frame_rate,
            vbv_size: params.vbv_size,
            profile: params.profile.code(),
            level: params.level.code(),
            bit_depth: params.bit_depth(),
            qp_i: params.qp_i,
            qp_p: params.qp_p,
            qp_b: params.qp_b,
            cbcr_interleave: src.pixel_format.cbcr_interleave(),
            nv21: src.pixel_format.nv21(),
            ..Self::default()
        }
    }
}
