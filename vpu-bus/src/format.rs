//! Pixel formats and plane geometry.
//!
//! The same derivation sizes both the caller's frame buffers and the
//! encoder's internal reference frames, so everything here is a pure
//! function of (format, width, height).

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MIN_ENC_WIDTH: u32 = 256;
pub const MAX_ENC_WIDTH: u32 = 8192;
pub const MIN_ENC_HEIGHT: u32 = 128;
pub const MAX_ENC_HEIGHT: u32 = 8192;

pub const DEFAULT_WIDTH: u32 = 416;
pub const DEFAULT_HEIGHT: u32 = 240;

pub const MAX_PLANES: usize = 3;

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0 in one contiguous buffer (I420).
    Yuv420,
    Nv12,
    Nv21,
    /// Planar 4:2:0, one buffer per component.
    Yuv420m,
    Nv12m,
    Nv21m,
    Hevc,
    H264,
    /// Anything the encoder has no explicit plane geometry for.
    #[serde(skip)]
    Other(u32),
}

impl PixelFormat {
    /// Raw formats accepted on the source queue, in enumeration order.
    pub const RAW: [PixelFormat; 6] = [
        PixelFormat::Yuv420,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Yuv420m,
        PixelFormat::Nv12m,
        PixelFormat::Nv21m,
    ];

    /// Compressed formats produced on the destination queue.
    pub const CODEC: [PixelFormat; 2] = [PixelFormat::Hevc, PixelFormat::H264];

    pub fn is_raw(&self) -> bool {
        Self::RAW.contains(self)
    }

    pub fn is_codec(&self) -> bool {
        Self::CODEC.contains(self)
    }

    /// Number of separately allocated memory planes.
    pub fn mem_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420m => 3,
            PixelFormat::Nv12m | PixelFormat::Nv21m => 2,
            _ => 1,
        }
    }

    /// Cb and Cr share one interleaved plane.
    pub fn cbcr_interleave(&self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12 | PixelFormat::Nv12m | PixelFormat::Nv21 | PixelFormat::Nv21m
        )
    }

    /// Interleaved chroma is stored Cr first.
    pub fn nv21(&self) -> bool {
        matches!(self, PixelFormat::Nv21 | PixelFormat::Nv21m)
    }

    pub fn fourcc(&self) -> u32 {
        let code: &[u8; 4] = match self {
            PixelFormat::Yuv420 => b"YU12",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Nv21 => b"NV21",
            PixelFormat::Yuv420m => b"YM12",
            PixelFormat::Nv12m => b"NM12",
            PixelFormat::Nv21m => b"NM21",
            PixelFormat::Hevc => b"HEVC",
            PixelFormat::H264 => b"H264",
            PixelFormat::Other(fourcc) => return *fourcc,
        };
        u32::from_le_bytes(*code)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.fourcc().to_le_bytes();
        let text: String = bytes
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect();
        write!(f, "{}", text)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Negotiated geometry of one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

impl FrameFormat {
    /// Builds a format with the plane layout derived for `width` x `height`.
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            planes: plane_layout(pixel_format, width, height),
        }
    }

    /// Clamps the requested size into the encoder's limits, like a
    /// try-format would, and derives the layout from the clamped size.
    pub fn negotiate(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        let width = width.clamp(MIN_ENC_WIDTH, MAX_ENC_WIDTH);
        let height = height.clamp(MIN_ENC_HEIGHT, MAX_ENC_HEIGHT);
        Self::new(pixel_format, width, height)
    }

    pub fn default_source() -> Self {
        Self::new(PixelFormat::RAW[0], DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }

    pub fn default_destination() -> Self {
        Self::new(PixelFormat::CODEC[0], DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }

    /// Same pixel format, new geometry.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        Self::new(self.pixel_format, width, height)
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn size_images(&self) -> Vec<u32> {
        self.planes.iter().map(|p| p.size_image).collect()
    }

    pub fn validate_raw(&self) -> Result<(), ConfigError> {
        if !self.pixel_format.is_raw() {
            return Err(ConfigError::UnsupportedSourceFormat(self.pixel_format));
        }
        Ok(())
    }

    pub fn validate_codec(&self) -> Result<(), ConfigError> {
        if !self.pixel_format.is_codec() {
            return Err(ConfigError::UnsupportedCodec(self.pixel_format));
        }
        Ok(())
    }
}

/// Per-plane stride and byte size for `pixel_format` at `width` x `height`.
///
/// Compressed formats fall through to the generic case: one plane, no
/// stride, `width * height` bytes.
pub fn plane_layout(pixel_format: PixelFormat, width: u32, height: u32) -> Vec<PlaneFormat> {
    let stride = align_up(width, 32);
    match pixel_format {
        PixelFormat::Yuv420 | PixelFormat::Nv12 | PixelFormat::Nv21 => vec![PlaneFormat {
            bytes_per_line: stride,
            size_image: stride * height * 3 / 2,
        }],
        PixelFormat::Yuv420m => vec![
            PlaneFormat {
                bytes_per_line: stride,
                size_image: stride * height,
            },
            PlaneFormat {
                bytes_per_line: stride / 2,
                size_image: stride * height / 4,
            },
            PlaneFormat {
                bytes_per_line: stride / 2,
                size_image: stride * height / 4,
            },
        ],
        PixelFormat::Nv12m | PixelFormat::Nv21m => vec![
            PlaneFormat {
                bytes_per_line: stride,
                size_image: stride * height,
            },
            PlaneFormat {
                bytes_per_line: stride,
                size_image: stride * height / 2,
            },
        ],
        _ => vec![PlaneFormat {
            bytes_per_line: 0,
            size_image: width * height,
        }],
    }
}

/// Size of one internal reconstructed frame for a `width` x `height` stream.
pub fn reference_frame_geometry(width: u32, height: u32) -> (u32, u32, usize) {
    let stride = align_up(width, 32);
    let height = align_up(height, 32);
    let luma = stride as usize * height as usize;
    let chroma = align_up(stride / 2, 16) as usize * height as usize;
    (stride, height, luma + chroma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semi_planar_two_plane_sizes() {
        let planes = plane_layout(PixelFormat::Nv12m, 416, 240);
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].bytes_per_line, 416);
        assert_eq!(planes[0].size_image, 99840);
        assert_eq!(planes[1].size_image, 49920);
    }

    #[test]
    fn single_plane_420_size() {
        for fmt in [PixelFormat::Yuv420, PixelFormat::Nv12, PixelFormat::Nv21] {
            let planes = plane_layout(fmt, 416, 240);
            assert_eq!(planes.len(), 1);
            assert_eq!(planes[0].size_image, 149760);
        }
    }

    #[test]
    fn three_plane_sizes_use_aligned_stride() {
        let planes = plane_layout(PixelFormat::Yuv420m, 1000, 100);
        assert_eq!(planes[0].bytes_per_line, 1024);
        assert_eq!(planes[0].size_image, 102400);
        assert_eq!(planes[1].bytes_per_line, 512);
        assert_eq!(planes[1].size_image, 25600);
        assert_eq!(planes[2].size_image, 25600);
    }

    #[test]
    fn codec_format_uses_generic_layout() {
        let planes = plane_layout(PixelFormat::Hevc, 416, 240);
        assert_eq!(planes, vec![PlaneFormat { bytes_per_line: 0, size_image: 99840 }]);
    }

    #[test]
    fn mem_planes_match_layout() {
        for fmt in PixelFormat::RAW {
            assert_eq!(fmt.mem_planes(), plane_layout(fmt, 640, 480).len(), "{}", fmt);
        }
    }

    #[test]
    fn negotiate_clamps_size() {
        let f = FrameFormat::negotiate(PixelFormat::Nv12, 16, 20_000);
        assert_eq!(f.width, MIN_ENC_WIDTH);
        assert_eq!(f.height, MAX_ENC_HEIGHT);
    }

    #[test]
    fn reference_geometry() {
        let (stride, height, size) = reference_frame_geometry(416, 240);
        assert_eq!(stride, 416);
        assert_eq!(height, 256);
        assert_eq!(size, 416 * 256 + 208 * 256);
    }

    #[test]
    fn display_fourcc() {
        assert_eq!(PixelFormat::Nv12m.to_string(), "NM12");
        assert_eq!(PixelFormat::Other(0).to_string(), "....");
    }

    #[test]
    fn chroma_flags() {
        assert!(PixelFormat::Nv21m.cbcr_interleave());
        assert!(PixelFormat::Nv21m.nv21());
        assert!(PixelFormat::Nv12.cbcr_interleave());
        assert!(!PixelFormat::Nv12.nv21());
        assert!(!PixelFormat::Yuv420.cbcr_interleave());
    }
}
