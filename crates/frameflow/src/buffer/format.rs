//! Pixel formats and the attribute signature that keys a resource pool.

use serde::{Deserialize, Serialize};

use super::pool::PoolError;

/// Four-character pixel format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 32-bit BGRA, 8 bits per channel.
    pub const BGRA32: Self = Self::from_fourcc(*b"BGRA");
    /// 32-bit RGBA, 8 bits per channel.
    pub const RGBA32: Self = Self::from_fourcc(*b"RGBA");
    /// Bi-planar 4:2:0 luma/chroma, video range.
    pub const NV12_VIDEO_RANGE: Self = Self::from_fourcc(*b"420v");
    /// Bi-planar 4:2:0 luma/chroma, full range.
    pub const NV12_FULL_RANGE: Self = Self::from_fourcc(*b"420f");
    /// Single 8-bit component.
    pub const GRAY8: Self = Self::from_fourcc(*b"L008");

    pub const fn from_fourcc(code: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(code))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn fourcc(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Bytes needed for one frame of `width` x `height`, or `None` for formats
    /// whose layout is unknown (or on overflow).
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let w = usize::try_from(width).ok()?;
        let h = usize::try_from(height).ok()?;
        let pixels = w.checked_mul(h)?;

        match self {
            Self::BGRA32 | Self::RGBA32 => pixels.checked_mul(4),
            Self::GRAY8 => Some(pixels),
            Self::NV12_VIDEO_RANGE | Self::NV12_FULL_RANGE => {
                // Interleaved CbCr plane at half resolution, two bytes per sample.
                let chroma = w.div_ceil(2).checked_mul(h.div_ceil(2))?.checked_mul(2)?;
                pixels.checked_add(chroma)
            }
            _ => None,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::NV12_FULL_RANGE
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.fourcc();
        if code.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in code {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// Backend compatibility requirements. Fixed per cache by default, but part of
/// the signature so pools with different requirements never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compatibility {
    pub shared_surface: bool,
    pub image: bool,
    pub bitmap_context: bool,
    pub gpu: bool,
}

impl Compatibility {
    pub const ALL: Self = Self {
        shared_surface: true,
        image: true,
        bitmap_context: true,
        gpu: true,
    };

    pub const NONE: Self = Self {
        shared_surface: false,
        image: false,
        bitmap_context: false,
        gpu: false,
    };
}

impl Default for Compatibility {
    fn default() -> Self {
        Self::ALL
    }
}

/// Canonical key of one resource pool. Only obtainable through validation, so
/// width, height and format are always usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttributeSignature {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    compatibility: Compatibility,
}

impl AttributeSignature {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Result<Self, PoolError> {
        BufferAttributes::sized(width, height, pixel_format).validate()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn compatibility(&self) -> Compatibility {
        self.compatibility
    }
}

impl std::fmt::Display for AttributeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// Raw, possibly incomplete buffer request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAttributes {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub compatibility: Compatibility,
}

impl BufferAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sized(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self::new()
            .with_size(width, height)
            .with_pixel_format(pixel_format)
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    pub fn with_compatibility(mut self, compatibility: Compatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    /// Canonicalize into a signature. Width and height must be present and non-zero
    /// and a pixel format must be given.
    pub fn validate(&self) -> Result<AttributeSignature, PoolError> {
        let width = self.width.unwrap_or(0);
        let height = self.height.unwrap_or(0);

        if width == 0 {
            return Err(PoolError::InvalidAttributes("width must be > 0".to_string()));
        }
        if height == 0 {
            return Err(PoolError::InvalidAttributes("height must be > 0".to_string()));
        }
        let pixel_format = self
            .pixel_format
            .ok_or_else(|| PoolError::InvalidAttributes("pixel format missing".to_string()))?;

        Ok(AttributeSignature {
            width,
            height,
            pixel_format,
            compatibility: self.compatibility,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_displays_as_text() {
        assert_eq!(PixelFormat::BGRA32.to_string(), "BGRA");
        assert_eq!(PixelFormat::NV12_FULL_RANGE.to_string(), "420f");
        assert_eq!(PixelFormat::from_raw(1).to_string(), "0x00000001");
    }

    #[test]
    fn default_format_is_full_range_nv12() {
        assert_eq!(PixelFormat::default(), PixelFormat::NV12_FULL_RANGE);
    }

    #[test]
    fn frame_len_for_known_formats() {
        assert_eq!(PixelFormat::BGRA32.frame_len(4, 2), Some(32));
        assert_eq!(PixelFormat::GRAY8.frame_len(4, 2), Some(8));
        // 4x2 luma + 2x1 CbCr pairs
        assert_eq!(PixelFormat::NV12_FULL_RANGE.frame_len(4, 2), Some(12));
        // odd sizes round the chroma plane up
        assert_eq!(PixelFormat::NV12_VIDEO_RANGE.frame_len(3, 3), Some(9 + 8));
        assert_eq!(PixelFormat::from_fourcc(*b"v210").frame_len(4, 2), None);
    }

    #[test]
    fn validate_accepts_complete_attributes() {
        let signature = BufferAttributes::sized(1920, 1080, PixelFormat::BGRA32)
            .validate()
            .unwrap();
        assert_eq!(signature.width(), 1920);
        assert_eq!(signature.height(), 1080);
        assert_eq!(signature.pixel_format(), PixelFormat::BGRA32);
        assert_eq!(signature.compatibility(), Compatibility::ALL);
        assert_eq!(signature.to_string(), "1920x1080 BGRA");
    }

    #[test]
    fn validate_rejects_zero_width() {
        let err = BufferAttributes::sized(0, 1080, PixelFormat::BGRA32)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidAttributes(_)));
    }

    #[test]
    fn validate_checks_height_independently() {
        let err = BufferAttributes::sized(1920, 0, PixelFormat::BGRA32)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            PoolError::InvalidAttributes("height must be > 0".to_string())
        );
    }

    #[test]
    fn validate_rejects_missing_format_and_size() {
        let no_format = BufferAttributes::new().with_size(640, 480);
        assert!(no_format.validate().is_err());
        assert!(BufferAttributes::new().validate().is_err());
    }

    #[test]
    fn compatibility_distinguishes_signatures() {
        let a = AttributeSignature::new(640, 480, PixelFormat::BGRA32).unwrap();
        let b = BufferAttributes::sized(640, 480, PixelFormat::BGRA32)
            .with_compatibility(Compatibility::NONE)
            .validate()
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn signature_serializes() {
        let signature = AttributeSignature::new(640, 480, PixelFormat::BGRA32).unwrap();
        insta::assert_json_snapshot!("signature_640x480_bgra", signature);
    }
}
