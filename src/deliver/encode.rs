//! JPEG encoding for delivery and recording, and decoding for analysis.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView};

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        if !frame.is_valid() {
            return Err(anyhow!(
                "cannot encode frame {} with shape {}x{}x{} ({} bytes)",
                frame.sequence,
                frame.width,
                frame.height,
                frame.channels,
                frame.byte_len()
            ));
        }
        let mut out = Vec::with_capacity(frame.byte_len() / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(
                frame.pixels(),
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

/// Decode JPEG bytes into an RGB8 frame tagged with `sequence`.
pub fn decode_jpeg(bytes: &[u8], sequence: u64) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok(Frame::rgb(rgb.into_raw(), width, height, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_valid_frame_as_jpeg() {
        let frame = Frame::rgb(vec![120; 16 * 8 * 3], 16, 8, 3);
        let jpeg = FrameEncoder::default().encode(&frame).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_jpeg(&jpeg, 3).expect("decode");
        assert_eq!((decoded.width, decoded.height), (16, 8));
        assert!(decoded.is_valid());
    }

    #[test]
    fn rejects_invalid_frame() {
        let frame = Frame::rgb(vec![0; 10], 16, 8, 0);
        assert!(FrameEncoder::default().encode(&frame).is_err());
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(FrameEncoder::new(0).quality(), 1);
        assert_eq!(FrameEncoder::new(250).quality(), 100);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_jpeg(b"not a jpeg", 0).is_err());
    }
}
