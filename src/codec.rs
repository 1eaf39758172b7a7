//! Image snapshot codec.
//!
//! DESIGN
//! ======
//! Layer snapshots and paint patches travel as PNG. The format is lossless
//! for RGBA8, so encode-then-decode reproduces a buffer bit-for-bit; that
//! property is what lets the snapshot cache stand in for the raw buffer.

use std::io::Cursor;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageReader};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("buffer length {len} does not match {width}x{height} RGBA")]
    BufferSize { len: usize, width: u32, height: u32 },
}

/// A decoded snapshot: raw RGBA8 bytes plus dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Encode a raw RGBA8 buffer as PNG.
///
/// # Errors
///
/// Returns `BufferSize` when the buffer does not match the dimensions, or
/// `Encode` when the encoder fails.
pub fn encode(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>, CodecError> {
    if rgba.len() != width as usize * height as usize * 4 {
        return Err(CodecError::BufferSize { len: rgba.len(), width, height });
    }
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(rgba, width, height, ExtendedColorType::Rgba8)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode an encoded snapshot into raw RGBA8 bytes.
///
/// # Errors
///
/// Returns `Decode` when the bytes are not a well-formed image.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, CodecError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    let image = reader
        .decode()
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    let rgba = image.to_rgba8();
    Ok(DecodedImage { width: rgba.width(), height: rgba.height(), rgba: rgba.into_raw() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_bit_exact() {
        // Every byte value exercised, alpha included.
        let width = 16;
        let height = 4;
        let rgba: Vec<u8> = (0..width * height * 4).map(|i| (i % 256) as u8).collect();

        let encoded = encode(width as u32, height as u32, &rgba).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.width, width as u32);
        assert_eq!(decoded.height, height as u32);
        assert_eq!(decoded.rgba, rgba);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not a png at all").is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn encode_rejects_wrong_buffer_size() {
        let result = encode(4, 4, &[0u8; 10]);
        assert!(matches!(result, Err(CodecError::BufferSize { len: 10, .. })));
    }

    #[test]
    fn decode_preserves_transparency() {
        let rgba = vec![0u8; 4 * 2 * 2];
        let encoded = encode(2, 2, &rgba).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.rgba.iter().all(|&b| b == 0));
    }
}
