//! JPEG encode/decode helpers shared by transports, the stream multiplexer and snapshots.

use image::codecs::jpeg::JpegEncoder;
use image::{GenericImageView, RgbImage};

use crate::error::CodecError;

/// Decode an encoded image into RGB8 pixels.
pub fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), CodecError> {
    let image = image::load_from_memory(bytes).map_err(CodecError::Decode)?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

/// Encode RGB8 pixels as JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, CodecError> {
    let image = RgbImage::from_raw(width, height, pixels.to_vec()).ok_or(
        CodecError::BufferSize {
            len: pixels.len(),
            width,
            height,
        },
    )?;
    encode_rgb_image(&image, quality)
}

pub fn encode_rgb_image(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(64 * 1024);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode_image(image).map_err(CodecError::Encode)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_jpeg_decodes_to_same_dimensions() {
        let pixels = vec![128u8; 32 * 24 * 3];
        let jpeg = encode_jpeg(&pixels, 32, 24, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let (decoded, width, height) = decode_jpeg(&jpeg).unwrap();
        assert_eq!((width, height), (32, 24));
        assert_eq!(decoded.len(), 32 * 24 * 3);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let err = encode_jpeg(&[0u8; 10], 32, 24, 90).unwrap_err();
        assert!(matches!(
            err,
            CodecError::BufferSize {
                len: 10,
                width: 32,
                height: 24
            }
        ));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            decode_jpeg(b"not a jpeg"),
            Err(CodecError::Decode(_))
        ));
    }
}
