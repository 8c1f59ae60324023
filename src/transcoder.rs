use crate::config::IngestConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

/// Errors from decoding or re-encoding an image
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The bytes were not a decodable image, whatever their declared MIME type
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Normalized output of one transcode
#[derive(Debug, Clone)]
pub struct TranscodedImage {
    /// JPEG bytes
    pub bytes: Vec<u8>,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
}

/// Normalizes uploaded images: decode any allow-listed raster format,
/// bound the dimensions, re-encode as JPEG at a fixed quality.
///
/// Output is deterministic in visual terms but not bit-exact across
/// encoder versions; tests compare dimensions, format, and size bounds.
#[derive(Debug, Clone)]
pub struct Transcoder {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl Transcoder {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Decode, bound dimensions preserving aspect ratio, re-encode as JPEG.
    ///
    /// CPU-bound; callers on the async runtime run this on the blocking
    /// pool. Has no side effects; the caller persists the output.
    pub fn transcode(&self, bytes: &[u8]) -> Result<TranscodedImage, TranscodeError> {
        let decoded = image::load_from_memory(bytes).map_err(TranscodeError::Decode)?;

        let (src_width, src_height) = (decoded.width(), decoded.height());
        let bounded = if src_width > self.max_dimension || src_height > self.max_dimension {
            decoded.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3)
        } else {
            // Never upscale a smaller source
            decoded
        };

        // JPEG carries no alpha channel
        let rgb = bounded.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .map_err(TranscodeError::Encode)?;

        debug!(
            src_width,
            src_height,
            width,
            height,
            size_bytes = out.len(),
            "Image transcoded"
        );

        Ok(TranscodedImage {
            bytes: out,
            width,
            height,
        })
    }
}
