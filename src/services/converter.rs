use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::DynamicImage;

use crate::models::image::ImageFormat;

/// Decode `source` and re-encode it as `target`.
///
/// `ratio` depends on the target: JPEG reads it as a quality percentage
/// (clamped to 1..=100), PNG as a compression effort level where higher values
/// trade speed for smaller output. The same number does not mean the same
/// thing for both.
pub fn convert(source: &[u8], target: ImageFormat, ratio: i32) -> Result<Vec<u8>, ConvertError> {
    let decoded = image::load_from_memory(source).map_err(ConvertError::Decode)?;

    let mut output = Vec::new();
    match target {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut output, jpeg_quality(ratio));
            rgb.write_with_encoder(encoder)
                .map_err(|e| ConvertError::Encode(target, e))?;
        }
        ImageFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut output, png_compression(ratio), FilterType::Adaptive);
            decoded
                .write_with_encoder(encoder)
                .map_err(|e| ConvertError::Encode(target, e))?;
        }
    }

    Ok(output)
}

fn jpeg_quality(ratio: i32) -> u8 {
    ratio.clamp(1, 100) as u8
}

fn png_compression(ratio: i32) -> CompressionType {
    match ratio {
        i32::MIN..=33 => CompressionType::Fast,
        34..=66 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Name for the converted file: the source stem with the target's extension.
pub fn target_filename(source_name: &str, target: ImageFormat) -> String {
    let stem = match source_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => source_name,
    };
    format!("{stem}.{}", target.extension())
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("can't decode source image: {0}")]
    Decode(image::ImageError),

    #[error("can't encode image as {0}: {1}")]
    Encode(ImageFormat, image::ImageError),
}
