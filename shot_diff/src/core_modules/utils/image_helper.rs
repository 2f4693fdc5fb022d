use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, RgbImage};

use crate::error::{DiffError, Result};

/// Encodes `image` as PNG and writes it to `path`.
pub fn save(path: &Path, image: &RgbImage) -> Result<()> {
    write_png(path, image).map_err(|source| DiffError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

fn write_png(path: &Path, image: &RgbImage) -> Result<(), ImageError> {
    let output = BufWriter::new(File::create(path)?);
    let encoder = PngEncoder::new(output);

    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;

    Ok(())
}
