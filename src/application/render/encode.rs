use image::{
    ExtendedColorType, ImageEncoder, ImageError,
    codecs::png::PngEncoder,
    error::{ParameterError, ParameterErrorKind},
};

use super::engine::Raster;

/// Encode an RGBA raster as PNG.
pub fn encode_png(raster: &Raster) -> Result<Vec<u8>, ImageError> {
    let expected = raster.width as usize * raster.height as usize * 4;
    if raster.pixels.len() != expected {
        return Err(ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::DimensionMismatch,
        )));
    }

    let mut buffer = Vec::with_capacity(expected / 2);
    PngEncoder::new(&mut buffer).write_image(
        &raster.pixels,
        raster.width,
        raster.height,
        ExtendedColorType::Rgba8,
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_carries_png_signature() {
        let raster = Raster {
            width: 2,
            height: 2,
            pixels: vec![255; 16],
        };
        let png = encode_png(&raster).expect("encode");
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let raster = Raster {
            width: 4,
            height: 4,
            pixels: vec![0; 3],
        };
        assert!(matches!(
            encode_png(&raster),
            Err(ImageError::Parameter(_))
        ));
    }
}
