use std::io::Cursor;

use image::imageops::FilterType;
use image::{GrayImage, ImageFormat, Luma, RgbaImage};

use crate::error::ImageError;

/// Decodes any raster format the `image` crate understands into RGBA.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, ImageError> {
    let img = image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
    let rgba = img.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(ImageError::Empty {
            width: rgba.width(),
            height: rgba.height(),
        });
    }
    Ok(rgba)
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, ImageError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::Empty {
            width: img.width(),
            height: img.height(),
        });
    }
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Rec.601 luma; transparent pixels are composited onto white first so
/// an empty alpha channel reads as paper.
pub fn to_gray(img: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y).0;
        let a = p[3] as f32 / 255.0;
        let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        let on_white = luma * a + 255.0 * (1.0 - a);
        Luma([on_white.round().clamp(0.0, 255.0) as u8])
    })
}

/// Proportional scale factor that brings the longest side down to
/// `max_dim`. Never upscales.
pub fn fit_scale(width: u32, height: u32, max_dim: u32) -> f64 {
    let longest = width.max(height);
    if longest <= max_dim || longest == 0 {
        1.0
    } else {
        max_dim as f64 / longest as f64
    }
}

/// Downscales so neither side exceeds `max_dim`. Returns the image and the
/// factor applied.
pub fn fit_within<P>(
    img: &image::ImageBuffer<P, Vec<P::Subpixel>>,
    max_dim: u32,
) -> (image::ImageBuffer<P, Vec<P::Subpixel>>, f64)
where
    P: image::Pixel + 'static,
    P::Subpixel: 'static,
{
    let scale = fit_scale(img.width(), img.height(), max_dim);
    if scale >= 1.0 {
        return (img.clone(), 1.0);
    }
    let w = ((img.width() as f64 * scale).round() as u32).max(1);
    let h = ((img.height() as f64 * scale).round() as u32).max(1);
    (image::imageops::resize(img, w, h, FilterType::Triangle), scale)
}
