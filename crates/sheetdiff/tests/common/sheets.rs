//! Synthetic drawing sheets: linework, filled blocks and circles on white.

#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_circle_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sheetdiff::imaging::aligner::warp_to_frame;
use sheetdiff::imaging::{encode_png, AffineTransform};

pub const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);
pub const INK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// A reproducible sheet: 2px linework, blocks and double-stroked circles,
/// kept inside the central 80% so small transforms stay in frame.
pub fn drawing_sheet(width: u32, height: u32, seed: u64) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(width, height, PAPER);
    let mut rng = StdRng::seed_from_u64(seed);
    let (w, h) = (width as f32, height as f32);

    for _ in 0..80 {
        let x0 = rng.random_range(0.1 * w..0.9 * w);
        let y0 = rng.random_range(0.1 * h..0.9 * h);
        let (x1, y1) = if rng.random_bool(0.5) {
            (rng.random_range(0.1 * w..0.9 * w), y0)
        } else {
            (x0, rng.random_range(0.1 * h..0.9 * h))
        };
        for o in [0.0, 1.0] {
            draw_line_segment_mut(&mut img, (x0 + o, y0), (x1 + o, y1), INK);
            draw_line_segment_mut(&mut img, (x0, y0 + o), (x1, y1 + o), INK);
        }
    }
    for _ in 0..30 {
        let x = rng.random_range((0.1 * w) as i32..(0.85 * w) as i32);
        let y = rng.random_range((0.1 * h) as i32..(0.85 * h) as i32);
        let rw = rng.random_range(10..(0.06 * w) as u32);
        let rh = rng.random_range(10..(0.06 * h) as u32);
        draw_filled_rect_mut(&mut img, Rect::at(x, y).of_size(rw, rh), INK);
    }
    for _ in 0..20 {
        let cx = rng.random_range((0.15 * w) as i32..(0.85 * w) as i32);
        let cy = rng.random_range((0.15 * h) as i32..(0.85 * h) as i32);
        let r = rng.random_range(8..(0.04 * w) as i32);
        draw_hollow_circle_mut(&mut img, (cx, cy), r, INK);
        draw_hollow_circle_mut(&mut img, (cx, cy), r + 1, INK);
    }
    img
}

/// Similarity transform that scales and rotates about the sheet centre.
pub fn about_center(scale: f64, rotation_deg: f64, width: u32, height: u32) -> AffineTransform {
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let (s, c) = rotation_deg.to_radians().sin_cos();
    let tx = cx - scale * (c * cx - s * cy);
    let ty = cy - scale * (s * cx + c * cy);
    AffineTransform::similarity(scale, rotation_deg.to_radians(), tx, ty)
}

/// The same sheet as re-plotted by a slightly misregistered scanner.
pub fn rescanned(sheet: &RgbaImage, transform: &AffineTransform) -> RgbaImage {
    warp_to_frame(sheet, transform, sheet.width(), sheet.height()).unwrap()
}

/// Adds a block that only exists in the newer revision.
pub fn with_added_block(sheet: &RgbaImage, x: i32, y: i32, size: u32) -> RgbaImage {
    let mut img = sheet.clone();
    draw_filled_rect_mut(&mut img, Rect::at(x, y).of_size(size, size), INK);
    img
}

pub fn png(img: &RgbaImage) -> Vec<u8> {
    encode_png(img).unwrap()
}
