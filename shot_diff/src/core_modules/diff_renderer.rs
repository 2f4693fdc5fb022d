// THEORY:
// The `DiffRenderer` turns the match decisions into pictures. It never decides
// anything itself; it only re-aligns and paints.
//
// Key architectural principles & algorithm steps:
// 1.  **Re-alignment by Template Search**: For every accepted pair the new
//     segment's grayscale crop is searched over the whole old grayscale image
//     (sum of squared differences). The minimum is where that content sits in
//     the old coordinate space, which absorbs small drift between captures.
//     Searches are independent, so they run in parallel.
// 2.  **Serial Painting**: The output canvas starts as a copy of the old color
//     image and is only touched after all searches are done, one pair at a
//     time: an outline in `BOUNDARY_COLOR`, then every pixel whose old value
//     (at the re-aligned offset) differs from the new value (at the original
//     offset) is recolored with `CHANGED_COLOR`.
// 3.  **Overlays**: Unmatched segments are boxed on a copy of their own image
//     (`DELETED_COLOR` for old, `ADDED_COLOR` for new).

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use imageproc::template_matching::{MatchTemplateMethod, find_extremes, match_template};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::core_modules::segment::{MatchPair, Segment};

pub const BOUNDARY_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const CHANGED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const DELETED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const ADDED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);

/// Position of `template` inside `haystack` with the smallest SSD. `None` when
/// the template does not fit.
pub fn locate(haystack: &GrayImage, template: &GrayImage) -> Option<(u32, u32)> {
    let (hw, hh) = haystack.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > hw || th > hh {
        return None;
    }
    let scores = match_template(haystack, template, MatchTemplateMethod::SumOfSquaredErrors);
    Some(find_extremes(&scores).min_value_location)
}

/// Paints the diff of every accepted pair onto a copy of `old_color`.
pub fn render_diff(
    old_color: &RgbImage,
    old_gray: &GrayImage,
    new_color: &RgbImage,
    new_segments: &[Segment<'_>],
    pairs: &[MatchPair],
) -> RgbImage {
    // --- 1. Re-align every pair ---
    let locations: Vec<Option<(u32, u32)>> = pairs
        .par_iter()
        .map(|pair| {
            let segment = &new_segments[pair.new];
            let location = locate(old_gray, &segment.crop().to_image());
            if location.is_none() {
                warn!(
                    old = pair.old,
                    new = pair.new,
                    area = ?segment.area,
                    "segment does not fit inside the old image, skipped"
                );
            }
            location
        })
        .collect();

    // --- 2. Paint ---
    let mut canvas = old_color.clone();
    let mut changed = 0usize;
    for (pair, location) in pairs.iter().zip(locations) {
        let Some((left, top)) = location else {
            continue;
        };
        let area = new_segments[pair.new].area;
        let aligned = Rect::at(left as i32, top as i32).of_size(area.width(), area.height());
        draw_hollow_rect_mut(&mut canvas, aligned, BOUNDARY_COLOR);

        for dy in 0..area.height() {
            for dx in 0..area.width() {
                let (ox, oy) = (left + dx, top + dy);
                let (nx, ny) = (area.left() as u32 + dx, area.top() as u32 + dy);
                if !in_bounds(old_color, ox, oy) || !in_bounds(new_color, nx, ny) {
                    continue;
                }
                if old_color.get_pixel(ox, oy) != new_color.get_pixel(nx, ny) {
                    canvas.put_pixel(ox, oy, CHANGED_COLOR);
                    changed += 1;
                }
            }
        }
    }

    debug!(pairs = pairs.len(), changed, "diff rendered");
    canvas
}

/// Boxes every segment that did not find a partner.
pub fn render_unmatched(color: &RgbImage, segments: &[Segment<'_>], outline: Rgb<u8>) -> RgbImage {
    let mut canvas = color.clone();
    for segment in segments.iter().filter(|segment| !segment.is_matched()) {
        draw_hollow_rect_mut(&mut canvas, segment.area, outline);
    }
    canvas
}

/// Boxes every segment.
pub fn render_segments(color: &RgbImage, segments: &[Segment<'_>], outline: Rgb<u8>) -> RgbImage {
    let mut canvas = color.clone();
    for segment in segments {
        draw_hollow_rect_mut(&mut canvas, segment.area, outline);
    }
    canvas
}

fn in_bounds(image: &RgbImage, x: u32, y: u32) -> bool {
    x < image.width() && y < image.height()
}
