// THEORY:
// The `Segmenter` cuts one screenshot into rectangular regions of coherent
// content (a button, a paragraph, an icon). It runs independently on the old
// and the new image, so the two calls are forked onto the worker pool.
//
// Algorithm steps:
// 1.  **Binarize**: fixed threshold on the grayscale matrix.
// 2.  **Ridges**: morphological gradient (3x3 square applied `GRADIENT_ITERATIONS`
//     times, i.e. a 15x15 window). Seven passes thicken the ridges enough that
//     neighboring widgets separate; fewer over-fragment, more over-merge.
// 3.  **Contours**: outer borders of the ridge mask are top-level components;
//     hole borders belong to their enclosing outer border.
// 4.  **Markers**: each top-level component gets a label starting at 1 and is
//     painted filled into a `LabelMap`; holes are painted with their parent's
//     label.
// 5.  **Watershed**: labels are shifted by +1 so that 0 stays "unknown", then
//     flooded over the color image.
// 6.  **Regions**: a raster scan starts an 8-connected breadth-first fill at
//     each unvisited pixel whose label is above 1, over pixels of the same
//     label. Visited markers are zeroed. A fill that never leaves its seed is
//     noise; every other fill yields its bounding rectangle.

use std::collections::VecDeque;

use image::{GrayImage, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::contrast::{ThresholdType, threshold};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use imageproc::point::Point;
use imageproc::rect::Rect;
use tracing::debug;

use crate::core_modules::segment::{Segment, Side};
use crate::core_modules::watershed::{LabelMap, watershed};

pub const DEFAULT_THRESHOLD: u8 = 200;
/// Number of 3x3 passes of the morphological gradient.
const GRADIENT_ITERATIONS: u8 = 7;

/// A connected region found by the final flood fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Inclusive bounding box of the visited pixels.
    pub rect: Rect,
    /// Number of visited pixels.
    pub area: usize,
}

/// Runs the full segmentation of one image and wraps the regions as segments.
pub fn detect_segments<'a>(
    side: Side,
    color: &RgbImage,
    gray: &'a GrayImage,
    bin_threshold: u8,
) -> Vec<Segment<'a>> {
    let regions = segment_regions(gray, color, bin_threshold);
    debug!(?side, regions = regions.len(), "segmentation finished");
    regions
        .into_iter()
        .map(|region| Segment::new(side, region.rect, gray))
        .collect()
}

/// Steps 1-6 on one image.
pub fn segment_regions(gray: &GrayImage, color: &RgbImage, bin_threshold: u8) -> Vec<Region> {
    let ridges = ridge_mask(gray, bin_threshold);
    let mut markers = contour_markers(&ridges);
    markers.offset(1);
    watershed(color, &mut markers);
    extract_regions(&mut markers)
}

/// Binarized morphological gradient.
pub fn ridge_mask(gray: &GrayImage, bin_threshold: u8) -> GrayImage {
    let binary = threshold(gray, bin_threshold, ThresholdType::Binary);
    let dilated = dilate(&binary, Norm::LInf, GRADIENT_ITERATIONS);
    let eroded = erode(&binary, Norm::LInf, GRADIENT_ITERATIONS);

    let mut gradient = dilated;
    for (out, low) in gradient.pixels_mut().zip(eroded.pixels()) {
        out.0[0] = out.0[0].saturating_sub(low.0[0]);
    }
    gradient
}

/// Labels every top-level contour of `mask` (holes included) into a fresh map.
pub fn contour_markers(mask: &GrayImage) -> LabelMap {
    let (width, height) = mask.dimensions();
    let mut markers = LabelMap::new(width, height);
    let contours = find_contours::<i32>(mask);

    let mut labels = vec![0; contours.len()];
    let mut next_label = 0;
    for (index, contour) in contours.iter().enumerate() {
        labels[index] = match (contour.border_type, contour.parent) {
            (BorderType::Hole, Some(parent)) => labels[parent],
            _ => {
                next_label += 1;
                next_label
            }
        };
        fill_contour(&mut markers, &contour.points, labels[index]);
    }
    markers
}

/// Paints the polygon traced by `points` (border included) with `label`.
fn fill_contour(markers: &mut LabelMap, points: &[Point<i32>], label: i32) {
    let (width, height) = (markers.width() as i32, markers.height() as i32);
    let mut paint = |x: i32, y: i32| {
        if x >= 0 && y >= 0 && x < width && y < height {
            markers.set(x as u32, y as u32, label);
        }
    };

    let Some(min_y) = points.iter().map(|p| p.y).min() else {
        return;
    };
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(min_y);

    // Even-odd scanline fill with half-open edges.
    let mut crossings = Vec::new();
    for y in min_y..=max_y {
        crossings.clear();
        for (i, a) in points.iter().enumerate() {
            let b = &points[(i + 1) % points.len()];
            if (a.y <= y && y < b.y) || (b.y <= y && y < a.y) {
                let t = (y - a.y) as f64 / (b.y - a.y) as f64;
                crossings.push(a.x as f64 + t * (b.x - a.x) as f64);
            }
        }
        crossings.sort_by(f64::total_cmp);
        for span in crossings.chunks_exact(2) {
            for x in span[0].ceil() as i32..=span[1].floor() as i32 {
                paint(x, y);
            }
        }
    }
    for point in points {
        paint(point.x, point.y);
    }
}

/// Step 6: consumes the labels of `markers` and returns the regions found.
pub fn extract_regions(markers: &mut LabelMap) -> Vec<Region> {
    let (width, height) = (markers.width(), markers.height());
    let mut regions = Vec::new();
    let mut queue = VecDeque::new();

    for y in 0..height {
        for x in 0..width {
            let label = markers.get(x, y);
            if label <= 1 {
                continue;
            }

            let (mut min_x, mut min_y, mut max_x, mut max_y) = (x, y, x, y);
            let mut area = 0;
            markers.set(x, y, 0);
            queue.push_back((x, y));

            while let Some((cx, cy)) = queue.pop_front() {
                area += 1;
                min_x = min_x.min(cx);
                min_y = min_y.min(cy);
                max_x = max_x.max(cx);
                max_y = max_y.max(cy);

                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = cx as i64 + dx;
                        let ny = cy as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as u32, ny as u32);
                        if markers.get(nx, ny) == label {
                            markers.set(nx, ny, 0);
                            queue.push_back((nx, ny));
                        }
                    }
                }
            }

            // A fill that never left its seed is noise.
            if area > 1 {
                regions.push(Region {
                    rect: Rect::at(min_x as i32, min_y as i32)
                        .of_size(max_x - min_x + 1, max_y - min_y + 1),
                    area,
                });
            }
        }
    }
    regions
}
