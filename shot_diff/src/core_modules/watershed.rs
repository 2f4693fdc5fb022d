// THEORY:
// Marker-controlled watershed. The color image is treated as a relief where
// the "height" between two neighboring pixels is their largest per-channel
// difference. Labeled seed regions are flooded outwards, lowest step first;
// a pixel reached by two different labels becomes a boundary.
//
// Conventions of the `LabelMap`:
// - `> 0`  a region label,
// - `0`    unknown, to be flooded,
// - `-1`   boundary (`BOUNDARY`), also written into the one-pixel image frame.
//
// The queue is a set of 256 FIFO buckets, one per step height, which makes
// the flooding order (and therefore the result) fully deterministic.

use std::collections::VecDeque;

use image::RgbImage;

pub const BOUNDARY: i32 = -1;
pub const UNKNOWN: i32 = 0;
const IN_QUEUE: i32 = -2;

/// Integer label per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    width: u32,
    height: u32,
    labels: Vec<i32>,
}

impl LabelMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            labels: vec![UNKNOWN; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i32 {
        self.labels[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, label: i32) {
        let index = self.index(x, y);
        self.labels[index] = label;
    }

    /// Adds `offset` to every label.
    pub fn offset(&mut self, offset: i32) {
        self.labels.iter_mut().for_each(|label| *label += offset);
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.labels
    }
}

/// Floods every `UNKNOWN` pixel of `markers` from the labeled seeds.
pub fn watershed(color: &RgbImage, markers: &mut LabelMap) {
    let (width, height) = (markers.width(), markers.height());
    debug_assert_eq!(color.dimensions(), (width, height));
    if width == 0 || height == 0 {
        return;
    }

    for x in 0..width {
        markers.set(x, 0, BOUNDARY);
        markers.set(x, height - 1, BOUNDARY);
    }
    for y in 0..height {
        markers.set(0, y, BOUNDARY);
        markers.set(width - 1, y, BOUNDARY);
    }
    if width < 3 || height < 3 {
        return;
    }

    let step = |a: (u32, u32), b: (u32, u32)| -> usize {
        let (pa, pb) = (color.get_pixel(a.0, a.1).0, color.get_pixel(b.0, b.1).0);
        (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0) as usize
    };

    let mut buckets: Vec<VecDeque<(u32, u32)>> = vec![VecDeque::new(); 256];

    // --- 1. Seed the queue with unknown pixels touching a region ---
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            if markers.get(x, y) != UNKNOWN {
                continue;
            }
            let lowest = neighbors(x, y)
                .into_iter()
                .filter(|&(nx, ny)| markers.get(nx, ny) > 0)
                .map(|n| step((x, y), n))
                .min();
            if let Some(priority) = lowest {
                buckets[priority].push_back((x, y));
                markers.set(x, y, IN_QUEUE);
            }
        }
    }

    // --- 2. Flood, lowest step first ---
    let mut level = 0;
    loop {
        while level < buckets.len() && buckets[level].is_empty() {
            level += 1;
        }
        let Some((x, y)) = buckets.get_mut(level).and_then(VecDeque::pop_front) else {
            break;
        };

        let mut label = UNKNOWN;
        for (nx, ny) in neighbors(x, y) {
            let neighbor = markers.get(nx, ny);
            if neighbor <= 0 {
                continue;
            }
            if label == UNKNOWN {
                label = neighbor;
            } else if label != neighbor {
                label = BOUNDARY;
            }
        }
        markers.set(x, y, label);
        if label == BOUNDARY {
            continue;
        }

        for (nx, ny) in neighbors(x, y) {
            if markers.get(nx, ny) == UNKNOWN {
                let priority = step((x, y), (nx, ny));
                buckets[priority].push_back((nx, ny));
                markers.set(nx, ny, IN_QUEUE);
                level = level.min(priority);
            }
        }
    }
}

/// 4-connected neighbors of an interior pixel.
fn neighbors(x: u32, y: u32) -> [(u32, u32); 4] {
    [(x, y - 1), (x - 1, y), (x + 1, y), (x, y + 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn frame_becomes_boundary() {
        let color = RgbImage::from_pixel(5, 4, Rgb([10, 10, 10]));
        let mut markers = LabelMap::new(5, 4);
        markers.offset(1);
        watershed(&color, &mut markers);
        for x in 0..5 {
            assert_eq!(markers.get(x, 0), BOUNDARY);
            assert_eq!(markers.get(x, 3), BOUNDARY);
        }
        assert_eq!(markers.get(2, 1), 1);
        assert_eq!(markers.get(2, 2), 1);
    }

    #[test]
    fn two_seeds_split_along_the_color_edge() {
        // Left half dark, right half bright; one seed on each side.
        let color = RgbImage::from_fn(10, 5, |x, _| if x < 5 { Rgb([0, 0, 0]) } else { Rgb([250, 250, 250]) });
        let mut markers = LabelMap::new(10, 5);
        markers.set(1, 2, 2);
        markers.set(8, 2, 3);
        watershed(&color, &mut markers);

        for y in 1..4 {
            for x in 1..4 {
                assert_eq!(markers.get(x, y), 2, "pixel ({x},{y})");
            }
            for x in 6..9 {
                assert_eq!(markers.get(x, y), 3, "pixel ({x},{y})");
            }
        }
        assert!(markers.as_slice().iter().all(|&l| l != UNKNOWN && l != IN_QUEUE));
    }

    #[test]
    fn offset_shifts_every_label() {
        let mut markers = LabelMap::new(2, 2);
        markers.set(1, 1, 4);
        markers.offset(1);
        assert_eq!(markers.as_slice(), &[1, 1, 1, 5]);
    }
}
