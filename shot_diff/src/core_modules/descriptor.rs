// THEORY:
// The descriptor extractor turns the pixels of one segment into a bag of local
// texture signatures that survive small shifts. Two segments that show the
// same content end up with near-identical bags, whatever their position.
//
// Algorithm:
//   1. FAST-9 corners on the raw crop give the keypoints. Corners whose 31x31
//      BRIEF patch would leave the crop are dropped, the strongest
//      `MAX_KEYPOINTS` are kept and re-sorted into raster order.
//   2. Each keypoint gets a 256-bit BRIEF string from `imageproc`. The test
//      pairs are drawn once from a seeded generator, so every segment of every
//      run is described with the same pattern.
//   3. Bits are unpacked into `f32` rows of 0.0/1.0 so that the squared L2
//      distance between two rows equals their Hamming distance.
//
// Extraction of a segment reads only its own crop and writes only its own
// descriptor, so segments are processed with an unordered `par_iter_mut`.

use std::sync::OnceLock;

use image::GrayImage;
use imageproc::binary_descriptors::brief::{BriefDescriptor, TestPair, brief};
use imageproc::corners::corners_fast9;
use imageproc::point::Point;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::warn;

use crate::core_modules::segment::Segment;

const FAST_THRESHOLD: u8 = 20;
const MAX_KEYPOINTS: usize = 500;
/// Radius of the 31x31 patch `imageproc` samples around a keypoint.
const PATCH_RADIUS: u32 = 15;
const PATCH_DIAMETER: u32 = 2 * PATCH_RADIUS + 1;
const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x9E37_79B9;

/// Row-major matrix of descriptors, one row per keypoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptors {
    cols: usize,
    data: Vec<f32>,
}

impl Descriptors {
    /// Builds a matrix from explicit rows. All rows must share one length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        debug_assert!(rows.iter().all(|row| row.len() == cols));
        Self {
            cols,
            data: rows.into_iter().flatten().collect(),
        }
    }

    /// Unpacks BRIEF bit strings, least significant bit of each word first.
    fn from_brief(descriptors: &[BriefDescriptor]) -> Self {
        let data = descriptors
            .iter()
            .flat_map(|descriptor| descriptor.bits.iter())
            .flat_map(|&word| (0..128).map(move |bit| ((word >> bit) & 1) as f32))
            .collect();
        Self {
            cols: DESCRIPTOR_BITS,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 { 0 } else { self.data.len() / self.cols }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols.max(1))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Computes the descriptor of one crop. Returns `None` when no usable keypoint
/// is found.
pub fn extract(crop: &GrayImage) -> Option<Descriptors> {
    let (width, height) = crop.dimensions();
    if width < PATCH_DIAMETER + 1 || height < PATCH_DIAMETER + 1 {
        return None;
    }

    let mut corners: Vec<_> = corners_fast9(crop, FAST_THRESHOLD)
        .into_iter()
        .filter(|c| {
            c.x > PATCH_RADIUS
                && c.y > PATCH_RADIUS
                && c.x + PATCH_RADIUS < width
                && c.y + PATCH_RADIUS < height
        })
        .collect();
    if corners.is_empty() {
        return None;
    }
    corners.sort_by(|a, b| b.score.total_cmp(&a.score).then((a.y, a.x).cmp(&(b.y, b.x))));
    corners.truncate(MAX_KEYPOINTS);
    corners.sort_by_key(|c| (c.y, c.x));

    let keypoints: Vec<Point<u32>> = corners.iter().map(|c| Point::new(c.x, c.y)).collect();
    match brief(crop, &keypoints, DESCRIPTOR_BITS, Some(test_pairs())) {
        Ok((descriptors, _)) => Some(Descriptors::from_brief(&descriptors)),
        Err(reason) => {
            warn!(%reason, "BRIEF extraction failed");
            None
        }
    }
}

/// Attaches a descriptor to every segment, in parallel.
pub fn attach_descriptors(segments: &mut [Segment<'_>]) {
    segments.par_iter_mut().for_each(|segment| {
        let crop = segment.crop().to_image();
        segment.set_descriptor(extract(&crop));
    });
}

/// Fixed BRIEF test pairs, identical across runs and processes.
fn test_pairs() -> &'static Vec<TestPair> {
    static PAIRS: OnceLock<Vec<TestPair>> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut point = move || {
            Point::new(
                rng.random_range(0..PATCH_DIAMETER),
                rng.random_range(0..PATCH_DIAMETER),
            )
        };
        (0..DESCRIPTOR_BITS)
            .map(|_| TestPair {
                p0: point(),
                p1: point(),
            })
            .collect()
    })
}
