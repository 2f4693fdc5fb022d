// THEORY:
// The `HistogramGate` is the cheap global pre-check that runs before any
// segmentation. If the two screenshots are judged identical the whole pipeline
// is skipped.
//
// Key architectural principles:
// 1.  **Hue/Saturation Histograms**: Both images are converted to the 8-bit
//     HSV convention (hue 0-180, saturation 0-255) and binned into a joint
//     256x256 hue/saturation histogram, min-max normalized to [0, 1].
// 2.  **Chi-Square Distance**: `sum((h1 - h2)^2 / h1)` over the bins where the
//     old histogram is non-zero. Distances within `SAME_TOLERANCE` make the
//     histograms indistinguishable.
// 3.  **Pixel Confirmation**: Hue and saturation ignore brightness, so black and
//     white both land in bin (0, 0). Indistinguishable histograms are therefore
//     confirmed with an exact comparison of the color matrices before the gate
//     reports `Same`.

use image::RgbImage;
use tracing::debug;

const HUE_BINS: usize = 256;
const SATURATION_BINS: usize = 256;
const HUE_RANGE: f64 = 180.0;
const SATURATION_RANGE: f64 = 256.0;
const SAME_OFFSET: f64 = 1e-5;
const SAME_TOLERANCE: f64 = 1e-13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Different,
    Same,
    /// One of the inputs is an empty matrix.
    DecodeError,
}

/// Joint hue/saturation histogram, row-major by hue.
#[derive(Debug, Clone, PartialEq)]
pub struct HsHistogram {
    bins: Vec<f64>,
}

impl HsHistogram {
    pub fn of(image: &RgbImage) -> Self {
        let mut bins = vec![0.0; HUE_BINS * SATURATION_BINS];
        for pixel in image.pixels() {
            let (hue, saturation) = hue_saturation(pixel.0);
            let h = bin_index(hue as f64, HUE_RANGE, HUE_BINS);
            let s = bin_index(saturation as f64, SATURATION_RANGE, SATURATION_BINS);
            bins[h * SATURATION_BINS + s] += 1.0;
        }

        let mut histogram = Self { bins };
        histogram.normalize();
        histogram
    }

    /// Min-max normalization to [0, 1]. A flat histogram becomes all zeros.
    fn normalize(&mut self) {
        let min = self.bins.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.bins.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        for bin in &mut self.bins {
            *bin = if range > 0.0 { (*bin - min) / range } else { 0.0 };
        }
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// Chi-square distance with `self` as the reference histogram.
    pub fn chi_square(&self, other: &Self) -> f64 {
        self.bins
            .iter()
            .zip(&other.bins)
            .filter(|(a, _)| **a != 0.0)
            .map(|(a, b)| (a - b) * (a - b) / a)
            .sum()
    }
}

/// Compares the two decoded images.
pub fn compare(old: &RgbImage, new: &RgbImage) -> GateVerdict {
    if is_empty(old) || is_empty(new) {
        return GateVerdict::DecodeError;
    }

    let distance = HsHistogram::of(old).chi_square(&HsHistogram::of(new));
    debug!(distance, "histogram distance");
    if !indistinguishable(distance) {
        return GateVerdict::Different;
    }

    if old.dimensions() == new.dimensions() && old.as_raw() == new.as_raw() {
        GateVerdict::Same
    } else {
        debug!("histograms agree but pixels differ");
        GateVerdict::Different
    }
}

pub fn indistinguishable(distance: f64) -> bool {
    distance - SAME_OFFSET <= SAME_TOLERANCE
}

fn is_empty(image: &RgbImage) -> bool {
    image.width() == 0 || image.height() == 0
}

fn bin_index(value: f64, range: f64, bins: usize) -> usize {
    ((value * bins as f64 / range) as usize).min(bins - 1)
}

/// 8-bit HSV convention: hue in [0, 180], saturation in [0, 255].
pub fn hue_saturation([r, g, b]: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { 255.0 * delta / max } else { 0.0 };
    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };

    ((hue / 2.0).round() as u8, saturation.round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn primary_colors_map_to_opencv_hues() {
        assert_eq!(hue_saturation([255, 0, 0]), (0, 255));
        assert_eq!(hue_saturation([0, 255, 0]), (60, 255));
        assert_eq!(hue_saturation([0, 0, 255]), (120, 255));
        assert_eq!(hue_saturation([128, 128, 128]), (0, 0));
        assert_eq!(hue_saturation([0, 0, 0]), (0, 0));
    }

    #[test]
    fn identical_images_are_same() {
        let image = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 5, y as u8 * 7, 90]));
        assert_eq!(compare(&image, &image.clone()), GateVerdict::Same);
    }

    #[test]
    fn disjoint_hues_are_different() {
        let red = RgbImage::from_pixel(32, 32, Rgb([220, 10, 10]));
        let blue = RgbImage::from_pixel(32, 32, Rgb([10, 10, 220]));
        assert!(!indistinguishable(
            HsHistogram::of(&red).chi_square(&HsHistogram::of(&blue))
        ));
        assert_eq!(compare(&red, &blue), GateVerdict::Different);
    }

    #[test]
    fn black_square_on_white_is_different() {
        let old = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        let mut new = old.clone();
        for y in 50..70 {
            for x in 50..70 {
                new.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        // Both images only fill bin (0, 0).
        assert!(indistinguishable(
            HsHistogram::of(&old).chi_square(&HsHistogram::of(&new))
        ));
        assert_eq!(compare(&old, &new), GateVerdict::Different);
    }

    #[test]
    fn empty_matrix_is_a_decode_error() {
        let empty = RgbImage::new(0, 0);
        let full = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        assert_eq!(compare(&empty, &full), GateVerdict::DecodeError);
        assert_eq!(compare(&full, &empty), GateVerdict::DecodeError);
    }

    #[test]
    fn normalized_histogram_peaks_at_one() {
        let image = RgbImage::from_fn(10, 10, |x, _| if x < 7 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });
        let histogram = HsHistogram::of(&image);
        let max = histogram.bins().iter().copied().fold(0.0, f64::max);
        assert_eq!(max, 1.0);
        assert!(histogram.bins().iter().all(|&b| (0.0..=1.0).contains(&b)));
    }
}
