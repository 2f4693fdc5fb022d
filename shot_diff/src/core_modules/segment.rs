// THEORY:
// A `Segment` is one rectangular region found by the segmenter in either the
// old or the new image. It is the unit that flows through the rest of the
// engine: the extractor attaches a descriptor to it, the matcher pairs it with
// a segment from the other side, and the renderer draws it.
//
// Key architectural principles:
// 1.  **Borrowed Pixels**: A segment never copies pixels. It keeps a view into
//     the grayscale matrix of the image it was cut from.
// 2.  **Monotonic Match Flag**: The `matched` flag starts false and can only be
//     flipped to true, once, through an atomic compare-and-set. This is what
//     keeps the final assignment one-to-one while new segments are scanned in
//     parallel.

use std::sync::atomic::{AtomicBool, Ordering};

use image::{GenericImageView, GrayImage, SubImage};
use imageproc::rect::Rect;

use crate::core_modules::descriptor::Descriptors;

/// Which input a segment was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Old,
    New,
}

/// A rectangular region of one input image.
pub struct Segment<'a> {
    pub side: Side,
    /// Bounding rectangle in the coordinates of its own image.
    pub area: Rect,
    /// Non-owning grayscale view of `area`.
    crop: SubImage<&'a GrayImage>,
    /// Local feature descriptor. `None` when no keypoints were found.
    descriptor: Option<Descriptors>,
    matched: AtomicBool,
}

impl<'a> Segment<'a> {
    /// Creates a segment over `area`, which must lie inside `gray`.
    pub fn new(side: Side, area: Rect, gray: &'a GrayImage) -> Self {
        debug_assert!(area.left() >= 0 && area.top() >= 0);
        debug_assert!(area.right() < gray.width() as i32 && area.bottom() < gray.height() as i32);
        let crop = gray.view(
            area.left() as u32,
            area.top() as u32,
            area.width(),
            area.height(),
        );
        Self {
            side,
            area,
            crop,
            descriptor: None,
            matched: AtomicBool::new(false),
        }
    }

    pub fn crop(&self) -> &SubImage<&'a GrayImage> {
        &self.crop
    }

    pub fn descriptor(&self) -> Option<&Descriptors> {
        self.descriptor.as_ref()
    }

    pub fn set_descriptor(&mut self, descriptor: Option<Descriptors>) {
        self.descriptor = descriptor;
    }

    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::Acquire)
    }

    /// Flips the match flag from false to true. Returns `false` if another
    /// caller got there first.
    pub fn try_mark_matched(&self) -> bool {
        self.matched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("side", &self.side)
            .field("area", &self.area)
            .field("keypoints", &self.descriptor.as_ref().map(Descriptors::rows))
            .field("matched", &self.is_matched())
            .finish()
    }
}

/// An accepted correspondence, as indices into the old and new segment lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPair {
    pub old: usize,
    pub new: usize,
}
