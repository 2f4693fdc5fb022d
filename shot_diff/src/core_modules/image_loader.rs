// THEORY:
// The image loader turns a path into the two matrices the engine works on.
// The file is memory-mapped rather than read, and the mapping stays alive
// alongside the decoded matrices for the duration of the run.
//
// Every decoded image produces both a color matrix (histogram gate, watershed,
// rendering) and a grayscale matrix (segmentation, descriptors, template
// search). Both are immutable from here on.

use std::fs::File;
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};
use memmap2::Mmap;
use tracing::debug;

use crate::error::{DiffError, Result};

pub struct LoadedImage {
    pub path: PathBuf,
    /// Raw file bytes, mapped read-only.
    bytes: Mmap,
    pub color: RgbImage,
    pub gray: GrayImage,
}

impl LoadedImage {
    pub fn open(path: &Path) -> Result<Self> {
        let io_error = |source| DiffError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;
        let len = file.metadata().map_err(io_error)?.len();
        if len == 0 {
            return Err(DiffError::Decode {
                path: path.to_path_buf(),
                reason: "empty file".to_string(),
            });
        }

        // SAFETY: the mapping is read-only and only read through `bytes`; the
        // input files are not expected to change while the run is in flight.
        let bytes = unsafe { Mmap::map(&file) }.map_err(|source| DiffError::Map {
            path: path.to_path_buf(),
            source,
        })?;

        let decoded = image::load_from_memory(&bytes).map_err(|err| DiffError::Decode {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(DiffError::Decode {
                path: path.to_path_buf(),
                reason: "empty image".to_string(),
            });
        }

        debug!(path = %path.display(), width = decoded.width(), height = decoded.height(), "decoded");
        Ok(Self {
            path: path.to_path_buf(),
            color: decoded.to_rgb8(),
            gray: decoded.to_luma8(),
            bytes,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.color.dimensions()
    }
}

impl std::fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedImage")
            .field("path", &self.path)
            .field("bytes", &self.bytes.len())
            .field("dimensions", &self.dimensions())
            .finish()
    }
}
