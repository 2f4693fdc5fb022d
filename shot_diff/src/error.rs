// THEORY:
// Every failure the engine can hit is fatal for the run: there is no retry and
// no partial output. Instead of aborting deep inside the pipeline, each layer
// returns a `DiffError` with `?`, and the binary's single top-level handler
// prints it under a lock and terminates the process.
//
// `SameImage` is not a crash. It is the business rule "nothing to diff",
// reported through the same channel so that no artifact gets written.

use std::path::PathBuf;

use thiserror::Error;

/// All fatal conditions of a diff run.
#[derive(Debug, Error)]
pub enum DiffError {
    /// Bad or missing command line input.
    #[error("{0}")]
    Usage(String),

    /// An input file could not be opened or inspected.
    #[error("cannot open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input file was opened but could not be memory-mapped.
    #[error("{}: mmap failed: {source}", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The codec rejected the bytes, or produced an empty matrix.
    #[error("failed to decode image file {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// The histogram gate judged both inputs identical.
    #[error("two images are same")]
    SameImage,

    /// An output artifact could not be encoded or written.
    #[error("failed to write {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T, E = DiffError> = std::result::Result<T, E>;
