// THEORY:
// This file is the main entry point for the `shot_diff` library crate. It
// exposes `DiffPipeline` and its `DiffConfig`/`DiffReport` as the high-level
// interface for diffing two screenshots; the binary in `main.rs` is only a
// command line shell around it.
//
// The engine itself lives in `core_modules`: histogram gate, segmenter,
// descriptor extractor, region matcher, diff renderer and profiler. They are
// public so that each stage can be driven and tested on its own, but a normal
// caller only needs the pipeline.

pub mod cli;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use error::{DiffError, Result};
pub use pipeline::{DiffConfig, DiffPipeline, DiffReport};
