pub mod descriptor;
pub mod diff_renderer;
pub mod histogram_gate;
pub mod image_loader;
pub mod profiler;
pub mod region_matcher;
pub mod segment;
pub mod segmenter;
pub mod utils;
pub mod watershed;
