// THEORY:
// The `pipeline` module is the top-level API of the diff engine. It wires the
// core modules into one run over a pair of screenshots and hides the
// scheduling behind a single `DiffPipeline::run` call.
//
// Stages, in order:
// 1.  **Load**: both files are mapped and decoded concurrently.
// 2.  **Gate**: the histogram gate short-circuits identical inputs with
//     `DiffError::SameImage` before anything is written.
// 3.  **Describe**: segmentation followed by descriptor extraction, forked once
//     per side. Inside one side, extraction is data-parallel over segments.
// 4.  **Match**: old segments are paired with new segments one-to-one.
// 5.  **Render**: the diff canvas, then the optional added/deleted overlays
//     (forked) and the optional segment dumps.
//
// Every stage opens a `Profiler` phase. Phases started inside a fork do not
// name a parent; the profiler attaches them by time containment.

use std::path::PathBuf;

use image::RgbImage;
use tracing::{info, warn};

use crate::core_modules::descriptor::attach_descriptors;
use crate::core_modules::diff_renderer::{
    self, ADDED_COLOR, BOUNDARY_COLOR, DELETED_COLOR,
};
use crate::core_modules::histogram_gate::{self, GateVerdict};
use crate::core_modules::image_loader::LoadedImage;
use crate::core_modules::profiler::Profiler;
use crate::core_modules::region_matcher::RegionMatcher;
use crate::core_modules::segment::{Segment, Side};
use crate::core_modules::segmenter::{self, DEFAULT_THRESHOLD};
use crate::core_modules::utils::image_helper;
use crate::error::{DiffError, Result};

pub const DEFAULT_OUTPUT_PREFIX: &str = "image_difference";

/// Everything a single diff run needs to know.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// The "before" screenshot.
    pub old_path: PathBuf,
    /// The "after" screenshot.
    pub new_path: PathBuf,
    /// Artifacts are written as `<output_prefix>_<kind>.png`.
    pub output_prefix: String,
    /// Binarization threshold of the segmenter.
    pub bin_threshold: u8,
    /// Also write the added/deleted overlays.
    pub create_change_image: bool,
    /// Only mutually consistent descriptor matches count.
    pub cross_check: bool,
    /// Also write every detected segment of each side.
    pub save_segments: bool,
}

impl DiffConfig {
    pub fn new(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            old_path: old_path.into(),
            new_path: new_path.into(),
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            bin_threshold: DEFAULT_THRESHOLD,
            create_change_image: false,
            cross_check: false,
            save_segments: false,
        }
    }

    pub fn output_path(&self, kind: &str) -> PathBuf {
        PathBuf::from(format!("{}_{kind}.png", self.output_prefix))
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    pub diff_path: PathBuf,
    pub added_path: Option<PathBuf>,
    pub deleted_path: Option<PathBuf>,
    /// `<prefix>_old_segments.png` and `<prefix>_new_segments.png`, if requested.
    pub segment_dumps: Vec<PathBuf>,
    pub old_segments: usize,
    pub new_segments: usize,
    pub matched: usize,
}

pub struct DiffPipeline {
    config: DiffConfig,
    profiler: Profiler,
}

impl DiffPipeline {
    pub fn new(config: DiffConfig) -> Self {
        Self {
            config,
            profiler: Profiler::new(),
        }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Runs the whole diff. Must be called from inside the worker pool that
    /// should carry the forked stages.
    pub fn run(&self) -> Result<DiffReport> {
        let profiler = &self.profiler;
        let config = &self.config;
        let total = profiler.start("total", None);

        // --- 1. Load ---
        let load = profiler.start("load", Some(&total));
        let (old, new) = rayon::join(
            || {
                let _timer = profiler.start("load old", None);
                LoadedImage::open(&config.old_path)
            },
            || {
                let _timer = profiler.start("load new", None);
                LoadedImage::open(&config.new_path)
            },
        );
        let (old, new) = (old?, new?);
        load.stop();

        // --- 2. Gate ---
        let gate = profiler.start("histogram gate", Some(&total));
        match histogram_gate::compare(&old.color, &new.color) {
            GateVerdict::Different => {}
            GateVerdict::Same => return Err(DiffError::SameImage),
            GateVerdict::DecodeError => {
                let empty = if old.color.is_empty() { &old } else { &new };
                return Err(DiffError::Decode {
                    path: empty.path.clone(),
                    reason: "empty image".to_string(),
                });
            }
        }
        gate.stop();

        // --- 3. Describe ---
        let describe = profiler.start("describe", Some(&total));
        let (old_segments, new_segments) = rayon::join(
            || self.describe(Side::Old, &old),
            || self.describe(Side::New, &new),
        );
        describe.stop();

        // --- 4. Match ---
        let matching = profiler.start("match", Some(&total));
        let pairs = RegionMatcher::new(config.cross_check).assign(&old_segments, &new_segments);
        matching.stop();

        // --- 5. Render ---
        let render = profiler.start("render", Some(&total));
        let diff_path = config.output_path("diff");
        let mut artifacts = Vec::new();
        {
            let _timer = profiler.start("render diff", Some(&render));
            let canvas = diff_renderer::render_diff(
                &old.color,
                &old.gray,
                &new.color,
                &new_segments,
                &pairs,
            );
            artifacts.push((diff_path.clone(), canvas));
        }

        let (added_path, deleted_path) = if config.create_change_image {
            let _timer = profiler.start("render changes", Some(&render));
            let (added, deleted) = rayon::join(
                || diff_renderer::render_unmatched(&new.color, &new_segments, ADDED_COLOR),
                || diff_renderer::render_unmatched(&old.color, &old_segments, DELETED_COLOR),
            );
            let added_path = config.output_path("added");
            let deleted_path = config.output_path("deleted");
            artifacts.push((added_path.clone(), added));
            artifacts.push((deleted_path.clone(), deleted));
            (Some(added_path), Some(deleted_path))
        } else {
            (None, None)
        };

        let mut segment_dumps = Vec::new();
        if config.save_segments {
            let _timer = profiler.start("render segments", Some(&render));
            for (kind, image, segments) in [
                ("old_segments", &old, &old_segments),
                ("new_segments", &new, &new_segments),
            ] {
                let path = config.output_path(kind);
                let canvas = diff_renderer::render_segments(&image.color, segments, BOUNDARY_COLOR);
                segment_dumps.push(path.clone());
                artifacts.push((path, canvas));
            }
        }
        render.stop();

        {
            let _timer = profiler.start("write", Some(&total));
            write_all(&artifacts)?;
        }
        total.stop();

        let report = DiffReport {
            diff_path,
            added_path,
            deleted_path,
            segment_dumps,
            old_segments: old_segments.len(),
            new_segments: new_segments.len(),
            matched: pairs.len(),
        };
        info!(
            old_segments = report.old_segments,
            new_segments = report.new_segments,
            matched = report.matched,
            diff = %report.diff_path.display(),
            "diff written"
        );
        Ok(report)
    }

    /// Segmentation and descriptor extraction of one side.
    fn describe<'a>(&self, side: Side, image: &'a LoadedImage) -> Vec<Segment<'a>> {
        let label = match side {
            Side::Old => "old",
            Side::New => "new",
        };

        let segment_timer = self.profiler.start(format!("segment {label}"), None);
        let mut segments = segmenter::detect_segments(
            side,
            &image.color,
            &image.gray,
            self.config.bin_threshold,
        );
        segment_timer.stop();

        let _extract_timer = self.profiler.start(format!("extract {label}"), None);
        attach_descriptors(&mut segments);
        segments
    }
}

/// Writes every artifact, or none: on the first failure the files already
/// written by this call are removed again.
fn write_all(artifacts: &[(PathBuf, RgbImage)]) -> Result<()> {
    for (index, (path, canvas)) in artifacts.iter().enumerate() {
        if let Err(err) = image_helper::save(path, canvas) {
            for (written, _) in &artifacts[..index] {
                if let Err(cleanup) = std::fs::remove_file(written) {
                    warn!(path = %written.display(), %cleanup, "cannot remove partial output");
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    fn white(path: &Path) {
        RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]))
            .save(path)
            .expect("write png");
    }

    fn white_with_black_square(path: &Path) {
        let mut image = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        for y in 50..70 {
            for x in 50..70 {
                image.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        image.save(path).expect("write png");
    }

    fn config_in(dir: &Path, old: &Path, new: &Path) -> DiffConfig {
        let mut config = DiffConfig::new(old, new);
        config.output_prefix = dir.join("out").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn identical_inputs_stop_at_the_gate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (old, new) = (dir.path().join("a.png"), dir.path().join("b.png"));
        let gray = RgbImage::from_pixel(200, 200, Rgb([128, 128, 128]));
        gray.save(&old).expect("write png");
        gray.save(&new).expect("write png");
        let config = config_in(dir.path(), &old, &new);

        let err = DiffPipeline::new(config.clone()).run().unwrap_err();
        assert!(matches!(err, DiffError::SameImage));
        assert_eq!(err.to_string(), "two images are same");
        assert!(!config.output_path("diff").exists());
    }

    #[test]
    fn added_square_is_reported_as_unmatched() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (old, new) = (dir.path().join("old.png"), dir.path().join("new.png"));
        white(&old);
        white_with_black_square(&new);
        let mut config = config_in(dir.path(), &old, &new);
        config.create_change_image = true;

        let report = DiffPipeline::new(config.clone()).run().expect("diff runs");

        assert_eq!(report.old_segments, 0);
        assert_eq!(report.new_segments, 1);
        assert_eq!(report.matched, 0);
        assert!(report.diff_path.exists());
        assert_eq!(report.added_path, Some(config.output_path("added")));
        assert!(config.output_path("added").exists());
        assert!(config.output_path("deleted").exists());
        assert!(report.segment_dumps.is_empty());

        let added = image::open(config.output_path("added")).expect("png").to_rgb8();
        assert!(added.pixels().any(|p| *p == ADDED_COLOR));
    }

    #[test]
    fn segment_dumps_are_written_on_request() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (old, new) = (dir.path().join("old.png"), dir.path().join("new.png"));
        white(&old);
        white_with_black_square(&new);
        let mut config = config_in(dir.path(), &old, &new);
        config.save_segments = true;

        let report = DiffPipeline::new(config.clone()).run().expect("diff runs");
        assert_eq!(
            report.segment_dumps,
            vec![config.output_path("old_segments"), config.output_path("new_segments")]
        );
        assert!(report.segment_dumps.iter().all(|path| path.exists()));
        assert!(report.added_path.is_none());
        assert!(!config.output_path("added").exists());
    }

    #[test]
    fn undecodable_input_writes_nothing() {
        for corrupt_old in [false, true] {
            let dir = tempfile::tempdir().expect("temp dir");
            let (old, new) = (dir.path().join("old.png"), dir.path().join("new.png"));
            let (broken, intact) = if corrupt_old { (&old, &new) } else { (&new, &old) };
            white(intact);
            std::fs::write(broken, b"not an image at all").expect("write");
            let config = config_in(dir.path(), &old, &new);

            let err = DiffPipeline::new(config.clone()).run().unwrap_err();
            match err {
                DiffError::Decode { path, .. } => assert_eq!(&path, broken),
                other => panic!("expected a decode error, got {other:?}"),
            }
            assert!(!config.output_path("diff").exists());
        }
    }

    #[test]
    fn failed_write_removes_earlier_artifacts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (old, new) = (dir.path().join("old.png"), dir.path().join("new.png"));
        white(&old);
        white_with_black_square(&new);
        let mut config = config_in(dir.path(), &old, &new);
        config.create_change_image = true;
        // A directory in place of the added overlay makes its write fail.
        std::fs::create_dir(config.output_path("added")).expect("blocker dir");

        let err = DiffPipeline::new(config.clone()).run().unwrap_err();
        assert!(matches!(err, DiffError::Encode { .. }));
        assert!(!config.output_path("diff").exists());
        assert!(!config.output_path("deleted").exists());
    }

    #[test]
    fn forked_phases_land_under_their_stage() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (old, new) = (dir.path().join("old.png"), dir.path().join("new.png"));
        white(&old);
        white_with_black_square(&new);
        let pipeline = DiffPipeline::new(config_in(dir.path(), &old, &new));
        pipeline.run().expect("diff runs");
        pipeline.profiler().finish();

        let nodes = pipeline.profiler().nodes();
        let index_of = |name: &str| nodes.iter().position(|n| n.name == name).expect(name);
        // Sibling forks may nest inside each other, so only ancestry is fixed.
        let has_ancestor = |name: &str, ancestor: &str| {
            let target = index_of(ancestor);
            let mut current = nodes[index_of(name)].parent;
            while let Some(index) = current {
                if index == target {
                    return true;
                }
                current = nodes[index].parent;
            }
            false
        };
        assert!(has_ancestor("load old", "load"));
        assert!(has_ancestor("load new", "load"));
        assert!(has_ancestor("segment new", "describe"));
        assert!(has_ancestor("extract old", "describe"));
        assert_eq!(nodes[index_of("describe")].parent, Some(index_of("total")));

        let report = pipeline.profiler().report();
        assert!(report.starts_with("     User   System     Real  Name\n"));
        assert!(report.contains("  total\n"));
        assert!(report.contains("      segment new\n"));
    }
}
