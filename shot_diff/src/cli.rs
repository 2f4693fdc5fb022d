// THEORY:
// Command line front-end. The tool historically takes single-dash long flags
// (`-new`, `-threshold 180`, `-create_change_image`), which clap does not
// parse as long options. `normalize_args` rewrites the known ones to their
// double-dash form before clap sees them, leaving flag values untouched, so
// both spellings are accepted.
//
// Parsing never prints or exits by itself: help text is returned to the
// caller, and every other parse failure becomes a `DiffError::Usage` for the
// binary's fatal handler.

use std::path::PathBuf;

use clap::Parser;
use clap::error::ErrorKind;

use crate::core_modules::segmenter::DEFAULT_THRESHOLD;
use crate::error::{DiffError, Result};
use crate::pipeline::{DEFAULT_OUTPUT_PREFIX, DiffConfig};

/// Upper bound of the default worker count.
pub const MAX_DEFAULT_THREADS: usize = 16;

/// Long flags that may be written with a single dash.
const LONG_FLAGS: &[&str] = &[
    "new",
    "old",
    "output",
    "threshold",
    "create_change_image",
    "cross_check",
    "thread_count",
    "perf",
    "color-diagnostics",
    "save_segments",
    "help",
];

/// Flags whose next argument is a value.
const VALUE_FLAGS: &[&str] = &["--new", "--old", "--output", "-o", "--threshold", "--thread_count"];

#[derive(Debug, Clone, Parser)]
#[command(
    name = "shot_diff",
    about = "Highlights added, deleted and altered regions between two screenshots",
    after_help = "Single-dash long flags (-new, -old, -threshold, ...) are accepted as well."
)]
pub struct Args {
    /// New (after) image file
    #[arg(long = "new", value_name = "PATH")]
    pub new: PathBuf,

    /// Old (before) image file
    #[arg(long = "old", value_name = "PATH")]
    pub old: PathBuf,

    /// Prefix of the output files
    #[arg(short = 'o', long = "output", value_name = "PREFIX", default_value = DEFAULT_OUTPUT_PREFIX)]
    pub output: String,

    /// Binarization threshold used by the segmenter (0-255)
    #[arg(long, value_name = "INT", default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: u8,

    /// Also write <PREFIX>_added.png and <PREFIX>_deleted.png
    #[arg(long = "create_change_image")]
    pub create_change_image: bool,

    /// Keep only mutually consistent descriptor matches
    #[arg(long = "cross_check")]
    pub cross_check: bool,

    /// Worker pool size [default: min(available cores, 16)]
    #[arg(long = "thread_count", value_name = "INT", value_parser = clap::value_parser!(u32).range(1..))]
    pub thread_count: Option<u32>,

    /// Print a timing report after completion
    #[arg(long)]
    pub perf: bool,

    /// Colorize fatal error messages
    #[arg(long = "color-diagnostics")]
    pub color_diagnostics: bool,

    /// Also write every detected segment of each image
    #[arg(long = "save_segments")]
    pub save_segments: bool,
}

impl Args {
    pub fn thread_count(&self) -> usize {
        self.thread_count
            .map(|count| count as usize)
            .unwrap_or_else(|| num_cpus::get().min(MAX_DEFAULT_THREADS))
    }

    pub fn into_config(self) -> DiffConfig {
        DiffConfig {
            old_path: self.old,
            new_path: self.new,
            output_prefix: self.output,
            bin_threshold: self.threshold,
            create_change_image: self.create_change_image,
            cross_check: self.cross_check,
            save_segments: self.save_segments,
        }
    }
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Run(Args),
    /// `-h`/`--help`: the rendered help text.
    Help(String),
}

/// Parses the full argument vector, program name included.
pub fn parse<I>(raw: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    match Args::try_parse_from(normalize_args(raw)) {
        Ok(args) => Ok(Invocation::Run(args)),
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            Ok(Invocation::Help(err.render().to_string()))
        }
        Err(err) => {
            let rendered = err.render().to_string();
            let message = rendered.lines().next().unwrap_or_default();
            Err(DiffError::Usage(
                message.trim_start_matches("error: ").to_string(),
            ))
        }
    }
}

/// Rewrites known single-dash long flags to double-dash form.
pub fn normalize_args<I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut expect_value = false;

    for (position, arg) in raw.into_iter().enumerate() {
        if position == 0 || expect_value {
            expect_value = false;
            out.push(arg);
            continue;
        }

        let arg = if is_single_dash_long(&arg) {
            format!("-{arg}")
        } else {
            arg
        };
        let flag = arg.split('=').next().unwrap_or_default();
        expect_value = !arg.contains('=') && VALUE_FLAGS.contains(&flag);
        out.push(arg);
    }
    out
}

/// `-<known long flag>` or `-<known long flag>=<value>`.
fn is_single_dash_long(arg: &str) -> bool {
    let Some(rest) = arg.strip_prefix('-') else {
        return false;
    };
    let name = rest.split('=').next().unwrap_or_default();
    !rest.starts_with('-') && LONG_FLAGS.contains(&name)
}

/// Whether colored diagnostics were requested. Looked up on the raw arguments
/// so that a usage error can already be colored.
pub fn wants_color(raw: &[String]) -> bool {
    raw.iter()
        .skip(1)
        .any(|arg| arg == "-color-diagnostics" || arg == "--color-diagnostics")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("shot_diff")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    fn run_args(args: &[&str]) -> Args {
        match parse(argv(args)).expect("valid command line") {
            Invocation::Run(args) => args,
            Invocation::Help(_) => panic!("unexpected help"),
        }
    }

    #[test]
    fn single_dash_long_flags_are_rewritten() {
        assert_eq!(
            normalize_args(argv(&["-new", "a.png", "-threshold=10", "-perf", "-o", "x"])),
            argv(&["--new", "a.png", "--threshold=10", "--perf", "-o", "x"])
        );
    }

    #[test]
    fn values_are_never_rewritten() {
        assert_eq!(
            normalize_args(argv(&["--output", "-perf", "-old", "-new"])),
            argv(&["--output", "-perf", "--old", "-new"])
        );
        assert_eq!(normalize_args(argv(&["-unknown", "-h"])), argv(&["-unknown", "-h"]));
    }

    #[test]
    fn defaults_apply() {
        let args = run_args(&["-new", "n.png", "-old", "o.png"]);
        assert_eq!(args.output, DEFAULT_OUTPUT_PREFIX);
        assert_eq!(args.threshold, 200);
        assert!(!args.create_change_image && !args.cross_check && !args.perf);
        assert!(args.thread_count() >= 1 && args.thread_count() <= MAX_DEFAULT_THREADS);

        let config = args.into_config();
        assert_eq!(config.new_path, PathBuf::from("n.png"));
        assert_eq!(config.old_path, PathBuf::from("o.png"));
    }

    #[test]
    fn every_flag_is_accepted_in_both_spellings() {
        let args = run_args(&[
            "-new", "n.png", "--old", "o.png", "--output", "out", "-threshold", "0",
            "-create_change_image", "--cross_check", "-thread_count", "3", "-perf",
            "-color-diagnostics", "-save_segments",
        ]);
        assert_eq!(args.output, "out");
        assert_eq!(args.threshold, 0);
        assert!(args.create_change_image && args.cross_check && args.perf);
        assert!(args.color_diagnostics && args.save_segments);
        assert_eq!(args.thread_count(), 3);
    }

    #[test]
    fn help_is_not_an_error() {
        for flag in ["-h", "--help", "-help"] {
            match parse(argv(&[flag])).expect("help") {
                Invocation::Help(text) => assert!(text.contains("-threshold")),
                Invocation::Run(_) => panic!("expected help"),
            }
        }
    }

    #[test]
    fn bad_command_lines_are_usage_errors() {
        let cases: &[&[&str]] = &[
            &["-old", "o.png"],
            &["-new", "n.png", "-old", "o.png", "-threshold", "256"],
            &["-new", "n.png", "-old", "o.png", "-thread_count", "0"],
            &["-new", "n.png", "-old", "o.png", "-bogus"],
            &["-new", "n.png", "-old"],
        ];
        for case in cases {
            assert!(
                matches!(parse(argv(case)), Err(DiffError::Usage(_))),
                "{case:?}"
            );
        }
    }

    #[test]
    fn color_is_detected_before_parsing() {
        assert!(wants_color(&argv(&["-bogus", "-color-diagnostics"])));
        assert!(!wants_color(&argv(&["-new", "x"])));
    }
}
