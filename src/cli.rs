use clap::Parser;
use std::path::PathBuf;

/// Default log file for `--log` without a value
pub const DEFAULT_LOG_FILE: &str = "gridplay.log";

/// Headless heat-grid playback: loads a synthetic cooling plate and plays it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Playback config (JSON). Falls back to $GRIDPLAY_CONFIG, then the platform config dir
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of frames in the synthetic dataset
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 240)]
    pub frames: usize,

    /// Simulated time between frames, in seconds
    #[arg(long = "interval", value_name = "SECS", default_value_t = 1.0 / 24.0)]
    pub interval: f64,

    /// Mesh width in nodes
    #[arg(long = "width", value_name = "N", default_value_t = 64)]
    pub width: usize,

    /// Mesh height in nodes
    #[arg(long = "height", value_name = "N", default_value_t = 64)]
    pub height: usize,

    /// Playback speed multiplier (presets: 0.5, 1, 2, 5, 10)
    #[arg(short = 's', long = "speed", value_name = "X", default_value_t = 1.0)]
    pub speed: f64,

    /// Wall-clock seconds to run before exiting
    #[arg(short = 't', long = "seconds", value_name = "S", default_value_t = 5.0)]
    pub seconds: f64,

    /// Fraction of fetch attempts that fail (0..1)
    #[arg(long = "fail-rate", value_name = "RATE", default_value_t = 0.0)]
    pub fail_rate: f64,

    /// Artificial per-frame fetch latency
    #[arg(long = "latency-ms", value_name = "MS", default_value_t = 0)]
    pub latency_ms: u64,

    /// Scrub to this frame halfway through the run, then release
    #[arg(long = "scrub", value_name = "N")]
    pub scrub: Option<i64>,

    /// Export the frame shown at exit as CSV into this directory
    #[arg(short = 'e', long = "export", value_name = "DIR")]
    pub export_dir: Option<PathBuf>,

    /// Write the effective config to the config path and exit
    #[arg(long = "write-config")]
    pub write_config: bool,

    /// Enable logging to file (default: gridplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Resolved `--log` target, if logging to file
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["gridplay"]);
        assert_eq!(args.frames, 240);
        assert_eq!(args.speed, 1.0);
        assert_eq!(args.verbosity, 0);
        assert!(args.log_path().is_none());
        assert!(args.scrub.is_none());
    }

    #[test]
    fn test_log_flag_without_value_uses_default_file() {
        let args = Args::parse_from(["gridplay", "-vv", "--log"]);
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.log_path(), Some(PathBuf::from(DEFAULT_LOG_FILE)));

        let args = Args::parse_from(["gridplay", "--log", "run.log", "--scrub", "12", "--speed", "5"]);
        assert_eq!(args.log_path(), Some(PathBuf::from("run.log")));
        assert_eq!(args.scrub, Some(12));
        assert_eq!(args.speed, 5.0);
    }
}
