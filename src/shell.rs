//! Shared shell for the demo binary and embedders.
//!
//! - `init_logger`: env_logger setup (console or file)
//! - `HeatPlateSource`: synthetic cooling-plate dataset
//! - `LogSink`: render sink that logs frames and can export them as CSV
//! - `Shell`: player + worker pool + event bus wired together

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::PlaybackConfig;
use crate::core::event_bus::EventBus;
use crate::core::player::Player;
use crate::core::workers::Workers;
use crate::entities::{
    DataSource, FetchError, Frame, FrameLoadError, FrameMeta, MeshDimensions, Metadata, MetadataError, Progress,
    RenderSink, TempRange, WorkerPool,
};

/// Map `-v` count to a level: 0 warn, 1 info, 2 debug, 3+ trace
pub fn log_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Initialize env_logger. Console logging respects `RUST_LOG`.
pub fn init_logger(verbosity: u8, log_file: Option<&Path>) -> Result<()> {
    let level = log_level(verbosity);
    match log_file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create log file: {}", path.display()))?;
            env_logger::Builder::new()
                .filter_level(level)
                .format_timestamp_millis()
                .target(env_logger::Target::Pipe(Box::new(file)))
                .try_init()?;
            info!("Logging to file: {} (level: {:?})", path.display(), level);
        }
        None => {
            let default = level.to_string().to_lowercase();
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
                .format_timestamp_millis()
                .try_init()?;
        }
    }
    Ok(())
}

/// Plate temperature far from the hot spot
const AMBIENT: f64 = 20.0;
/// Initial excess temperature at the hot spot center
const PEAK: f64 = 480.0;
/// Thermal diffusivity in cells^2 per second
const DIFFUSIVITY: f64 = 0.35;

/// Deterministic 64-bit mix (splitmix64 finalizer)
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Synthetic dataset: a Gaussian hot spot cooling on a square plate.
///
/// `T(x, y, t) = ambient + peak * s2 / w(t) * exp(-r^2 / w(t))`, with
/// `w(t) = s2 + 4 * a * t`. Values are a pure function of index and node, so
/// every fetch of a frame returns the same grid.
///
/// Optional latency and failure injection exercise the retry path. Failures
/// are decided by hashing (index, attempt): reproducible across runs.
#[derive(Debug)]
pub struct HeatPlateSource {
    meta: Metadata,
    latency: Duration,
    fail_rate: f64,
    attempts: Mutex<HashMap<usize, u32>>,
}

impl HeatPlateSource {
    pub fn new(total_frames: usize, time_interval: f64, mesh: MeshDimensions) -> Result<Self, MetadataError> {
        let range = TempRange::new(AMBIENT, AMBIENT + PEAK);
        Ok(Self {
            meta: Metadata::new(total_frames, time_interval, mesh, Some(range))?,
            latency: Duration::ZERO,
            fail_rate: 0.0,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fraction of attempts that fail, clamped to [0, 1]
    pub fn with_fail_rate(mut self, rate: f64) -> Self {
        self.fail_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    fn should_fail(&self, index: usize, attempt: u32) -> bool {
        if self.fail_rate <= 0.0 {
            return false;
        }
        let roll = mix(((index as u64) << 32) | attempt as u64) as f64 / u64::MAX as f64;
        roll < self.fail_rate
    }

    /// Grid values at simulation time `t`
    pub fn sample(&self, t: f64) -> Vec<f64> {
        let mesh = self.meta.mesh();
        let cx = (mesh.width.saturating_sub(1)) as f64 / 2.0;
        let cy = (mesh.height.saturating_sub(1)) as f64 / 2.0;
        let s2 = (mesh.width.min(mesh.height) as f64 / 8.0).max(1.0).powi(2);
        let w = s2 + 4.0 * DIFFUSIVITY * t.max(0.0);
        let amplitude = PEAK * s2 / w;

        let mut values = Vec::with_capacity(mesh.node_count());
        for y in 0..mesh.height {
            for x in 0..mesh.width {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                values.push(AMBIENT + amplitude * (-(dx * dx + dy * dy) / w).exp());
            }
        }
        values
    }
}

impl DataSource for HeatPlateSource {
    fn fetch_metadata(&self) -> Result<Metadata, FetchError> {
        Ok(self.meta.clone())
    }

    fn fetch_frame(&self, index: usize) -> Result<Frame, FetchError> {
        if !self.meta.contains(index) {
            return Err(FetchError::IndexOutOfRange {
                index,
                total: self.meta.total_frames(),
            });
        }
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let n = attempts.entry(index).or_insert(0);
            *n += 1;
            *n
        };
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.should_fail(index, attempt) {
            return Err(FetchError::SourceUnavailable(format!(
                "injected failure (frame {}, attempt {})",
                index, attempt
            )));
        }

        let time = self.meta.time_of(index);
        let values = self.sample(time);
        let range = TempRange::of(&values);
        let frame = Frame::new(index, time, values);
        Ok(match range {
            Some(range) => frame.with_temp_range(range),
            None => frame,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkCounters {
    pub frames: usize,
    pub stalls: usize,
    pub errors: usize,
    pub exports: usize,
}

/// Render sink for headless runs: logs, counts, exports CSV
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    export_dir: Option<PathBuf>,
    counters: Arc<Mutex<SinkCounters>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write captured frames as `frame_NNNNN.csv` into `dir`
    pub fn with_export_dir(mut self, dir: PathBuf) -> Self {
        self.export_dir = Some(dir);
        self
    }

    pub fn counters(&self) -> SinkCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, f: impl FnOnce(&mut SinkCounters)) {
        f(&mut *self.counters.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// One CSV row per mesh row
fn write_csv(path: &Path, frame: &Frame, width: usize) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for row in frame.values().chunks(width.max(1)) {
        let line: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
        writeln!(out, "{}", line.join(","))?;
    }
    out.flush()?;
    Ok(())
}

impl RenderSink for LogSink {
    fn on_frame_ready(&mut self, frame: &Frame, meta: FrameMeta) {
        if meta.loading {
            self.count(|c| c.stalls += 1);
            debug!("Holding frame {} while loading", frame.index());
            return;
        }
        self.count(|c| c.frames += 1);
        match frame.temp_range() {
            Some(range) => debug!(
                "Frame {} t={:.2}s T=[{:.1}, {:.1}]",
                frame.index(),
                frame.time(),
                range.min,
                range.max
            ),
            None => debug!("Frame {} t={:.2}s", frame.index(), frame.time()),
        }
    }

    fn on_progress(&mut self, progress: Progress) {
        debug!(
            "Resident {}/{} ({:.0}%)",
            progress.loaded_count,
            progress.total_count,
            progress.fraction() * 100.0
        );
    }

    fn on_error(&mut self, error: &FrameLoadError) {
        self.count(|c| c.errors += 1);
        warn!("{}", error);
    }

    fn capture(&mut self, frame: &Frame) -> Result<()> {
        let Some(dir) = &self.export_dir else {
            anyhow::bail!("no export directory configured");
        };
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("frame_{:05}.csv", frame.index()));
        // Square meshes are the common case; without metadata fall back to sqrt
        let width = (frame.values().len() as f64).sqrt().round() as usize;
        write_csv(&path, frame, width)?;
        self.count(|c| c.exports += 1);
        info!("Exported frame {} to {}", frame.index(), path.display());
        Ok(())
    }
}

/// Player wired to an event bus
pub struct Shell {
    pub player: Player,
    pub event_bus: EventBus,
}

impl Shell {
    /// Player backed by a `Workers` pool sized from `config.worker_threads`
    pub fn new(config: PlaybackConfig, source: Arc<dyn DataSource>, sink: Box<dyn RenderSink>) -> Result<Self> {
        let workers = Workers::with_auto_size(config.worker_threads).context("Failed to start worker pool")?;
        info!("Worker pool: {} thread(s)", workers.thread_count());
        Self::with_pool(config, source, sink, Arc::new(workers))
    }

    pub fn with_pool(
        config: PlaybackConfig,
        source: Arc<dyn DataSource>,
        sink: Box<dyn RenderSink>,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self> {
        let event_bus = EventBus::new();
        let player = Player::new(config, source, sink, pool)?.with_event_bus(event_bus.clone());
        Ok(Self { player, event_bus })
    }

    /// Apply queued command events to the player. Returns commands handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        for event in self.event_bus.poll() {
            if self.player.handle_event(&event) {
                handled += 1;
            }
        }
        handled
    }
}
