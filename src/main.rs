use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use gridplay::cli::Args;
use gridplay::config::{self, PlaybackConfig};
use gridplay::core::player::PlaybackMode;
use gridplay::core::player_events::{
    ExportFrameEvent, FrameLoadFailedEvent, LoadingChangedEvent, PlayEvent, ReleaseScrubEvent, ScrubEvent,
    SetSpeedEvent, StateChangedEvent,
};
use gridplay::entities::MeshDimensions;
use gridplay::shell::{self, HeatPlateSource, LogSink, Shell};

/// Host loop period (about 60 Hz)
const TICK: Duration = Duration::from_millis(16);
/// Give up waiting for the initial batch after this long
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    let args = Args::parse();
    shell::init_logger(args.verbosity, args.log_path().as_deref())?;

    let config = PlaybackConfig::load_or_default(args.config.clone())?;
    if args.write_config {
        let path = config::resolve_path(args.config.clone()).context("No config path available")?;
        config.save(&path)?;
        println!("Config written to {}", path.display());
        return Ok(());
    }
    debug!("Effective config: {:?}", config);

    let source = HeatPlateSource::new(args.frames, args.interval, MeshDimensions::new(args.width, args.height))
        .context("Invalid dataset parameters")?
        .with_latency(Duration::from_millis(args.latency_ms))
        .with_fail_rate(args.fail_rate);

    let mut sink = LogSink::new();
    if let Some(dir) = &args.export_dir {
        sink = sink.with_export_dir(dir.clone());
    }
    let counters = sink.clone();

    let mut shell = Shell::new(config, Arc::new(source), Box::new(sink))?;
    subscribe_logging(&shell);

    shell.player.initialize().context("Failed to initialize player")?;
    wait_for_ready(&mut shell)?;

    let ui = shell.event_bus.emitter();
    ui.emit(SetSpeedEvent(args.speed));
    ui.emit(PlayEvent);
    shell.process_events();

    let run_for = Duration::from_secs_f64(args.seconds.max(0.0));
    let scrub_at = run_for / 2;
    let mut scrub_pending = args.scrub;
    let start = Instant::now();

    while start.elapsed() < run_for {
        if let Some(target) = scrub_pending {
            if start.elapsed() >= scrub_at {
                info!("Scrubbing to {}", target);
                ui.emit(ScrubEvent(target as f64));
                ui.emit(ReleaseScrubEvent);
                ui.emit(PlayEvent);
                scrub_pending = None;
            }
        }
        shell.process_events();
        shell.player.update();
        if shell.player.mode() == PlaybackMode::Error {
            warn!("Playback stopped on error");
            break;
        }
        if scrub_pending.is_none() && shell.player.mode() == PlaybackMode::Paused {
            info!("Playback finished at frame {}", shell.player.current_index());
            break;
        }
        thread::sleep(TICK);
    }

    if args.export_dir.is_some() {
        ui.emit(ExportFrameEvent);
        shell.process_events();
    }

    report(&shell, &counters, start.elapsed());
    Ok(())
}

fn subscribe_logging(shell: &Shell) {
    let bus = &shell.event_bus;
    bus.subscribe::<StateChangedEvent, _>(|e| debug!("State: {:?} -> {:?}", e.from, e.to));
    bus.subscribe::<LoadingChangedEvent, _>(|e| {
        if e.0 {
            debug!("Waiting for frame data");
        }
    });
    bus.subscribe::<FrameLoadFailedEvent, _>(|e| warn!("Frame {} failed: {}", e.0.index, e.0.cause));
}

/// Pump until the initial batch is resident (`Paused`) or loading fails
fn wait_for_ready(shell: &mut Shell) -> Result<()> {
    let start = Instant::now();
    loop {
        shell.player.pump();
        match shell.player.mode() {
            PlaybackMode::Paused => {
                info!("Initial batch ready in {:.0} ms", start.elapsed().as_secs_f64() * 1000.0);
                return Ok(());
            }
            PlaybackMode::Error => {
                let cause = shell
                    .player
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Initial load failed: {}", cause);
            }
            _ if start.elapsed() > LOAD_TIMEOUT => anyhow::bail!("Initial load timed out"),
            _ => thread::sleep(Duration::from_millis(2)),
        }
    }
}

fn report(shell: &Shell, counters: &LogSink, elapsed: Duration) {
    let player = &shell.player;
    let stats = player.cache_stats();
    let shown = counters.counters();
    let total = player.metadata().map(|m| m.total_frames()).unwrap_or(0);
    println!(
        "Ran {:.1} s: frame {}/{} (t={:.2} s), mode {:?}, speed {}x",
        elapsed.as_secs_f64(),
        player.current_index(),
        total.saturating_sub(1),
        player.current_time(),
        player.mode(),
        player.speed()
    );
    println!(
        "Shown {} frame(s), {} stall(s), {} error(s), {} export(s)",
        shown.frames, shown.stalls, shown.errors, shown.exports
    );
    println!(
        "Cache: {}/{} resident, hits {} misses {} evictions {} (hit rate {:.1}%)",
        stats.resident_count,
        stats.capacity,
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.hit_rate() * 100.0
    );
}
