//! End-to-end playback behavior through the public API.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gridplay::config::PlaybackConfig;
use gridplay::core::fetch::{FetchCoordinator, FetchHandle};
use gridplay::core::frame_store::FrameStore;
use gridplay::core::player::{snap_to_frame, PlaybackMode, Player};
use gridplay::core::player_events::StateChangedEvent;
use gridplay::core::testing::{ManualPool, RecordingSink, ScriptedSource};
use gridplay::core::workers::Workers;
use gridplay::entities::{DataSource, MeshDimensions, Metadata, Priority};
use gridplay::shell::HeatPlateSource;

fn meta(total: usize, interval: f64) -> Metadata {
    Metadata::new(total, interval, MeshDimensions::new(3, 3), None).unwrap()
}

fn config() -> PlaybackConfig {
    PlaybackConfig {
        backoff_base_ms: 0,
        backoff_cap_ms: 0,
        fetch_timeout_ms: 0,
        ..Default::default()
    }
}

struct Harness {
    player: Player,
    pool: Arc<ManualPool>,
    source: Arc<ScriptedSource>,
    sink: RecordingSink,
}

impl Harness {
    fn new(source: ScriptedSource, config: PlaybackConfig) -> Self {
        let source = Arc::new(source);
        let pool = Arc::new(ManualPool::new());
        let sink = RecordingSink::new();
        let player = Player::new(config, source.clone(), Box::new(sink.clone()), pool.clone()).unwrap();
        Self {
            player,
            pool,
            source,
            sink,
        }
    }

    fn ready(total: usize, interval: f64) -> Self {
        let mut h = Self::new(ScriptedSource::new(meta(total, interval)), config());
        h.player.initialize().unwrap();
        h.settle();
        assert_eq!(h.player.mode(), PlaybackMode::Paused);
        h
    }

    fn settle(&mut self) {
        self.pool.run_all();
        self.player.pump();
    }
}

/// Pump until `done` holds or the deadline passes
fn pump_until(player: &mut Player, timeout: Duration, done: impl Fn(&Player) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        player.pump();
        if done(player) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn one_interval_of_wall_time_advances_one_frame() {
    let mut h = Harness::ready(5, 15.0);
    h.player.play().unwrap();
    h.player.tick(15_000.0);
    assert_eq!(h.player.current_index(), 1);
    h.player.tick(0.0);
    assert_eq!(h.player.current_index(), 1);
    assert_eq!(h.sink.shown(), vec![0, 1]);

    // Same wall time in render-sized slices
    let mut h = Harness::ready(5, 15.0);
    h.player.play().unwrap();
    let mut transitions = 0;
    let mut last = h.player.current_index();
    for _ in 0..1000 {
        h.player.tick(15.0);
        if h.player.current_index() != last {
            transitions += 1;
            last = h.player.current_index();
        }
    }
    assert_eq!(transitions, 1);
    assert_eq!(h.player.current_index(), 1);
}

#[test]
fn fast_playback_is_capped_per_tick_and_stops_at_the_end() {
    let mut h = Harness::ready(5, 15.0);
    h.player.set_speed(10.0).unwrap();
    h.player.play().unwrap();
    h.player.tick(15_000.0);
    assert_eq!(h.player.current_index(), 4);
    assert_eq!(h.player.mode(), PlaybackMode::Paused);

    let mut h = Harness::ready(100, 15.0);
    let cap = h.player.config().max_frame_skip_per_tick;
    h.player.set_speed(10.0).unwrap();
    h.player.play().unwrap();
    let mut prev = 0;
    for _ in 0..5 {
        h.player.tick(15_000.0);
        let now = h.player.current_index();
        assert!(now - prev <= cap);
        prev = now;
    }
    assert_eq!(prev, 5 * cap);
}

#[test]
fn scrub_while_playing_ends_paused_at_target() {
    let mut h = Harness::ready(100, 1.0);
    let modes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&modes);
    h.player
        .events()
        .subscribe::<StateChangedEvent, _>(move |e| seen.lock().unwrap().push(e.to));

    h.player.play().unwrap();
    for _ in 0..5 {
        h.player.tick(8_000.0);
    }
    assert_eq!(h.player.current_index(), 40);

    h.player.scrub(3).unwrap();
    assert_eq!(h.player.mode(), PlaybackMode::Scrubbing);
    let keep = h.player.planner().unwrap().keep_range(3, 1.0);
    assert!(h.player.fetch().pending_indices().iter().all(|i| keep.contains(i)));

    h.player.release_scrub().unwrap();
    assert_eq!(h.player.mode(), PlaybackMode::Paused);
    assert_eq!(h.player.current_index(), 3);
    let window = h.player.planner().unwrap().window(3, 1.0);
    assert!(h.player.fetch().pending_indices().iter().all(|i| window.contains(i)));

    assert_eq!(
        *modes.lock().unwrap(),
        vec![
            PlaybackMode::Playing,
            PlaybackMode::Paused,
            PlaybackMode::Scrubbing,
            PlaybackMode::Paused
        ]
    );

    h.settle();
    assert_eq!(h.player.displayed_index(), Some(3));
}

#[test]
fn playing_from_the_last_frame_pauses_on_next_tick() {
    let mut h = Harness::ready(10, 1.0);
    h.player.scrub(9).unwrap();
    h.player.release_scrub().unwrap();
    h.settle();
    h.player.play().unwrap();
    assert_eq!(h.player.mode(), PlaybackMode::Playing);
    h.player.tick(0.0);
    assert_eq!(h.player.mode(), PlaybackMode::Paused);
    assert_eq!(h.player.current_index(), 9);
}

#[test]
fn scrub_release_round_trip_and_snap() {
    let mut h = Harness::ready(20, 1.0);
    for j in 0..20 {
        h.player.scrub(j).unwrap();
        h.player.release_scrub().unwrap();
        assert_eq!(h.player.current_index(), j as usize);
    }

    for x in [-3.0, 0.0, 0.49, 0.5, 7.6, 19.2, 1e9, f64::NAN] {
        let once = snap_to_frame(x, 20);
        assert_eq!(snap_to_frame(once as f64, 20), once);
        assert_eq!(h.player.snap_to_frame(x), once);
    }
}

#[test]
fn always_failing_source_makes_retries_plus_one_attempts() {
    let config = PlaybackConfig {
        max_retries: 2,
        initial_batch_size: 1,
        ..config()
    };
    let mut h = Harness::new(ScriptedSource::new(meta(10, 1.0)).failing_always(), config);
    h.player.initialize().unwrap();
    h.settle();

    assert_eq!(h.player.mode(), PlaybackMode::Error);
    assert_eq!(h.source.calls_for(0), 3);
    let err = h.player.last_error().unwrap();
    assert_eq!((err.index, err.attempts), (0, 3));
    assert_eq!(h.sink.errors().len(), 1);
}

#[test]
fn concurrent_requests_share_one_fetch_on_real_workers() {
    let source = Arc::new(ScriptedSource::new(meta(10, 1.0)).with_latency(Duration::from_millis(20)));
    let pool = Arc::new(Workers::new(2).unwrap());
    let mut coord = FetchCoordinator::new(source.clone(), pool, config().fetch_policy());
    coord.set_metadata(source.fetch_metadata().unwrap());
    let mut store = FrameStore::new(8);

    let mut handles: Vec<FetchHandle> = (0..6)
        .map(|_| coord.request(7, Priority::High, &mut store).unwrap())
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !store.has(7) && Instant::now() < deadline {
        coord.drain(&mut store, &BTreeSet::new());
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(source.calls_for(7), 1);
    for handle in handles.iter_mut() {
        assert_eq!(handle.try_result().unwrap().as_ref().unwrap().index(), 7);
    }
}

#[test]
fn heat_plate_plays_through_worker_pool() {
    let source = Arc::new(HeatPlateSource::new(40, 0.1, MeshDimensions::new(8, 8)).unwrap());
    let pool = Arc::new(Workers::new(2).unwrap());
    let sink = RecordingSink::new();
    let mut player = Player::new(config(), source, Box::new(sink.clone()), pool).unwrap();

    player.initialize().unwrap();
    assert!(pump_until(&mut player, Duration::from_secs(5), |p| p.mode() == PlaybackMode::Paused));

    player.play().unwrap();
    for _ in 0..20 {
        player.tick(100.0);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(player.current_index(), 20);
    assert!(pump_until(&mut player, Duration::from_secs(5), |p| p.displayed_index() == Some(20)));

    let shown = sink.shown();
    assert!(shown.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(shown.last(), Some(&20));
    assert!(player.cache_stats().resident_count <= player.cache_stats().capacity);
}
