//! Deterministic doubles for the engine seams.
//!
//! - `ManualPool`: queues jobs, runs them when told (no threads)
//! - `InlinePool`: runs jobs immediately on the calling thread
//! - `ScriptedSource`: in-memory dataset with call counting and failure scripts
//! - `RecordingSink`: render sink that logs every call into a shared vec
//!
//! Used by unit tests, integration tests and headless tooling.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::entities::{
    DataSource, FetchError, Frame, FrameLoadError, FrameMeta, Job, Metadata, Priority, Progress,
    RenderSink, WorkerPool,
};

/// Pool that holds jobs until `run_next`/`run_all`. High lane first.
#[derive(Default)]
pub struct ManualPool {
    queue: Mutex<VecDeque<(Priority, Job)>>,
}

impl ManualPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run the oldest high-priority job (or oldest low one). False if empty.
    pub fn run_next(&self) -> bool {
        let job = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let pos = queue
                .iter()
                .position(|(p, _)| *p == Priority::High)
                .or_else(|| (!queue.is_empty()).then_some(0));
            pos.and_then(|p| queue.remove(p))
        };
        match job {
            Some((_, job)) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run until the queue is empty. Returns jobs run.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_next() {
            count += 1;
        }
        count
    }

    /// Discard queued jobs without running them
    pub fn drop_all(&self) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let n = queue.len();
        queue.clear();
        n
    }
}

impl WorkerPool for ManualPool {
    fn execute(&self, priority: Priority, job: Job) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back((priority, job));
    }
}

/// Pool that runs each job synchronously inside `execute`
#[derive(Debug, Default, Clone, Copy)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn execute(&self, _priority: Priority, job: Job) {
        job();
    }
}

#[derive(Debug, Clone, Default)]
enum FailMode {
    #[default]
    Never,
    Always,
    /// First N attempts of every index fail
    First(u32),
    /// Listed indices always fail
    Indices(BTreeSet<usize>),
    /// Listed indices fail their first attempt only
    OnceAt(BTreeSet<usize>),
}

/// In-memory data source with scripted failures.
///
/// Frame `i` has every value equal to `i`, time `i * interval`.
#[derive(Debug)]
pub struct ScriptedSource {
    meta: Metadata,
    fail: FailMode,
    latency: Duration,
    calls: Mutex<HashMap<usize, u32>>,
}

impl ScriptedSource {
    pub fn new(meta: Metadata) -> Self {
        Self {
            meta,
            fail: FailMode::Never,
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_always(mut self) -> Self {
        self.fail = FailMode::Always;
        self
    }

    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail = FailMode::First(attempts);
        self
    }

    pub fn failing_indices(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.fail = FailMode::Indices(indices.into_iter().collect());
        self
    }

    pub fn failing_once_at(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.fail = FailMode::OnceAt(indices.into_iter().collect());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `fetch_frame` calls made for `index`
    pub fn calls_for(&self, index: usize) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).values().sum()
    }
}

impl DataSource for ScriptedSource {
    fn fetch_metadata(&self) -> Result<Metadata, FetchError> {
        Ok(self.meta.clone())
    }

    fn fetch_frame(&self, index: usize) -> Result<Frame, FetchError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            let n = calls.entry(index).or_insert(0);
            *n += 1;
            *n
        };
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if !self.meta.contains(index) {
            return Err(FetchError::IndexOutOfRange {
                index,
                total: self.meta.total_frames(),
            });
        }
        let fails = match &self.fail {
            FailMode::Never => false,
            FailMode::Always => true,
            FailMode::First(n) => attempt <= *n,
            FailMode::Indices(set) => set.contains(&index),
            FailMode::OnceAt(set) => attempt == 1 && set.contains(&index),
        };
        if fails {
            return Err(FetchError::SourceUnavailable(format!("scripted failure #{}", attempt)));
        }
        let nodes = self.meta.mesh().node_count();
        Ok(Frame::new(index, self.meta.time_of(index), vec![index as f64; nodes]))
    }
}

/// One recorded render sink call
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Frame { index: usize, meta: FrameMeta },
    Progress(Progress),
    Error(FrameLoadError),
    Capture(usize),
}

/// Render sink recording into a shared log (clone to keep a reader handle)
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Indices freshly shown by `on_frame_ready`, in call order.
    /// Re-sends of a stale frame with `loading` set are left out.
    pub fn shown(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Frame { index, meta } if !meta.loading => Some(index),
                _ => None,
            })
            .collect()
    }

    /// Times a stale frame was re-sent with the loading indicator
    pub fn stalls(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Frame { meta, .. } if meta.loading))
            .count()
    }

    pub fn errors(&self) -> Vec<FrameLoadError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    pub fn last_progress(&self) -> Option<Progress> {
        self.events().into_iter().rev().find_map(|e| match e {
            SinkEvent::Progress(p) => Some(p),
            _ => None,
        })
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl RenderSink for RecordingSink {
    fn on_frame_ready(&mut self, frame: &Frame, meta: FrameMeta) {
        self.push(SinkEvent::Frame {
            index: frame.index(),
            meta,
        });
    }

    fn on_progress(&mut self, progress: Progress) {
        self.push(SinkEvent::Progress(progress));
    }

    fn on_error(&mut self, error: &FrameLoadError) {
        self.push(SinkEvent::Error(error.clone()));
    }

    fn capture(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.push(SinkEvent::Capture(frame.index()));
        Ok(())
    }
}
