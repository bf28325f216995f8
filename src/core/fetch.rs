//! Fetch coordinator: deduplicated, retried, cancellable frame requests
//!
//! **Tickets**: at most one live `FetchTicket` per frame index. Repeated
//! requests attach as extra waiters; the data source is called once.
//!
//! **Jobs**: each ticket schedules one job on the worker pool. The job runs the
//! whole retry loop (exponential backoff, per-attempt timeout) off-thread and
//! reports exactly one `FetchCompletion` over a channel. A ticket promoted
//! from the low to the high lane gets a second job; both share a claim flag
//! and only the first to start calls the source.
//!
//! **Timeouts**: a timed attempt runs on its own thread so the worker can give
//! up on it. A timed-out thread is left to finish on its own. At most
//! `MAX_ATTEMPT_THREADS` of them run at once; past that, attempts run on the
//! worker without a timeout.
//!
//! **Drain**: completions are applied on the owner's thread in `drain()`: the
//! frame is written to the store, waiters are notified, then eviction runs.
//! This is the only place fetch results touch the store, so a later
//! `request(i)` always sees either the pending ticket or the cached frame.
//!
//! **Cancellation** is advisory. A cancelled ticket still writes its frame to
//! the store but its waiters and the player are not notified.
//!
//! **Failures**: indices whose retries were exhausted are remembered. `ensure`
//! does not re-issue them (no retry storms from preload); an explicit
//! `request` or `clear_failures` makes them fetchable again.
//!
//! **Generation**: `clear()` bumps the generation so completions of a previous
//! dataset are discarded when they arrive.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use log::{debug, error, trace, warn};

use super::frame_store::FrameStore;
use crate::entities::{
    DataSource, FetchError, Frame, FrameLoadError, Metadata, MetadataError, Priority, WorkerPool,
};

/// Live timed-attempt threads allowed per coordinator
pub const MAX_ATTEMPT_THREADS: usize = 32;

/// Retry/backoff/timeout policy for one ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// 0 disables the per-attempt timeout
    pub timeout_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 50,
            backoff_cap_ms: 2000,
            timeout_ms: 5000,
        }
    }
}

impl FetchPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Result sent to a waiter
pub type FetchResult = Result<Frame, FrameLoadError>;

/// Message from a fetch job back to the coordinator
#[derive(Debug)]
struct FetchCompletion {
    generation: u64,
    index: usize,
    attempts: u32,
    result: Result<Frame, FetchError>,
}

/// Resolved fetch handed to the player after a drain
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub index: usize,
    pub result: FetchResult,
}

/// One logical in-flight request for a frame index
#[derive(Debug)]
struct FetchTicket {
    priority: Priority,
    waiters: Vec<Sender<FetchResult>>,
    cancelled: bool,
    /// Set by whichever of the ticket's jobs starts first
    claim: Arc<AtomicBool>,
}

impl FetchTicket {
    fn new(priority: Priority) -> Self {
        Self {
            priority,
            waiters: Vec::new(),
            cancelled: false,
            claim: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Caller-side view of a request.
///
/// Resolves once the owner of the coordinator drains completions. A handle
/// whose ticket was cancelled resolves to `FetchError::Cancelled`.
#[derive(Debug)]
pub struct FetchHandle {
    index: usize,
    rx: Receiver<FetchResult>,
    outcome: Option<FetchResult>,
}

impl FetchHandle {
    fn pending(index: usize) -> (Self, Sender<FetchResult>) {
        let (tx, rx) = bounded(1);
        (Self { index, rx, outcome: None }, tx)
    }

    fn ready(index: usize, frame: Frame) -> Self {
        let (_, rx) = bounded(1);
        Self {
            index,
            rx,
            outcome: Some(Ok(frame)),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Non-blocking poll. Returns the outcome once available.
    pub fn try_result(&mut self) -> Option<&FetchResult> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.outcome = Some(result),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.outcome = Some(Err(FrameLoadError {
                        index: self.index,
                        attempts: 0,
                        cause: FetchError::Cancelled,
                    }))
                }
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_resolved(&mut self) -> bool {
        self.try_result().is_some()
    }

    /// Consume the handle, returning the outcome if resolved
    pub fn into_result(mut self) -> Option<FetchResult> {
        self.try_result();
        self.outcome
    }
}

/// Run one attempt, bounded by `timeout_ms` when non-zero.
///
/// `live` counts attempt threads still running, timed-out ones included.
fn attempt_once(
    source: &Arc<dyn DataSource>,
    index: usize,
    timeout_ms: u64,
    live: &Arc<AtomicUsize>,
) -> Result<Frame, FetchError> {
    if timeout_ms == 0 {
        return source.fetch_frame(index);
    }
    let running = live.load(Ordering::Acquire);
    if running >= MAX_ATTEMPT_THREADS {
        warn!(
            "{} fetch attempt(s) still running past their timeout, frame {} fetched without timeout",
            running, index
        );
        return source.fetch_frame(index);
    }

    let (tx, rx) = bounded(1);
    let attempt_source = Arc::clone(source);
    let attempt_live = Arc::clone(live);
    live.fetch_add(1, Ordering::AcqRel);
    let spawned = thread::Builder::new()
        .name(format!("gridplay-fetch-{}", index))
        .spawn(move || {
            let _ = tx.send(attempt_source.fetch_frame(index));
            attempt_live.fetch_sub(1, Ordering::AcqRel);
        });
    if let Err(e) = spawned {
        live.fetch_sub(1, Ordering::AcqRel);
        warn!("Cannot spawn fetch thread ({}), fetching without timeout", e);
        return source.fetch_frame(index);
    }

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(result) => result,
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(FetchError::Timeout(timeout_ms)),
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
            Err(FetchError::SourceUnavailable("fetch thread exited without result".into()))
        }
    }
}

/// Full retry loop for one frame. Returns attempts made and final result.
fn fetch_with_retry(
    source: &Arc<dyn DataSource>,
    index: usize,
    meta: Option<&Metadata>,
    policy: FetchPolicy,
    live: &Arc<AtomicUsize>,
) -> (u32, Result<Frame, FetchError>) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = attempt_once(source, index, policy.timeout_ms, live).and_then(|frame| match meta {
            Some(meta) => frame.checked(index, meta).map_err(FetchError::from),
            None if frame.index() != index => Err(FetchError::InvalidFrame(MetadataError::IndexMismatch {
                requested: index,
                actual: frame.index(),
            })),
            None => Ok(frame),
        });

        match result {
            Ok(frame) => return (attempts, Ok(frame)),
            Err(e) if attempts >= policy.max_attempts() || !e.is_transient() => {
                return (attempts, Err(e));
            }
            Err(e) => {
                let delay = policy.backoff(attempts - 1);
                warn!(
                    "Fetch frame {} attempt {}/{} failed: {} (retry in {} ms)",
                    index,
                    attempts,
                    policy.max_attempts(),
                    e,
                    delay.as_millis()
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    }
}

/// Deduplicating front end to the data source
pub struct FetchCoordinator {
    source: Arc<dyn DataSource>,
    pool: Arc<dyn WorkerPool>,
    policy: FetchPolicy,
    meta: Option<Metadata>,
    tickets: BTreeMap<usize, FetchTicket>,
    tx: Sender<FetchCompletion>,
    rx: Receiver<FetchCompletion>,
    failed: BTreeMap<usize, FrameLoadError>,
    generation: u64,
    source_calls: u64,
    attempt_threads: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("policy", &self.policy)
            .field("tickets", &self.tickets.len())
            .field("failed", &self.failed.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(source: Arc<dyn DataSource>, pool: Arc<dyn WorkerPool>, policy: FetchPolicy) -> Self {
        let (tx, rx) = unbounded();
        Self {
            source,
            pool,
            policy,
            meta: None,
            tickets: BTreeMap::new(),
            tx,
            rx,
            failed: BTreeMap::new(),
            generation: 0,
            source_calls: 0,
            attempt_threads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind to a dataset. Frames are validated against it and indices
    /// outside it are rejected.
    pub fn set_metadata(&mut self, meta: Metadata) {
        self.meta = Some(meta);
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    fn check_range(&self, index: usize) -> Result<(), FetchError> {
        match &self.meta {
            Some(meta) if !meta.contains(index) => Err(FetchError::IndexOutOfRange {
                index,
                total: meta.total_frames(),
            }),
            _ => Ok(()),
        }
    }

    /// Request a frame, returning a handle that resolves to it.
    ///
    /// Resident frames resolve immediately. An outstanding ticket gains one
    /// more waiter (and is revived if it was cancelled). A remembered
    /// failure is forgotten and the frame fetched again.
    pub fn request(&mut self, index: usize, priority: Priority, store: &mut FrameStore) -> Result<FetchHandle, FetchError> {
        self.check_range(index)?;
        if let Some(frame) = store.get(index) {
            return Ok(FetchHandle::ready(index, frame));
        }
        self.failed.remove(&index);
        let (handle, waiter) = FetchHandle::pending(index);
        self.ticket_for(index, priority).waiters.push(waiter);
        Ok(handle)
    }

    /// Make sure `index` is resident or on its way, without a waiter.
    ///
    /// Returns true if the frame is already resident. Indices with a
    /// remembered failure are left alone.
    pub fn ensure(&mut self, index: usize, priority: Priority, store: &FrameStore) -> Result<bool, FetchError> {
        self.check_range(index)?;
        if store.has(index) {
            return Ok(true);
        }
        if !self.failed.contains_key(&index) {
            self.ticket_for(index, priority);
        }
        Ok(false)
    }

    /// Live ticket for `index`, issuing the fetch job if none exists.
    ///
    /// A queued ticket asked for at a more urgent priority is requeued on
    /// that lane.
    fn ticket_for(&mut self, index: usize, priority: Priority) -> &mut FetchTicket {
        let job = match self.tickets.get_mut(&index) {
            Some(ticket) => {
                if ticket.cancelled {
                    trace!("Ticket {} revived", index);
                    ticket.cancelled = false;
                }
                if priority < ticket.priority {
                    ticket.priority = priority;
                    if ticket.claim.load(Ordering::Acquire) {
                        None
                    } else {
                        debug!("Ticket {} promoted to {:?}", index, priority);
                        Some(Arc::clone(&ticket.claim))
                    }
                } else {
                    None
                }
            }
            None => {
                let ticket = FetchTicket::new(priority);
                let claim = Arc::clone(&ticket.claim);
                self.tickets.insert(index, ticket);
                self.source_calls += 1;
                debug!("Ticket {} issued ({:?})", index, priority);
                Some(claim)
            }
        };
        if let Some(claim) = job {
            self.spawn_job(index, priority, claim);
        }
        self.tickets.entry(index).or_insert_with(|| FetchTicket::new(priority))
    }

    fn spawn_job(&self, index: usize, priority: Priority, claim: Arc<AtomicBool>) {
        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();
        let meta = self.meta.clone();
        let policy = self.policy;
        let generation = self.generation;
        let live = Arc::clone(&self.attempt_threads);

        self.pool.execute(
            priority,
            Box::new(move || {
                if claim.swap(true, Ordering::AcqRel) {
                    trace!("Frame {} already claimed by another job", index);
                    return;
                }
                let (attempts, result) = fetch_with_retry(&source, index, meta.as_ref(), policy, &live);
                let _ = tx.send(FetchCompletion {
                    generation,
                    index,
                    attempts,
                    result,
                });
            }),
        );
    }

    /// Mark a ticket as no longer needed. Never fails.
    pub fn cancel(&mut self, index: usize) {
        if let Some(ticket) = self.tickets.get_mut(&index) {
            if !ticket.cancelled {
                trace!("Ticket {} cancelled", index);
                ticket.cancelled = true;
                ticket.waiters.clear();
            }
        }
    }

    /// Cancel every live ticket outside `keep`. Returns cancelled indices.
    pub fn cancel_outside(&mut self, keep: &RangeInclusive<usize>) -> Vec<usize> {
        let doomed: Vec<usize> = self
            .tickets
            .iter()
            .filter(|(idx, t)| !t.cancelled && !keep.contains(idx))
            .map(|(idx, _)| *idx)
            .collect();
        for &index in &doomed {
            self.cancel(index);
        }
        if !doomed.is_empty() {
            debug!("Cancelled {} ticket(s) outside {:?}", doomed.len(), keep);
        }
        doomed
    }

    pub fn cancel_all(&mut self) -> usize {
        let live: Vec<usize> = self.pending_indices();
        for &index in &live {
            self.cancel(index);
        }
        live.len()
    }

    /// Apply finished jobs: cache frames, notify waiters, evict.
    ///
    /// `protected` (the playhead) and frames delivered in this batch are
    /// exempt from eviction. Returns outcomes of non-cancelled tickets.
    pub fn drain(&mut self, store: &mut FrameStore, protected: &BTreeSet<usize>) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::new();
        let mut delivered = protected.clone();

        loop {
            let completion = match self.rx.try_recv() {
                Ok(c) => c,
                Err(_) => break,
            };
            if completion.generation != self.generation {
                trace!("Dropped stale completion for frame {}", completion.index);
                continue;
            }

            let index = completion.index;
            let ticket = self.tickets.remove(&index);
            let cancelled = ticket.as_ref().map(|t| t.cancelled).unwrap_or(true);
            let waiters = ticket.map(|t| t.waiters).unwrap_or_default();

            let result = match completion.result {
                Ok(frame) => {
                    self.failed.remove(&index);
                    store.put(index, frame.clone());
                    delivered.insert(index);
                    trace!("Frame {} resident after {} attempt(s)", index, completion.attempts);
                    Ok(frame)
                }
                Err(cause) => {
                    let err = FrameLoadError {
                        index,
                        attempts: completion.attempts,
                        cause,
                    };
                    if cancelled {
                        debug!("Cancelled fetch failed: {}", err);
                    } else {
                        error!("{}", err);
                        self.failed.insert(index, err.clone());
                    }
                    Err(err)
                }
            };

            if cancelled {
                continue;
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            outcomes.push(FetchOutcome { index, result });
        }

        store.evict_if_over_capacity(&delivered);
        outcomes
    }

    /// Indices with a live (non-cancelled) ticket, ascending
    pub fn pending_indices(&self) -> Vec<usize> {
        self.tickets
            .iter()
            .filter(|(_, t)| !t.cancelled)
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn is_pending(&self, index: usize) -> bool {
        self.tickets.get(&index).map(|t| !t.cancelled).unwrap_or(false)
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        self.tickets.get(&index).map(|t| t.cancelled).unwrap_or(false)
    }

    /// Last terminal failure of `index`, if not retried since
    pub fn failure(&self, index: usize) -> Option<&FrameLoadError> {
        self.failed.get(&index)
    }

    pub fn has_failed(&self, index: usize) -> bool {
        self.failed.contains_key(&index)
    }

    /// Make `index` fetchable again. Returns true if a failure was recorded.
    pub fn forget_failure(&mut self, index: usize) -> bool {
        self.failed.remove(&index).is_some()
    }

    /// Make every failed index fetchable again
    pub fn clear_failures(&mut self) {
        if !self.failed.is_empty() {
            debug!("Forgetting {} failed frame(s)", self.failed.len());
            self.failed.clear();
        }
    }

    /// All outstanding tickets, cancelled ones included
    pub fn in_flight(&self) -> usize {
        self.tickets.len()
    }

    /// Tickets issued since creation (promotions not counted)
    pub fn source_calls(&self) -> u64 {
        self.source_calls
    }

    /// Forget every ticket. Late completions are discarded.
    pub fn clear(&mut self) {
        self.generation += 1;
        let dropped = self.tickets.len();
        self.tickets.clear();
        self.failed.clear();
        self.meta = None;
        debug!("Fetch coordinator cleared ({} tickets, generation {})", dropped, self.generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{ManualPool, ScriptedSource};
    use crate::entities::MeshDimensions;

    fn meta(total: usize) -> Metadata {
        Metadata::new(total, 1.0, MeshDimensions::new(2, 2), None).unwrap()
    }

    fn policy(max_retries: u32) -> FetchPolicy {
        FetchPolicy {
            max_retries,
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
            timeout_ms: 0,
        }
    }

    fn setup(source: ScriptedSource, max_retries: u32) -> (FetchCoordinator, Arc<ManualPool>, Arc<ScriptedSource>) {
        let source = Arc::new(source);
        let pool = Arc::new(ManualPool::new());
        let mut coord = FetchCoordinator::new(source.clone(), pool.clone(), policy(max_retries));
        coord.set_metadata(meta(10));
        (coord, pool, source)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = FetchPolicy {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 500,
            timeout_ms: 0,
        };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(500));
        assert_eq!(p.backoff(80), Duration::from_millis(500));
        assert_eq!(p.max_attempts(), 6);
    }

    #[test]
    fn test_concurrent_requests_share_one_fetch() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)), 3);
        let mut store = FrameStore::new(8);

        let mut handles: Vec<FetchHandle> = (0..5)
            .map(|_| coord.request(4, Priority::High, &mut store).unwrap())
            .collect();
        assert_eq!(pool.queued(), 1);
        assert!(handles.iter_mut().all(|h| !h.is_resolved()));

        pool.run_all();
        let outcomes = coord.drain(&mut store, &BTreeSet::new());

        assert_eq!(source.calls_for(4), 1);
        assert_eq!(outcomes.len(), 1);
        for h in handles.iter_mut() {
            let frame = h.try_result().unwrap().as_ref().unwrap();
            assert_eq!(frame.index(), 4);
        }
        assert!(store.has(4));
        assert_eq!(coord.in_flight(), 0);
    }

    #[test]
    fn test_always_failing_source_exhausts_retries() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)).failing_always(), 3);
        let mut store = FrameStore::new(8);

        let mut a = coord.request(2, Priority::High, &mut store).unwrap();
        let mut b = coord.request(2, Priority::Low, &mut store).unwrap();
        pool.run_all();
        let outcomes = coord.drain(&mut store, &BTreeSet::new());

        assert_eq!(source.calls_for(2), 4);
        assert!(!store.has(2));
        assert_eq!(outcomes.len(), 1);
        for h in [&mut a, &mut b] {
            let err = h.try_result().unwrap().as_ref().unwrap_err();
            assert_eq!(err.index, 2);
            assert_eq!(err.attempts, 4);
            assert!(matches!(err.cause, FetchError::SourceUnavailable(_)));
        }
    }

    #[test]
    fn test_failed_index_not_reissued_until_requested() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)).failing_indices([5]), 0);
        let mut store = FrameStore::new(8);

        coord.ensure(5, Priority::High, &store).unwrap();
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());
        assert!(coord.has_failed(5));
        assert_eq!(coord.failure(5).map(|e| e.attempts), Some(1));

        assert!(!coord.ensure(5, Priority::High, &store).unwrap());
        assert_eq!(pool.queued(), 0);
        assert!(!coord.is_pending(5));

        let _h = coord.request(5, Priority::High, &mut store).unwrap();
        assert!(!coord.has_failed(5));
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());
        assert_eq!(source.calls_for(5), 2);

        coord.clear_failures();
        assert!(!coord.has_failed(5));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)).failing_first(2), 3);
        let mut store = FrameStore::new(8);

        let mut h = coord.request(1, Priority::High, &mut store).unwrap();
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());

        assert_eq!(source.calls_for(1), 3);
        assert!(h.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_cancelled_ticket_still_caches_but_does_not_deliver() {
        let (mut coord, pool, _source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);

        let mut h = coord.request(3, Priority::Low, &mut store).unwrap();
        coord.cancel(3);
        coord.cancel(3);
        coord.cancel(99);
        assert!(!coord.is_pending(3));
        assert!(coord.is_cancelled(3));

        pool.run_all();
        let outcomes = coord.drain(&mut store, &BTreeSet::new());
        assert!(outcomes.is_empty());
        assert!(store.has(3));
        let err = h.try_result().unwrap().as_ref().unwrap_err();
        assert_eq!(err.cause, FetchError::Cancelled);
    }

    #[test]
    fn test_request_revives_cancelled_ticket_without_refetch() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);

        coord.ensure(6, Priority::Low, &store).unwrap();
        coord.cancel(6);
        let mut h = coord.request(6, Priority::High, &mut store).unwrap();
        assert!(coord.is_pending(6));

        pool.run_all();
        let outcomes = coord.drain(&mut store, &BTreeSet::new());
        assert_eq!(source.calls_for(6), 1);
        assert_eq!(outcomes.len(), 1);
        assert!(h.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_resident_frame_resolves_immediately() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);
        store.put(0, Frame::new(0, 0.0, vec![0.0; 4]));

        let mut h = coord.request(0, Priority::High, &mut store).unwrap();
        assert!(h.is_resolved());
        assert!(coord.ensure(0, Priority::High, &store).unwrap());
        assert_eq!(pool.queued(), 0);
        assert_eq!(source.calls_for(0), 0);
    }

    #[test]
    fn test_out_of_range_rejected_synchronously() {
        let (mut coord, pool, _source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);
        assert!(matches!(
            coord.request(10, Priority::High, &mut store),
            Err(FetchError::IndexOutOfRange { index: 10, total: 10 })
        ));
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_cancel_outside_keeps_window() {
        let (mut coord, _pool, _source) = setup(ScriptedSource::new(meta(10)), 0);
        let store = FrameStore::new(8);
        for i in [0, 1, 4, 5, 6, 9] {
            coord.ensure(i, Priority::Low, &store).unwrap();
        }
        let cancelled = coord.cancel_outside(&(4..=6));
        assert_eq!(cancelled, vec![0, 1, 9]);
        assert_eq!(coord.pending_indices(), vec![4, 5, 6]);
        assert_eq!(coord.in_flight(), 6);
    }

    #[test]
    fn test_clear_discards_late_completions() {
        let (mut coord, pool, _source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);
        coord.ensure(2, Priority::High, &store).unwrap();
        coord.clear();
        coord.set_metadata(meta(10));

        pool.run_all();
        assert!(coord.drain(&mut store, &BTreeSet::new()).is_empty());
        assert!(!store.has(2));
    }

    #[test]
    fn test_timeout_counts_as_failed_attempt() {
        let source = Arc::new(ScriptedSource::new(meta(10)).with_latency(Duration::from_millis(200)));
        let pool = Arc::new(ManualPool::new());
        let p = FetchPolicy {
            max_retries: 1,
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
            timeout_ms: 10,
        };
        let mut coord = FetchCoordinator::new(source.clone(), pool.clone(), p);
        let mut store = FrameStore::new(4);

        let mut h = coord.request(0, Priority::High, &mut store).unwrap();
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());

        let err = h.try_result().unwrap().as_ref().unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.cause, FetchError::Timeout(10));
        assert!(!store.has(0));
    }

    #[test]
    fn test_eviction_spares_batch_and_protected() {
        let (mut coord, pool, _source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(2);
        store.put(0, Frame::new(0, 0.0, vec![0.0; 4]));
        store.put(1, Frame::new(1, 1.0, vec![0.0; 4]));

        coord.ensure(5, Priority::High, &store).unwrap();
        pool.run_all();
        let protected: BTreeSet<usize> = [0].into_iter().collect();
        coord.drain(&mut store, &protected);

        assert_eq!(store.resident_indices(), vec![0, 5]);
    }

    #[test]
    fn test_promoted_ticket_overtakes_low_lane_with_one_call() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);

        coord.ensure(1, Priority::Low, &store).unwrap();
        coord.ensure(3, Priority::Low, &store).unwrap();
        let mut h = coord.request(3, Priority::High, &mut store).unwrap();
        coord.ensure(4, Priority::High, &store).unwrap();
        assert_eq!(pool.queued(), 4);

        assert!(pool.run_next());
        coord.drain(&mut store, &BTreeSet::new());
        assert_eq!(store.resident_indices(), vec![3]);
        assert!(h.try_result().unwrap().is_ok());

        pool.run_all();
        let outcomes = coord.drain(&mut store, &BTreeSet::new());
        let mut delivered: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        delivered.sort();
        assert_eq!(delivered, vec![1, 4]);
        assert_eq!(source.calls_for(3), 1);
        assert_eq!(source.total_calls(), 3);
        assert_eq!(coord.source_calls(), 3);
    }

    #[test]
    fn test_started_ticket_is_not_requeued() {
        let (mut coord, pool, source) = setup(ScriptedSource::new(meta(10)), 0);
        let mut store = FrameStore::new(8);

        coord.ensure(2, Priority::Low, &store).unwrap();
        pool.run_all();
        // Finished but not drained: the job already claimed the ticket
        let mut h = coord.request(2, Priority::High, &mut store).unwrap();
        assert_eq!(pool.queued(), 0);

        coord.drain(&mut store, &BTreeSet::new());
        assert!(h.try_result().unwrap().is_ok());
        assert_eq!(source.calls_for(2), 1);
    }

    struct MisindexedSource(Metadata);

    impl DataSource for MisindexedSource {
        fn fetch_metadata(&self) -> Result<Metadata, FetchError> {
            Ok(self.0.clone())
        }

        fn fetch_frame(&self, _index: usize) -> Result<Frame, FetchError> {
            Ok(Frame::new(0, 0.0, vec![0.0; 4]))
        }
    }

    #[test]
    fn test_frame_for_another_index_is_rejected() {
        let pool = Arc::new(ManualPool::new());
        let mut coord = FetchCoordinator::new(Arc::new(MisindexedSource(meta(10))), pool.clone(), policy(1));
        coord.set_metadata(meta(10));
        let mut store = FrameStore::new(8);

        let mut h = coord.request(5, Priority::High, &mut store).unwrap();
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());

        let err = h.try_result().unwrap().as_ref().unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(
            err.cause,
            FetchError::InvalidFrame(MetadataError::IndexMismatch { requested: 5, actual: 0 })
        );
        assert!(store.is_empty());
        assert!(coord.has_failed(5));

        let mut ok = coord.request(0, Priority::High, &mut store).unwrap();
        pool.run_all();
        coord.drain(&mut store, &BTreeSet::new());
        assert!(ok.try_result().unwrap().is_ok());
        assert_eq!(store.resident_indices(), vec![0]);
    }

    #[test]
    fn test_attempt_threads_are_capped() {
        let source: Arc<dyn DataSource> =
            Arc::new(ScriptedSource::new(meta(10)).with_latency(Duration::from_millis(50)));
        let live = Arc::new(AtomicUsize::new(0));

        assert_eq!(attempt_once(&source, 1, 1, &live), Err(FetchError::Timeout(1)));
        assert_eq!(live.load(Ordering::Acquire), 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while live.load(Ordering::Acquire) > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(live.load(Ordering::Acquire), 0);

        // At the cap the attempt runs inline and is not timed
        live.store(MAX_ATTEMPT_THREADS, Ordering::Release);
        let frame = attempt_once(&source, 2, 1, &live).unwrap();
        assert_eq!(frame.index(), 2);
        assert_eq!(live.load(Ordering::Acquire), MAX_ATTEMPT_THREADS);
    }
}
