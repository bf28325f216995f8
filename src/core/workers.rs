//! Background thread pool for frame fetches.
//!
//! Two global injectors give two priority lanes:
//! - High: playhead target, scrub target, initial batch
//! - Low: background fill beyond the preload window
//!
//! Idle workers always drain the high lane before touching the low one, then
//! steal from each other.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use log::trace;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::entities::{Job, Priority, WorkerPool};

/// Worker pool with work-stealing and two priority lanes.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4)?;
/// workers.execute(Priority::High, Box::new(move || {
///     let _ = source.fetch_frame(12);
/// }));
/// ```
pub struct Workers {
    high: Arc<Injector<Job>>,
    low: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Take one job from an injector, retrying on contention
fn steal_from(injector: &Injector<Job>) -> Option<Job> {
    std::iter::repeat_with(|| injector.steal())
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
}

fn steal_peer(stealers: &[Stealer<Job>]) -> Option<Job> {
    stealers.iter().find_map(|s| {
        std::iter::repeat_with(|| s.steal())
            .find(|s| !s.is_retry())
            .and_then(Steal::success)
    })
}

impl Workers {
    /// Spawn `num_threads` workers (min 1).
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` to leave room for the render thread.
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let high: Arc<Injector<Job>> = Arc::new(Injector::new());
        let low: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(|w| w.stealer()).collect();
        let mut handles = Vec::with_capacity(num_threads);

        for (worker_id, local) in locals.into_iter().enumerate() {
            let high = Arc::clone(&high);
            let low = Arc::clone(&low);
            let stop = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("gridplay-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    loop {
                        let job = local
                            .pop()
                            .or_else(|| steal_from(&high))
                            .or_else(|| steal_from(&low))
                            .or_else(|| steal_peer(&stealers));

                        if let Some(job) = job {
                            job();
                            continue;
                        }

                        if stop.load(Ordering::Relaxed) {
                            break;
                        }

                        // No work - short sleep instead of spinning
                        thread::sleep(Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let already spawned workers exit
                    shutdown.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        trace!("Workers initialized: {} threads (two lanes)", num_threads);

        Ok(Self {
            high,
            low,
            handles,
            shutdown,
        })
    }

    /// Pool sized from config (0 = auto)
    pub fn with_auto_size(threads: usize) -> io::Result<Self> {
        let n = if threads == 0 { (num_cpus::get() * 3 / 4).max(1) } else { threads };
        Self::new(n)
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Jobs not yet picked up (both lanes)
    pub fn queued(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

impl WorkerPool for Workers {
    fn execute(&self, priority: Priority, job: Job) {
        match priority {
            Priority::High => self.high.push(job),
            Priority::Low => self.low.push(job),
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::Instant;

        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Jobs may be mid-fetch; do not wait forever on a slow source
        let deadline = Instant::now() + Duration::from_millis(500);

        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining workers");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_jobs_run_on_both_lanes() {
        let workers = Workers::new(2).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            let lane = if i % 2 == 0 { Priority::High } else { Priority::Low };
            workers.execute(lane, Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let mut got: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_auto_size_spawns_at_least_one() {
        let workers = Workers::with_auto_size(0).unwrap();
        assert!(workers.thread_count() >= 1);
        assert_eq!(Workers::new(0).unwrap().thread_count(), 1);
    }
}
