//! The bounded worker pool behind the accept loop.
//!
//! Sized to `min(4, cores)`, retaining zero idle threads at rest: a worker is
//! spawned when a job arrives and no idle worker takes it, lingers for a
//! keep-alive window, then exits. Hand-off is a rendezvous; there is no
//! queue. A job that finds the pool saturated is returned to the caller,
//! which for the server means closing the rejected socket on the spot instead
//! of letting connections pile up.

use crate::prelude::threading_types::*;
use crate::prelude::*;

/// Upper bound on pool capacity regardless of core count.
const MAX_WORKERS: usize = 4;
/// How long an idle worker waits for the next job before exiting.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// A unit of work; returned to the caller when the pool is saturated.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The pool capacity for this machine.
#[must_use]
pub fn pool_size() -> usize {
    cmp::min(MAX_WORKERS, num_cpus::get())
}

/// An on-demand worker pool with rendezvous hand-off.
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    sender: mpsc::SyncSender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Arc<AtomicUsize>,
    counter: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool of at most `capacity` workers; threads are named
    /// `<name>_io_worker_<n>`.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0);
        // Zero-capacity channel: a send only succeeds while a worker is
        // blocked in `recv`, which is exactly the rendezvous contract.
        let (sender, receiver) = mpsc::sync_channel(0);
        Self {
            name,
            capacity,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            workers: Arc::new(AtomicUsize::new(0)),
            counter: AtomicUsize::new(0),
        }
    }

    /// Submits `job` for immediate execution.
    ///
    /// # Errors
    ///
    /// Returns the job when the pool is saturated; nothing is queued.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Job> {
        let mut job: Job = Box::new(job);
        // First preference: hand to an already-idle worker.
        job = match self.sender.try_send(job) {
            Ok(()) => return Ok(()),
            Err(mpsc::TrySendError::Full(job) | mpsc::TrySendError::Disconnected(job)) => job,
        };
        // No idle worker; spawn one if the budget allows.
        if self
            .workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.capacity).then_some(count + 1)
            })
            .is_err()
        {
            return Err(job);
        }
        self.spawn_worker(job);
        Ok(())
    }

    fn spawn_worker(&self, initial: Job) {
        let receiver = Arc::clone(&self.receiver);
        let workers = Arc::clone(&self.workers);
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}_io_worker_{id}", self.name))
            .spawn(move || {
                run_job(initial);
                loop {
                    // Holding the lock while waiting keeps at most one worker
                    // in `recv`, which is enough for `try_send` to rendezvous.
                    let job = {
                        let receiver = match receiver.lock() {
                            Ok(receiver) => receiver,
                            Err(_) => break,
                        };
                        receiver.recv_timeout(KEEP_ALIVE)
                    };
                    match job {
                        Ok(job) => run_job(job),
                        // Idle past keep-alive, or the pool is gone.
                        Err(_) => break,
                    }
                }
                workers.fetch_sub(1, Ordering::AcqRel);
            });
        if spawned.is_err() {
            // Thread creation failed; undo the reservation. The job is lost
            // here, which for connection tasks means the socket closes.
            error!("failed to spawn {} worker", self.name);
            self.workers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Workers currently alive (serving or within keep-alive).
    #[must_use]
    pub fn active(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }
}

/// A panicking job must not take its worker (and a pool slot) with it.
fn run_job(job: Job) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
        error!("worker task panicked");
    }
}
impl Debug for WorkerPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new("test", 2);
        let (done, results) = channel();
        for value in 0..8 {
            let done = done.clone();
            // Saturation is possible with 8 rapid submissions and 2 workers;
            // retry like the dispatcher would not; just require that every
            // accepted job runs.
            let mut job = Box::new(move || done.send(value).unwrap()) as Job;
            loop {
                match pool.execute(job) {
                    Ok(()) => break,
                    Err(rejected) => {
                        job = rejected;
                        thread::yield_now();
                    }
                }
            }
        }
        drop(done);
        let mut received: Vec<i32> = results.iter().collect();
        received.sort_unstable();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn saturated_pool_rejects() {
        let pool = WorkerPool::new("test", 2);
        let (release, gate) = channel::<()>();
        let gate = Arc::new(Mutex::new(gate));
        let (started, started_rx) = channel();
        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            let started = started.clone();
            pool.execute(move || {
                started.send(()).unwrap();
                let _ = gate.lock().unwrap().recv();
            })
            .ok()
            .unwrap();
        }
        // Both workers are blocked inside jobs.
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pool.active(), 2);
        assert!(pool.execute(|| {}).is_err());
        drop(release);
    }

    #[test]
    fn capacity_is_bounded() {
        assert!(pool_size() >= 1);
        assert!(pool_size() <= 4);
    }
}
