//! Queue for verifications that have to be performed in parallel.
//!
//! One thread (the master) pushes batches of verifiers onto the queue, where
//! they are processed by N worker threads. When the master is done adding
//! work, it temporarily joins the worker pool as an N+1'th worker until all
//! jobs are done. The result of a round is the AND over all verifier results,
//! with a fast exit as soon as any verifier reports failure.
//!
//! Workers claim verifiers lock-free with a CAS on the `bot` counter; the
//! mutex/condvar pair exists only to park idle workers between rounds.

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const LOG_TARGET: &str = "checkqueue";

/// High bit of `top`: set once the last verifier of the round has been added.
/// Also doubles as the "no round in progress" marker when `top == SEALED`.
const SEALED: u32 = 1 << 31;

/// A short boolean verification, typically one script/signature check.
///
/// Verifiers are moved into the round's storage and evaluated at most once;
/// they are never copied during scheduling.
pub trait Verifier: Send {
    fn check(&mut self) -> bool;
}

impl<F: FnMut() -> bool + Send> Verifier for F {
    fn check(&mut self) -> bool {
        self()
    }
}

/// State shared between the queue handle and its worker threads.
struct QueueState<T> {
    /// Guards `quit`; workers block on `cond_worker` when out of work.
    sleep: Mutex<bool>,
    cond_worker: Condvar,

    /// The temporary evaluation result, cleared on the first failing verifier.
    all_ok: AtomicBool,

    /// Number of worker threads that aren't in stand-by. When a thread is
    /// awake it may have a job that will return false, but is yet to report
    /// the result through `all_ok`.
    awake: AtomicU32,

    /// Contiguous verifier storage for the current round, owned by the
    /// active [`CheckQueueControl`]. Written under `sleep` in `setup`.
    checks: AtomicPtr<T>,

    /// Next index to claim. Forced to `u32::MAX` on fast exit so no further
    /// worker claims; padded against `top` to eliminate false sharing.
    bot: CachePadded<AtomicU32>,

    /// One past the last submitted index, with [`SEALED`] in the high bit.
    top: CachePadded<AtomicU32>,
}

impl<T: Verifier> QueueState<T> {
    /// Does the bulk of the verification work; `master` parametrises the
    /// empty phase (seal-and-join versus sleep).
    fn worker_loop(&self, master: bool) -> bool {
        if !master {
            self.awake.fetch_add(1, Ordering::SeqCst);
        }
        let mut top_cache = if master {
            self.top.load(Ordering::Relaxed) & !SEALED
        } else {
            0
        };
        let mut final_check_added = master;
        loop {
            let mut bottom = self.bot.load(Ordering::Relaxed);
            // Claim index `bottom` by incrementing `bot`, as long as our view
            // of `top` says there is work. compare_exchange_weak refreshes
            // `bottom` on failure.
            while top_cache > bottom {
                match self.bot.compare_exchange_weak(
                    bottom,
                    bottom + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => bottom = current,
                }
            }
            if top_cache > bottom {
                let checks = self.checks.load(Ordering::Relaxed);
                // SAFETY: the CAS above claimed index `bottom` exclusively
                // for this thread, `bottom < top` implies the slot has been
                // published by the Control, and the Control keeps the storage
                // alive until the master has joined the round.
                let ok = unsafe { (*checks.add(bottom as usize)).check() };
                if !ok {
                    // Fast exit: stop all further claims. This is a
                    // heuristic; the sealed flag plus `awake == 0` is the
                    // actual join barrier.
                    self.bot.store(u32::MAX, Ordering::Relaxed);
                    self.all_ok.store(false, Ordering::Relaxed);
                }
                continue;
            }
            if master {
                self.top.store(SEALED, Ordering::Relaxed);
                // All jobs are taken; busy spin until no worker is awake.
                // Their Release decrement of `awake` publishes any `all_ok`
                // clear before we read it.
                while self.awake.load(Ordering::Acquire) != 0 {
                    std::hint::spin_loop();
                }
                return self.all_ok.swap(true, Ordering::Release);
            }
            if !final_check_added {
                let top = self.top.load(Ordering::Acquire);
                final_check_added = top & SEALED != 0;
                top_cache = top & !SEALED;
                // First observation of the seal: one more pass to drain any
                // work published together with it.
                if final_check_added {
                    continue;
                }
            }
            if final_check_added {
                // Release all writes to `all_ok` before sleeping.
                self.awake.fetch_sub(1, Ordering::Release);
                {
                    let mut quit = self.sleep.lock();
                    while !*quit && self.top.load(Ordering::Relaxed) == SEALED {
                        self.cond_worker.wait(&mut quit);
                    }
                    if *quit {
                        return false;
                    }
                }
                self.awake.fetch_add(1, Ordering::Release);
                let top = self.top.load(Ordering::Acquire);
                final_check_added = top & SEALED != 0;
                top_cache = top & !SEALED;
                continue;
            }
        }
    }
}

/// Queue for verifications that have to be performed.
///
/// Use through a [`CheckQueueControl`]: one control handle per round, which
/// owns the verifier storage and joins the pool on [`CheckQueueControl::wait`].
pub struct CheckQueue<T: Verifier> {
    state: Arc<QueueState<T>>,
    threads: Vec<JoinHandle<()>>,
    /// Ensures only one concurrent [`CheckQueueControl`].
    control_mutex: Mutex<()>,
}

impl<T: Verifier + 'static> CheckQueue<T> {
    /// Spawn one additional worker thread.
    pub fn spawn_worker(&mut self) -> io::Result<()> {
        let state = Arc::clone(&self.state);
        let handle = std::thread::Builder::new()
            .name(format!("checkqueue.{}", self.threads.len()))
            .spawn(move || {
                state.worker_loop(false);
            })?;
        self.threads.push(handle);
        Ok(())
    }
}

impl<T: Verifier> CheckQueue<T> {
    /// Create a new check queue with no worker threads.
    pub fn new() -> Self {
        Self {
            state: Arc::new(QueueState {
                sleep: Mutex::new(false),
                cond_worker: Condvar::new(),
                all_ok: AtomicBool::new(true),
                awake: AtomicU32::new(0),
                checks: AtomicPtr::new(std::ptr::null_mut()),
                bot: CachePadded::new(AtomicU32::new(0)),
                top: CachePadded::new(AtomicU32::new(SEALED)),
            }),
            threads: Vec::new(),
            control_mutex: Mutex::new(()),
        }
    }

    /// Number of spawned worker threads.
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Point the queue at a fresh round's storage and restart the counters.
    fn setup(&self, checks: *mut T) {
        {
            let _quit = self.state.sleep.lock();
            self.state.checks.store(checks, Ordering::Relaxed);
            self.state.top.store(0, Ordering::Relaxed);
            self.state.bot.store(0, Ordering::Relaxed);
        }
        self.state.cond_worker.notify_all();
    }

    /// Publish that `count` further verifiers are now present.
    fn add(&self, count: usize) {
        self.state.top.fetch_add(count as u32, Ordering::Release);
    }

    /// Signal that no more verifiers will be added this round.
    fn done_adding(&self) {
        self.state.top.fetch_or(SEALED, Ordering::Relaxed);
    }

    /// Join as the final worker; returns whether every verifier succeeded.
    fn wait(&self) -> bool {
        self.done_adding();
        self.state.worker_loop(true)
    }

    /// Instruct all workers to exit once the current round (if any) drains.
    pub fn interrupt(&self) {
        {
            while self.state.awake.load(Ordering::SeqCst) != 0 {
                std::hint::spin_loop();
            }
            let _control = self.control_mutex.lock();
            let mut quit = self.state.sleep.lock();
            *quit = true;
            self.state.top.store(SEALED, Ordering::SeqCst);
        }
        self.state.cond_worker.notify_all();
        tracing::debug!(target: LOG_TARGET, "Check queue interrupted");
    }

    /// Join all worker threads.
    pub fn stop(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Verifier> Default for CheckQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Verifier> Drop for CheckQueue<T> {
    fn drop(&mut self) {
        self.interrupt();
        self.stop();
    }
}

/// RAII controller for one verification round. Guarantees the queue is
/// finished with the round's verifiers before the storage is released.
pub struct CheckQueueControl<'a, T: Verifier> {
    queue: &'a CheckQueue<T>,
    /// Round storage. Reserved once at construction; never reallocates, so
    /// worker-held pointers into it stay valid.
    checks: Vec<T>,
    done: bool,
    _control: MutexGuard<'a, ()>,
}

impl<'a, T: Verifier> CheckQueueControl<'a, T> {
    /// Start a round sized for at most `size` verifiers.
    pub fn new(queue: &'a CheckQueue<T>, size: usize) -> Self {
        let guard = queue.control_mutex.lock();
        let mut checks = Vec::with_capacity(size);
        queue.setup(checks.as_mut_ptr());
        Self {
            queue,
            checks,
            done: false,
            _control: guard,
        }
    }

    /// Construct a verifier in place on the round's storage. Verifiers added
    /// this way are not executed until a subsequent [`Self::flush`].
    pub fn add(&mut self, check: T) {
        assert!(
            self.checks.len() < self.checks.capacity(),
            "check queue round storage exhausted"
        );
        self.checks.push(check);
    }

    /// Inform the workers of the last `count` added verifiers.
    pub fn flush(&self, count: usize) {
        self.queue.add(count);
    }

    /// Wait until execution finishes; returns whether all verifiers succeeded.
    pub fn wait(&mut self) -> bool {
        let result = self.queue.wait();
        self.done = true;
        result
    }
}

impl<T: Verifier> Drop for CheckQueueControl<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.wait();
        }
    }
}
