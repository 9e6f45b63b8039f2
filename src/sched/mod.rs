//! The task scheduler interface consumed by the resource manager, plus a
//! small work-stealing thread pool as the default implementation.
//!
//! The resource manager never owns threads itself; it hands load and
//! finalize jobs to whatever implements [`TaskScheduler`]. Cancellation is
//! cooperative: the manager flags shutdown and its jobs drain out on their
//! own, so the trait needs no `cancel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};

/// A unit of work handed to the scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The scheduling interface consumed by the resource manager.
pub trait TaskScheduler: Send + Sync {
    /// Runs `job` asynchronously.
    fn spawn(&self, job: Job);

    /// Blocks the current thread until `probe` returns true, helping with
    /// pending jobs where possible instead of going idle.
    fn wait_for_condition(&self, probe: &(dyn Fn() -> bool + Sync));
}

/// A fixed pool of worker threads fed from a shared injector queue.
pub struct ThreadPool {
    inner: Arc<Inner>,
    threads: Vec<thread::JoinHandle<()>>,
}

struct Inner {
    injector: Injector<Job>,
    terminating: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl ThreadPool {
    /// Creates a pool with `num` worker threads.
    pub fn new(num: usize) -> Self {
        let inner = Arc::new(Inner {
            injector: Injector::new(),
            terminating: AtomicBool::new(false),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        });

        let threads = (0..num.max(1))
            .map(|i| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("quarry-worker-{}", i))
                    .spawn(move || inner.run())
                    .expect("failed to spawn worker thread")
            })
            .collect();

        ThreadPool { inner, threads }
    }

    /// Signals termination and blocks until all workers finished their
    /// current job.
    pub fn terminate(&mut self) {
        self.inner.terminating.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl Inner {
    fn run(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(job) => job(),
                Steal::Retry => {}
                Steal::Empty => {
                    if self.terminating.load(Ordering::SeqCst) {
                        return;
                    }

                    let guard = self.lock.lock().unwrap();
                    if self.injector.is_empty() && !self.terminating.load(Ordering::SeqCst) {
                        let _ = self
                            .condvar
                            .wait_timeout(guard, Duration::from_millis(50))
                            .unwrap();
                    }
                }
            }
        }
    }

    fn try_run_one(&self) -> bool {
        loop {
            match self.injector.steal() {
                Steal::Success(job) => {
                    job();
                    return true;
                }
                Steal::Retry => {}
                Steal::Empty => return false,
            }
        }
    }
}

impl TaskScheduler for ThreadPool {
    fn spawn(&self, job: Job) {
        self.inner.injector.push(job);
        self.inner.condvar.notify_one();
    }

    fn wait_for_condition(&self, probe: &(dyn Fn() -> bool + Sync)) {
        while !probe() {
            // keep busy with queued jobs instead of going idle
            if !self.inner.try_run_one() {
                thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_jobs() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();
            pool.spawn(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.wait_for_condition(&|| counter.load(Ordering::SeqCst) == 64);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn terminates_cleanly() {
        let mut pool = ThreadPool::new(4);
        pool.spawn(Box::new(|| {}));
        pool.terminate();
    }
}
