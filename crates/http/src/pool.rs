//! Fixed-size worker pool running request handlers.
//!
//! Tasks go through an unbounded FIFO guarded by a mutex and a condition variable.
//! The pool can grow but never shrinks, so no worker is ever asked to stop while it may
//! be in the middle of a request. Shutdown enqueues one sentinel per worker.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Quit,
}

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
    busy: AtomicUsize,
    quitting: AtomicBool,
    exit_on_fatal: bool,
}

pub struct WorkerPool {
    name: String,
    queue: Arc<Queue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl WorkerPool {
    /// Starts `threads` workers named `{name}-{n}`.
    ///
    /// With `exit_on_fatal`, a panicking task terminates the process instead of being
    /// logged and skipped.
    pub fn new(name: impl Into<String>, threads: usize, exit_on_fatal: bool) -> io::Result<Self> {
        let pool = Self {
            name: name.into(),
            queue: Arc::new(Queue {
                jobs: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                busy: AtomicUsize::new(0),
                quitting: AtomicBool::new(false),
                exit_on_fatal,
            }),
            workers: Mutex::new(Vec::with_capacity(threads)),
        };
        pool.grow(threads)?;
        Ok(pool)
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queue.quitting.load(Ordering::Acquire) {
            warn!(pool = %self.name, "task submitted after quit, it will never run");
        }
        self.queue.jobs.lock().push_back(Job::Run(Box::new(task)));
        self.queue.available.notify_one();
    }

    /// Grows the pool to `threads` workers. Smaller values are ignored.
    pub fn grow(&self, threads: usize) -> io::Result<()> {
        let mut workers = self.workers.lock();
        while workers.len() < threads {
            let queue = Arc::clone(&self.queue);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, workers.len()))
                .spawn(move || worker_loop(&queue))?;
            workers.push(handle);
        }
        debug!(pool = %self.name, threads = workers.len(), "worker pool sized");
        Ok(())
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Tasks waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    /// Tasks currently running.
    pub fn busy(&self) -> usize {
        self.queue.busy.load(Ordering::Acquire)
    }

    /// Stops every worker once the tasks queued before this call ran.
    ///
    /// Returns `false` when some workers were still running at the deadline. Those are
    /// detached and will exit after their current task.
    pub fn quit(&self, timeout: Duration) -> bool {
        self.queue.quitting.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        {
            let mut jobs = self.queue.jobs.lock();
            jobs.extend(workers.iter().map(|_| Job::Quit));
        }
        self.queue.available.notify_all();

        let deadline = Instant::now() + timeout;
        let mut stragglers = 0;
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(pool = %self.name, "worker thread panicked");
                }
            } else {
                stragglers += 1;
            }
        }

        if stragglers > 0 {
            warn!(pool = %self.name, stragglers, "workers still busy at quit deadline, detaching them");
            return false;
        }
        info!(pool = %self.name, "worker pool stopped");
        true
    }
}

fn worker_loop(queue: &Queue) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                queue.available.wait(&mut jobs);
            }
        };

        let task = match job {
            Job::Run(task) => task,
            Job::Quit => return,
        };

        queue.busy.fetch_add(1, Ordering::AcqRel);
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        queue.busy.fetch_sub(1, Ordering::AcqRel);

        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "task panicked");
            if queue.exit_on_fatal {
                error!("exiting on fatal task failure");
                std::process::exit(70);
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_tasks_in_order() {
        let pool = WorkerPool::new("test", 1, false).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap());
        }
        let received: Vec<_> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(pool.quit(Duration::from_secs(5)));
    }

    #[test]
    fn survives_panicking_task() {
        let pool = WorkerPool::new("panicky", 1, false).unwrap();
        pool.submit(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send("still alive").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
        assert!(pool.quit(Duration::from_secs(5)));
    }

    #[test]
    fn grows_but_never_shrinks() {
        let pool = WorkerPool::new("grow", 2, false).unwrap();
        pool.grow(1).unwrap();
        assert_eq!(pool.threads(), 2);
        pool.grow(4).unwrap();
        assert_eq!(pool.threads(), 4);
        assert!(pool.quit(Duration::from_secs(5)));
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn quit_reports_stuck_workers() {
        let pool = WorkerPool::new("stuck", 1, false).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.busy(), 1);

        assert!(!pool.quit(Duration::from_millis(50)));
        release_tx.send(()).unwrap();
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42), "non-string panic payload");
    }
}
