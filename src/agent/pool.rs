use std::{
    any::Any,
    fmt, io, mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    thread,
};

use tokio::{runtime::Handle, sync::mpsc};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of OS threads running request handlers and response completions.
///
/// Jobs are distributed round-robin. Every thread enters the agent's runtime, so jobs can spawn tasks. A panic
/// inside a job is logged and the thread keeps serving.
pub(crate) struct WorkerPool {
    senders: Mutex<Option<Vec<mpsc::UnboundedSender<Job>>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next_idx: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, size: usize, runtime: Handle) -> io::Result<Self> {
        let mut senders = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);
        for idx in 0..size {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let runtime = runtime.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-pool-{idx}"))
                .spawn(move || {
                    let _guard = runtime.enter();
                    while let Some(job) = rx.blocking_recv() {
                        run(job);
                    }
                    trace!("pool thread exiting");
                })?;
            senders.push(tx);
            threads.push(handle);
        }

        Ok(WorkerPool {
            senders: Mutex::new(Some(senders)),
            threads: Mutex::new(threads),
            next_idx: AtomicUsize::new(0),
        })
    }

    /// Queues a job on the next thread. Once the pool is drained the job runs inline.
    pub(crate) fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.senders().as_ref().and_then(|senders| {
            if senders.is_empty() {
                return None;
            }
            let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % senders.len();
            senders.get(idx).cloned()
        });

        let job: Job = Box::new(job);
        match sender {
            Some(sender) => {
                if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                    run(job);
                }
            }
            None => run(job),
        }
    }

    /// Stops accepting jobs and blocks until every queued and running job has finished.
    pub(crate) fn drain(&self) {
        drop(self.senders().take());

        let threads = mem::take(&mut *self.threads.lock().unwrap_or_else(|err| err.into_inner()));
        let current = thread::current().id();
        for handle in threads {
            // A job draining its own pool cannot wait for itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("pool thread panicked");
            }
        }
    }

    fn senders(&self) -> MutexGuard<'_, Option<Vec<mpsc::UnboundedSender<Job>>>> {
        self.senders.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.senders().as_ref().map(Vec::len);
        f.debug_struct("WorkerPool").field("size", &size).finish()
    }
}

fn run(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        error!("pool job panicked: {}", panic_message(&*panic));
    }
}

/// Renders a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
