//! Concurrency shims (component C10): a minimal submit/future abstraction
//! over a serial fallback and an OS thread pool.
//!
//! The reference implementation offers a serial executor, a thread-pool
//! executor, and a process-pool executor, the last one chosen on platforms
//! where CPU-bound codecs benefit from true parallelism unavailable to
//! threads. This crate has no GIL to work around, so there is no process
//! variant: `ThreadPoolExecutor` covers every case where the reference
//! implementation reached for multiprocessing. Only `submit`, `Future::result`,
//! and `Future::cancel` are exposed, matching the narrow surface the reader
//! and writer actually use.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

pub trait Future<T>: Send {
    fn result(self: Box<Self>) -> T;
    fn cancel(&self) {}
}

pub trait Executor<T: Send + 'static>: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() -> T + Send>) -> Box<dyn Future<T>>;
}

// ---------------------------------------------------------------------
// Serial executor: runs the job immediately on the calling thread.
// ---------------------------------------------------------------------

pub struct SerialExecutor;

struct SerialFuture<T>(T);
impl<T: Send> Future<T> for SerialFuture<T> {
    fn result(self: Box<Self>) -> T {
        self.0
    }
}

impl<T: Send + 'static> Executor<T> for SerialExecutor {
    fn submit(&self, job: Box<dyn FnOnce() -> T + Send>) -> Box<dyn Future<T>> {
        Box::new(SerialFuture(job()))
    }
}

// ---------------------------------------------------------------------
// Thread pool executor: a fixed number of worker threads pulling jobs off
// a shared channel.
// ---------------------------------------------------------------------

type BoxedJob = Box<dyn FnOnce() + Send>;

pub struct ThreadPoolExecutor {
    sender: mpsc::Sender<BoxedJob>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = mpsc::channel::<BoxedJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let receiver = Arc::clone(&receiver);
            workers.push(thread::spawn(move || loop {
                let job = {
                    let guard = receiver.lock().unwrap();
                    guard.recv()
                };
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }));
        }
        ThreadPoolExecutor {
            sender,
            _workers: workers,
        }
    }
}

struct ChannelFuture<T> {
    receiver: mpsc::Receiver<T>,
}
impl<T: Send> Future<T> for ChannelFuture<T> {
    fn result(self: Box<Self>) -> T {
        self.receiver.recv().expect("worker dropped result sender")
    }
}

impl<T: Send + 'static> Executor<T> for ThreadPoolExecutor {
    fn submit(&self, job: Box<dyn FnOnce() -> T + Send>) -> Box<dyn Future<T>> {
        let (tx, rx) = mpsc::channel();
        let wrapped: BoxedJob = Box::new(move || {
            let result = job();
            let _ = tx.send(result);
        });
        self.sender
            .send(wrapped)
            .expect("thread pool workers have all exited");
        Box::new(ChannelFuture { receiver: rx })
    }
}

/// Resolves the `parallelism` option (`0` = serial, `None`/"guess" = all
/// available cores, `Some(n)` = exactly `n`) into a concrete worker count
/// for [`ThreadPoolExecutor`], or `None` to mean "use [`SerialExecutor`]".
pub fn resolve_parallelism(parallelism: Option<usize>) -> Option<usize> {
    match parallelism {
        Some(0) => None,
        Some(n) => Some(n),
        None => Some(thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_runs_immediately() {
        let exec = SerialExecutor;
        let fut = Executor::<i32>::submit(&exec, Box::new(|| 42));
        assert_eq!(fut.result(), 42);
    }

    #[test]
    fn thread_pool_runs_jobs() {
        let exec = ThreadPoolExecutor::new(4);
        let futures: Vec<_> = (0..8)
            .map(|i| Executor::<i32>::submit(&exec, Box::new(move || i * i)))
            .collect();
        let results: Vec<i32> = futures.into_iter().map(|f| f.result()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn resolve_parallelism_zero_is_serial() {
        assert_eq!(resolve_parallelism(Some(0)), None);
        assert_eq!(resolve_parallelism(Some(5)), Some(5));
        assert!(resolve_parallelism(None).unwrap() >= 1);
    }
}
