//! The execution engine: a fixed worker pool fanning statements out and
//! collecting results in submission order.

mod statement;

pub use statement::{BatchStatementExecutor, BatchUnit, PreparedUnit, StatementExecutor};

use crossbeam_channel::{unbounded, Sender};
use quilt_error::{ErrorCode, QuiltError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// What happens when one unit of a group fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionPolicy {
    /// The first failure (in submission order) fails the whole group.
    #[default]
    Propagate,
    /// Failures are logged and replaced by the caller's fallback value.
    Suppress,
}

/// Fixed-size worker pool. Groups of tasks run concurrently; results come
/// back indexed by submission order regardless of completion order.
pub struct ExecutorEngine {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    closed: AtomicBool,
}

impl ExecutorEngine {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("quilt-exec-{}", index))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .unwrap_or_else(|e| panic!("cannot spawn executor worker: {}", e)),
            );
        }
        debug!(size, "executor engine started");
        ExecutorEngine {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs `task` over every input, returning outputs in input order.
    ///
    /// A single input runs on the calling thread without touching the pool.
    /// Under [`ExceptionPolicy::Suppress`], a failed slot is replaced by
    /// `fallback()`.
    pub fn execute_group<I, O, F, G>(
        &self,
        inputs: Vec<I>,
        policy: ExceptionPolicy,
        task: F,
        fallback: G,
    ) -> Result<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
        G: Fn() -> O,
    {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_closed() {
            return Err(QuiltError::new(
                ErrorCode::EngineClosed,
                "Executor engine is closed",
            ));
        }
        if inputs.len() == 1 {
            let input = inputs.into_iter().next().unwrap_or_else(|| unreachable!());
            return collect(vec![Some(run_caught(&task, input))], policy, fallback);
        }

        let total = inputs.len();
        let task = Arc::new(task);
        let slots: Arc<Mutex<Vec<Option<Result<O>>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let done = Arc::new((Mutex::new(0usize), Condvar::new()));

        {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            let sender = sender.as_ref().ok_or_else(|| {
                QuiltError::new(ErrorCode::EngineClosed, "Executor engine is closed")
            })?;
            for (slot, input) in inputs.into_iter().enumerate() {
                let task = task.clone();
                let slots = slots.clone();
                let done = done.clone();
                sender
                    .send(Box::new(move || {
                        let output = run_caught(task.as_ref(), input);
                        if let Ok(mut slots) = slots.lock() {
                            slots[slot] = Some(output);
                        }
                        let (count, signal) = &*done;
                        if let Ok(mut count) = count.lock() {
                            *count += 1;
                            signal.notify_one();
                        }
                    }))
                    .map_err(|_| {
                        QuiltError::new(ErrorCode::EngineClosed, "Executor engine is closed")
                    })?;
            }
        }

        let (count, signal) = &*done;
        let mut finished = count.lock().unwrap_or_else(|e| e.into_inner());
        while *finished < total {
            finished = signal
                .wait(finished)
                .unwrap_or_else(|e| e.into_inner());
        }

        // Workers may still hold their clone of `slots` for a moment after
        // signalling, so take the results out under the lock instead of
        // unwrapping the Arc.
        let slots = {
            let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *slots)
        };
        collect(slots, policy, fallback)
    }

    /// Shuts the pool down and joins every worker. Idempotent; in-flight
    /// jobs finish first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            let _ = worker.join();
        }
        debug!("executor engine closed");
    }
}

impl Drop for ExecutorEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs one task with a panic boundary. A panic must still fill the slot and
/// bump the completion counter, or the fan-in wait would block forever.
fn run_caught<I, O, F>(task: &F, input: I) -> Result<O>
where
    F: Fn(I) -> Result<O>,
{
    catch_unwind(AssertUnwindSafe(|| task(input)))
        .unwrap_or_else(|_| Err(QuiltError::new(ErrorCode::Internal, "Executor task panicked")))
}

fn collect<O, G>(
    slots: Vec<Option<Result<O>>>,
    policy: ExceptionPolicy,
    fallback: G,
) -> Result<Vec<O>>
where
    G: Fn() -> O,
{
    let mut outputs = Vec::with_capacity(slots.len());
    for slot in slots {
        let result = slot
            .ok_or_else(|| QuiltError::new(ErrorCode::Internal, "Executor slot never filled"))?;
        match (result, policy) {
            (Ok(output), _) => outputs.push(output),
            (Err(err), ExceptionPolicy::Propagate) => return Err(err),
            (Err(err), ExceptionPolicy::Suppress) => {
                error!(error = %err, "suppressed execution failure");
                outputs.push(fallback());
            }
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_results_keep_submission_order() {
        let engine = ExecutorEngine::new(2);
        let outputs = engine
            .execute_group(
                vec![5u64, 4, 3, 2, 1],
                ExceptionPolicy::Propagate,
                |n| {
                    // Later inputs finish earlier.
                    std::thread::sleep(Duration::from_millis(n * 10));
                    Ok(n)
                },
                || 0,
            )
            .unwrap();
        assert_eq!(outputs, vec![5, 4, 3, 2, 1]);
        engine.close();
    }

    #[test]
    fn test_propagate_returns_first_error() {
        let engine = ExecutorEngine::new(2);
        let err = engine
            .execute_group(
                vec![1, 2, 3],
                ExceptionPolicy::Propagate,
                |n| {
                    if n == 2 {
                        Err(QuiltError::new(ErrorCode::TaskFailed, "boom"))
                    } else {
                        Ok(n)
                    }
                },
                || 0,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskFailed);
    }

    #[test]
    fn test_suppress_substitutes_fallback() {
        let engine = ExecutorEngine::new(2);
        let outputs = engine
            .execute_group(
                vec![1, 2, 3, 4, 5],
                ExceptionPolicy::Suppress,
                |n| {
                    if n == 3 {
                        Err(QuiltError::new(ErrorCode::TaskFailed, "boom"))
                    } else {
                        Ok(n * 10)
                    }
                },
                || 0,
            )
            .unwrap();
        assert_eq!(outputs, vec![10, 20, 0, 40, 50]);
        engine.close();
    }

    #[test]
    fn test_panicking_task_fails_instead_of_hanging() {
        let engine = ExecutorEngine::new(2);
        let err = engine
            .execute_group(
                vec![1, 2, 3],
                ExceptionPolicy::Propagate,
                |n| {
                    if n == 2 {
                        panic!("boom");
                    }
                    Ok(n)
                },
                || 0,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        engine.close();
    }

    #[test]
    fn test_panicking_task_suppressed_to_fallback() {
        let engine = ExecutorEngine::new(2);
        let outputs = engine
            .execute_group(
                vec![1, 2, 3],
                ExceptionPolicy::Suppress,
                |n| {
                    if n == 2 {
                        panic!("boom");
                    }
                    Ok(n * 10)
                },
                || 0,
            )
            .unwrap();
        assert_eq!(outputs, vec![10, 0, 30]);
        engine.close();
    }

    #[test]
    fn test_single_input_runs_inline() {
        let engine = ExecutorEngine::new(1);
        let caller = std::thread::current().id();
        let outputs = engine
            .execute_group(
                vec![()],
                ExceptionPolicy::Propagate,
                move |_| Ok(std::thread::current().id() == caller),
                || false,
            )
            .unwrap();
        assert_eq!(outputs, vec![true]);
    }

    #[test]
    fn test_closed_engine_rejects_work() {
        let engine = ExecutorEngine::new(1);
        engine.close();
        let err = engine
            .execute_group(vec![1, 2], ExceptionPolicy::Propagate, |n| Ok(n), || 0)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineClosed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = ExecutorEngine::new(2);
        engine.close();
        engine.close();
        assert!(engine.is_closed());
    }
}
