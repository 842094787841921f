//! Bounded-concurrency task runner with cooperative cancellation.
//!
//! All tasks are queued before any worker starts. Each worker checks the
//! cancellation token before taking the next task; a running task is only
//! interrupted if it observes the token itself. The first failing task
//! cancels the rest of the run and its error becomes the run's result.
//! Errors from tasks that were already in flight are logged and dropped, so
//! with more than one worker the reported error is whichever lost the race
//! to the result cell first.

use crate::core::error::TaskError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancellation signal with an optional deadline.
///
/// Clones observe the same flag. A child token trips when its parent does,
/// but cancelling the child leaves the parent untouched.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
            deadline: None,
        }
    }

    /// A token that also trips once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// Set or tighten the deadline.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        self
    }

    /// Derive a token that is cancelled with this one or on its own.
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self {
            flags,
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.iter().any(|f| f.load(Ordering::SeqCst))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ============================================================================
// Runner
// ============================================================================

/// One unit of work. Receives the run's token and returns its output.
pub type Task = Box<dyn FnOnce(&CancelToken) -> Result<String, TaskError> + Send>;

/// Outcome of one successfully completed task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: String,
    pub output: String,
    pub duration: Duration,
}

/// Executes queued tasks on a fixed number of worker threads.
pub struct Runner {
    concurrency: usize,
    tasks: Vec<(String, Task)>,
}

impl Runner {
    /// A runner with `concurrency` workers; zero is raised to one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            tasks: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, id: impl Into<String>, task: F)
    where
        F: FnOnce(&CancelToken) -> Result<String, TaskError> + Send + 'static,
    {
        self.tasks.push((id.into(), Box::new(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and wait for all workers to exit.
    ///
    /// Reports come back in submission order. If `cancel` trips before the
    /// queue drains, the result is `TaskError::Cancelled` with the number of
    /// tasks that never started.
    pub fn run(self, cancel: &CancelToken) -> Result<Vec<TaskReport>, TaskError> {
        let total = self.tasks.len();
        let workers = self.concurrency.min(total.max(1));
        debug!(tasks = total, workers, "starting runner");

        let queue: Mutex<VecDeque<(usize, String, Task)>> = Mutex::new(
            self.tasks
                .into_iter()
                .enumerate()
                .map(|(i, (id, task))| (i, id, task))
                .collect(),
        );
        let token = cancel.child();
        let first_error: Mutex<Option<TaskError>> = Mutex::new(None);
        let reports: Mutex<Vec<(usize, TaskReport)>> = Mutex::new(Vec::with_capacity(total));

        thread::scope(|scope| {
            for worker in 0..workers {
                let (queue, token, first_error, reports) = (&queue, &token, &first_error, &reports);
                scope.spawn(move || loop {
                    if token.is_cancelled() {
                        break;
                    }
                    let Some((index, id, task)) = lock(queue).pop_front() else {
                        break;
                    };
                    debug!(worker, task = %id, "task started");
                    let started = Instant::now();
                    match task(token) {
                        Ok(output) => {
                            let duration = started.elapsed();
                            debug!(worker, task = %id, ?duration, "task finished");
                            lock(reports).push((
                                index,
                                TaskReport {
                                    id,
                                    output,
                                    duration,
                                },
                            ));
                        }
                        Err(err) => {
                            let mut slot = lock(first_error);
                            if slot.is_none() {
                                warn!(worker, task = %id, error = %err, "task failed, cancelling run");
                                *slot = Some(err);
                                token.cancel();
                            } else {
                                debug!(worker, task = %id, error = %err, "discarding later task error");
                            }
                            break;
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        let pending = queue.into_inner().unwrap_or_else(PoisonError::into_inner).len();
        if pending > 0 {
            return Err(TaskError::Cancelled { pending });
        }
        let mut reports = reports.into_inner().unwrap_or_else(PoisonError::into_inner);
        reports.sort_by_key(|(index, _)| *index);
        Ok(reports.into_iter().map(|(_, r)| r).collect())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fail(unit: &str) -> TaskError {
        TaskError::Invalid {
            unit: unit.to_string(),
            message: "fail".to_string(),
        }
    }

    #[test]
    fn test_all_tasks_complete() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut runner = Runner::new(4);
        for i in 0..100 {
            let completed = Arc::clone(&completed);
            runner.add(format!("t{i}"), move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            });
        }
        let reports = runner.run(&CancelToken::new()).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 100);
        assert_eq!(reports.len(), 100);
        assert_eq!(reports[0].id, "t0");
        assert_eq!(reports[99].id, "t99");
    }

    #[test]
    fn test_fail_fast_single_worker() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut runner = Runner::new(1);
        for i in 1..=4 {
            let started = Arc::clone(&started);
            runner.add(format!("task{i}"), move |_| {
                started.lock().unwrap().push(i);
                if i == 3 {
                    Err(fail("task3"))
                } else {
                    Ok(format!("done {i}"))
                }
            });
        }
        let err = runner.run(&CancelToken::new()).unwrap_err();
        assert_eq!(err.unit(), Some("task3"));
        assert_eq!(*started.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_single_worker_preserves_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut runner = Runner::new(1);
        for name in ["c", "a", "b"] {
            let order = Arc::clone(&order);
            runner.add(name, move |_| {
                order.lock().unwrap().push(name);
                Ok(name.to_string())
            });
        }
        let reports = runner.run(&CancelToken::new()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
        let outputs: Vec<_> = reports.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut runner = Runner::new(2);
        for i in 0..8 {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            runner.add(format!("t{i}"), move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(String::new())
            });
        }
        runner.run(&CancelToken::new()).unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let mut runner = Runner::new(2);
        runner.add("a", |_| Ok(String::new()));
        runner.add("b", |_| Ok(String::new()));
        let err = runner.run(&token).unwrap_err();
        assert!(matches!(err, TaskError::Cancelled { pending: 2 }));
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let token = CancelToken::new().deadline(Instant::now());
        assert!(token.is_cancelled());
        let mut runner = Runner::new(1);
        runner.add("a", |_| Ok(String::new()));
        assert!(matches!(
            runner.run(&token),
            Err(TaskError::Cancelled { pending: 1 })
        ));
    }

    #[test]
    fn test_task_observes_cancellation() {
        let mut runner = Runner::new(2);
        runner.add("fails", |_| Err(fail("fails")));
        runner.add("waits", |token| {
            let until = Instant::now() + Duration::from_secs(5);
            while !token.is_cancelled() && Instant::now() < until {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(String::new())
        });
        let err = runner.run(&CancelToken::new()).unwrap_err();
        assert_eq!(err.unit(), Some("fails"));
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_empty_runner() {
        let runner = Runner::new(0);
        assert!(runner.is_empty());
        assert!(runner.run(&CancelToken::new()).unwrap().is_empty());
    }
}
