//! Execution isolator — worker pool with forced-termination deadlines
//!
//! A cooperative timeout cannot interrupt arbitrary unresponsive code;
//! real enforcement needs a separately schedulable unit the supervisor
//! can unconditionally abandon. The isolator keeps a pool of worker
//! threads: each invocation checks out a unit, submits the body, and
//! blocks on the unit's result channel — the sole suspension point.
//!
//! - **Completion**: the produced value or error passes upward unchanged
//!   and the unit returns to the pool.
//! - **Deadline expiry**: the unit is forcibly recycled — its tracer
//!   scope is revoked so the body can make no further observable
//!   progress, the result channel is dropped so any late value is
//!   discarded, and the thread is abandoned, never reused.
//! - **Abnormal termination**: a panic in the body is caught and
//!   propagated as the function's own error, bypassing return checks.
//!
//! No deadline means no timer, but isolation is identical for
//! uniformity.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, Violation};
use crate::tracer::Tracer;
use crate::value::Value;

/// A guarded body, arguments already bound, ready to run on a worker
pub type BodyJob = Box<dyn FnOnce() -> Result<Value> + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One cancellable execution unit: a thread draining a job channel.
/// Dropping the sender (abandonment) ends the thread after its current
/// job returns.
struct Worker {
    jobs: mpsc::Sender<Job>,
}

fn spawn_worker() -> Result<Worker> {
    let (jobs, intake) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name("warden-worker".to_string())
        .spawn(move || {
            while let Ok(job) = intake.recv() {
                job();
            }
        })
        .map_err(|e| Violation::Body {
            message: format!("failed to spawn worker: {}", e),
        })?;
    debug!("worker spawned");
    Ok(Worker { jobs })
}

/// Supervising pool of cancellable workers
pub struct Isolator {
    idle: Mutex<Vec<Worker>>,
}

impl Isolator {
    pub fn new() -> Self {
        Isolator {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Run a body on an isolated worker, waiting for whichever of
    /// (completion, deadline expiry) occurs first.
    pub fn run(
        &self,
        tracer: &Arc<Tracer>,
        deadline: Option<Duration>,
        body: BodyJob,
    ) -> Result<Value> {
        let worker = self.checkout()?;

        let (result_tx, result_rx) = mpsc::channel::<Result<Value>>();
        let task: Job = Box::new(move || {
            let produced = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
                Err(Violation::Body {
                    message: panic_message(payload.as_ref()),
                })
            });
            // send fails only when the supervisor already gave up;
            // the late result is discarded
            let _ = result_tx.send(produced);
        });
        if worker.jobs.send(task).is_err() {
            return Err(Violation::Body {
                message: "worker unavailable".to_string(),
            });
        }

        let received = match deadline {
            Some(limit) => result_rx.recv_timeout(limit),
            None => result_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(produced) => {
                self.checkin(worker);
                produced
            }
            Err(RecvTimeoutError::Timeout) => {
                let limit_seconds = deadline.map(|d| d.as_secs_f64()).unwrap_or_default();
                let violation = Violation::Timeout {
                    function: tracer.function().to_string(),
                    limit_seconds,
                };
                // revoke before abandoning: the stuck body can make no
                // further observable progress through its scope
                tracer.revoke(violation.clone());
                warn!(
                    function = %tracer.function(),
                    limit_seconds,
                    "deadline expired, worker forcibly recycled"
                );
                Err(violation)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Violation::Body {
                message: "worker terminated abnormally".to_string(),
            }),
        }
    }

    /// Idle units currently in the pool
    pub fn idle_workers(&self) -> usize {
        lock(&self.idle).len()
    }

    fn checkout(&self) -> Result<Worker> {
        match lock(&self.idle).pop() {
            Some(worker) => Ok(worker),
            None => spawn_worker(),
        }
    }

    fn checkin(&self, worker: Worker) {
        lock(&self.idle).push(worker);
    }
}

impl Default for Isolator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("body panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("body panicked: {}", message)
    } else {
        "body panicked".to_string()
    }
}
