//! Supervision of background tasks.
//!
//! Every long-running task in the runtime (pool health checks, pipeline
//! loops, executor workers) is spawned through a [`TaskMonitor`]. The monitor
//! catches errors and panics so a dying task is always logged and counted,
//! hands out a shared shutdown signal, and on shutdown waits for tasks with a
//! grace period before aborting the stragglers.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VegaError};

/// Receiver side of the monitor's stop flag. Becomes `true` once.
pub type ShutdownSignal = watch::Receiver<bool>;

const RECENT_FAILURES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
    pub panicked: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub running: bool,
    pub active: usize,
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub aborted: u64,
    pub recent_failures: Vec<TaskFailure>,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    aborted: AtomicU64,
    recent: Mutex<VecDeque<TaskFailure>>,
}

impl Counters {
    async fn record_failure(&self, task: String, error: String, panicked: bool) {
        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_FAILURES {
            recent.pop_front();
        }
        recent.push_back(TaskFailure {
            task,
            error,
            panicked,
            at: Utc::now(),
        });
    }
}

struct Tracked {
    name: String,
    handle: JoinHandle<()>,
}

/// Supervisor for all background tasks of one runtime.
pub struct TaskMonitor {
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<Tracked>>,
    counters: Arc<Counters>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            running: AtomicBool::new(true),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A fresh receiver of the stop flag.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown_tx.subscribe()
    }

    /// Spawn `fut` under supervision.
    ///
    /// Errors and panics are caught, logged and counted. Fails with
    /// [`VegaError::Supervisor`] once the monitor is shutting down.
    pub async fn spawn<F>(&self, name: impl Into<String>, fut: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.is_running() {
            return Err(VegaError::Supervisor("task monitor is shut down".into()));
        }
        let name = name.into();
        let counters = self.counters.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!("[monitor] task '{task_name}' finished");
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("[monitor] task '{task_name}' failed: {e:#}");
                    counters.record_failure(task_name, format!("{e:#}"), false).await;
                }
                Err(panic) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    let msg = panic_message(panic.as_ref());
                    error!("[monitor] task '{task_name}' panicked: {msg}");
                    counters.record_failure(task_name, msg, true).await;
                }
            }
        });

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(Tracked { name, handle });
        Ok(())
    }

    /// Signal shutdown, wait up to `grace` for tasks to exit, then abort the
    /// rest. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if was_running {
            info!("[monitor] shutting down {} task(s)", tasks.len());
        }

        let deadline = Instant::now() + grace;
        for mut t in tasks {
            if tokio::time::timeout_at(deadline, &mut t.handle).await.is_err() {
                warn!("[monitor] task '{}' did not stop within {grace:?}, aborting", t.name);
                t.handle.abort();
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn stats(&self) -> MonitorStats {
        let active = self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count();
        let recent_failures = self.counters.recent.lock().await.iter().cloned().collect();
        MonitorStats {
            running: self.is_running(),
            active,
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            recent_failures,
        }
    }
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_failures_and_panics() {
        let monitor = TaskMonitor::new();
        monitor.spawn("ok", async { Ok(()) }).await.unwrap();
        monitor
            .spawn("err", async { anyhow::bail!("boom") })
            .await
            .unwrap();
        monitor
            .spawn("panic", async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .await
            .unwrap();

        for _ in 0..50 {
            let s = monitor.stats().await;
            if s.completed + s.failed + s.panicked == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let s = monitor.stats().await;
        assert_eq!(s.spawned, 3);
        assert_eq!(s.completed, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.panicked, 1);
        assert_eq!(s.recent_failures.len(), 2);
        assert!(s.recent_failures.iter().any(|f| f.panicked && f.error == "kaboom"));
    }

    #[tokio::test]
    async fn shutdown_signals_then_aborts_stragglers() {
        let monitor = TaskMonitor::new();
        let mut signal = monitor.shutdown_signal();
        monitor
            .spawn("cooperative", async move {
                let _ = signal.changed().await;
                Ok(())
            })
            .await
            .unwrap();
        monitor
            .spawn("stubborn", async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await
            .unwrap();

        monitor.shutdown(Duration::from_millis(50)).await;
        let s = monitor.stats().await;
        assert!(!s.running);
        assert_eq!(s.active, 0);
        assert_eq!(s.aborted, 1);

        assert!(matches!(
            monitor.spawn("late", async { Ok(()) }).await,
            Err(VegaError::Supervisor(_))
        ));
        // idempotent
        monitor.shutdown(Duration::from_millis(10)).await;
    }
}
