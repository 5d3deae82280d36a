//! Bounded in-memory task store with an idempotency index.
//!
//! The store has no lock of its own: the executor keeps it behind a single
//! mutex so that the idempotency lookup and the insert are one critical
//! section. Pending tasks are claimed FIFO; retrying tasks are claimed by due
//! time and take precedence once due.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vega_core::types::{AccountId, OrderAck, OrderOperation, OrderParams, OrderTask, TaskStatus};
use vega_core::{Result, VegaError};

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub task_id: Uuid,
    /// `false` when the key matched an existing task.
    pub created: bool,
}

/// How an attempt ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(OrderAck),
    Retry { error: String, at: DateTime<Utc> },
    Failed(String),
    DeadLetter(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub live: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub idempotency_keys: usize,
}

struct KeyEntry {
    task_id: Uuid,
    created_at: DateTime<Utc>,
}

pub struct TaskStore {
    tasks: HashMap<Uuid, OrderTask>,
    by_key: HashMap<String, KeyEntry>,
    ready: VecDeque<Uuid>,
    delayed: BTreeSet<(DateTime<Utc>, Uuid)>,
    max_tasks: usize,
    retention: chrono::Duration,
    idempotency_window: chrono::Duration,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl TaskStore {
    pub fn new(max_tasks: usize, retention: Duration, idempotency_window: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            by_key: HashMap::new(),
            ready: VecDeque::new(),
            delayed: BTreeSet::new(),
            max_tasks: max_tasks.max(1),
            retention: to_chrono(retention),
            idempotency_window: to_chrono(idempotency_window),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: &Uuid) -> Option<&OrderTask> {
        self.tasks.get(task_id)
    }

    /// Return the task already registered under `key`, or create one.
    ///
    /// A full store is cleaned synchronously first; if that frees nothing the
    /// call fails with [`VegaError::Capacity`].
    pub fn insert(
        &mut self,
        key: &str,
        operation: OrderOperation,
        params: OrderParams,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Admitted> {
        if let Some(entry) = self.by_key.get(key) {
            if now - entry.created_at < self.idempotency_window
                && self.tasks.contains_key(&entry.task_id)
            {
                return Ok(Admitted {
                    task_id: entry.task_id,
                    created: false,
                });
            }
            self.by_key.remove(key);
        }

        if self.tasks.len() >= self.max_tasks {
            self.cleanup(now);
            if self.tasks.len() >= self.max_tasks {
                return Err(VegaError::Capacity(format!(
                    "task store full ({} live tasks)",
                    self.tasks.len()
                )));
            }
        }

        let task = OrderTask::new(key.to_string(), operation, params, account_id, now);
        let task_id = task.task_id;
        self.by_key.insert(
            key.to_string(),
            KeyEntry {
                task_id,
                created_at: now,
            },
        );
        self.tasks.insert(task_id, task);
        self.ready.push_back(task_id);
        Ok(Admitted {
            task_id,
            created: true,
        })
    }

    /// Mark the next runnable task `RUNNING` and count the attempt. Returns
    /// the status it was claimed from.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Option<(TaskStatus, OrderTask)> {
        let due = self.delayed.first().filter(|(at, _)| *at <= now).copied();
        let task_id = match due {
            Some(entry) => {
                self.delayed.remove(&entry);
                entry.1
            }
            None => self.ready.pop_front()?,
        };
        let task = self.tasks.get_mut(&task_id)?;
        let from = task.status;
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.next_attempt_at = None;
        task.updated_at = now;
        Some((from, task.clone()))
    }

    /// Tasks currently claimed by a worker.
    pub fn running_ids(&self) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.task_id)
            .collect()
    }

    /// Earliest instant a claimable task exists: now if anything is pending.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.ready.is_empty() {
            return Some(now);
        }
        self.delayed.first().map(|(at, _)| *at)
    }

    /// Record the end of an attempt. Returns the previous status and the
    /// updated task.
    pub fn finish(
        &mut self,
        task_id: &Uuid,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<(TaskStatus, OrderTask)> {
        let task = self.tasks.get_mut(task_id)?;
        let from = task.status;
        task.updated_at = now;
        match outcome {
            Outcome::Completed(ack) => {
                task.status = TaskStatus::Completed;
                task.result = Some(ack);
                task.last_error = None;
            }
            Outcome::Retry { error, at } => {
                task.status = TaskStatus::Retrying;
                task.last_error = Some(error);
                task.next_attempt_at = Some(at);
                self.delayed.insert((at, *task_id));
            }
            Outcome::Failed(error) => {
                task.status = TaskStatus::Failed;
                task.last_error = Some(error);
            }
            Outcome::DeadLetter(error) => {
                task.status = TaskStatus::DeadLetter;
                task.last_error = Some(error);
            }
        }
        Some((from, task.clone()))
    }

    /// Drop terminal tasks older than the retention window together with
    /// their idempotency entries, and expire keys past their window.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        let retention = self.retention;
        self.tasks
            .retain(|_, t| !(t.status.is_terminal() && now - t.updated_at >= retention));
        let window = self.idempotency_window;
        let tasks = &self.tasks;
        self.by_key.retain(|_, e| {
            tasks.contains_key(&e.task_id) && now - e.created_at < window
        });
        before - self.tasks.len()
    }

    pub fn dead_letters(&self) -> Vec<OrderTask> {
        let mut out: Vec<OrderTask> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::DeadLetter)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.updated_at);
        out
    }

    pub fn counts(&self) -> StoreCounts {
        let mut c = StoreCounts {
            live: self.tasks.len(),
            idempotency_keys: self.by_key.len(),
            ..Default::default()
        };
        for t in self.tasks.values() {
            match t.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Retrying => c.retrying += 1,
                TaskStatus::Completed => c.completed += 1,
                TaskStatus::Failed => c.failed += 1,
                TaskStatus::DeadLetter => c.dead_letter += 1,
            }
        }
        c
    }
}
