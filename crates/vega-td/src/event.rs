//! Task status transitions emitted by the executor.
//!
//! Consumers (API layer, persistence) subscribe to a [`TaskEventReceiver`]
//! and see every change of every task, starting with its creation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vega_core::types::{AccountId, OrderAck, OrderTask, TaskStatus};

/// One status change of an order task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub idempotency_key: String,
    pub account_id: AccountId,
    /// `None` when the task was just created.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result: Option<OrderAck>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(from: Option<TaskStatus>, task: &OrderTask) -> Self {
        Self {
            task_id: task.task_id,
            idempotency_key: task.idempotency_key.clone(),
            account_id: task.account_id.clone(),
            from,
            to: task.status,
            attempts: task.attempts,
            error: task.last_error.clone(),
            result: task.result.clone(),
            at: task.updated_at,
        }
    }
}

/// Sender half of the task event channel.
pub type TaskEventSender = tokio::sync::mpsc::UnboundedSender<TaskEvent>;

/// Receiver half of the task event channel.
pub type TaskEventReceiver = tokio::sync::mpsc::UnboundedReceiver<TaskEvent>;
