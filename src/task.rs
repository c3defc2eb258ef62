//! Task identity and lifecycle state.
//!
//! A [`ConversionTask`] moves through a fixed, forward-only sequence of
//! [`TaskStatus`] values:
//!
//! ```text
//! Created → Extracting ─┬─▶ Failed
//!                       └─▶ ProcessingPages → Assembling → Completed
//! ```
//!
//! Every mutation goes through a method that checks the transition, so a
//! task can never regress, and `result` is populated exactly when the task
//! reaches `Completed`.

use crate::error::Pdf2HtmlError;
use crate::output::CombinedDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Extracting,
    ProcessingPages,
    Assembling,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether `next` is the one legal successor of `self`.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Extracting)
                | (Extracting, Failed)
                | (Extracting, ProcessingPages)
                | (ProcessingPages, Assembling)
                | (Assembling, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Extracting => "extracting",
            TaskStatus::ProcessingPages => "processing_pages",
            TaskStatus::Assembling => "assembling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One document conversion job.
#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub id: TaskId,
    status: TaskStatus,
    /// Human-readable handle to the input (path, URL or upload name).
    pub source: String,
    page_count: usize,
    completed_page_count: usize,
    errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<CombinedDocument>,
}

impl ConversionTask {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            status: TaskStatus::Created,
            source: source.into(),
            page_count: 0,
            completed_page_count: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn completed_page_count(&self) -> usize {
        self.completed_page_count
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn result(&self) -> Option<&CombinedDocument> {
        self.result.as_ref()
    }

    /// Move to the next stage. `Completed` is reachable only through
    /// [`ConversionTask::complete`] and `Failed` only through
    /// [`ConversionTask::fail`].
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), Pdf2HtmlError> {
        if next.is_terminal() || !self.status.can_advance_to(next) {
            return Err(self.invalid(next));
        }
        self.status = next;
        Ok(())
    }

    /// Enter `Completed` with the assembled document.
    pub fn complete(&mut self, document: CombinedDocument) -> Result<(), Pdf2HtmlError> {
        if !self.status.can_advance_to(TaskStatus::Completed) {
            return Err(self.invalid(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.result = Some(document);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Enter `Failed`, recording why.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), Pdf2HtmlError> {
        if !self.status.can_advance_to(TaskStatus::Failed) {
            return Err(self.invalid(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.errors.push(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fix the number of pages once extraction has counted them.
    pub fn set_page_count(&mut self, n: usize) {
        self.page_count = n;
        self.completed_page_count = self.completed_page_count.min(n);
    }

    /// Count one more processed page, saturating at `page_count`.
    pub fn record_page_done(&mut self) {
        if self.completed_page_count < self.page_count {
            self.completed_page_count += 1;
        }
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            status: self.status,
            source: self.source.clone(),
            page_count: self.page_count,
            completed_page_count: self.completed_page_count,
            errors: self.errors.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            result_available: self.result.is_some(),
        }
    }

    fn invalid(&self, to: TaskStatus) -> Pdf2HtmlError {
        Pdf2HtmlError::InvalidTransition {
            task_id: self.id,
            from: self.status,
            to,
        }
    }
}

/// Point-in-time view of a task, as returned by status polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub source: String,
    pub page_count: usize,
    pub completed_page_count: usize,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_available: bool,
}
