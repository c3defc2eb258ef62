//! Progress events emitted while a task runs.
//!
//! Events are plain values: once published they are immutable and any
//! number of observers may hold copies. Each serialises to one JSON record
//! with a `type` discriminator, which is all the transport layer needs to
//! frame them (one WebSocket message, or one NDJSON line).
//!
//! ```json
//! {"type":"page_completed","task_id":"…","page_number":2,"markup":"…",
//!  "current_page":2,"total_pages":3,"percentage":66.7,"timestamp":"…"}
//! ```

use crate::output::ResultStatus;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest markup excerpt carried by a `Progress` event.
pub const SNIPPET_CHARS: usize = 500;

/// One progress record for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Sent to each new subscriber before anything else.
    #[serde(rename = "connection")]
    Connected {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Progress {
        task_id: TaskId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_page: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_pages: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percentage: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        markup_snippet: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PageCompleted {
        task_id: TaskId,
        page_number: usize,
        markup: String,
        current_page: usize,
        total_pages: usize,
        percentage: f32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "task_completed")]
    Completed {
        task_id: TaskId,
        status: ResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        combined_document: Option<String>,
        total_pages: usize,
        duration_secs: f64,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        task_id: TaskId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn connected(task_id: TaskId) -> Self {
        Self::Connected {
            task_id,
            timestamp: Utc::now(),
        }
    }

    /// A free-form status line, with no page counters.
    pub fn message(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::Progress {
            task_id,
            message: message.into(),
            current_page: None,
            total_pages: None,
            percentage: None,
            markup_snippet: None,
            timestamp: Utc::now(),
        }
    }

    /// A status line tied to page `current` of `total`.
    pub fn page_progress(
        task_id: TaskId,
        message: impl Into<String>,
        current: usize,
        total: usize,
        done: usize,
        markup: Option<&str>,
    ) -> Self {
        Self::Progress {
            task_id,
            message: message.into(),
            current_page: Some(current),
            total_pages: Some(total),
            percentage: Some(percentage(done, total)),
            markup_snippet: markup.map(snippet),
            timestamp: Utc::now(),
        }
    }

    pub fn page_completed(
        task_id: TaskId,
        page_number: usize,
        markup: impl Into<String>,
        done: usize,
        total: usize,
    ) -> Self {
        Self::PageCompleted {
            task_id,
            page_number,
            markup: markup.into(),
            current_page: done,
            total_pages: total,
            percentage: percentage(done, total),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(
        task_id: TaskId,
        status: ResultStatus,
        combined_document: Option<String>,
        total_pages: usize,
        duration_secs: f64,
        errors: Vec<String>,
    ) -> Self {
        Self::Completed {
            task_id,
            status,
            combined_document,
            total_pages,
            duration_secs,
            errors,
            timestamp: Utc::now(),
        }
    }

    pub fn error(task_id: TaskId, message: impl Into<String>, code: Option<&str>) -> Self {
        Self::Error {
            task_id,
            message: message.into(),
            code: code.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Connected { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::PageCompleted { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Error { task_id, .. } => *task_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Connected { timestamp, .. }
            | Self::Progress { timestamp, .. }
            | Self::PageCompleted { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    pub(crate) fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        match self {
            Self::Connected { timestamp, .. }
            | Self::Progress { timestamp, .. }
            | Self::PageCompleted { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp = ts,
        }
    }

    /// `Completed` and `Error` end a task's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    /// Wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connection",
            Self::Progress { .. } => "progress",
            Self::PageCompleted { .. } => "page_completed",
            Self::Completed { .. } => "task_completed",
            Self::Error { .. } => "error",
        }
    }
}

/// `done` of `total` as a percentage. Reaches 100 only when `done == total`.
pub fn percentage(done: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }
    (done.min(total) as f32 * 100.0) / total as f32
}

fn snippet(markup: &str) -> String {
    match markup.char_indices().nth(SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}…", &markup[..idx]),
        None => markup.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_with_type_discriminator() {
        let id = TaskId::new();
        let ev = ProgressEvent::page_completed(id, 2, "<p>x</p>", 2, 3);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "page_completed");
        assert_eq!(json["page_number"], 2);
        assert_eq!(json["total_pages"], 3);

        let json = serde_json::to_value(ProgressEvent::connected(id)).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["task_id"], id.to_string());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let ev = ProgressEvent::message(TaskId::new(), "Extracting pages");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("current_page"));
        assert!(!json.contains("markup_snippet"));
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn percentage_hits_100_only_at_last_page() {
        assert_eq!(percentage(0, 3), 0.0);
        assert!(percentage(2, 3) < 100.0);
        assert_eq!(percentage(3, 3), 100.0);
        assert_eq!(percentage(5, 3), 100.0);
    }

    #[test]
    fn snippet_is_char_bounded() {
        let long = "é".repeat(SNIPPET_CHARS + 10);
        let ev = ProgressEvent::page_progress(TaskId::new(), "m", 1, 1, 0, Some(&long));
        let ProgressEvent::Progress { markup_snippet, .. } = ev else {
            panic!("expected progress");
        };
        let s = markup_snippet.unwrap();
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 1);
        assert!(s.ends_with('…'));
    }

    #[test]
    fn terminal_kinds() {
        let id = TaskId::new();
        assert!(ProgressEvent::error(id, "boom", Some("extraction_failed")).is_terminal());
        assert!(!ProgressEvent::message(id, "hi").is_terminal());
        assert_eq!(
            ProgressEvent::completed(id, ResultStatus::Success, None, 1, 0.5, vec![]).kind(),
            "task_completed"
        );
    }
}
