//! Push event envelope exchanged with connected clients.
//!
//! Frames are `{type, timestamp, data}` with snake_case type tags, the
//! same shape the browser client consumes. Keepalive ping/pong frames
//! carry no data.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BookGenerationUpdate,
    Notification,
    Ping,
    Pong,
}

/// Job status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Processing,
    Completed,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Processing => "processing",
            UpdateStatus::Completed => "completed",
            UpdateStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(UpdateStatus::Processing),
            "completed" => Some(UpdateStatus::Completed),
            "failed" => Some(UpdateStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStatus::Completed | UpdateStatus::Failed)
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress payload for `book_generation_update` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationUpdate {
    pub book_id: i64,
    pub task_id: String,
    pub status: UpdateStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Payload for general `notification` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub level: NoticeLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Generation(GenerationUpdate),
    Notice(Notice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Fractional epoch seconds.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl PushEvent {
    pub fn generation(update: GenerationUpdate) -> Self {
        Self {
            kind: EventKind::BookGenerationUpdate,
            timestamp: now_ts(),
            data: Some(EventData::Generation(update)),
        }
    }

    pub fn notification(notice: Notice) -> Self {
        Self {
            kind: EventKind::Notification,
            timestamp: now_ts(),
            data: Some(EventData::Notice(notice)),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: EventKind::Ping,
            timestamp: now_ts(),
            data: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: EventKind::Pong,
            timestamp: now_ts(),
            data: None,
        }
    }

    pub fn generation_update(&self) -> Option<&GenerationUpdate> {
        match &self.data {
            Some(EventData::Generation(update)) => Some(update),
            _ => None,
        }
    }
}

impl Notice {
    pub fn new(title: &str, message: &str, level: NoticeLevel, action_url: Option<String>) -> Self {
        Self {
            id: format!("notif_{}", Utc::now().timestamp_micros()),
            title: title.to_string(),
            message: message.to_string(),
            level,
            action_url,
        }
    }
}
