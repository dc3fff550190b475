use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of logical item a queue row or delivery record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    Story,
    Article,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Story => "story",
            ItemType::Article => "article",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "story" => Some(ItemType::Story),
            "article" => Some(ItemType::Article),
            _ => None,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue row lifecycle.
///
/// `queued -> sent` and `queued -> skipped` are terminal. `queued -> error`
/// is terminal once the retry budget is exhausted; before that the row is
/// put back to `queued` with a backoff-delayed `scheduled_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Sent,
    Skipped,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Sent => "sent",
            QueueStatus::Skipped => "skipped",
            QueueStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueueStatus::Queued),
            "sent" => Some(QueueStatus::Sent),
            "skipped" => Some(QueueStatus::Skipped),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Queued)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revision kind recorded in the append-only edit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Edit,
    Append,
}

impl EditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditAction::Edit => "edit",
            EditAction::Append => "append",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "edit" => Some(EditAction::Edit),
            "append" => Some(EditAction::Append),
            _ => None,
        }
    }
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering mode a message was (or will be) formatted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Markdown,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Html => "html",
            ParseMode::Markdown => "markdown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "html" => Some(ParseMode::Html),
            "markdown" => Some(ParseMode::Markdown),
            _ => None,
        }
    }

    /// Wire name the channel API expects.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
            ParseMode::Markdown => "MarkdownV2",
        }
    }
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
