//! Task data model shared by the gateway, the commit notifier and clients.
//!
//! A [`Task`] is a work item sitting in one of a fixed set of [`Column`]s.
//! Its `updated_at` timestamp doubles as a logical version: every consumer
//! resolves conflicts by last-writer-wins on that field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Raised when a column name is not one of the known workflow stages.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown column '{0}'")]
pub struct UnknownColumn(pub String);

/// Workflow stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Recurring,
    Backlog,
    InProgress,
    Review,
    Completed,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Recurring,
        Column::Backlog,
        Column::InProgress,
        Column::Review,
        Column::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Recurring => "recurring",
            Column::Backlog => "backlog",
            Column::InProgress => "in_progress",
            Column::Review => "review",
            Column::Completed => "completed",
        }
    }

    /// Lenient parse used at the mutation boundary: anything unknown lands in
    /// the backlog instead of being propagated.
    pub fn coerce(value: &str) -> Column {
        value.parse().unwrap_or(Column::Backlog)
    }
}

impl FromStr for Column {
    type Err = UnknownColumn;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Column::ALL
            .into_iter()
            .find(|column| column.as_str() == value)
            .ok_or_else(|| UnknownColumn(value.to_string()))
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A work item on the board.
///
/// This is the full representation carried by `created` and `updated`
/// events and returned by list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub column_id: Column,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,

    /// Free-form labels; order carries no meaning
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub is_recurring: bool,

    pub created_at: DateTime<Utc>,

    /// Logical version used for last-writer-wins
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a backlog task stamped with the given time.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            column_id: Column::Backlog,
            priority: Priority::default(),
            assignee_id: None,
            due_date: None,
            tags: BTreeSet::new(),
            metadata: Value::Null,
            is_recurring: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.column_id = column;
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee_id = Some(assignee.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
