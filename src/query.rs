//! Cache keys for task list queries.
//!
//! A list query is shaped by two optional filters, column and assignee.
//! Its cache key is derived deterministically from that shape:
//!
//! ```text
//! TaskQuery { column: Some(review), assignee: None }  ->  tasks:review:all
//! TaskQuery { column: None, assignee: Some("ann") }   ->  tasks:all:ann
//! ```
//!
//! Given the old and new versions of a task, [`affected_keys`] lists every
//! key whose result set could contain either version, so a write can
//! invalidate exactly those. [`affected_keys_for_event`] derives both
//! versions from a [`MutationEvent`], or gives up when it cannot.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use tracing::{debug, warn};

use crate::cache::CacheCoordinator;
use crate::event::MutationEvent;
use crate::task::{Column, Task};

/// Default key prefix for list caches.
pub const DEFAULT_KEY_PREFIX: &str = "tasks";

/// Placeholder for an absent filter.
const ANY: &str = "all";

/// Filter parameters of a task list query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<Column>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
}

impl TaskQuery {
    /// The unfiltered "all tasks" query.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn column(mut self, column: Column) -> Self {
        self.column_id = Some(column);
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee_id = Some(assignee.into());
        self
    }

    /// Cache key for this query shape.
    pub fn cache_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}",
            prefix,
            self.column_id.map(|c| c.as_str()).unwrap_or(ANY),
            self.assignee_id.as_deref().unwrap_or(ANY)
        )
    }

    /// Whether `task` belongs in this query's result set.
    pub fn matches(&self, task: &Task) -> bool {
        let column_ok = self.column_id.map_or(true, |c| c == task.column_id);
        let assignee_ok = self
            .assignee_id
            .as_deref()
            .map_or(true, |a| task.assignee_id.as_deref() == Some(a));
        column_ok && assignee_ok
    }
}

/// Every query shape whose results could include `task`.
fn queries_containing(task: &Task) -> Vec<TaskQuery> {
    let columns = [None, Some(task.column_id)];
    let assignees = [None, task.assignee_id.clone()];

    let mut queries = Vec::with_capacity(4);
    for column in columns {
        for assignee in assignees.iter() {
            // (None, None) is already covered when the task has no assignee
            let query = TaskQuery {
                column_id: column,
                assignee_id: assignee.clone(),
            };
            if !queries.contains(&query) {
                queries.push(query);
            }
        }
    }
    queries
}

/// Keys to invalidate after a write that turned `before` into `after`.
///
/// Either side may be missing (create, delete). With neither side known
/// only the unfiltered list is returned; callers wanting a blanket flush
/// should use [`CacheCoordinator::invalidate_prefix`] instead.
pub fn affected_keys(prefix: &str, before: Option<&Task>, after: Option<&Task>) -> Vec<String> {
    let mut keys = BTreeSet::new();
    keys.insert(TaskQuery::all().cache_key(prefix));

    for task in before.into_iter().chain(after) {
        for query in queries_containing(task) {
            keys.insert(query.cache_key(prefix));
        }
    }

    keys.into_iter().collect()
}

/// Keys to invalidate after `event` committed, with `previous` the task as
/// it was before the write.
///
/// Moves and deletes carry no task body, so without `previous` there is no
/// way to tell which filtered lists held the task. Returns `None` then; the
/// caller has to flush every list.
pub fn affected_keys_for_event(
    prefix: &str,
    event: &MutationEvent,
    previous: Option<&Task>,
) -> Option<Vec<String>> {
    match (event, previous) {
        (MutationEvent::Created(task) | MutationEvent::Updated(task), _) => {
            Some(affected_keys(prefix, previous, Some(task)))
        }
        (MutationEvent::Moved(mv), Some(before)) => {
            let after = before.clone().with_column(mv.column_id);
            Some(affected_keys(prefix, Some(before), Some(&after)))
        }
        (MutationEvent::Deleted(_), Some(before)) => Some(affected_keys(prefix, Some(before), None)),
        (MutationEvent::Moved(_) | MutationEvent::Deleted(_), None) => None,
    }
}

/// Serve a list query from cache, falling back to `load` on a miss and
/// caching its result.
///
/// A cached value that no longer parses is treated as a miss.
pub async fn read_through<T, E, F, Fut>(
    cache: &CacheCoordinator,
    key: &str,
    load: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(cached) = cache.get(key).await {
        match serde_json::from_str(&cached) {
            Ok(value) => return Ok(value),
            Err(e) => warn!(key = %key, error = %e, "Discarding unreadable cache entry"),
        }
    }

    let value = load().await?;

    match serde_json::to_string(&value) {
        Ok(serialized) => cache.set(key, &serialized).await,
        Err(e) => warn!(key = %key, error = %e, "Result not cacheable"),
    }
    debug!(key = %key, "Loaded and cached query result");

    Ok(value)
}
