//! Client-side reconciliation of optimistic edits with the event stream.
//!
//! [`BoardState`] is the per-connection view of the board. Every task is in
//! one of three states:
//!
//! ```text
//!             begin(optimistic)              confirm / fail
//!   Synced ───────────────────▶ OptimisticApplied ───────────────▶ Synced
//!     │                                                              ▲
//!     └──── begin(not optimistic) ──▶ Pending ─── confirm / fail ────┘
//! ```
//!
//! Rules:
//!
//! - Remote events for a task with a request in flight are suppressed. The
//!   newest one is kept and replayed once the request resolves.
//! - Every other remote event is applied only if its `updated_at` is newer
//!   than the last one applied for that task (last write wins). Applying
//!   the same event twice is a no-op.
//! - Moves relayed from other clients carry no timestamp. They change the
//!   column shown but not the task's version, so the authoritative update
//!   that follows still applies.
//! - A reconnect throws all of this away and starts from a fresh fetch.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::{Envelope, MutationEvent};
use crate::task::{Column, Task, TaskId};

/// Reconciliation state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// The view matches the last known server state
    Synced,
    /// A request is in flight; the view does not reflect it yet
    Pending,
    /// A request is in flight and the view already shows its effect
    OptimisticApplied,
}

/// A change the local user asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    Move { id: TaskId, column: Column },
    /// Create or edit; the task replaces the current version wholesale
    Edit(Task),
    Delete { id: TaskId },
}

impl LocalMutation {
    pub fn task_id(&self) -> &TaskId {
        match self {
            LocalMutation::Move { id, .. } | LocalMutation::Delete { id } => id,
            LocalMutation::Edit(task) => &task.id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LocalMutation::Move { .. } => "move",
            LocalMutation::Edit(_) => "edit",
            LocalMutation::Delete { .. } => "delete",
        }
    }
}

/// What happened to a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Older than (or equal to) what the view already holds
    Discarded,
    /// Held back until this client's own request for the task resolves
    Suppressed,
}

/// A user-visible message, drained by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub task_id: TaskId,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("task {0} already has a request in flight")]
    AlreadyInFlight(TaskId),

    #[error("no request in flight for task {0}")]
    NotInFlight(TaskId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("unreadable event: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug)]
struct InFlight {
    mutation: LocalMutation,
    /// Task as it was when the request started (`None` if it did not exist)
    snapshot: Option<Task>,
    optimistic: bool,
    deferred: Option<MutationEvent>,
}

impl InFlight {
    /// Keep the newer of the held and the incoming event. Timestamped
    /// events win over provisional ones.
    fn defer(&mut self, event: MutationEvent) {
        let replace = match (&self.deferred, event.timestamp()) {
            (None, _) => true,
            (Some(held), Some(incoming)) => held.timestamp().map_or(true, |held| incoming >= held),
            (Some(held), None) => held.timestamp().is_none(),
        };
        if replace {
            self.deferred = Some(event);
        }
    }
}

/// One client's view of the board.
#[derive(Debug, Default)]
pub struct BoardState {
    tasks: BTreeMap<TaskId, Task>,
    last_applied: HashMap<TaskId, DateTime<Utc>>,
    tombstones: HashMap<TaskId, DateTime<Utc>>,
    in_flight: HashMap<TaskId, InFlight>,
    notices: VecDeque<Notice>,
}

impl BoardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from a full fetch.
    pub fn from_snapshot(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut state = Self::new();
        state.load(tasks);
        state
    }

    /// Reconnect: drop every in-flight request and all version tracking,
    /// then load the refetched tasks as synced.
    ///
    /// Pending notices survive; they are for the user, not the session.
    pub fn reset(&mut self, tasks: impl IntoIterator<Item = Task>) {
        let abandoned = self.in_flight.len();
        self.tasks.clear();
        self.last_applied.clear();
        self.tombstones.clear();
        self.in_flight.clear();
        self.load(tasks);
        info!(tasks = self.tasks.len(), abandoned = abandoned, "Board state reset from fetch");
    }

    fn load(&mut self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.last_applied.insert(task.id.clone(), task.updated_at);
            self.tasks.insert(task.id.clone(), task);
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All visible tasks, ordered by id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn tasks_in(&self, column: Column) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.column_id == column).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn state_of(&self, id: &TaskId) -> SyncState {
        match self.in_flight.get(id) {
            Some(flight) if flight.optimistic => SyncState::OptimisticApplied,
            Some(_) => SyncState::Pending,
            None => SyncState::Synced,
        }
    }

    /// Version of the last authoritative event applied for a task.
    pub fn last_applied(&self, id: &TaskId) -> Option<DateTime<Utc>> {
        self.last_applied.get(id).copied()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    /// Start a local mutation. With `optimistic` the view changes at once;
    /// otherwise it waits for the confirmation.
    pub fn begin(&mut self, mutation: LocalMutation, optimistic: bool) -> Result<(), ReconcileError> {
        let id = mutation.task_id().clone();
        if self.in_flight.contains_key(&id) {
            return Err(ReconcileError::AlreadyInFlight(id));
        }

        let snapshot = self.tasks.get(&id).cloned();
        if snapshot.is_none() && !matches!(mutation, LocalMutation::Edit(_)) {
            return Err(ReconcileError::UnknownTask(id));
        }

        if optimistic {
            match &mutation {
                LocalMutation::Move { column, .. } => {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.column_id = *column;
                    }
                }
                LocalMutation::Edit(task) => {
                    self.tasks.insert(id.clone(), task.clone());
                }
                LocalMutation::Delete { .. } => {
                    self.tasks.remove(&id);
                }
            }
        }

        debug!(task_id = %id, kind = mutation.kind(), optimistic = optimistic, "Local mutation started");
        self.in_flight.insert(
            id,
            InFlight {
                mutation,
                snapshot,
                optimistic,
                deferred: None,
            },
        );
        Ok(())
    }

    /// The request succeeded. `confirmed` is the server's answer; its
    /// timestamp is authoritative.
    pub fn confirm(&mut self, confirmed: MutationEvent) -> Result<ApplyOutcome, ReconcileError> {
        let id = confirmed.task_id().clone();
        let flight = self
            .in_flight
            .remove(&id)
            .ok_or_else(|| ReconcileError::NotInFlight(id.clone()))?;

        self.restore(&id, flight.snapshot);
        let outcome = self.apply_authoritative(&confirmed);
        if let Some(deferred) = flight.deferred {
            self.apply_authoritative(&deferred);
        }

        debug!(task_id = %id, outcome = ?outcome, "Local mutation confirmed");
        Ok(outcome)
    }

    /// The request failed: roll the task back and tell the user.
    pub fn fail(&mut self, id: &TaskId, reason: impl Into<String>) -> Result<(), ReconcileError> {
        let flight = self
            .in_flight
            .remove(id)
            .ok_or_else(|| ReconcileError::NotInFlight(id.clone()))?;

        let reason = reason.into();
        warn!(task_id = %id, kind = flight.mutation.kind(), reason = %reason, "Local mutation failed, rolled back");

        self.restore(id, flight.snapshot);
        if let Some(deferred) = flight.deferred {
            self.apply_authoritative(&deferred);
        }

        self.notices.push_back(Notice {
            task_id: id.clone(),
            message: format!("Could not {} task: {}", flight.mutation.kind(), reason),
        });
        Ok(())
    }

    /// Merge an event relayed from the gateway.
    pub fn apply_remote(&mut self, event: MutationEvent) -> ApplyOutcome {
        if let Some(flight) = self.in_flight.get_mut(event.task_id()) {
            debug!(task_id = %event.task_id(), event_name = event.name(), "Event suppressed while in flight");
            flight.defer(event);
            return ApplyOutcome::Suppressed;
        }
        self.apply_authoritative(&event)
    }

    /// Decode a wire envelope and merge it.
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> Result<ApplyOutcome, ReconcileError> {
        let event = MutationEvent::from_envelope(envelope)?;
        Ok(self.apply_remote(event))
    }

    fn restore(&mut self, id: &TaskId, snapshot: Option<Task>) {
        match snapshot {
            Some(task) => {
                self.tasks.insert(id.clone(), task);
            }
            None => {
                self.tasks.remove(id);
            }
        }
    }

    /// True if a version stamped `at` is not newer than what we hold.
    fn is_stale(&self, id: &TaskId, at: DateTime<Utc>) -> bool {
        self.last_applied.get(id).is_some_and(|seen| at <= *seen)
            || self.tombstones.get(id).is_some_and(|gone| at <= *gone)
    }

    fn apply_authoritative(&mut self, event: &MutationEvent) -> ApplyOutcome {
        let id = event.task_id();
        match event {
            MutationEvent::Created(task) | MutationEvent::Updated(task) => {
                if self.is_stale(id, task.updated_at) {
                    return ApplyOutcome::Discarded;
                }
                self.tombstones.remove(id);
                self.last_applied.insert(id.clone(), task.updated_at);
                self.tasks.insert(id.clone(), task.clone());
                ApplyOutcome::Applied
            }
            MutationEvent::Deleted(deletion) => {
                if let Some(at) = deletion.updated_at {
                    if self.is_stale(id, at) {
                        return ApplyOutcome::Discarded;
                    }
                }
                if !self.tasks.contains_key(id) && self.tombstones.contains_key(id) {
                    return ApplyOutcome::Discarded;
                }
                // Without a delete time, anything not newer than the last
                // version we saw is considered older than the delete
                let gone_at = deletion
                    .updated_at
                    .or_else(|| self.last_applied.get(id).copied())
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                self.tasks.remove(id);
                self.last_applied.remove(id);
                self.tombstones.insert(id.clone(), gone_at);
                ApplyOutcome::Applied
            }
            MutationEvent::Moved(mv) => {
                if let Some(at) = mv.updated_at {
                    if self.is_stale(id, at) {
                        return ApplyOutcome::Discarded;
                    }
                }
                let Some(task) = self.tasks.get_mut(id) else {
                    return ApplyOutcome::Discarded;
                };
                match mv.updated_at {
                    Some(at) => {
                        task.column_id = mv.column_id;
                        task.updated_at = at;
                        self.last_applied.insert(id.clone(), at);
                    }
                    None if task.column_id == mv.column_id => return ApplyOutcome::Discarded,
                    // Provisional: the version stays where it was
                    None => task.column_id = mv.column_id,
                }
                ApplyOutcome::Applied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Deletion, Move};
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: &str, column: Column, at: i64) -> Task {
        Task::new(id, format!("Task {}", id), ts(0))
            .with_column(column)
            .updated(ts(at))
    }

    fn updated(id: &str, column: Column, at: i64) -> MutationEvent {
        MutationEvent::Updated(task(id, column, at))
    }

    fn provisional_move(id: &str, column: Column) -> MutationEvent {
        MutationEvent::Moved(Move {
            id: TaskId::from(id),
            column_id: column,
            updated_at: None,
        })
    }

    fn column_of(state: &BoardState, id: &str) -> Column {
        state.task(&TaskId::from(id)).unwrap().column_id
    }

    #[test]
    fn test_same_event_twice_is_idempotent() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let event = updated("t1", Column::Review, 2);

        assert_eq!(state.apply_remote(event.clone()), ApplyOutcome::Applied);
        let once: Vec<Task> = state.tasks().cloned().collect();

        assert_eq!(state.apply_remote(event), ApplyOutcome::Discarded);
        let twice: Vec<Task> = state.tasks().cloned().collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_older_event_discarded() {
        let mut state = BoardState::from_snapshot([task("t", Column::Backlog, 1)]);

        assert_eq!(state.apply_remote(updated("t", Column::Review, 5)), ApplyOutcome::Applied);
        assert_eq!(state.apply_remote(updated("t", Column::InProgress, 3)), ApplyOutcome::Discarded);

        assert_eq!(column_of(&state, "t"), Column::Review);
        assert_eq!(state.last_applied(&TaskId::from("t")), Some(ts(5)));
    }

    #[test]
    fn test_optimistic_move_confirmed() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let id = TaskId::from("t1");

        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::InProgress }, true)
            .unwrap();
        assert_eq!(state.state_of(&id), SyncState::OptimisticApplied);
        assert_eq!(column_of(&state, "t1"), Column::InProgress);

        let outcome = state.confirm(updated("t1", Column::InProgress, 2)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(state.state_of(&id), SyncState::Synced);
        assert_eq!(state.last_applied(&id), Some(ts(2)));
    }

    #[test]
    fn test_pending_mutation_leaves_view_alone() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let id = TaskId::from("t1");

        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::Review }, false)
            .unwrap();
        assert_eq!(state.state_of(&id), SyncState::Pending);
        assert_eq!(column_of(&state, "t1"), Column::Backlog);

        state.confirm(updated("t1", Column::Review, 2)).unwrap();
        assert_eq!(column_of(&state, "t1"), Column::Review);
    }

    #[test]
    fn test_failure_rolls_back_and_notifies() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let id = TaskId::from("t1");

        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::Completed }, true)
            .unwrap();
        state.fail(&id, "server returned 500").unwrap();

        assert_eq!(column_of(&state, "t1"), Column::Backlog);
        assert_eq!(state.state_of(&id), SyncState::Synced);

        let notices = state.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].task_id, id);
        assert!(notices[0].message.contains("server returned 500"));
        assert!(state.drain_notices().is_empty());
    }

    #[test]
    fn test_failed_delete_restores_task() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Review, 1)]);
        let id = TaskId::from("t1");

        state.begin(LocalMutation::Delete { id: id.clone() }, true).unwrap();
        assert!(state.task(&id).is_none());

        state.fail(&id, "forbidden").unwrap();
        assert_eq!(column_of(&state, "t1"), Column::Review);
    }

    #[test]
    fn test_failed_create_removes_task() {
        let mut state = BoardState::new();
        let draft = task("t5", Column::Backlog, 1);

        state.begin(LocalMutation::Edit(draft), true).unwrap();
        assert_eq!(state.len(), 1);

        state.fail(&TaskId::from("t5"), "validation failed").unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_own_echo_suppressed_while_in_flight() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let id = TaskId::from("t1");
        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::InProgress }, true)
            .unwrap();

        // The writer's event for our own move arrives before the HTTP response
        let echo = updated("t1", Column::InProgress, 2);
        assert_eq!(state.apply_remote(echo.clone()), ApplyOutcome::Suppressed);
        assert_eq!(state.state_of(&id), SyncState::OptimisticApplied);

        assert_eq!(state.confirm(echo.clone()).unwrap(), ApplyOutcome::Applied);
        // Arriving again after confirmation changes nothing
        assert_eq!(state.apply_remote(echo), ApplyOutcome::Discarded);
        assert_eq!(column_of(&state, "t1"), Column::InProgress);
    }

    #[test]
    fn test_other_tasks_apply_while_in_flight() {
        let mut state =
            BoardState::from_snapshot([task("t1", Column::Backlog, 1), task("t2", Column::Backlog, 1)]);
        state
            .begin(LocalMutation::Move { id: "t1".into(), column: Column::Review }, true)
            .unwrap();

        assert_eq!(state.apply_remote(updated("t2", Column::Completed, 2)), ApplyOutcome::Applied);
        assert_eq!(column_of(&state, "t2"), Column::Completed);
    }

    #[test]
    fn test_newer_suppressed_event_wins_after_confirm() {
        // Both clients mark t2 completed; the other client's write commits later
        let mut state = BoardState::from_snapshot([task("t2", Column::Review, 1)]);
        let id = TaskId::from("t2");
        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::Completed }, true)
            .unwrap();

        let mut theirs = task("t2", Column::Completed, 8);
        theirs.title = "Edited elsewhere".into();
        assert_eq!(
            state.apply_remote(MutationEvent::Updated(theirs.clone())),
            ApplyOutcome::Suppressed
        );

        state.confirm(updated("t2", Column::Completed, 6)).unwrap();

        assert_eq!(state.task(&id), Some(&theirs));
        assert_eq!(state.last_applied(&id), Some(ts(8)));
    }

    #[test]
    fn test_older_suppressed_event_loses_after_confirm() {
        let mut state = BoardState::from_snapshot([task("t2", Column::Review, 1)]);
        let id = TaskId::from("t2");
        state
            .begin(LocalMutation::Move { id: id.clone(), column: Column::Completed }, true)
            .unwrap();

        state.apply_remote(updated("t2", Column::Backlog, 4));
        state.confirm(updated("t2", Column::Completed, 6)).unwrap();

        assert_eq!(column_of(&state, "t2"), Column::Completed);
        assert_eq!(state.last_applied(&id), Some(ts(6)));
    }

    #[test]
    fn test_last_write_wins_across_clients() {
        let initial = [task("t2", Column::Review, 1)];
        let mut alice = BoardState::from_snapshot(initial.clone());
        let mut bob = BoardState::from_snapshot(initial);
        let id = TaskId::from("t2");

        alice
            .begin(LocalMutation::Move { id: id.clone(), column: Column::Completed }, true)
            .unwrap();
        bob.begin(LocalMutation::Move { id: id.clone(), column: Column::Completed }, true)
            .unwrap();

        let mut first = task("t2", Column::Completed, 5);
        first.title = "alice".into();
        let mut second = task("t2", Column::Completed, 7);
        second.title = "bob".into();

        // Events cross on the wire in different orders
        alice.apply_remote(MutationEvent::Updated(second.clone()));
        alice.confirm(MutationEvent::Updated(first.clone())).unwrap();

        bob.apply_remote(MutationEvent::Updated(first.clone()));
        bob.confirm(MutationEvent::Updated(second.clone())).unwrap();

        assert_eq!(alice.task(&id), Some(&second));
        assert_eq!(bob.task(&id), Some(&second));
    }

    #[test]
    fn test_provisional_move_keeps_version() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 3)]);
        let id = TaskId::from("t1");

        assert_eq!(
            state.apply_remote(provisional_move("t1", Column::InProgress)),
            ApplyOutcome::Applied
        );
        assert_eq!(column_of(&state, "t1"), Column::InProgress);
        assert_eq!(state.last_applied(&id), Some(ts(3)));

        // Same relay twice is a no-op
        assert_eq!(
            state.apply_remote(provisional_move("t1", Column::InProgress)),
            ApplyOutcome::Discarded
        );

        // The authoritative update still lands
        assert_eq!(state.apply_remote(updated("t1", Column::InProgress, 4)), ApplyOutcome::Applied);
        assert_eq!(state.last_applied(&id), Some(ts(4)));
    }

    #[test]
    fn test_timestamped_deferred_event_beats_provisional() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let id = TaskId::from("t1");
        state.begin(LocalMutation::Delete { id: id.clone() }, false).unwrap();

        state.apply_remote(updated("t1", Column::Review, 2));
        state.apply_remote(provisional_move("t1", Column::Completed));
        state.fail(&id, "conflict").unwrap();

        assert_eq!(column_of(&state, "t1"), Column::Review);
    }

    #[test]
    fn test_delete_tombstone_blocks_stale_update() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 2)]);
        let id = TaskId::from("t1");

        let delete = MutationEvent::Deleted(Deletion {
            id: id.clone(),
            updated_at: Some(ts(5)),
        });
        assert_eq!(state.apply_remote(delete.clone()), ApplyOutcome::Applied);
        assert_eq!(state.apply_remote(delete), ApplyOutcome::Discarded);

        assert_eq!(state.apply_remote(updated("t1", Column::Review, 4)), ApplyOutcome::Discarded);
        assert!(state.task(&id).is_none());
    }

    #[test]
    fn test_untimestamped_delete_uses_last_version() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 2)]);
        let id = TaskId::from("t1");

        state.apply_remote(MutationEvent::Deleted(Deletion {
            id: id.clone(),
            updated_at: None,
        }));
        assert_eq!(state.apply_remote(updated("t1", Column::Review, 2)), ApplyOutcome::Discarded);
        assert!(state.task(&id).is_none());
    }

    #[test]
    fn test_second_mutation_on_same_task_rejected() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        state
            .begin(LocalMutation::Move { id: "t1".into(), column: Column::Review }, true)
            .unwrap();

        let result = state.begin(LocalMutation::Delete { id: "t1".into() }, true);
        assert!(matches!(result, Err(ReconcileError::AlreadyInFlight(_))));
    }

    #[test]
    fn test_unknown_task_and_stray_resolution() {
        let mut state = BoardState::new();
        let result = state.begin(LocalMutation::Move { id: "ghost".into(), column: Column::Review }, true);
        assert!(matches!(result, Err(ReconcileError::UnknownTask(_))));

        assert!(matches!(
            state.confirm(updated("ghost", Column::Review, 1)),
            Err(ReconcileError::NotInFlight(_))
        ));
        assert!(matches!(
            state.fail(&TaskId::from("ghost"), "x"),
            Err(ReconcileError::NotInFlight(_))
        ));
    }

    #[test]
    fn test_apply_envelope_from_wire() {
        let mut state = BoardState::from_snapshot([task("t1", Column::Backlog, 1)]);
        let envelope = Envelope::new("moved", json!({"id": "t1", "column_id": "review"}));

        assert_eq!(state.apply_envelope(&envelope).unwrap(), ApplyOutcome::Applied);
        assert_eq!(column_of(&state, "t1"), Column::Review);

        let bad = Envelope::new("moved", json!({"id": "t1", "column_id": "archive"}));
        assert!(matches!(state.apply_envelope(&bad), Err(ReconcileError::Malformed(_))));
    }

    #[test]
    fn test_reconnect_refetch_matches_connected_client() {
        let initial = vec![task("t1", Column::Backlog, 1), task("t2", Column::Review, 1)];
        let mut connected = BoardState::from_snapshot(initial.clone());
        let mut reconnecting = BoardState::from_snapshot(initial);

        // Leaves something in flight when the socket drops
        reconnecting
            .begin(LocalMutation::Move { id: "t1".into(), column: Column::Completed }, true)
            .unwrap();

        let missed = vec![
            updated("t1", Column::InProgress, 2),
            MutationEvent::Deleted(Deletion {
                id: "t2".into(),
                updated_at: Some(ts(3)),
            }),
            MutationEvent::Created(task("t3", Column::Backlog, 4)),
        ];
        for event in missed {
            connected.apply_remote(event);
        }

        // Server state after the three writes
        let fetched = vec![task("t1", Column::InProgress, 2), task("t3", Column::Backlog, 4)];
        reconnecting.reset(fetched);

        let a: Vec<&Task> = connected.tasks().collect();
        let b: Vec<&Task> = reconnecting.tasks().collect();
        assert_eq!(a, b);
        assert_eq!(reconnecting.in_flight_count(), 0);
        for id in ["t1", "t3"] {
            let id = TaskId::from(id);
            assert_eq!(reconnecting.state_of(&id), SyncState::Synced);
            assert_eq!(reconnecting.last_applied(&id), connected.last_applied(&id));
        }
    }
}
