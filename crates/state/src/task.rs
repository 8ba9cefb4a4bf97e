use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub u64);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task. `Do` moves through `Doing` to `Done` or `Error`;
/// when a change aborts, completed tasks are sent back through
/// `Undo`/`Undoing` to `Undone` and not-yet-run tasks are parked on `Hold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Do,
    Doing,
    Done,
    Undo,
    Undoing,
    Undone,
    Hold,
    Error,
}

impl Status {
    /// A ready status is final: the runner will not touch the task again.
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Hold | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
        };
        f.write_str(s)
    }
}

/// A single unit of work: kind, JSON payload, wait edges and a log.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: String,
    pub(crate) summary: String,
    pub(crate) status: Status,
    pub(crate) data: Map<String, Value>,
    pub(crate) wait_for: Vec<TaskId>,
    pub(crate) change: Option<ChangeId>,
    pub(crate) log: Vec<String>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str) -> Self {
        Task {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            data: Map::new(),
            wait_for: Vec::new(),
            change: None,
            log: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.change
    }

    pub fn wait_for(&self) -> &[TaskId] {
        &self.wait_for
    }

    /// Make this task wait for `other` to complete.
    pub fn wait_on(&mut self, other: TaskId) {
        if !self.wait_for.contains(&other) {
            self.wait_for.push(other);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.data.get(key), Some(v) if !v.is_null())
    }

    pub fn add_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }
}

/// A group of tasks with a shared outcome, visible to API callers.
pub struct Change {
    pub(crate) id: ChangeId,
    pub(crate) kind: String,
    pub(crate) summary: String,
    pub(crate) tasks: Vec<TaskId>,
    pub(crate) data: Map<String, Value>,
    pub(crate) explicit_status: Option<Status>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str) -> Self {
        Change {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            tasks: Vec::new(),
            data: Map::new(),
            explicit_status: None,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Pin the change's status, overriding derivation from its tasks. Used
    /// for changes that carry no tasks.
    pub fn set_status(&mut self, status: Status) {
        self.explicit_status = Some(status);
    }
}
