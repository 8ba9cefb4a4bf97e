use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::task::{Change, ChangeId, Status, Task, TaskId};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot serialize state entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no task with id {0}")]
    MissingTask(TaskId),
    #[error("no change with id {0}")]
    MissingChange(ChangeId),
    #[error("task runner was already started")]
    RunnerStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHandlerId(u64);

type StatusHandler = Arc<dyn Fn(&Task, Status, Status) + Send + Sync>;

/// Shared handle to the host state. All reads and writes go through
/// [`State::lock`]; the guard derefs to [`StateData`]. Cross-component
/// waits must never happen with the guard held.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

struct StateInner {
    data: Mutex<StateData>,
    ensure_tx: Sender<()>,
    ensure_rx: Mutex<Option<Receiver<()>>>,
}

pub struct StateData {
    entries: HashMap<String, Value>,
    tasks: BTreeMap<TaskId, Task>,
    changes: BTreeMap<ChangeId, Change>,
    next_id: u64,
    handlers: Vec<(StatusHandlerId, StatusHandler)>,
    next_handler_id: u64,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let (ensure_tx, ensure_rx) = crossbeam_channel::unbounded();
        State {
            inner: Arc::new(StateInner {
                data: Mutex::new(StateData {
                    entries: HashMap::new(),
                    tasks: BTreeMap::new(),
                    changes: BTreeMap::new(),
                    next_id: 0,
                    handlers: Vec::new(),
                    next_handler_id: 0,
                }),
                ensure_tx,
                ensure_rx: Mutex::new(Some(ensure_rx)),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateData> {
        self.inner.data.lock()
    }

    /// Ask the runner to process pending work no later than `after` from
    /// now. The engine only ever passes zero; the runner treats any poke as
    /// "run now".
    pub fn ensure_before(&self, _after: Duration) {
        let _ = self.inner.ensure_tx.send(());
    }

    /// Hand the ensure channel's receiving end to the runner. Yields `None`
    /// after the first call.
    pub(crate) fn take_ensure_rx(&self) -> Option<Receiver<()>> {
        self.inner.ensure_rx.lock().take()
    }
}

impl StateData {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.entries.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.entries.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let id = ChangeId(self.next());
        self.changes.insert(id, Change::new(id, kind, summary));
        id
    }

    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let id = TaskId(self.next());
        self.tasks.insert(id, Task::new(id, kind, summary));
        id
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, StateError> {
        self.tasks.get(&id).ok_or(StateError::MissingTask(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StateError> {
        self.tasks.get_mut(&id).ok_or(StateError::MissingTask(id))
    }

    pub fn change(&self, id: ChangeId) -> Result<&Change, StateError> {
        self.changes.get(&id).ok_or(StateError::MissingChange(id))
    }

    pub fn change_mut(&mut self, id: ChangeId) -> Result<&mut Change, StateError> {
        self.changes.get_mut(&id).ok_or(StateError::MissingChange(id))
    }

    pub fn add_task_to_change(&mut self, change: ChangeId, task: TaskId) -> Result<(), StateError> {
        self.task_mut(task)?.change = Some(change);
        let change = self.change_mut(change)?;
        if !change.tasks.contains(&task) {
            change.tasks.push(task);
        }
        Ok(())
    }

    /// Tasks that wait on `id` (the inverse of the `wait_for` edges).
    pub fn halt_tasks(&self, id: TaskId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.wait_for.contains(&id))
            .map(|t| t.id)
            .collect()
    }

    /// Set a task's status, notifying registered status handlers.
    pub fn set_task_status(&mut self, id: TaskId, status: Status) -> Result<(), StateError> {
        let task = self.task_mut(id)?;
        let old = task.status;
        if old == status {
            return Ok(());
        }
        task.status = status;
        let handlers: Vec<StatusHandler> =
            self.handlers.iter().map(|(_, h)| h.clone()).collect();
        if let Some(task) = self.tasks.get(&id) {
            for handler in handlers {
                handler(task, old, status);
            }
        }
        Ok(())
    }

    /// The change's status: explicitly pinned, or derived from its tasks.
    pub fn change_status(&self, id: ChangeId) -> Result<Status, StateError> {
        let change = self.change(id)?;
        if let Some(status) = change.explicit_status {
            return Ok(status);
        }
        let statuses: Vec<Status> = change
            .tasks
            .iter()
            .filter_map(|tid| self.tasks.get(tid))
            .map(|t| t.status)
            .collect();
        if statuses.is_empty() {
            return Ok(Status::Hold);
        }
        if !statuses.iter().all(|s| s.is_ready()) {
            return Ok(Status::Doing);
        }
        if statuses.iter().any(|s| matches!(s, Status::Error)) {
            return Ok(Status::Error);
        }
        if statuses
            .iter()
            .any(|s| matches!(s, Status::Hold | Status::Undone))
        {
            // The change aborted without a hard task error.
            return Ok(Status::Error);
        }
        Ok(Status::Done)
    }

    /// Register a callback fired (under the state lock) on every task
    /// status transition. The callback must not reacquire the lock.
    pub fn add_task_status_changed_handler(
        &mut self,
        handler: impl Fn(&Task, Status, Status) + Send + Sync + 'static,
    ) -> StatusHandlerId {
        self.next_handler_id += 1;
        let id = StatusHandlerId(self.next_handler_id);
        self.handlers.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_task_status_changed_handler(&mut self, id: StatusHandlerId) {
        self.handlers.retain(|(hid, _)| *hid != id);
    }

    pub(crate) fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }
}
