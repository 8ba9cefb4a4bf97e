use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::select;
use parking_lot::RwLock;

use crate::state::{State, StateData, StateError};
use crate::task::{ChangeId, Status, TaskId};

pub type HandlerFn = Arc<dyn Fn(&State, TaskId) -> anyhow::Result<()> + Send + Sync>;

struct Handlers {
    do_fn: HandlerFn,
    undo_fn: Option<HandlerFn>,
}

enum Direction {
    Do,
    Undo,
}

/// Executes tasks by kind-registered (do, undo) handlers, one at a time.
///
/// Running tasks strictly sequentially is a feature: hooks within a change
/// must never overlap, and the save-view rollback depends on a well-defined
/// completion order.
#[derive(Clone)]
pub struct TaskRunner {
    state: State,
    handlers: Arc<RwLock<HashMap<String, Handlers>>>,
}

impl TaskRunner {
    pub fn new(state: State) -> Self {
        TaskRunner {
            state,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wrap a closure as a registrable handler.
    pub fn handler(
        f: impl Fn(&State, TaskId) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerFn {
        Arc::new(f)
    }

    pub fn add_handler(&self, kind: &str, do_fn: HandlerFn, undo_fn: Option<HandlerFn>) {
        self.handlers
            .write()
            .insert(kind.to_string(), Handlers { do_fn, undo_fn });
    }

    /// Run every currently runnable task to quiescence. Returns whether any
    /// task ran.
    pub fn ensure(&self) -> bool {
        let mut ran = false;
        while self.run_one() {
            ran = true;
        }
        ran
    }

    /// Drive the state until nothing is runnable or `timeout` elapses.
    /// Returns true when every task has reached a ready status. Meant for
    /// synchronous test driving; do not mix with a started runner thread.
    pub fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.ensure() {
                return self.all_ready();
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Spawn the worker thread. It wakes on [`State::ensure_before`] pokes
    /// and sweeps periodically as a safety net.
    pub fn start(&self) -> Result<RunnerHandle, StateError> {
        let ensure_rx = self.state.take_ensure_rx().ok_or(StateError::RunnerStarted)?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let runner = self.clone();
        let join = thread::spawn(move || loop {
            runner.ensure();
            select! {
                recv(ensure_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                }
                recv(stop_rx) -> _ => break,
                default(Duration::from_millis(50)) => {}
            }
        });
        Ok(RunnerHandle {
            stop_tx,
            join: Some(join),
        })
    }

    fn all_ready(&self) -> bool {
        let st = self.state.lock();
        st.task_ids()
            .into_iter()
            .all(|id| st.task(id).map(|t| t.status().is_ready()).unwrap_or(true))
    }

    fn find_runnable(&self, st: &StateData) -> Option<(TaskId, Direction)> {
        for id in st.task_ids() {
            let task = match st.task(id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            match task.status() {
                Status::Do => {
                    let deps_done = task
                        .wait_for()
                        .iter()
                        .all(|dep| matches!(st.task(*dep).map(|t| t.status()), Ok(Status::Done)));
                    if deps_done {
                        return Some((id, Direction::Do));
                    }
                }
                Status::Undo => {
                    let halts_ready = st
                        .halt_tasks(id)
                        .into_iter()
                        .all(|h| st.task(h).map(|t| t.status().is_ready()).unwrap_or(true));
                    if halts_ready {
                        return Some((id, Direction::Undo));
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn run_one(&self) -> bool {
        let (id, direction, kind, change) = {
            let mut st = self.state.lock();
            let Some((id, direction)) = self.find_runnable(&st) else {
                return false;
            };
            let task = match st.task(id) {
                Ok(t) => t,
                Err(_) => return false,
            };
            let kind = task.kind().to_string();
            let change = task.change();
            let next = match direction {
                Direction::Do => Status::Doing,
                Direction::Undo => Status::Undoing,
            };
            if st.set_task_status(id, next).is_err() {
                return false;
            }
            (id, direction, kind, change)
        };

        match direction {
            Direction::Do => self.run_do(id, &kind, change),
            Direction::Undo => self.run_undo(id, &kind),
        }
        true
    }

    fn run_do(&self, id: TaskId, kind: &str, change: Option<ChangeId>) {
        let handler = self.handlers.read().get(kind).map(|h| h.do_fn.clone());
        let result = match handler {
            Some(f) => f(&self.state, id),
            None => Err(anyhow!("no handler for task kind {kind:?}")),
        };
        let mut st = self.state.lock();
        match result {
            Ok(()) => {
                let _ = st.set_task_status(id, Status::Done);
            }
            Err(err) => {
                log::error!("task {id} ({kind}) failed: {err:#}");
                if let Ok(task) = st.task_mut(id) {
                    task.add_log(format!("ERROR {err:#}"));
                }
                let _ = st.set_task_status(id, Status::Error);
                if let Some(change) = change {
                    abort_change(&mut st, change);
                }
            }
        }
    }

    fn run_undo(&self, id: TaskId, kind: &str) {
        let handler = self.handlers.read().get(kind).and_then(|h| h.undo_fn.clone());
        let result = match handler {
            // No undo handler: nothing to revert.
            None => Ok(()),
            Some(f) => f(&self.state, id),
        };
        let mut st = self.state.lock();
        match result {
            Ok(()) => {
                let _ = st.set_task_status(id, Status::Undone);
            }
            Err(err) => {
                log::error!("undoing task {id} ({kind}) failed: {err:#}");
                if let Ok(task) = st.task_mut(id) {
                    task.add_log(format!("ERROR {err:#}"));
                }
                let _ = st.set_task_status(id, Status::Error);
            }
        }
    }
}

/// Abort a change after a task failure: park pending tasks, send completed
/// ones back through their undo handlers.
fn abort_change(st: &mut StateData, change: ChangeId) {
    let tasks = match st.change(change) {
        Ok(c) => c.tasks().to_vec(),
        Err(_) => return,
    };
    for id in tasks {
        let status = match st.task(id) {
            Ok(t) => t.status(),
            Err(_) => continue,
        };
        match status {
            Status::Do => {
                let _ = st.set_task_status(id, Status::Hold);
            }
            Status::Done => {
                let _ = st.set_task_status(id, Status::Undo);
            }
            _ => {}
        }
    }
}

/// Handle to a started runner thread; `stop` shuts it down and joins.
pub struct RunnerHandle {
    stop_tx: crossbeam_channel::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
