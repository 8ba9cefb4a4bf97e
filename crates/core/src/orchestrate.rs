use std::sync::Arc;
use std::time::Duration;

use confdb_schema::{View, ViewId};
use confdb_state::{ChangeId, HookContext, StateData, Status, StatusHandlerId, TaskId};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde_json::Value;

use crate::arbiter;
use crate::error::ConfdbError;
use crate::graph;
use crate::manager::{api_data, stored_transaction, ConfdbManager, TX_CACHE_KEY};
use crate::transaction::Transaction;
use crate::view::get_via_view;
use crate::{GET_CONFDB_CHANGE_KIND, LOAD_CHANGE_TASK_KIND, SET_CONFDB_CHANGE_KIND};

const CONFDB_HOOK_PREFIXES: [&str; 5] = [
    "change-view-",
    "save-view-",
    "observe-view-",
    "query-view-",
    "load-view-",
];

fn is_confdb_hook(ctx: &HookContext) -> bool {
    CONFDB_HOOK_PREFIXES
        .iter()
        .any(|p| ctx.setup().hook.starts_with(p))
}

/// Signal `rx` once the given task reaches a ready status. The sender is
/// consumed on first fire, closing the channel.
fn watch_task_ready(st: &mut StateData, watched: TaskId) -> (Receiver<()>, StatusHandlerId) {
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    let sender = Mutex::new(Some(tx));
    let id = st.add_task_status_changed_handler(move |task, _old, new| {
        if task.id() == watched && new.is_ready() {
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(());
            }
        }
    });
    (rx, id)
}

fn change_failure(st: &StateData, change: ChangeId) -> String {
    let Ok(change) = st.change(change) else {
        return "change failed".to_string();
    };
    for id in change.tasks() {
        let Ok(task) = st.task(*id) else { continue };
        if task.status() == Status::Error {
            if let Some(line) = task.log().last() {
                return line.strip_prefix("ERROR ").unwrap_or(line).to_string();
            }
        }
    }
    "change failed".to_string()
}

/// One-shot commit of a write transaction: builds the task chain, attaches
/// it to the enclosing change (when invoked from a hook) or a fresh
/// `set-confdb` change, registers the write with the arbiter and kicks the
/// runner. The receiver fires when the trailing clear task is ready, i.e.
/// when the transaction has been committed and released (or the change
/// failed; inspect it then).
pub struct CommitHandle {
    mgr: ConfdbManager,
    tx: Arc<Transaction>,
    view: Arc<dyn View>,
    calling_snap: String,
    attach_change: Option<ChangeId>,
}

impl std::fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandle")
            .field("tx", &self.tx)
            .field("view", self.view.id())
            .field("calling_snap", &self.calling_snap)
            .field("attach_change", &self.attach_change)
            .finish()
    }
}

impl CommitHandle {
    pub fn commit(self) -> Result<(ChangeId, Receiver<()>), ConfdbError> {
        let view_id = self.view.id().clone();
        let state = self.mgr.state().clone();
        let mut st = state.lock();

        check_no_ongoing_write(&st, &view_id)?;
        let schema = self.mgr.schema(&view_id.account, &view_id.confdb)?;
        let ts = graph::change_confdb_tasks(
            &mut st,
            self.mgr.registry(),
            schema.as_ref(),
            &self.tx,
            self.view.as_ref(),
            &self.calling_snap,
        )?;
        let change = match self.attach_change {
            Some(change) => change,
            None => st.new_change(
                SET_CONFDB_CHANGE_KIND,
                &format!("Set confdb through \"{view_id}\""),
            ),
        };
        for task in &ts.tasks {
            st.add_task_to_change(change, *task)?;
        }
        let commit = ts.commit_task.ok_or_else(|| {
            ConfdbError::Internal("write task set has no commit task".to_string())
        })?;
        arbiter::set_write_transaction(&mut st, &view_id.account, &view_id.confdb, commit)?;
        let (rx, _watch) = watch_task_ready(&mut st, ts.clear_task);
        drop(st);

        state.ensure_before(Duration::ZERO);
        Ok((change, rx))
    }
}

fn check_no_ongoing_write(st: &StateData, view: &ViewId) -> Result<(), ConfdbError> {
    match arbiter::ongoing_txs(st, &view.account, &view.confdb)? {
        None => Ok(()),
        Some(txs) if txs.write_tx_id.is_none() && txs.read_tx_ids.is_empty() => Ok(()),
        Some(txs) => Err(ConfdbError::WriteBlocked {
            view: view.clone(),
            blocked_by_write: txs.write_tx_id.is_some(),
        }),
    }
}

impl ConfdbManager {
    /// A transaction for writing through `view`, plus a commit handle.
    ///
    /// Inside a confdb hook the enclosing transaction is reused (and no
    /// handle is returned: the enclosing change commits it); accessing a
    /// different confdb than the hook's is rejected. Otherwise a fresh
    /// transaction is handed out, provided nothing is in flight for the
    /// (account, confdb) pair.
    pub fn transaction_to_set(
        &self,
        ctx: Option<&HookContext>,
        view: Arc<dyn View>,
    ) -> Result<(Arc<Transaction>, Option<CommitHandle>), ConfdbError> {
        let view_id = view.id().clone();
        if let Some(ctx) = ctx {
            if is_confdb_hook(ctx) {
                let tx = self.hook_transaction(ctx)?;
                check_same_confdb(&tx, &view_id)?;
                return Ok((tx, None));
            }
        }

        let state = self.state().clone();
        let st = state.lock();
        check_no_ongoing_write(&st, &view_id)?;
        let tx = Arc::new(Transaction::new(&st, &view_id.account, &view_id.confdb)?);
        drop(st);

        let handle = CommitHandle {
            mgr: self.clone(),
            tx: tx.clone(),
            view,
            calling_snap: ctx.map(|c| c.setup().snap.clone()).unwrap_or_default(),
            attach_change: ctx.and_then(|c| c.change()),
        };
        Ok((tx, Some(handle)))
    }

    /// A transaction for reading through `view`, blocking until custodian
    /// load/query hooks (if any) have run.
    ///
    /// Inside a confdb hook the enclosing transaction is returned as-is.
    /// Otherwise, when hooks are needed, the read is scheduled and this
    /// call waits for the chain's clear task with the configured timeout,
    /// then reloads the transaction from that task (hooks may have
    /// replaced its payload). Without hooks the fresh transaction reads
    /// the databag directly.
    pub fn transaction_to_read(
        &self,
        ctx: Option<&HookContext>,
        view: Arc<dyn View>,
        requests: &[String],
        constraints: Option<&Value>,
    ) -> Result<Arc<Transaction>, ConfdbError> {
        let view_id = view.id().clone();
        if let Some(ctx) = ctx {
            if is_confdb_hook(ctx) {
                // Cross-confdb reads during a hook are rejected like
                // writes, for now.
                let tx = self.hook_transaction(ctx)?;
                check_same_confdb(&tx, &view_id)?;
                return Ok(tx);
            }
        }

        let state = self.state().clone();
        let mut st = state.lock();
        if !arbiter::can_start_read_tx(&st, &view_id.account, &view_id.confdb)? {
            return Err(ConfdbError::ReadBlocked { view: view_id });
        }
        let tx = Transaction::new(&st, &view_id.account, &view_id.confdb)?;
        let Some(ts) = graph::load_confdb_tasks(
            &mut st,
            self.registry(),
            &tx,
            view.as_ref(),
            requests,
            constraints,
        )?
        else {
            // No custodian participation needed; read the databag directly.
            return Ok(Arc::new(tx));
        };

        let change = st.new_change(
            GET_CONFDB_CHANGE_KIND,
            &format!("Get confdb through \"{view_id}\""),
        );
        for task in &ts.tasks {
            st.add_task_to_change(change, *task)?;
        }
        arbiter::add_read_transaction(&mut st, &view_id.account, &view_id.confdb, ts.clear_task)?;
        let (rx, watch) = watch_task_ready(&mut st, ts.clear_task);
        let timeout = self.transaction_timeout();
        drop(st);

        state.ensure_before(Duration::ZERO);
        let outcome = rx.recv_timeout(timeout);

        let mut st = state.lock();
        st.remove_task_status_changed_handler(watch);
        match outcome {
            Err(RecvTimeoutError::Timeout) => Err(ConfdbError::LoadTimeout {
                view: view_id,
                timeout,
            }),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if st.change_status(change)? == Status::Error {
                    return Err(ConfdbError::LoadFailed {
                        view: view_id,
                        cause: change_failure(&st, change),
                    });
                }
                let (_, tx) = stored_transaction(&st, ts.clear_task)?;
                Ok(Arc::new(tx))
            }
        }
    }

    /// Schedule a read through `view` and return the change tracking it.
    /// The outcome lands in the change's `api-data` (`values` or `error`).
    /// When no custodian hooks are needed the view is evaluated on the
    /// spot and the returned change is already done.
    pub fn load_async(
        &self,
        view: Arc<dyn View>,
        requests: &[String],
        constraints: Option<&Value>,
    ) -> Result<ChangeId, ConfdbError> {
        let view_id = view.id().clone();
        let state = self.state().clone();
        let mut st = state.lock();
        if !arbiter::can_start_read_tx(&st, &view_id.account, &view_id.confdb)? {
            return Err(ConfdbError::ReadBlocked { view: view_id });
        }
        let tx = Transaction::new(&st, &view_id.account, &view_id.confdb)?;
        let ts = graph::load_confdb_tasks(
            &mut st,
            self.registry(),
            &tx,
            view.as_ref(),
            requests,
            constraints,
        )?;
        let change = st.new_change(
            GET_CONFDB_CHANGE_KIND,
            &format!("Get confdb through \"{view_id}\""),
        );
        match ts {
            None => {
                let result = get_via_view(&tx.bag(), view.as_ref(), requests, constraints);
                let change_data = st.change_mut(change)?;
                change_data.set("api-data", &api_data(result))?;
                change_data.set_status(Status::Done);
                Ok(change)
            }
            Some(ts) => {
                for task in &ts.tasks {
                    st.add_task_to_change(change, *task)?;
                }
                let load = st.new_task(
                    LOAD_CHANGE_TASK_KIND,
                    &format!("Load confdb through \"{view_id}\""),
                );
                {
                    let task = st.task_mut(load)?;
                    task.set("view-name", &view_id.view)?;
                    task.set("requests", &requests)?;
                    if let Some(constraints) = constraints {
                        task.set("constraints", constraints)?;
                    }
                    task.set("tx-task", &ts.clear_task)?;
                    task.wait_on(ts.clear_task);
                }
                st.add_task_to_change(change, load)?;
                arbiter::add_read_transaction(
                    &mut st,
                    &view_id.account,
                    &view_id.confdb,
                    ts.clear_task,
                )?;
                drop(st);
                state.ensure_before(Duration::ZERO);
                Ok(change)
            }
        }
    }

    /// The transaction the enclosing hook operates on, cached on the hook
    /// context so repeated engine calls share it; the cached transaction
    /// is re-serialized onto its owning task when the hook finishes.
    fn hook_transaction(&self, ctx: &HookContext) -> Result<Arc<Transaction>, ConfdbError> {
        if let Some(tx) = ctx.cache_get::<Arc<Transaction>>(TX_CACHE_KEY) {
            return Ok(tx);
        }
        let (owner, tx) = {
            let st = self.state().lock();
            stored_transaction(&st, ctx.task())?
        };
        let tx = Arc::new(tx);
        ctx.cache_set(TX_CACHE_KEY, tx.clone());
        let serialized = tx.clone();
        ctx.on_done(move |st| {
            st.task_mut(owner)?.set("confdb-transaction", &*serialized)?;
            Ok(())
        });
        Ok(tx)
    }
}

fn check_same_confdb(tx: &Transaction, view: &ViewId) -> Result<(), ConfdbError> {
    if tx.account() != view.account || tx.confdb() != view.confdb {
        return Err(ConfdbError::CrossConfdbAccess {
            view: view.clone(),
            account: tx.account().to_string(),
            confdb: tx.confdb().to_string(),
        });
    }
    Ok(())
}
