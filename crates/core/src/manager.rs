use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use confdb_schema::{Schema, ViewId};
use confdb_state::{
    HookContext, HookHandler, HookManager, HookSetup, State, StateData, TaskId, TaskRunner,
};
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::arbiter;
use crate::error::ConfdbError;
use crate::transaction::Transaction;
use crate::view::get_via_view;
use crate::{
    CLEAR_ON_ERROR_TASK_KIND, CLEAR_TASK_KIND, COMMIT_TASK_KIND, LOAD_CHANGE_TASK_KIND,
    RUN_HOOK_TASK_KIND,
};

/// Hook-context cache key under which engine calls share one transaction.
pub(crate) const TX_CACHE_KEY: &str = "confdb-transaction";

/// Default time a blocking read waits for its hooks to finish.
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Resolves the schema governing one (account, confdb) pair. Production
/// backs this with the assertion database; that lookup is outside the
/// engine.
pub trait SchemaResolver: Send + Sync {
    fn schema(&self, account: &str, confdb: &str) -> Result<Arc<dyn Schema>, ConfdbError>;
}

/// A fixed schema table.
#[derive(Default)]
pub struct StaticSchemas {
    schemas: HashMap<(String, String), Arc<dyn Schema>>,
}

impl StaticSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(
        mut self,
        account: &str,
        confdb: &str,
        schema: impl Schema + 'static,
    ) -> Self {
        self.schemas
            .insert((account.to_string(), confdb.to_string()), Arc::new(schema));
        self
    }
}

impl SchemaResolver for StaticSchemas {
    fn schema(&self, account: &str, confdb: &str) -> Result<Arc<dyn Schema>, ConfdbError> {
        self.schemas
            .get(&(account.to_string(), confdb.to_string()))
            .cloned()
            .ok_or_else(|| ConfdbError::UnknownConfdb {
                account: account.to_string(),
                confdb: confdb.to_string(),
            })
    }
}

/// Locate the transaction a task works on: its own payload, or the task
/// its `tx-task` reference names. Returns the owning task's id with it.
pub(crate) fn stored_transaction(
    st: &StateData,
    id: TaskId,
) -> Result<(TaskId, Transaction), ConfdbError> {
    let task = st.task(id)?;
    if let Some(tx) = task.get::<Transaction>("confdb-transaction")? {
        return Ok((id, tx));
    }
    let owner: TaskId = task.get("tx-task")?.ok_or_else(|| {
        ConfdbError::Internal(format!("task {id} has no associated transaction"))
    })?;
    let tx = st
        .task(owner)?
        .get::<Transaction>("confdb-transaction")?
        .ok_or_else(|| {
            ConfdbError::Internal(format!("task {owner} should hold a transaction but does not"))
        })?;
    Ok((owner, tx))
}

/// Render an engine result as a change's `api-data` payload.
pub(crate) fn api_data(result: Result<Value, ConfdbError>) -> Value {
    match result {
        Ok(values) => json!({ "values": values }),
        Err(err) => json!({
            "error": { "message": err.to_string(), "kind": err.kind() }
        }),
    }
}

/// The engine's composition root: registers the confdb task handlers and
/// hook handlers, and owns the schema and plug-registry seams.
#[derive(Clone)]
pub struct ConfdbManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    state: State,
    schemas: Arc<dyn SchemaResolver>,
    registry: Arc<dyn crate::custodian::PlugRegistry>,
    tx_timeout: RwLock<Duration>,
}

impl ConfdbManager {
    pub fn new(
        state: State,
        runner: &TaskRunner,
        hooks: &HookManager,
        schemas: Arc<dyn SchemaResolver>,
        registry: Arc<dyn crate::custodian::PlugRegistry>,
    ) -> Self {
        let mgr = ConfdbManager {
            inner: Arc::new(ManagerInner {
                state,
                schemas,
                registry,
                tx_timeout: RwLock::new(DEFAULT_TRANSACTION_TIMEOUT),
            }),
        };

        {
            let m = mgr.clone();
            runner.add_handler(
                COMMIT_TASK_KIND,
                TaskRunner::handler(move |state, id| m.do_commit(state, id)),
                None,
            );
        }
        {
            let m = mgr.clone();
            runner.add_handler(
                CLEAR_TASK_KIND,
                TaskRunner::handler(move |state, id| m.clear_ongoing(state, id, false)),
                None,
            );
        }
        {
            let m = mgr.clone();
            runner.add_handler(
                CLEAR_ON_ERROR_TASK_KIND,
                TaskRunner::handler(|_, _| Ok(())),
                Some(TaskRunner::handler(move |state, id| {
                    m.clear_ongoing(state, id, true)
                })),
            );
        }
        {
            let m = mgr.clone();
            runner.add_handler(
                LOAD_CHANGE_TASK_KIND,
                TaskRunner::handler(move |state, id| m.do_load_change(state, id)),
                None,
            );
        }

        hooks.register_prefix(
            "change-view-",
            Arc::new(|_| Box::new(ChangeViewHandler) as Box<dyn HookHandler>),
        );
        hooks.register_prefix(
            "save-view-",
            Arc::new(|_| Box::new(SaveViewHandler) as Box<dyn HookHandler>),
        );
        for prefix in ["observe-view-", "query-view-", "load-view-"] {
            hooks.register_prefix(
                prefix,
                Arc::new(|_| Box::new(PassiveViewHandler) as Box<dyn HookHandler>),
            );
        }

        mgr
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    pub(crate) fn schema(
        &self,
        account: &str,
        confdb: &str,
    ) -> Result<Arc<dyn Schema>, ConfdbError> {
        self.inner.schemas.schema(account, confdb)
    }

    pub(crate) fn registry(&self) -> &dyn crate::custodian::PlugRegistry {
        self.inner.registry.as_ref()
    }

    pub(crate) fn transaction_timeout(&self) -> Duration {
        *self.inner.tx_timeout.read()
    }

    /// Override the blocking-read timeout (tests).
    pub fn set_transaction_timeout(&self, timeout: Duration) {
        *self.inner.tx_timeout.write() = timeout;
    }

    /// `commit-confdb-tx`: validate and persist the transaction. Do-only;
    /// a failure propagates to the change and the preceding
    /// `clear-confdb-tx-on-error` cleans up on the undo path.
    fn do_commit(&self, state: &State, id: TaskId) -> anyhow::Result<()> {
        let mut st = state.lock();
        let tx: Transaction = st.task(id)?.get("confdb-transaction")?.ok_or_else(|| {
            ConfdbError::Internal(format!("commit task {id} has no transaction"))
        })?;
        let schema = self.schema(tx.account(), tx.confdb())?;
        tx.commit(&mut st, schema.as_ref())?;
        st.task_mut(id)?.set("confdb-transaction", &tx)?;
        Ok(())
    }

    /// `clear-confdb-tx` (do) and `clear-confdb-tx-on-error` (undo):
    /// release the ongoing-transaction slot held under the owning task's
    /// id. The undo flavor tolerates an already-released slot.
    fn clear_ongoing(&self, state: &State, id: TaskId, on_error: bool) -> anyhow::Result<()> {
        let mut st = state.lock();
        let (owner, tx) = stored_transaction(&st, id)?;
        match arbiter::unset_ongoing_transaction(&mut st, tx.account(), tx.confdb(), owner) {
            Ok(()) => Ok(()),
            Err(ConfdbError::UnknownOngoingTransaction { .. }) if on_error => {
                log::debug!(
                    "ongoing transaction for {}/{} already cleared",
                    tx.account(),
                    tx.confdb()
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `load-confdb-change`: evaluate the view against the transaction and
    /// publish the outcome in the change's `api-data`. Missing data is a
    /// value-level outcome, not a task failure.
    fn do_load_change(&self, state: &State, id: TaskId) -> anyhow::Result<()> {
        let mut st = state.lock();
        let (view_name, requests, constraints, change) = {
            let task = st.task(id)?;
            let view_name: String = task.get("view-name")?.ok_or_else(|| {
                ConfdbError::Internal(format!("load task {id} has no view-name"))
            })?;
            let requests: Vec<String> = task.get("requests")?.unwrap_or_default();
            let constraints: Option<Value> = task.get("constraints")?;
            let change = task.change().ok_or_else(|| {
                ConfdbError::Internal(format!("load task {id} is not part of a change"))
            })?;
            (view_name, requests, constraints, change)
        };
        let (_, tx) = stored_transaction(&st, id)?;

        let result = self
            .schema(tx.account(), tx.confdb())
            .and_then(|schema| {
                schema.view(&view_name).ok_or_else(|| ConfdbError::UnknownView {
                    account: tx.account().to_string(),
                    confdb: tx.confdb().to_string(),
                    view: view_name.clone(),
                })
            })
            .and_then(|view| {
                get_via_view(&tx.bag(), view.as_ref(), &requests, constraints.as_ref())
            });
        st.change_mut(change)?.set("api-data", &api_data(result))?;
        Ok(())
    }
}

/// `change-view-*` hooks: the hook may veto the pending change by aborting
/// the transaction; that surfaces as a task failure once the hook is done.
struct ChangeViewHandler;

impl HookHandler for ChangeViewHandler {
    fn done(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        let st = ctx.state().lock();
        let (owner, stored) = stored_transaction(&st, ctx.task())?;
        // The hook mutates the live cached transaction; the stored copy
        // only reflects it after the context's on-done ran.
        let aborted = match ctx.cache_get::<Arc<Transaction>>(TX_CACHE_KEY) {
            Some(live) => live.aborted(),
            None => stored.aborted(),
        };
        if let Some((snap, reason)) = aborted {
            let view_name: String = st.task(owner)?.get("view-name")?.unwrap_or_default();
            let view = ViewId {
                account: stored.account().to_string(),
                confdb: stored.confdb().to_string(),
                view: view_name,
            };
            return Err(ConfdbError::HookRejection { view, snap, reason }.into());
        }
        Ok(())
    }
}

/// `observe-view-*`, `query-view-*`, `load-view-*`: no engine-side
/// lifecycle beyond running the hook.
struct PassiveViewHandler;

impl HookHandler for PassiveViewHandler {}

/// `save-view-*` hooks: a failure triggers the rollback protocol instead
/// of failing the change outright.
struct SaveViewHandler;

impl HookHandler for SaveViewHandler {
    fn done(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        let original: Option<String> = {
            let st = ctx.state().lock();
            st.task(ctx.task())?.get("original-error")?
        };
        match original {
            // The rollback chain has finished; only now does the change
            // fail, surfacing the cause of it all.
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn error(&mut self, ctx: &HookContext, err: &anyhow::Error) -> (bool, Option<anyhow::Error>) {
        if ctx.setup().ignore_error {
            // Already a rollback hook: no rollback of rollbacks. Let the
            // runner swallow the failure.
            return (false, None);
        }
        match rollback_save_view(ctx, err) {
            Ok(()) => (true, None),
            Err(rollback_err) => (false, Some(rollback_err)),
        }
    }
}

/// Reverse the completed `save-view` phase after one of its hooks failed.
///
/// Walks the chain of `save-view-*` hook tasks backwards from the failing
/// one, appends a rollback re-run for each (failing hook first, then the
/// previously completed saves in reverse completion order), reparks the
/// failing task's dependents behind the last rollback, stores the original
/// error on that final task and drops the transaction's uncommitted deltas
/// so the re-runs see pristine data.
fn rollback_save_view(ctx: &HookContext, original: &anyhow::Error) -> anyhow::Result<()> {
    let state = ctx.state();
    let mut st = state.lock();
    let failing = ctx.task();
    let halt_tasks = st.halt_tasks(failing);

    let mut chain: Vec<HookSetup> = Vec::new();
    let mut cursor = Some(failing);
    while let Some(id) = cursor {
        let task = st.task(id)?;
        if task.kind() != RUN_HOOK_TASK_KIND {
            break;
        }
        let Some(setup) = task.get::<HookSetup>("hook-setup")? else {
            break;
        };
        if !setup.hook.starts_with("save-view-") {
            break;
        }
        cursor = task.wait_for().first().copied();
        chain.push(setup);
    }

    let change = st
        .task(failing)?
        .change()
        .ok_or_else(|| anyhow!("internal error: hook task {failing} is not part of a change"))?;
    let owner: TaskId = st
        .task(failing)?
        .get("tx-task")?
        .ok_or_else(|| anyhow!("internal error: hook task {failing} has no tx-task"))?;

    let mut last = failing;
    for setup in &chain {
        let rollback = st.new_task(
            RUN_HOOK_TASK_KIND,
            &format!(
                "Run hook {:?} of snap {:?} to roll back changes",
                setup.hook, setup.snap
            ),
        );
        {
            let task = st.task_mut(rollback)?;
            task.set(
                "hook-setup",
                &HookSetup {
                    ignore_error: true,
                    ..setup.clone()
                },
            )?;
            task.set("tx-task", &owner)?;
            task.wait_on(last);
        }
        st.add_task_to_change(change, rollback)?;
        last = rollback;
    }

    for halted in halt_tasks {
        st.task_mut(halted)?.wait_on(last);
    }
    st.task_mut(last)?.set("original-error", &original.to_string())?;

    let (_, tx) = stored_transaction(&st, failing)?;
    tx.clear(&st)?;
    st.task_mut(owner)?.set("confdb-transaction", &tx)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::{PlugRole, StaticRegistry};
    use crate::store;
    use crate::testing::Harness;
    use confdb_schema::{Databag as _, JsonDatabag, Path, SimpleSchema, SimpleView, View, ViewId};
    use confdb_state::Status;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn view_id() -> ViewId {
        ViewId::new("acc", "network", "wifi-setup")
    }

    fn wifi_view() -> Arc<dyn View> {
        Arc::new(SimpleView::new(view_id()))
    }

    fn schemas() -> StaticSchemas {
        StaticSchemas::new().with_schema(
            "acc",
            "network",
            SimpleSchema::new().with_view(SimpleView::new(view_id())),
        )
    }

    fn single_custodian() -> StaticRegistry {
        StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["change-view-wifi", "save-view-wifi"])
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn recording_invoker(harness: &Harness) -> Arc<Mutex<Vec<String>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        harness.hooks.set_invoker(Arc::new(move |ctx: &HookContext| {
            seen.lock()
                .push(format!("{}:{}", ctx.setup().snap, ctx.setup().hook));
            Ok(())
        }));
        calls
    }

    #[test]
    fn write_through_view_commits_and_releases_the_pair() {
        init_logging();
        let h = Harness::new(single_custodian(), schemas());
        let calls = recording_invoker(&h);

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let (change, done_rx) = handle.unwrap().commit().unwrap();

        // The write is tracked until the chain completes.
        {
            let st = h.state.lock();
            let txs = arbiter::ongoing_txs(&st, "acc", "network").unwrap().unwrap();
            assert!(txs.write_tx_id.is_some());
        }

        assert!(h.settle());
        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Done);
        assert_eq!(st.change(change).unwrap().kind(), "set-confdb");
        assert_eq!(
            st.change(change).unwrap().summary(),
            "Set confdb through \"acc/network/wifi-setup\""
        );
        let bag = store::read_databag(&st, "acc", "network").unwrap();
        assert_eq!(bag.get(&p("wifi.ssid")).unwrap(), json!("foo"));
        assert_eq!(arbiter::ongoing_txs(&st, "acc", "network").unwrap(), None);
        assert_eq!(
            calls.lock().as_slice(),
            &[
                "manager-snap:change-view-wifi".to_string(),
                "manager-snap:save-view-wifi".to_string(),
            ]
        );
        assert!(done_rx.try_recv().is_ok());
    }

    #[test]
    fn commit_validation_rejection_undoes_the_change() {
        let registry = single_custodian();
        let schemas = StaticSchemas::new().with_schema(
            "acc",
            "network",
            SimpleSchema::new()
                .with_view(SimpleView::new(view_id()))
                .allowing_top_level(["wifi"]),
        );
        let h = Harness::new(registry, schemas);

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("foo"), json!("bar")).unwrap();
        let (change, _) = handle.unwrap().commit().unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Error);
        let commit_id = st
            .change(change)
            .unwrap()
            .tasks()
            .iter()
            .copied()
            .find(|id| st.task(*id).unwrap().kind() == COMMIT_TASK_KIND)
            .unwrap();
        let commit_task = st.task(commit_id).unwrap();
        assert_eq!(commit_task.status(), Status::Error);
        assert!(commit_task.log().iter().any(|l| l.contains(
            "ERROR cannot accept top level element: map contains unexpected key \"foo\""
        )));
        // The undo path released the pair and nothing was persisted.
        assert_eq!(arbiter::ongoing_txs(&st, "acc", "network").unwrap(), None);
        assert!(store::read_databag(&st, "acc", "network").unwrap().is_empty());
    }

    #[test]
    fn change_view_hook_can_reject_the_transaction() {
        let h = Harness::new(single_custodian(), schemas());
        let mgr = h.mgr.clone();
        let view = wifi_view();
        h.hooks.set_invoker(Arc::new(move |ctx: &HookContext| {
            if ctx.setup().hook.starts_with("change-view-") {
                let (tx, _) = mgr.transaction_to_set(Some(ctx), view.clone())?;
                tx.abort("manager-snap", "undesired changes");
            }
            Ok(())
        }));

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let (change, _) = handle.unwrap().commit().unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Error);
        let hook_task = st
            .change(change)
            .unwrap()
            .tasks()
            .iter()
            .copied()
            .find(|id| st.task(*id).unwrap().kind() == RUN_HOOK_TASK_KIND)
            .unwrap();
        let log = st.task(hook_task).unwrap().log().join("\n");
        assert!(log.contains(
            "cannot change confdb through view acc/network/wifi-setup: \
             snap \"manager-snap\" rejected the changes: undesired changes"
        ));
        assert!(store::read_databag(&st, "acc", "network").unwrap().is_empty());
        assert_eq!(arbiter::ongoing_txs(&st, "acc", "network").unwrap(), None);
    }

    #[test]
    fn hook_writes_are_carried_into_the_commit() {
        let h = Harness::new(single_custodian(), schemas());
        let mgr = h.mgr.clone();
        let view = wifi_view();
        h.hooks.set_invoker(Arc::new(move |ctx: &HookContext| {
            if ctx.setup().hook.starts_with("change-view-") {
                let (tx, handle) = mgr.transaction_to_set(Some(ctx), view.clone())?;
                assert!(handle.is_none());
                tx.set(&p("wifi.psk"), json!("secret"))?;
            }
            Ok(())
        }));

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let (change, _) = handle.unwrap().commit().unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Done);
        let bag = store::read_databag(&st, "acc", "network").unwrap();
        assert_eq!(bag.get(&p("wifi.ssid")).unwrap(), json!("foo"));
        assert_eq!(bag.get(&p("wifi.psk")).unwrap(), json!("secret"));
    }

    #[test]
    fn observer_hook_failures_do_not_fail_the_change() {
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_plug(&view_id(), "watcher-snap", "wifi", PlugRole::Observer)
            .with_hooks("manager-snap", ["change-view-wifi"])
            .with_hooks("watcher-snap", ["observe-view-wifi"]);
        let h = Harness::new(registry, schemas());
        h.hooks.set_invoker(Arc::new(|ctx: &HookContext| {
            if ctx.setup().hook.starts_with("observe-view-") {
                anyhow::bail!("observer crashed");
            }
            Ok(())
        }));

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let (change, _) = handle.unwrap().commit().unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Done);
        assert_eq!(
            store::read_databag(&st, "acc", "network")
                .unwrap()
                .get(&p("wifi.ssid"))
                .unwrap(),
            json!("foo")
        );
    }

    #[test]
    fn save_view_failure_rolls_back_completed_saves() {
        init_logging();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "first-snap", "setup", PlugRole::Custodian)
            .with_plug(&view_id(), "second-snap", "setup", PlugRole::Custodian)
            .with_hooks("first-snap", ["save-view-setup"])
            .with_hooks("second-snap", ["save-view-setup"]);
        let h = Harness::new(registry, schemas());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let failed_once = Arc::new(AtomicBool::new(false));
        {
            let calls = calls.clone();
            let failed_once = failed_once.clone();
            h.hooks.set_invoker(Arc::new(move |ctx: &HookContext| {
                calls
                    .lock()
                    .push(format!("{}:{}", ctx.setup().snap, ctx.setup().hook));
                if ctx.setup().snap == "second-snap"
                    && !failed_once.swap(true, Ordering::SeqCst)
                {
                    anyhow::bail!("failed to save");
                }
                Ok(())
            }));
        }

        let (tx, handle) = h.mgr.transaction_to_set(None, wifi_view()).unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let (change, _) = handle.unwrap().commit().unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Error);

        // The failing hook runs again first, then the completed saves in
        // reverse order.
        assert_eq!(
            calls.lock().as_slice(),
            &[
                "first-snap:save-view-setup".to_string(),
                "second-snap:save-view-setup".to_string(),
                "second-snap:save-view-setup".to_string(),
                "first-snap:save-view-setup".to_string(),
            ]
        );

        // Two rollback tasks were appended to the change, carrying the
        // original error only on the last one.
        let tasks = st.change(change).unwrap().tasks().to_vec();
        let rollbacks: Vec<TaskId> = tasks
            .iter()
            .copied()
            .filter(|id| {
                let task = st.task(*id).unwrap();
                task.kind() == RUN_HOOK_TASK_KIND
                    && task
                        .get::<HookSetup>("hook-setup")
                        .unwrap()
                        .map(|s| s.ignore_error)
                        .unwrap_or(false)
            })
            .collect();
        assert_eq!(rollbacks.len(), 2);
        let setups: Vec<HookSetup> = rollbacks
            .iter()
            .map(|id| st.task(*id).unwrap().get("hook-setup").unwrap().unwrap())
            .collect();
        assert_eq!(setups[0].snap, "second-snap");
        assert_eq!(setups[1].snap, "first-snap");
        assert!(setups.iter().all(|s| s.hook == "save-view-setup"));
        assert!(!st.task(rollbacks[0]).unwrap().has("original-error"));
        assert_eq!(
            st.task(rollbacks[1])
                .unwrap()
                .get::<String>("original-error")
                .unwrap(),
            Some("failed to save".to_string())
        );

        // The final rollback surfaced the original error; the commit task
        // was parked behind it and held.
        let final_log = st.task(rollbacks[1]).unwrap().log().join("\n");
        assert!(final_log.contains("ERROR failed to save"));
        let commit_id = tasks
            .iter()
            .copied()
            .find(|id| st.task(*id).unwrap().kind() == COMMIT_TASK_KIND)
            .unwrap();
        assert_eq!(st.task(commit_id).unwrap().status(), Status::Hold);
        assert!(st
            .task(commit_id)
            .unwrap()
            .wait_for()
            .contains(&rollbacks[1]));

        // The transaction's deltas were dropped before the re-runs.
        let stored: Transaction = st
            .task(commit_id)
            .unwrap()
            .get("confdb-transaction")
            .unwrap()
            .unwrap();
        assert_eq!(stored.delta_count(), 0);

        // Nothing leaked: databag untouched, pair released.
        assert!(store::read_databag(&st, "acc", "network").unwrap().is_empty());
        assert_eq!(arbiter::ongoing_txs(&st, "acc", "network").unwrap(), None);
    }

    #[test]
    fn load_change_task_publishes_values_in_api_data() {
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["load-view-wifi"]);
        let h = Harness::new(registry, schemas());
        {
            let mut st = h.state.lock();
            let mut bag = JsonDatabag::new();
            bag.set(&p("wifi.ssid"), json!("foo")).unwrap();
            store::write_databag(&mut st, bag, "acc", "network").unwrap();
        }

        let change = h
            .mgr
            .load_async(wifi_view(), &["wifi.ssid".to_string()], None)
            .unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        assert_eq!(st.change_status(change).unwrap(), Status::Done);
        let api: Value = st.change(change).unwrap().get("api-data").unwrap().unwrap();
        assert_eq!(api, json!({"values": {"wifi.ssid": "foo"}}));
        assert_eq!(arbiter::ongoing_txs(&st, "acc", "network").unwrap(), None);
    }

    #[test]
    fn load_change_task_publishes_no_data_as_a_value_level_error() {
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["load-view-wifi"]);
        let h = Harness::new(registry, schemas());

        let change = h
            .mgr
            .load_async(wifi_view(), &["wifi.ssid".to_string()], None)
            .unwrap();
        assert!(h.settle());

        let st = h.state.lock();
        // The chain itself succeeds; the miss is data, not failure.
        assert_eq!(st.change_status(change).unwrap(), Status::Done);
        let api: Value = st.change(change).unwrap().get("api-data").unwrap().unwrap();
        assert_eq!(api["error"]["kind"], json!("no-data"));
        assert_eq!(
            api["error"]["message"],
            json!("cannot get \"wifi.ssid\" through acc/network/wifi-setup: no data")
        );
    }
}
