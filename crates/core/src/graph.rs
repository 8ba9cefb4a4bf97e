use std::collections::HashSet;

use confdb_schema::{Schema, View, ViewId};
use confdb_state::{HookSetup, StateData, TaskId};
use serde_json::Value;

use crate::custodian::{custodians_for_view, observers_for_views, PlugRegistry};
use crate::error::ConfdbError;
use crate::transaction::Transaction;
use crate::{CLEAR_ON_ERROR_TASK_KIND, CLEAR_TASK_KIND, COMMIT_TASK_KIND, RUN_HOOK_TASK_KIND};

/// A linear chain of tasks with its two named edges: the commit task (for
/// writes) and the trailing clear task. Every non-commit task carries a
/// `tx-task` back-reference to the task owning the transaction payload.
#[derive(Debug)]
pub struct TaskSet {
    pub tasks: Vec<TaskId>,
    pub commit_task: Option<TaskId>,
    pub clear_task: TaskId,
}

fn hook_task(
    st: &mut StateData,
    snap: &str,
    hook: &str,
    ignore_error: bool,
) -> Result<TaskId, ConfdbError> {
    let id = st.new_task(
        RUN_HOOK_TASK_KIND,
        &format!("Run hook {hook:?} of snap {snap:?}"),
    );
    st.task_mut(id)?.set(
        "hook-setup",
        &HookSetup {
            snap: snap.to_string(),
            hook: hook.to_string(),
            optional: false,
            ignore_error,
        },
    )?;
    Ok(id)
}

fn link_chain(st: &mut StateData, tasks: &[TaskId]) -> Result<(), ConfdbError> {
    for pair in tasks.windows(2) {
        st.task_mut(pair[1])?.wait_on(pair[0]);
    }
    Ok(())
}

/// Build the write-path chain: error cleanup, custodian change-view hooks,
/// custodian save-view hooks, observer notifications, commit, cleanup.
pub fn change_confdb_tasks(
    st: &mut StateData,
    registry: &dyn PlugRegistry,
    schema: &dyn Schema,
    tx: &Transaction,
    view: &dyn View,
    calling_snap: &str,
) -> Result<TaskSet, ConfdbError> {
    let view_id = view.id();
    let custodians = custodians_for_view(registry, view_id);
    if custodians.is_empty() {
        return Err(ConfdbError::NoCustodian {
            view: view_id.clone(),
        });
    }

    let paths = tx.altered_paths();
    if view.write_affects_ephemeral(&paths)
        && custodians.with_hook(registry, "save-view").next().is_none()
    {
        return Err(ConfdbError::EphemeralWithoutSave {
            view: view_id.clone(),
        });
    }

    let change_hooks: Vec<(String, String)> = custodians
        .with_hook(registry, "change-view")
        .map(|(snap, hook)| (snap.to_string(), hook))
        .collect();
    let save_hooks: Vec<(String, String)> = custodians
        .with_hook(registry, "save-view")
        .map(|(snap, hook)| (snap.to_string(), hook))
        .collect();

    // Snaps watching any view the write lands in, minus the custodians
    // themselves and the snap making the change.
    let mut affected: Vec<ViewId> = Vec::new();
    for path in &paths {
        for v in schema.views_affected_by_path(path) {
            if !affected.contains(v.id()) {
                affected.push(v.id().clone());
            }
        }
    }
    let mut skip: HashSet<String> = custodians.names.iter().cloned().collect();
    if !calling_snap.is_empty() {
        skip.insert(calling_snap.to_string());
    }
    let observers: Vec<(String, String)> = observers_for_views(registry, affected.iter(), &skip)
        .into_iter()
        .filter_map(|p| {
            let hook = format!("observe-view-{}", p.plug);
            registry.has_hook(&p.snap, &hook).then_some((p.snap, hook))
        })
        .collect();

    let mut tasks = Vec::new();
    tasks.push(st.new_task(
        CLEAR_ON_ERROR_TASK_KIND,
        "Clear the ongoing confdb transaction on error",
    ));
    for (snap, hook) in &change_hooks {
        tasks.push(hook_task(st, snap, hook, false)?);
    }
    for (snap, hook) in &save_hooks {
        tasks.push(hook_task(st, snap, hook, false)?);
    }
    for (snap, hook) in &observers {
        tasks.push(hook_task(st, snap, hook, true)?);
    }

    let commit = st.new_task(
        COMMIT_TASK_KIND,
        &format!("Commit changes to confdb ({}/{})", tx.account(), tx.confdb()),
    );
    {
        let task = st.task_mut(commit)?;
        task.set("confdb-transaction", tx)?;
        task.set("view-name", &view_id.view)?;
    }
    tasks.push(commit);
    tasks.push(st.new_task(CLEAR_TASK_KIND, "Clear the ongoing confdb transaction"));

    link_chain(st, &tasks)?;
    for id in &tasks {
        if *id != commit {
            st.task_mut(*id)?.set("tx-task", &commit)?;
        }
    }

    let clear_task = tasks[tasks.len() - 1];
    Ok(TaskSet {
        tasks,
        commit_task: Some(commit),
        clear_task,
    })
}

/// Build the read-path chain: error cleanup, custodian load-view hooks,
/// custodian query-view hooks, cleanup. Returns `None` when no custodian
/// ships a load or query hook: the caller may read the databag directly.
pub fn load_confdb_tasks(
    st: &mut StateData,
    registry: &dyn PlugRegistry,
    tx: &Transaction,
    view: &dyn View,
    requests: &[String],
    constraints: Option<&Value>,
) -> Result<Option<TaskSet>, ConfdbError> {
    let view_id = view.id();
    let custodians = custodians_for_view(registry, view_id);
    if custodians.is_empty() {
        return Err(ConfdbError::NoCustodian {
            view: view_id.clone(),
        });
    }

    let load_hooks: Vec<(String, String)> = custodians
        .with_hook(registry, "load-view")
        .map(|(snap, hook)| (snap.to_string(), hook))
        .collect();
    if view.read_affects_ephemeral(requests, constraints) && load_hooks.is_empty() {
        return Err(ConfdbError::EphemeralWithoutLoad {
            view: view_id.clone(),
        });
    }
    let query_hooks: Vec<(String, String)> = custodians
        .with_hook(registry, "query-view")
        .map(|(snap, hook)| (snap.to_string(), hook))
        .collect();
    if load_hooks.is_empty() && query_hooks.is_empty() {
        return Ok(None);
    }

    let mut tasks = Vec::new();
    tasks.push(st.new_task(
        CLEAR_ON_ERROR_TASK_KIND,
        "Clear the ongoing confdb transaction on error",
    ));
    for (snap, hook) in load_hooks.iter().chain(&query_hooks) {
        tasks.push(hook_task(st, snap, hook, false)?);
    }
    let clear = st.new_task(CLEAR_TASK_KIND, "Clear the ongoing confdb transaction");
    st.task_mut(clear)?.set("confdb-transaction", tx)?;
    tasks.push(clear);

    link_chain(st, &tasks)?;
    for id in &tasks {
        if *id != clear {
            st.task_mut(*id)?.set("tx-task", &clear)?;
        }
    }

    Ok(Some(TaskSet {
        tasks,
        commit_task: None,
        clear_task: clear,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::{PlugRole, StaticRegistry};
    use confdb_schema::{Path, SimpleSchema, SimpleView};
    use confdb_state::State;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn view_id() -> ViewId {
        ViewId::new("acc", "network", "wifi-setup")
    }

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn kinds_and_hooks(st: &StateData, ts: &TaskSet) -> Vec<String> {
        ts.tasks
            .iter()
            .map(|id| {
                let task = st.task(*id).unwrap();
                match task.get::<HookSetup>("hook-setup").unwrap() {
                    Some(setup) => format!("{}:{}", setup.snap, setup.hook),
                    None => task.kind().to_string(),
                }
            })
            .collect()
    }

    #[test]
    fn write_chain_has_the_documented_shape() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "second-snap", "wifi", PlugRole::Custodian)
            .with_plug(&view_id(), "first-snap", "wifi", PlugRole::Custodian)
            .with_plug(&view_id(), "watcher-snap", "wifi", PlugRole::Observer)
            .with_hooks("first-snap", ["change-view-wifi", "save-view-wifi"])
            .with_hooks("second-snap", ["change-view-wifi"])
            .with_hooks("watcher-snap", ["observe-view-wifi"]);
        let schema = SimpleSchema::new().with_view(SimpleView::new(view_id()));
        let view = SimpleView::new(view_id());

        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        let ts = change_confdb_tasks(&mut st, &registry, &schema, &tx, &view, "").unwrap();

        assert_eq!(
            kinds_and_hooks(&st, &ts),
            vec![
                "clear-confdb-tx-on-error",
                "first-snap:change-view-wifi",
                "second-snap:change-view-wifi",
                "first-snap:save-view-wifi",
                "watcher-snap:observe-view-wifi",
                "commit-confdb-tx",
                "clear-confdb-tx",
            ]
        );

        // Linear chain, each task waiting on its predecessor.
        for pair in ts.tasks.windows(2) {
            assert_eq!(st.task(pair[1]).unwrap().wait_for(), &[pair[0]]);
        }

        // The commit task owns the transaction; everything else points at it.
        let commit = ts.commit_task.unwrap();
        assert!(st.task(commit).unwrap().has("confdb-transaction"));
        for id in &ts.tasks {
            if *id != commit {
                assert_eq!(
                    st.task(*id).unwrap().get::<TaskId>("tx-task").unwrap(),
                    Some(commit)
                );
            }
        }

        // Observer failures are ignorable, custodian ones are not.
        let observe = ts.tasks[4];
        let setup: HookSetup = st.task(observe).unwrap().get("hook-setup").unwrap().unwrap();
        assert!(setup.ignore_error);
        let change = ts.tasks[1];
        let setup: HookSetup = st.task(change).unwrap().get("hook-setup").unwrap().unwrap();
        assert!(!setup.ignore_error);
    }

    #[test]
    fn calling_snap_is_not_notified() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_plug(&view_id(), "caller-snap", "wifi", PlugRole::Observer)
            .with_hooks("manager-snap", ["change-view-wifi"])
            .with_hooks("caller-snap", ["observe-view-wifi"]);
        let schema = SimpleSchema::new().with_view(SimpleView::new(view_id()));
        let view = SimpleView::new(view_id());

        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        tx.set(&p("wifi.ssid"), json!("x")).unwrap();
        let ts =
            change_confdb_tasks(&mut st, &registry, &schema, &tx, &view, "caller-snap").unwrap();
        assert!(!kinds_and_hooks(&st, &ts)
            .iter()
            .any(|k| k.starts_with("caller-snap:")));
    }

    #[test]
    fn write_requires_a_custodian() {
        let state = State::new();
        let registry = StaticRegistry::new().with_plug(
            &view_id(),
            "watcher-snap",
            "wifi",
            PlugRole::Observer,
        );
        let schema = SimpleSchema::new();
        let view = SimpleView::new(view_id());
        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        let err = change_confdb_tasks(&mut st, &registry, &schema, &tx, &view, "").unwrap_err();
        assert_eq!(err.kind(), "no-custodian");
    }

    #[test]
    fn ephemeral_write_requires_a_save_view_hook() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["change-view-wifi"]);
        let schema = SimpleSchema::new();
        let view = SimpleView::new(view_id()).with_ephemeral([p("eph")]);

        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        tx.set(&p("eph.status"), json!("up")).unwrap();
        let err = change_confdb_tasks(&mut st, &registry, &schema, &tx, &view, "").unwrap_err();
        assert_eq!(err.kind(), "ephemeral-without-save");
        assert!(err
            .to_string()
            .contains("write might cover ephemeral data but no custodian has a save-view hook"));
    }

    #[test]
    fn read_chain_carries_the_transaction_on_the_clear_task() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["load-view-wifi", "query-view-wifi"]);
        let view = SimpleView::new(view_id());

        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        let ts = load_confdb_tasks(&mut st, &registry, &tx, &view, &[], None)
            .unwrap()
            .unwrap();
        assert_eq!(
            kinds_and_hooks(&st, &ts),
            vec![
                "clear-confdb-tx-on-error",
                "manager-snap:load-view-wifi",
                "manager-snap:query-view-wifi",
                "clear-confdb-tx",
            ]
        );
        assert!(ts.commit_task.is_none());
        assert!(st.task(ts.clear_task).unwrap().has("confdb-transaction"));
        for id in &ts.tasks {
            if *id != ts.clear_task {
                assert_eq!(
                    st.task(*id).unwrap().get::<TaskId>("tx-task").unwrap(),
                    Some(ts.clear_task)
                );
            }
        }
    }

    #[test]
    fn read_without_hooks_needs_no_tasks() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks("manager-snap", ["change-view-wifi", "save-view-wifi"]);
        let view = SimpleView::new(view_id());
        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        let ts = load_confdb_tasks(&mut st, &registry, &tx, &view, &[], None).unwrap();
        assert!(ts.is_none());
    }

    #[test]
    fn ephemeral_read_requires_a_load_view_hook() {
        let state = State::new();
        let registry = StaticRegistry::new()
            .with_plug(&view_id(), "manager-snap", "wifi", PlugRole::Custodian)
            .with_hooks(
                "manager-snap",
                ["observe-view-wifi", "query-view-wifi", "save-view-wifi", "change-view-wifi"],
            );
        let view = SimpleView::new(view_id()).with_ephemeral([p("eph")]);
        let mut st = state.lock();
        let tx = Transaction::new(&st, "acc", "network").unwrap();
        let err = load_confdb_tasks(&mut st, &registry, &tx, &view, &["eph".to_string()], None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot schedule tasks to access acc/network/wifi-setup: read might cover ephemeral data but no custodian has a load-view hook"
        );
    }
}
