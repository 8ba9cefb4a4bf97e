use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::runner::TaskRunner;
use crate::state::{State, StateData};
use crate::task::{ChangeId, TaskId};

/// Payload of a `run-hook` task: which hook of which snap to run, and how
/// to treat failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookSetup {
    pub snap: String,
    pub hook: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub ignore_error: bool,
}

/// Per-invocation hook lifecycle callbacks, minted by a registered factory.
///
/// `error` is consulted when the hook body itself fails: it may return a
/// replacement error, or ask for the failure to be swallowed (first tuple
/// element). Errors returned from `before` or `done` always fail the task,
/// regardless of the setup's `ignore-error`.
pub trait HookHandler: Send {
    fn before(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn done(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn error(&mut self, ctx: &HookContext, err: &anyhow::Error) -> (bool, Option<anyhow::Error>) {
        let _ = (ctx, err);
        (false, None)
    }
}

struct DefaultHandler;

impl HookHandler for DefaultHandler {}

pub type HandlerFactory = Arc<dyn Fn(&HookContext) -> Box<dyn HookHandler> + Send + Sync>;

/// Runs the hook body. Production launches the snap's hook subprocess;
/// that is outside this engine, so the default invoker does nothing and
/// tests plug in closures.
pub trait HookInvoker: Send + Sync {
    fn invoke(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

impl<F> HookInvoker for F
where
    F: Fn(&HookContext) -> anyhow::Result<()> + Send + Sync,
{
    fn invoke(&self, ctx: &HookContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

fn noop_invoker() -> Arc<dyn HookInvoker> {
    Arc::new(|_: &HookContext| Ok(()))
}

type OnDoneFn = Box<dyn FnOnce(&mut StateData) -> anyhow::Result<()> + Send>;

/// Ambient scope of a running hook: the task representing it, the setup,
/// callbacks to run when the hook completes successfully, and a typed
/// cache shared by engine calls made from within the same hook.
pub struct HookContext {
    state: State,
    task: TaskId,
    setup: HookSetup,
    on_done: Mutex<Vec<OnDoneFn>>,
    cache: Mutex<HashMap<&'static str, Box<dyn Any + Send>>>,
}

impl HookContext {
    fn new(state: State, task: TaskId, setup: HookSetup) -> Self {
        HookContext {
            state,
            task,
            setup,
            on_done: Mutex::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn setup(&self) -> &HookSetup {
        &self.setup
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.state.lock().task(self.task).ok().and_then(|t| t.change())
    }

    /// Register a callback to run (under the state lock) once the hook
    /// finishes successfully.
    pub fn on_done(
        &self,
        f: impl FnOnce(&mut StateData) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.on_done.lock().push(Box::new(f));
    }

    pub(crate) fn fire_on_done(&self) -> anyhow::Result<()> {
        let callbacks: Vec<OnDoneFn> = std::mem::take(&mut *self.on_done.lock());
        let mut st = self.state.lock();
        for cb in callbacks {
            cb(&mut st)?;
        }
        Ok(())
    }

    pub fn cache_set<T: Send + 'static>(&self, key: &'static str, value: T) {
        self.cache.lock().insert(key, Box::new(value));
    }

    pub fn cache_get<T: Clone + Send + 'static>(&self, key: &'static str) -> Option<T> {
        self.cache
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }
}

/// Executes `run-hook` tasks: reads the hook setup, mints a handler from
/// the longest matching registered pattern, runs the hook body through the
/// pluggable invoker, and drives the handler lifecycle.
#[derive(Clone)]
pub struct HookManager {
    inner: Arc<HookManagerInner>,
}

struct HookManagerInner {
    state: State,
    patterns: RwLock<Vec<(String, HandlerFactory)>>,
    invoker: RwLock<Arc<dyn HookInvoker>>,
}

impl HookManager {
    pub fn new(state: State, runner: &TaskRunner) -> Self {
        let mgr = HookManager {
            inner: Arc::new(HookManagerInner {
                state,
                patterns: RwLock::new(Vec::new()),
                invoker: RwLock::new(noop_invoker()),
            }),
        };
        let hooks = mgr.clone();
        runner.add_handler(
            "run-hook",
            TaskRunner::handler(move |_, task| hooks.run_hook(task)),
            None,
        );
        mgr
    }

    /// Register a handler factory for hook names starting with `prefix`
    /// (e.g. `change-view-`). The longest matching prefix wins.
    pub fn register_prefix(&self, prefix: &str, factory: HandlerFactory) {
        self.inner
            .patterns
            .write()
            .push((prefix.to_string(), factory));
    }

    pub fn set_invoker(&self, invoker: Arc<dyn HookInvoker>) {
        *self.inner.invoker.write() = invoker;
    }

    fn handler_for(&self, ctx: &HookContext) -> Box<dyn HookHandler> {
        let patterns = self.inner.patterns.read();
        let factory = patterns
            .iter()
            .filter(|(p, _)| ctx.setup.hook.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, f)| f.clone());
        match factory {
            Some(f) => f(ctx),
            None => Box::new(DefaultHandler),
        }
    }

    fn run_hook(&self, task: TaskId) -> anyhow::Result<()> {
        let setup: HookSetup = {
            let st = self.inner.state.lock();
            st.task(task)?
                .get("hook-setup")?
                .ok_or_else(|| anyhow!("internal error: task {task} has no hook-setup"))?
        };
        let ctx = HookContext::new(self.inner.state.clone(), task, setup.clone());
        let mut handler = self.handler_for(&ctx);

        handler.before(&ctx)?;
        let invoker = self.inner.invoker.read().clone();
        match invoker.invoke(&ctx) {
            Ok(()) => {
                handler.done(&ctx)?;
                ctx.fire_on_done()?;
                Ok(())
            }
            Err(err) => {
                let (ignore, handler_err) = handler.error(&ctx, &err);
                if let Some(err) = handler_err {
                    return Err(err);
                }
                if ignore {
                    return Ok(());
                }
                if setup.ignore_error {
                    log::warn!(
                        "ignoring failure in hook {:?} of snap {:?}: {err:#}",
                        setup.hook,
                        setup.snap
                    );
                    let mut st = self.inner.state.lock();
                    st.task_mut(task)?
                        .add_log(format!("ignoring failure in hook {:?}: {err:#}", setup.hook));
                    return Ok(());
                }
                Err(err)
            }
        }
    }
}
