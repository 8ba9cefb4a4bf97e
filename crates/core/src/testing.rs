//! A preassembled engine for tests and experiments: state, runner, hook
//! manager and confdb manager wired together over in-memory seams.

use std::sync::Arc;
use std::time::Duration;

use confdb_state::{HookManager, State, TaskRunner};

use crate::custodian::StaticRegistry;
use crate::manager::{ConfdbManager, StaticSchemas};

pub struct Harness {
    pub state: State,
    pub runner: TaskRunner,
    pub hooks: HookManager,
    pub mgr: ConfdbManager,
}

impl Harness {
    pub fn new(registry: StaticRegistry, schemas: StaticSchemas) -> Self {
        let state = State::new();
        let runner = TaskRunner::new(state.clone());
        let hooks = HookManager::new(state.clone(), &runner);
        let mgr = ConfdbManager::new(
            state.clone(),
            &runner,
            &hooks,
            Arc::new(schemas),
            Arc::new(registry),
        );
        Harness {
            state,
            runner,
            hooks,
            mgr,
        }
    }

    /// Drive the runner synchronously until quiescence.
    pub fn settle(&self) -> bool {
        self.runner.settle(Duration::from_secs(10))
    }
}
