//! In-process host state machinery: a lock-guarded key/value state with
//! changes and tasks, a task runner executing per-kind do/undo handlers
//! over a dependency graph, and hook dispatch with per-invocation handlers.

pub mod hook;
pub mod runner;
pub mod state;
pub mod task;

pub use hook::{HookContext, HookHandler, HookInvoker, HookManager, HookSetup};
pub use runner::{RunnerHandle, TaskRunner};
pub use state::{State, StateData, StateError, StatusHandlerId};
pub use task::{Change, ChangeId, Status, Task, TaskId};
