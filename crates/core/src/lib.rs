//! The confdb transaction engine: schema-validated configuration databases
//! owned by (account, confdb) pairs, read and written through views by
//! DAG-scheduled pipelines of custodian hooks, with single-writer /
//! multi-reader isolation and atomic rollback on failure.

pub mod arbiter;
pub mod custodian;
pub mod error;
pub mod graph;
pub mod manager;
pub mod orchestrate;
pub mod store;
pub mod testing;
pub mod transaction;
pub mod view;

pub use error::ConfdbError;
pub use manager::{ConfdbManager, SchemaResolver, StaticSchemas};
pub use orchestrate::CommitHandle;
pub use transaction::Transaction;

/// Task kinds the engine registers handlers for.
pub const COMMIT_TASK_KIND: &str = "commit-confdb-tx";
pub const CLEAR_TASK_KIND: &str = "clear-confdb-tx";
pub const CLEAR_ON_ERROR_TASK_KIND: &str = "clear-confdb-tx-on-error";
pub const LOAD_CHANGE_TASK_KIND: &str = "load-confdb-change";
pub const RUN_HOOK_TASK_KIND: &str = "run-hook";

/// Change kinds the engine emits.
pub const SET_CONFDB_CHANGE_KIND: &str = "set-confdb";
pub const GET_CONFDB_CHANGE_KIND: &str = "get-confdb";
