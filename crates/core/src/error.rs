use std::time::Duration;

use confdb_schema::{DatabagError, PathError, SchemaError, ViewError, ViewId};
use confdb_state::{StateError, TaskId};
use thiserror::Error;

fn no_data_msg(view: &ViewId, requests: &[String]) -> String {
    if requests.is_empty() {
        return format!("cannot get {view}: no data");
    }
    let quoted = requests
        .iter()
        .map(|r| format!("{r:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("cannot get {quoted} through {view}: no data")
}

#[derive(Debug, Error)]
pub enum ConfdbError {
    #[error("cannot access aborted transaction (snap {snap:?}: {reason})")]
    AbortedTransaction { snap: String, reason: String },

    #[error(transparent)]
    SchemaValidation(#[from] SchemaError),

    #[error("cannot access confdb databags: {0}")]
    DatabagIo(#[source] StateError),

    #[error(transparent)]
    Databag(#[from] DatabagError),

    #[error(transparent)]
    View(#[from] ViewError),

    #[error("cannot access confdb through view {view}: no custodian snap connected")]
    NoCustodian { view: ViewId },

    #[error(
        "cannot schedule tasks to access {view}: write might cover ephemeral data but no custodian has a save-view hook"
    )]
    EphemeralWithoutSave { view: ViewId },

    #[error(
        "cannot schedule tasks to access {view}: read might cover ephemeral data but no custodian has a load-view hook"
    )]
    EphemeralWithoutLoad { view: ViewId },

    /// A new writer was rejected because a transaction is in flight.
    #[error("cannot set confdb through view {view}: ongoing transaction")]
    WriteBlocked { view: ViewId, blocked_by_write: bool },

    /// A new reader was rejected because a write is in flight.
    #[error("cannot get confdb through view {view}: ongoing write transaction")]
    ReadBlocked { view: ViewId },

    #[error("cannot access confdb through view {view}: ongoing transaction for {account}/{confdb}")]
    CrossConfdbAccess {
        view: ViewId,
        account: String,
        confdb: String,
    },

    #[error(
        "cannot get confdb through view {view}: timed out after {}s waiting for transaction",
        .timeout.as_secs()
    )]
    LoadTimeout { view: ViewId, timeout: Duration },

    #[error("cannot get confdb through view {view}: {cause}")]
    LoadFailed { view: ViewId, cause: String },

    #[error("{}", no_data_msg(.view, .requests))]
    NoData { view: ViewId, requests: Vec<String> },

    #[error("cannot change confdb through view {view}: snap {snap:?} rejected the changes: {reason}")]
    HookRejection {
        view: ViewId,
        snap: String,
        reason: String,
    },

    #[error("cannot start {attempt} transaction for {account}/{confdb}: a write transaction is ongoing")]
    WriteOngoing {
        attempt: &'static str,
        account: String,
        confdb: String,
    },

    #[error("cannot start write transaction for {account}/{confdb}: read transactions are ongoing")]
    ReadsOngoing { account: String, confdb: String },

    #[error("no transaction with id {id} ongoing for {account}/{confdb}")]
    UnknownOngoingTransaction {
        id: TaskId,
        account: String,
        confdb: String,
    },

    #[error("cannot find confdb {account}/{confdb}")]
    UnknownConfdb { account: String, confdb: String },

    #[error("cannot find view {view} in confdb {account}/{confdb}")]
    UnknownView {
        account: String,
        confdb: String,
        view: String,
    },

    #[error("cannot parse stored path: {0}")]
    Path(#[from] PathError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConfdbError {
    /// Stable kind strings, used in a change's `api-data` error payload.
    pub fn kind(&self) -> &'static str {
        use ConfdbError::*;
        match self {
            AbortedTransaction { .. } => "aborted-transaction",
            SchemaValidation(_) => "schema-validation",
            DatabagIo(_) => "databag-io",
            Databag(DatabagError::NoData(_)) => "no-data",
            Databag(_) => "databag-io",
            View(ViewError::NoData { .. }) | NoData { .. } => "no-data",
            View(_) => "bad-request",
            NoCustodian { .. } => "no-custodian",
            EphemeralWithoutSave { .. } => "ephemeral-without-save",
            EphemeralWithoutLoad { .. } => "ephemeral-without-load",
            WriteBlocked {
                blocked_by_write: true,
                ..
            } => "ongoing-write",
            WriteBlocked { .. } => "ongoing-read",
            ReadBlocked { .. } => "ongoing-write",
            WriteOngoing { .. } => "ongoing-write",
            ReadsOngoing { .. } => "ongoing-read",
            CrossConfdbAccess { .. } => "cross-confdb-access",
            LoadTimeout { .. } => "load-timeout",
            LoadFailed { .. } => "load-failed",
            HookRejection { .. } => "hook-rejection",
            UnknownOngoingTransaction { .. } => "unknown-transaction",
            UnknownConfdb { .. } | UnknownView { .. } => "not-found",
            Path(_) | State(_) | Internal(_) => "internal",
        }
    }
}
