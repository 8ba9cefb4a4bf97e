use std::collections::BTreeMap;

use confdb_state::{StateData, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::ConfdbError;

/// State key tracking in-flight transactions:
/// `"account/confdb" -> { read-tx-ids, write-tx-id }`.
pub const ONGOING_TXS_KEY: &str = "confdb-ongoing-txs";

/// In-flight transactions for one (account, confdb) pair. At most one
/// write; reads and the write are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OngoingTxs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_tx_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_tx_id: Option<TaskId>,
}

impl OngoingTxs {
    fn is_empty(&self) -> bool {
        self.read_tx_ids.is_empty() && self.write_tx_id.is_none()
    }
}

type OngoingMap = BTreeMap<String, OngoingTxs>;

fn key(account: &str, confdb: &str) -> String {
    format!("{account}/{confdb}")
}

fn read_map(st: &StateData) -> Result<OngoingMap, ConfdbError> {
    Ok(st.get(ONGOING_TXS_KEY)?.unwrap_or_default())
}

fn write_map(st: &mut StateData, map: &OngoingMap) -> Result<(), ConfdbError> {
    if map.is_empty() {
        st.remove(ONGOING_TXS_KEY);
        Ok(())
    } else {
        st.set(ONGOING_TXS_KEY, map).map_err(ConfdbError::from)
    }
}

/// The in-flight record for `(account, confdb)`, if any.
pub fn ongoing_txs(
    st: &StateData,
    account: &str,
    confdb: &str,
) -> Result<Option<OngoingTxs>, ConfdbError> {
    Ok(read_map(st)?.remove(&key(account, confdb)))
}

/// A read may start unless a write is in flight.
pub fn can_start_read_tx(st: &StateData, account: &str, confdb: &str) -> Result<bool, ConfdbError> {
    Ok(ongoing_txs(st, account, confdb)?
        .map_or(true, |txs| txs.write_tx_id.is_none()))
}

/// A write may start only with nothing else in flight.
pub fn can_start_write_tx(st: &StateData, account: &str, confdb: &str) -> Result<bool, ConfdbError> {
    Ok(ongoing_txs(st, account, confdb)?.map_or(true, |txs| txs.is_empty()))
}

/// Track a read transaction under `id`. Fails if a write is in flight.
pub fn add_read_transaction(
    st: &mut StateData,
    account: &str,
    confdb: &str,
    id: TaskId,
) -> Result<(), ConfdbError> {
    let mut map = read_map(st)?;
    let entry = map.entry(key(account, confdb)).or_default();
    if entry.write_tx_id.is_some() {
        return Err(ConfdbError::WriteOngoing {
            attempt: "read",
            account: account.to_string(),
            confdb: confdb.to_string(),
        });
    }
    entry.read_tx_ids.push(id);
    write_map(st, &map)
}

/// Track the write transaction under `id`. Fails if anything is in flight.
pub fn set_write_transaction(
    st: &mut StateData,
    account: &str,
    confdb: &str,
    id: TaskId,
) -> Result<(), ConfdbError> {
    let mut map = read_map(st)?;
    let entry = map.entry(key(account, confdb)).or_default();
    if entry.write_tx_id.is_some() {
        return Err(ConfdbError::WriteOngoing {
            attempt: "write",
            account: account.to_string(),
            confdb: confdb.to_string(),
        });
    }
    if !entry.read_tx_ids.is_empty() {
        return Err(ConfdbError::ReadsOngoing {
            account: account.to_string(),
            confdb: confdb.to_string(),
        });
    }
    entry.write_tx_id = Some(id);
    write_map(st, &map)
}

/// Release whichever slot `id` occupies, pruning empty entries and, when
/// the last entry goes, the state key itself.
pub fn unset_ongoing_transaction(
    st: &mut StateData,
    account: &str,
    confdb: &str,
    id: TaskId,
) -> Result<(), ConfdbError> {
    let mut map = read_map(st)?;
    let k = key(account, confdb);
    let entry = map.get_mut(&k).ok_or(ConfdbError::UnknownOngoingTransaction {
        id,
        account: account.to_string(),
        confdb: confdb.to_string(),
    })?;
    if entry.write_tx_id == Some(id) {
        entry.write_tx_id = None;
    } else if let Some(pos) = entry.read_tx_ids.iter().position(|r| *r == id) {
        entry.read_tx_ids.remove(pos);
    } else {
        return Err(ConfdbError::UnknownOngoingTransaction {
            id,
            account: account.to_string(),
            confdb: confdb.to_string(),
        });
    }
    if entry.is_empty() {
        map.remove(&k);
    }
    write_map(st, &map)
}
