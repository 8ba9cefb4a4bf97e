use std::str::FromStr;

use confdb_schema::{Databag, DatabagError, JsonDatabag, Path, Schema};
use confdb_state::StateData;
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ConfdbError;
use crate::store;

/// An in-memory, copy-on-write transaction over one (account, confdb)
/// databag.
///
/// Writes are recorded as an ordered delta log over a `pristine` snapshot
/// taken at construction; reads materialize a cached working bag with the
/// deltas applied. `previous` keeps the construction-time snapshot for the
/// lifetime of the object so hooks can inspect what a change is departing
/// from. Committing re-reads the current databag (not `pristine`), applies
/// the deltas, validates against the schema and writes back; on any
/// failure the transaction is left untouched.
///
/// A transaction may be serialized into a task payload and deserialized
/// later; the round trip preserves behavior, including delta order and
/// abort state.
#[derive(Debug)]
pub struct Transaction {
    account: String,
    confdb: String,
    inner: RwLock<TxInner>,
}

#[derive(Debug)]
struct TxInner {
    pristine: JsonDatabag,
    previous: JsonDatabag,
    deltas: Vec<(Path, Option<Value>)>,
    modified: Option<JsonDatabag>,
    applied_deltas: usize,
    aborting_snap: Option<String>,
    abort_reason: Option<String>,
}

impl TxInner {
    fn check_active(&self) -> Result<(), ConfdbError> {
        match (&self.aborting_snap, &self.abort_reason) {
            (Some(snap), reason) => Err(ConfdbError::AbortedTransaction {
                snap: snap.clone(),
                reason: reason.clone().unwrap_or_default(),
            }),
            (None, _) => Ok(()),
        }
    }

    /// Bring the cached working bag up to date with the delta log. On a
    /// delta application failure the cache is discarded so the next read
    /// retries from scratch.
    fn materialize(&mut self) -> Result<(), ConfdbError> {
        let (mut bag, applied) = match self.modified.take() {
            Some(bag) => (bag, self.applied_deltas),
            None => (self.pristine.clone(), 0),
        };
        for (path, value) in &self.deltas[applied..] {
            let res = match value {
                Some(v) => bag.set(path, v.clone()),
                None => bag.unset(path),
            };
            if let Err(err) = res {
                self.applied_deltas = 0;
                return Err(err.into());
            }
        }
        self.applied_deltas = self.deltas.len();
        self.modified = Some(bag);
        Ok(())
    }
}

impl Transaction {
    /// Start a transaction against the current databag for
    /// `(account, confdb)`.
    pub fn new(st: &StateData, account: &str, confdb: &str) -> Result<Self, ConfdbError> {
        let bag = store::read_databag(st, account, confdb)?;
        Ok(Transaction {
            account: account.to_string(),
            confdb: confdb.to_string(),
            inner: RwLock::new(TxInner {
                pristine: bag.clone(),
                previous: bag,
                deltas: Vec::new(),
                modified: None,
                applied_deltas: 0,
                aborting_snap: None,
                abort_reason: None,
            }),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn confdb(&self) -> &str {
        &self.confdb
    }

    /// Record a write. A JSON null is the wire form of an unset and is
    /// normalized to one.
    pub fn set(&self, path: &Path, value: Value) -> Result<(), ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;
        let delta = if value.is_null() { None } else { Some(value) };
        inner.deltas.push((path.clone(), delta));
        Ok(())
    }

    pub fn unset(&self, path: &Path) -> Result<(), ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;
        inner.deltas.push((path.clone(), None));
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Result<Value, ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;
        if inner.deltas.is_empty() && inner.modified.is_none() {
            return Ok(inner.pristine.get(path)?);
        }
        inner.materialize()?;
        match &inner.modified {
            Some(bag) => Ok(bag.get(path)?),
            None => Err(ConfdbError::Internal(
                "transaction lost its working databag".to_string(),
            )),
        }
    }

    /// The serialized byte form of the databag with all deltas applied.
    pub fn data(&self) -> Result<Vec<u8>, ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;
        inner.materialize()?;
        match &inner.modified {
            Some(bag) => Ok(bag.data()?),
            None => Err(ConfdbError::Internal(
                "transaction lost its working databag".to_string(),
            )),
        }
    }

    /// The paths written so far, in insertion order, duplicates preserved.
    pub fn altered_paths(&self) -> Vec<Path> {
        self.inner
            .read()
            .deltas
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// The immutable snapshot taken at construction.
    pub fn previous(&self) -> JsonDatabag {
        self.inner.read().previous.clone()
    }

    /// Apply the delta log to the current stored databag, validate and
    /// persist. On success `pristine` moves to the committed result and
    /// the delta log resets; `previous` is left alone. On failure nothing
    /// changes, in memory or in the store.
    pub fn commit(&self, st: &mut StateData, schema: &dyn Schema) -> Result<(), ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;

        // Fresh read: commits made since this transaction started must not
        // be clobbered.
        let mut bag = store::read_databag(st, &self.account, &self.confdb)?;
        for (path, value) in &inner.deltas {
            match value {
                Some(v) => bag.set(path, v.clone())?,
                None => bag.unset(path)?,
            }
        }
        schema.validate(&bag.data()?)?;
        // Write back a copy so no handle to the committed bag survives
        // outside the store.
        store::write_databag(st, bag.clone(), &self.account, &self.confdb)?;

        inner.pristine = bag;
        inner.modified = None;
        inner.deltas.clear();
        inner.applied_deltas = 0;
        Ok(())
    }

    /// Drop all uncommitted deltas and resynchronize `pristine` with the
    /// stored databag.
    pub fn clear(&self, st: &StateData) -> Result<(), ConfdbError> {
        let mut inner = self.inner.write();
        inner.check_active()?;
        inner.pristine = store::read_databag(st, &self.account, &self.confdb)?;
        inner.modified = None;
        inner.deltas.clear();
        inner.applied_deltas = 0;
        Ok(())
    }

    /// Mark the transaction as rejected by `snap`. Terminal: every
    /// subsequent operation fails.
    pub fn abort(&self, snap: &str, reason: &str) {
        let mut inner = self.inner.write();
        inner.aborting_snap = Some(snap.to_string());
        inner.abort_reason = Some(reason.to_string());
    }

    pub fn aborted(&self) -> Option<(String, String)> {
        let inner = self.inner.read();
        inner
            .aborting_snap
            .clone()
            .map(|snap| (snap, inner.abort_reason.clone().unwrap_or_default()))
    }

    pub fn delta_count(&self) -> usize {
        self.inner.read().deltas.len()
    }

    /// View this transaction as a databag, for view-mediated access.
    pub fn bag(&self) -> TxBag<'_> {
        TxBag(self)
    }
}

/// Databag adapter over a shared transaction reference.
pub struct TxBag<'a>(&'a Transaction);

fn to_bag_err(err: ConfdbError) -> DatabagError {
    match err {
        ConfdbError::Databag(e) => e,
        other => DatabagError::Other(other.to_string()),
    }
}

impl Databag for TxBag<'_> {
    fn get(&self, path: &Path) -> Result<Value, DatabagError> {
        self.0.get(path).map_err(to_bag_err)
    }

    fn set(&mut self, path: &Path, value: Value) -> Result<(), DatabagError> {
        self.0.set(path, value).map_err(to_bag_err)
    }

    fn unset(&mut self, path: &Path) -> Result<(), DatabagError> {
        self.0.unset(path).map_err(to_bag_err)
    }

    fn data(&self) -> Result<Vec<u8>, DatabagError> {
        self.0.data().map_err(to_bag_err)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawTransaction {
    account: String,
    confdb: String,
    pristine: JsonDatabag,
    previous: JsonDatabag,
    deltas: Vec<Map<String, Value>>,
    applied_deltas: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aborting_snap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    abort_reason: Option<String>,
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let inner = self.inner.read();
        let deltas = inner
            .deltas
            .iter()
            .map(|(path, value)| {
                let mut entry = Map::new();
                entry.insert(path.to_string(), value.clone().unwrap_or(Value::Null));
                entry
            })
            .collect();
        let raw = RawTransaction {
            account: self.account.clone(),
            confdb: self.confdb.clone(),
            pristine: inner.pristine.clone(),
            previous: inner.previous.clone(),
            deltas,
            applied_deltas: inner.applied_deltas,
            aborting_snap: inner.aborting_snap.clone(),
            abort_reason: inner.abort_reason.clone(),
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTransaction::deserialize(deserializer)?;
        let mut deltas = Vec::with_capacity(raw.deltas.len());
        for entry in raw.deltas {
            if entry.len() != 1 {
                return Err(D::Error::custom(format!(
                    "delta entry must hold exactly one path, got {}",
                    entry.len()
                )));
            }
            for (joined, value) in entry {
                let path = Path::from_str(&joined).map_err(D::Error::custom)?;
                let value = if value.is_null() { None } else { Some(value) };
                deltas.push((path, value));
            }
        }
        Ok(Transaction {
            account: raw.account,
            confdb: raw.confdb,
            inner: RwLock::new(TxInner {
                pristine: raw.pristine,
                previous: raw.previous,
                deltas,
                // The working bag is not serialized; the next read rebuilds
                // it from scratch, so the stored count is moot.
                modified: None,
                applied_deltas: raw.applied_deltas,
                aborting_snap: raw.aborting_snap,
                abort_reason: raw.abort_reason,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confdb_schema::SimpleSchema;
    use confdb_state::State;
    use serde_json::json;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn tx(state: &State) -> Transaction {
        Transaction::new(&state.lock(), "acc", "network").unwrap()
    }

    #[test]
    fn last_write_wins_after_commit() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("wifi.ssid"), json!("one")).unwrap();
        tx.set(&p("wifi.psk"), json!("secret")).unwrap();
        tx.set(&p("wifi.ssid"), json!("two")).unwrap();
        tx.unset(&p("wifi.psk")).unwrap();

        let schema = SimpleSchema::new();
        tx.commit(&mut state.lock(), &schema).unwrap();

        assert_eq!(tx.get(&p("wifi.ssid")).unwrap(), json!("two"));
        assert!(tx.get(&p("wifi.psk")).is_err());
        let stored = store::read_databag(&state.lock(), "acc", "network").unwrap();
        assert_eq!(stored.get(&p("wifi.ssid")).unwrap(), json!("two"));
    }

    #[test]
    fn reads_see_uncommitted_deltas_but_store_does_not() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        assert_eq!(tx.get(&p("wifi.ssid")).unwrap(), json!("foo"));
        assert!(store::read_databag(&state.lock(), "acc", "network")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn altered_paths_preserve_order_and_duplicates() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("a"), json!(1)).unwrap();
        tx.set(&p("b"), json!(2)).unwrap();
        tx.set(&p("a"), json!(3)).unwrap();
        tx.unset(&p("c")).unwrap();
        assert_eq!(
            tx.altered_paths(),
            vec![p("a"), p("b"), p("a"), p("c")]
        );
    }

    #[test]
    fn failed_delta_application_discards_the_cache_and_retries() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("a"), json!("scalar")).unwrap();
        assert_eq!(tx.get(&p("a")).unwrap(), json!("scalar"));
        // This delta cannot apply on top of a scalar.
        tx.set(&p("a.b"), json!(1)).unwrap();
        assert!(tx.get(&p("a.b")).is_err());
        // Same failure again: the read retried from scratch.
        assert!(tx.get(&p("a.b")).is_err());
    }

    #[test]
    fn commit_failure_leaves_store_and_transaction_untouched() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("foo"), json!("bar")).unwrap();

        let schema = SimpleSchema::new().allowing_top_level(["wifi"]);
        let err = tx.commit(&mut state.lock(), &schema).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot accept top level element: map contains unexpected key \"foo\""
        );
        assert!(store::read_databag(&state.lock(), "acc", "network")
            .unwrap()
            .is_empty());
        // The delta survives for a retry.
        assert_eq!(tx.altered_paths(), vec![p("foo")]);
    }

    #[test]
    fn commit_incorporates_store_writes_made_after_construction() {
        let state = State::new();
        let t1 = tx(&state);
        t1.set(&p("wifi.ssid"), json!("bar")).unwrap();

        // A concurrent commit lands directly in the store.
        {
            let mut st = state.lock();
            let mut bag = store::read_databag(&st, "acc", "network").unwrap();
            bag.set(&p("wifi.psk"), json!("hunter2")).unwrap();
            store::write_databag(&mut st, bag, "acc", "network").unwrap();
        }

        // Isolation: t1 does not observe it before committing.
        assert!(t1.get(&p("wifi.psk")).is_err());

        t1.commit(&mut state.lock(), &SimpleSchema::new()).unwrap();
        assert_eq!(t1.get(&p("wifi.ssid")).unwrap(), json!("bar"));
        // Post-commit the fresh base is visible.
        assert_eq!(t1.get(&p("wifi.psk")).unwrap(), json!("hunter2"));
        let stored = store::read_databag(&state.lock(), "acc", "network").unwrap();
        assert_eq!(stored.get(&p("wifi.ssid")).unwrap(), json!("bar"));
        assert_eq!(stored.get(&p("wifi.psk")).unwrap(), json!("hunter2"));
    }

    #[test]
    fn previous_is_never_updated() {
        let state = State::new();
        {
            let mut st = state.lock();
            let mut bag = JsonDatabag::new();
            bag.set(&p("a"), json!("old")).unwrap();
            store::write_databag(&mut st, bag, "acc", "network").unwrap();
        }
        let tx = tx(&state);
        tx.set(&p("a"), json!("new")).unwrap();
        tx.commit(&mut state.lock(), &SimpleSchema::new()).unwrap();
        assert_eq!(tx.previous().get(&p("a")).unwrap(), json!("old"));
    }

    #[test]
    fn abort_is_terminal_for_every_operation() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("a"), json!(1)).unwrap();
        tx.abort("some-snap", "undesired changes");

        let check = |err: ConfdbError| {
            assert_eq!(err.kind(), "aborted-transaction");
            assert!(err.to_string().contains("some-snap"));
            assert!(err.to_string().contains("undesired changes"));
        };
        check(tx.set(&p("a"), json!(2)).unwrap_err());
        check(tx.unset(&p("a")).unwrap_err());
        check(tx.get(&p("a")).unwrap_err());
        check(tx.data().unwrap_err());
        check(tx.commit(&mut state.lock(), &SimpleSchema::new()).unwrap_err());
        check(tx.clear(&state.lock()).unwrap_err());
        assert_eq!(
            tx.aborted(),
            Some(("some-snap".to_string(), "undesired changes".to_string()))
        );
    }

    #[test]
    fn clear_drops_deltas_and_resyncs_pristine() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("a"), json!(1)).unwrap();
        {
            let mut st = state.lock();
            let mut bag = JsonDatabag::new();
            bag.set(&p("b"), json!(2)).unwrap();
            store::write_databag(&mut st, bag, "acc", "network").unwrap();
        }
        tx.clear(&state.lock()).unwrap();
        assert_eq!(tx.delta_count(), 0);
        assert!(tx.get(&p("a")).is_err());
        assert_eq!(tx.get(&p("b")).unwrap(), json!(2));
    }

    #[test]
    fn serialization_round_trip_preserves_behavior() {
        let state = State::new();
        let tx = tx(&state);
        tx.set(&p("wifi.ssid"), json!("foo")).unwrap();
        tx.set(&p("nets[0].name"), json!("eth0")).unwrap();
        tx.unset(&p("wifi.psk")).unwrap();
        // Materialize so applied-deltas is non-zero on the wire.
        assert_eq!(tx.get(&p("wifi.ssid")).unwrap(), json!("foo"));

        let wire = serde_json::to_value(&tx).unwrap();
        assert_eq!(
            wire["deltas"],
            json!([
                {"wifi.ssid": "foo"},
                {"nets[0].name": "eth0"},
                {"wifi.psk": null},
            ])
        );

        let back: Transaction = serde_json::from_value(wire).unwrap();
        assert_eq!(back.account(), "acc");
        assert_eq!(back.confdb(), "network");
        assert_eq!(back.altered_paths(), tx.altered_paths());
        assert_eq!(back.get(&p("wifi.ssid")).unwrap(), json!("foo"));
        assert_eq!(back.get(&p("nets[0].name")).unwrap(), json!("eth0"));

        back.commit(&mut state.lock(), &SimpleSchema::new()).unwrap();
        let stored = store::read_databag(&state.lock(), "acc", "network").unwrap();
        assert_eq!(stored.get(&p("wifi.ssid")).unwrap(), json!("foo"));
        assert!(stored.get(&p("wifi.psk")).is_err());
    }

    #[test]
    fn abort_state_survives_serialization() {
        let state = State::new();
        let tx = tx(&state);
        tx.abort("manager-snap", "no thanks");
        let wire = serde_json::to_value(&tx).unwrap();
        let back: Transaction = serde_json::from_value(wire).unwrap();
        assert_eq!(
            back.aborted(),
            Some(("manager-snap".to_string(), "no thanks".to_string()))
        );
        assert!(back.get(&p("a")).is_err());
    }

    #[test]
    fn setting_null_is_an_unset() {
        let state = State::new();
        {
            let mut st = state.lock();
            let mut bag = JsonDatabag::new();
            bag.set(&p("a"), json!(1)).unwrap();
            store::write_databag(&mut st, bag, "acc", "network").unwrap();
        }
        let tx = tx(&state);
        tx.set(&p("a"), Value::Null).unwrap();
        assert!(tx.get(&p("a")).is_err());
    }
}
