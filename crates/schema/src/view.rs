use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::databag::{Databag, DatabagError};
use crate::path::Path;

/// Identity of a view: the account owning the schema, the schema (confdb)
/// name, and the view name within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    pub account: String,
    pub confdb: String,
    pub view: String,
}

impl ViewId {
    pub fn new(account: &str, confdb: &str, view: &str) -> Self {
        Self {
            account: account.to_string(),
            confdb: confdb.to_string(),
            view: view.to_string(),
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.confdb, self.view)
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("no data")]
    NoData { requests: Vec<String> },
    #[error("cannot use request {request:?} through view {view}: {reason}")]
    BadRequest {
        view: ViewId,
        request: String,
        reason: String,
    },
    #[error(transparent)]
    Databag(#[from] DatabagError),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot parse databag: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A named projection over a schema: translates external request names into
/// storage paths with access rules. The engine is indifferent to the rule
/// language; it only needs these operations.
pub trait View: Send + Sync {
    fn id(&self) -> &ViewId;

    fn set(&self, bag: &mut dyn Databag, request: &str, value: Value) -> Result<(), ViewError>;

    fn unset(&self, bag: &mut dyn Databag, request: &str) -> Result<(), ViewError>;

    /// Read `request` through the view; an empty request reads the whole
    /// view. Absent data surfaces as [`ViewError::NoData`].
    fn get(&self, bag: &dyn Databag, request: &str, constraints: Option<&Value>)
        -> Result<Value, ViewError>;

    /// Whether writes to any of `paths` may touch schema-tagged ephemeral
    /// storage, which requires custodian save participation.
    fn write_affects_ephemeral(&self, paths: &[Path]) -> bool;

    /// Whether a read of `requests` (all, if empty) may cover ephemeral
    /// storage, which requires custodian load participation.
    fn read_affects_ephemeral(&self, requests: &[String], constraints: Option<&Value>) -> bool;
}

/// Validation and view lookup for one (account, schema) configuration
/// database.
pub trait Schema: Send + Sync {
    /// Validate the serialized form of a whole databag.
    fn validate(&self, data: &[u8]) -> Result<(), SchemaError>;

    fn view(&self, name: &str) -> Option<Arc<dyn View>>;

    /// The views whose visible content may change when `path` does.
    fn views_affected_by_path(&self, path: &Path) -> Vec<Arc<dyn View>>;
}

/// A view whose requests are storage paths, mapped one to one. This is the
/// identity projection: enough for embedders without rule documents and for
/// the engine's own tests.
pub struct SimpleView {
    id: ViewId,
    /// Subtrees this view projects; empty means the whole databag.
    scope: Vec<Path>,
    /// Paths tagged as ephemeral (not persisted across reboots).
    ephemeral: Vec<Path>,
}

impl SimpleView {
    pub fn new(id: ViewId) -> Self {
        Self {
            id,
            scope: Vec::new(),
            ephemeral: Vec::new(),
        }
    }

    pub fn with_scope(mut self, paths: impl IntoIterator<Item = Path>) -> Self {
        self.scope = paths.into_iter().collect();
        self
    }

    pub fn with_ephemeral(mut self, paths: impl IntoIterator<Item = Path>) -> Self {
        self.ephemeral = paths.into_iter().collect();
        self
    }

    pub fn covers(&self, path: &Path) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|p| p.overlaps(path))
    }

    fn request_path(&self, request: &str) -> Result<Path, ViewError> {
        Path::from_str(request).map_err(|e| ViewError::BadRequest {
            view: self.id.clone(),
            request: request.to_string(),
            reason: e.to_string(),
        })
    }
}

impl View for SimpleView {
    fn id(&self) -> &ViewId {
        &self.id
    }

    fn set(&self, bag: &mut dyn Databag, request: &str, value: Value) -> Result<(), ViewError> {
        let path = self.request_path(request)?;
        bag.set(&path, value)?;
        Ok(())
    }

    fn unset(&self, bag: &mut dyn Databag, request: &str) -> Result<(), ViewError> {
        let path = self.request_path(request)?;
        bag.unset(&path)?;
        Ok(())
    }

    fn get(
        &self,
        bag: &dyn Databag,
        request: &str,
        _constraints: Option<&Value>,
    ) -> Result<Value, ViewError> {
        let path = self.request_path(request)?;
        match bag.get(&path) {
            Ok(v) => Ok(v),
            Err(DatabagError::NoData(_)) => Err(ViewError::NoData {
                requests: vec![request.to_string()],
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn write_affects_ephemeral(&self, paths: &[Path]) -> bool {
        paths
            .iter()
            .any(|p| self.ephemeral.iter().any(|e| e.overlaps(p)))
    }

    fn read_affects_ephemeral(&self, requests: &[String], _constraints: Option<&Value>) -> bool {
        if requests.is_empty() {
            return !self.ephemeral.is_empty();
        }
        requests.iter().any(|r| match Path::from_str(r) {
            Ok(p) => self.ephemeral.iter().any(|e| e.overlaps(&p)),
            Err(_) => false,
        })
    }
}

/// A schema holding [`SimpleView`]s and an optional top-level key allowlist
/// as its validation rule.
#[derive(Default)]
pub struct SimpleSchema {
    views: BTreeMap<String, Arc<SimpleView>>,
    allowed_top_level: Option<BTreeSet<String>>,
}

impl SimpleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(mut self, view: SimpleView) -> Self {
        self.views.insert(view.id.view.clone(), Arc::new(view));
        self
    }

    /// Restrict valid databags to the given top-level keys.
    pub fn allowing_top_level(mut self, keys: impl IntoIterator<Item = &'static str>) -> Self {
        self.allowed_top_level = Some(keys.into_iter().map(String::from).collect());
        self
    }
}

impl Schema for SimpleSchema {
    fn validate(&self, data: &[u8]) -> Result<(), SchemaError> {
        let value: Value = serde_json::from_slice(data)?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(SchemaError::Validation(format!(
                    "databag must be a map, not {}",
                    other
                )))
            }
        };
        if let Some(allowed) = &self.allowed_top_level {
            for key in map.keys() {
                if !allowed.contains(key) {
                    return Err(SchemaError::Validation(format!(
                        "cannot accept top level element: map contains unexpected key {:?}",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn view(&self, name: &str) -> Option<Arc<dyn View>> {
        self.views.get(name).map(|v| v.clone() as Arc<dyn View>)
    }

    fn views_affected_by_path(&self, path: &Path) -> Vec<Arc<dyn View>> {
        self.views
            .values()
            .filter(|v| v.covers(path))
            .map(|v| v.clone() as Arc<dyn View>)
            .collect()
    }
}
