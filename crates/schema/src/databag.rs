use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::path::{Accessor, Path};

#[derive(Debug, Error)]
pub enum DatabagError {
    #[error("no value under path {0}")]
    NoData(Path),
    #[error("cannot use {path} as a container: {found} is not an object or array")]
    NotAContainer { path: Path, found: &'static str },
    #[error("index {index} out of range under {path}")]
    IndexOutOfRange { path: Path, index: usize },
    #[error("cannot serialize databag: {0}")]
    Serialize(#[from] serde_json::Error),
    /// An implementation-specific refusal, e.g. a transaction that no
    /// longer accepts operations.
    #[error("{0}")]
    Other(String),
}

fn value_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Read/write access to hierarchical configuration data addressed by
/// [`Path`]. Implemented by the persistent [`JsonDatabag`] and by the
/// transaction's copy-on-write adapter, so view code is indifferent to
/// whether it is writing to storage or to a delta log.
pub trait Databag {
    fn get(&self, path: &Path) -> Result<Value, DatabagError>;
    fn set(&mut self, path: &Path, value: Value) -> Result<(), DatabagError>;
    fn unset(&mut self, path: &Path) -> Result<(), DatabagError>;
    /// The serialized byte form of the whole bag.
    fn data(&self) -> Result<Vec<u8>, DatabagError>;
}

/// The stored form of one (account, schema) configuration database: a
/// JSON-object-rooted tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonDatabag {
    root: Map<String, Value>,
}

impl JsonDatabag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    fn prefix(path: &Path, len: usize) -> Path {
        let mut s = String::new();
        let mut first = true;
        for acc in &path.accessors()[..len] {
            match acc {
                Accessor::Key(k) => {
                    if !first {
                        s.push('.');
                    }
                    s.push_str(k);
                }
                Accessor::Index(i) => s.push_str(&format!("[{i}]")),
            }
            first = false;
        }
        s.parse().unwrap_or_default()
    }

    fn lookup<'a>(&'a self, path: &Path) -> Result<&'a Value, DatabagError> {
        let mut cur: Option<&Value> = None;
        for (depth, acc) in path.accessors().iter().enumerate() {
            let next = match (cur, acc) {
                (None, Accessor::Key(k)) => self.root.get(k),
                (None, Accessor::Index(_)) => None,
                (Some(Value::Object(map)), Accessor::Key(k)) => map.get(k),
                (Some(Value::Array(items)), Accessor::Index(i)) => items.get(*i),
                (Some(v), _) => {
                    return Err(DatabagError::NotAContainer {
                        path: Self::prefix(path, depth),
                        found: value_type(v),
                    })
                }
            };
            cur = Some(next.ok_or_else(|| DatabagError::NoData(path.clone()))?);
        }
        match cur {
            Some(v) => Ok(v),
            // Root path: the whole bag.
            None => Err(DatabagError::NoData(Path::root())),
        }
    }
}

impl Databag for JsonDatabag {
    fn get(&self, path: &Path) -> Result<Value, DatabagError> {
        if path.is_root() {
            return Ok(Value::Object(self.root.clone()));
        }
        self.lookup(path).cloned()
    }

    fn set(&mut self, path: &Path, value: Value) -> Result<(), DatabagError> {
        if path.is_root() {
            return match value {
                Value::Object(map) => {
                    self.root = map;
                    Ok(())
                }
                other => Err(DatabagError::NotAContainer {
                    path: Path::root(),
                    found: value_type(&other),
                }),
            };
        }

        let accessors = path.accessors();
        let mut cur: &mut Value = {
            // First accessor indexes the root object.
            match &accessors[0] {
                Accessor::Key(k) => self.root.entry(k.clone()).or_insert(Value::Null),
                Accessor::Index(i) => {
                    return Err(DatabagError::IndexOutOfRange {
                        path: Path::root(),
                        index: *i,
                    })
                }
            }
        };

        for (depth, acc) in accessors.iter().enumerate().skip(1) {
            // Materialize the container the next accessor needs.
            match acc {
                Accessor::Key(k) => {
                    if cur.is_null() {
                        *cur = Value::Object(Map::new());
                    }
                    let found = value_type(cur);
                    let map = match cur.as_object_mut() {
                        Some(map) => map,
                        None => {
                            return Err(DatabagError::NotAContainer {
                                path: Self::prefix(path, depth),
                                found,
                            })
                        }
                    };
                    cur = map.entry(k.clone()).or_insert(Value::Null);
                }
                Accessor::Index(i) => {
                    if cur.is_null() {
                        *cur = Value::Array(Vec::new());
                    }
                    let prefix = Self::prefix(path, depth);
                    let found = value_type(cur);
                    let items = match cur.as_array_mut() {
                        Some(items) => items,
                        None => return Err(DatabagError::NotAContainer { path: prefix, found }),
                    };
                    if *i == items.len() {
                        items.push(Value::Null);
                    } else if *i > items.len() {
                        return Err(DatabagError::IndexOutOfRange {
                            path: prefix,
                            index: *i,
                        });
                    }
                    cur = &mut items[*i];
                }
            }
        }
        *cur = value;
        Ok(())
    }

    fn unset(&mut self, path: &Path) -> Result<(), DatabagError> {
        if path.is_root() {
            self.root.clear();
            return Ok(());
        }
        let accessors = path.accessors();
        let Some((last, parents)) = accessors.split_last() else {
            return Ok(());
        };

        // Walk to the parent container; an absent step makes unset a no-op.
        enum Parent<'a> {
            Root(&'a mut Map<String, Value>),
            Node(&'a mut Value),
        }
        let mut cur = Parent::Root(&mut self.root);
        for acc in parents {
            let next = match (cur, acc) {
                (Parent::Root(map), Accessor::Key(k)) => map.get_mut(k),
                (Parent::Root(_), Accessor::Index(_)) => None,
                (Parent::Node(Value::Object(map)), Accessor::Key(k)) => map.get_mut(k),
                (Parent::Node(Value::Array(items)), Accessor::Index(i)) => items.get_mut(*i),
                (Parent::Node(_), _) => None,
            };
            match next {
                Some(v) => cur = Parent::Node(v),
                None => return Ok(()),
            }
        }
        match (cur, last) {
            (Parent::Root(map), Accessor::Key(k)) => {
                map.remove(k);
            }
            (Parent::Node(Value::Object(map)), Accessor::Key(k)) => {
                map.remove(k);
            }
            (Parent::Node(Value::Array(items)), Accessor::Index(i)) => {
                if *i < items.len() {
                    items.remove(*i);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn data(&self) -> Result<Vec<u8>, DatabagError> {
        Ok(serde_json::to_vec(&self.root)?)
    }
}
