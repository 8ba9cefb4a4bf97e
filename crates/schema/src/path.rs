use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path has an empty key element")]
    EmptyKey,
    #[error("invalid index `{0}` in path")]
    BadIndex(String),
    #[error("unterminated index in path `{0}`")]
    UnterminatedIndex(String),
}

/// A single step into a hierarchical databag: either an object key or an
/// array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Accessor {
    Key(String),
    Index(usize),
}

/// A structured storage path.
///
/// Paths travel as joined strings (`wifi.ssid`, `nets[0].name`) in task
/// payloads and serialized transactions, and as accessor sequences in
/// memory. `Path::from_str` and `Display` are exact inverses of each other
/// so the wire form round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<Accessor>);

impl Path {
    /// The root path, addressing the entire databag.
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn accessors(&self) -> &[Accessor] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether one path contains the other (either direction). Writing to
    /// `wifi` affects `wifi.ssid` and writing to `wifi.ssid` affects a view
    /// rooted at `wifi`.
    pub fn overlaps(&self, other: &Path) -> bool {
        let n = self.0.len().min(other.0.len());
        self.0[..n] == other.0[..n]
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Ok(Path::root());
        }
        let mut accessors = Vec::new();
        for part in s.split('.') {
            let mut rest = part;
            let key_end = rest.find('[').unwrap_or(rest.len());
            let key = &rest[..key_end];
            if key.is_empty() {
                return Err(PathError::EmptyKey);
            }
            accessors.push(Accessor::Key(key.to_string()));
            rest = &rest[key_end..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| PathError::UnterminatedIndex(s.to_string()))?;
                let idx = stripped[..close]
                    .parse::<usize>()
                    .map_err(|_| PathError::BadIndex(stripped[..close].to_string()))?;
                accessors.push(Accessor::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(PathError::BadIndex(rest.to_string()));
            }
        }
        Ok(Path(accessors))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for acc in &self.0 {
            match acc {
                Accessor::Key(k) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{k}")?;
                }
                Accessor::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
