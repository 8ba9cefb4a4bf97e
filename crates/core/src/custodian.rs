use std::collections::{HashMap, HashSet};

use confdb_schema::ViewId;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Role a snap's plug declares towards a view. Custodians participate in
/// writes and reads through their hooks; observers are merely notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlugRole {
    Custodian,
    Observer,
}

/// A connected plug declaration of interest in a view.
#[derive(Debug, Clone)]
pub struct ViewPlug {
    pub snap: String,
    pub plug: String,
    pub role: PlugRole,
}

/// The engine's window into the interface repository: which connected
/// plugs reference a view, and which hooks a snap ships. Declarations
/// without an active connection must not be reported.
pub trait PlugRegistry: Send + Sync {
    fn plugs_for_view(&self, view: &ViewId) -> Vec<ViewPlug>;

    fn has_hook(&self, snap: &str, hook: &str) -> bool;
}

/// The custodians of a view: deterministically sorted snap names plus the
/// plug each snap connects with (first plug wins if a snap has several).
pub struct Custodians {
    pub names: Vec<String>,
    pub plugs: HashMap<String, ViewPlug>,
}

impl Custodians {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Snap names (sorted) that ship the given hook kind for their plug,
    /// e.g. `save-view-<plug>` for kind `save-view`.
    pub fn with_hook<'a>(
        &'a self,
        registry: &'a dyn PlugRegistry,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a str, String)> + 'a {
        self.names.iter().filter_map(move |snap| {
            let plug = self.plugs.get(snap)?;
            let hook = format!("{kind}-{}", plug.plug);
            registry.has_hook(snap, &hook).then_some((snap.as_str(), hook))
        })
    }
}

pub fn custodians_for_view(registry: &dyn PlugRegistry, view: &ViewId) -> Custodians {
    let mut plugs: HashMap<String, ViewPlug> = HashMap::new();
    for plug in registry.plugs_for_view(view) {
        if plug.role == PlugRole::Custodian {
            plugs.entry(plug.snap.clone()).or_insert(plug);
        }
    }
    let names = plugs.keys().cloned().sorted().collect();
    Custodians { names, plugs }
}

/// Non-custodian snaps (sorted) holding a connected plug on any of the
/// given views, excluding `skip` snaps; yields one (snap, plug) per snap.
pub fn observers_for_views<'a>(
    registry: &dyn PlugRegistry,
    views: impl IntoIterator<Item = &'a ViewId>,
    skip: &HashSet<String>,
) -> Vec<ViewPlug> {
    let mut seen: HashMap<String, ViewPlug> = HashMap::new();
    for view in views {
        for plug in registry.plugs_for_view(view) {
            if skip.contains(&plug.snap) {
                continue;
            }
            seen.entry(plug.snap.clone()).or_insert(plug);
        }
    }
    seen.into_values().sorted_by(|a, b| a.snap.cmp(&b.snap)).collect()
}

/// An in-memory registry, built up front. Serves embedders without a live
/// interface repository, and the engine's tests.
#[derive(Default)]
pub struct StaticRegistry {
    plugs: Vec<(ViewId, ViewPlug)>,
    hooks: HashSet<(String, String)>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plug(mut self, view: &ViewId, snap: &str, plug: &str, role: PlugRole) -> Self {
        self.plugs.push((
            view.clone(),
            ViewPlug {
                snap: snap.to_string(),
                plug: plug.to_string(),
                role,
            },
        ));
        self
    }

    pub fn with_hooks(mut self, snap: &str, hooks: impl IntoIterator<Item = &'static str>) -> Self {
        for hook in hooks {
            self.hooks.insert((snap.to_string(), hook.to_string()));
        }
        self
    }
}

impl PlugRegistry for StaticRegistry {
    fn plugs_for_view(&self, view: &ViewId) -> Vec<ViewPlug> {
        self.plugs
            .iter()
            .filter(|(v, _)| v == view)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn has_hook(&self, snap: &str, hook: &str) -> bool {
        self.hooks.contains(&(snap.to_string(), hook.to_string()))
    }
}
