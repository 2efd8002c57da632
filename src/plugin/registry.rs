//! Process-wide plugin registry (§4.6, §9).
//!
//! Rust has no load-time init hook, so plugins register themselves during
//! an explicit init phase invoked by the entry point, before the plugin
//! manager's first refresh. The manager resolves an instance name — which
//! may carry a `/label` suffix so one spec can run multiple differently
//! configured instances — against this registry at reconciliation time.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use mup_proto::command::CommandSchema;

use super::{Plugger, Plugin};

/// What a plugin declares about itself at registration time.
pub struct PluginSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub commands: Vec<CommandSchema>,
    pub start: fn(Plugger) -> Arc<dyn Plugin>,
}

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<PluginSpec>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<PluginSpec>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a plugin spec. Idempotent for a given `name`: a later call
/// replaces the earlier registration.
pub fn register(spec: PluginSpec) {
    registry().write().insert(spec.name, Arc::new(spec));
}

/// Resolve an instance name (possibly carrying a `/label` suffix) to its
/// registered spec.
pub fn lookup(name: &str) -> Option<Arc<PluginSpec>> {
    let base = name.split('/').next().unwrap_or(name);
    registry().read().get(base).cloned()
}
