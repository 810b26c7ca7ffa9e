use crate::component::{Behavior, ComponentData, ComponentKind};
use crate::scripting::dispatch::DispatchCache;

/// Behavior backed by a named script. The Lua instance and every resolved
/// method handle live in the dispatch cache.
pub struct ScriptComponent {
    script: String,
    pub(crate) cache: DispatchCache,
}

impl ScriptComponent {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            cache: DispatchCache::default(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Swaps the backing script. Returns false when the name is unchanged;
    /// otherwise every cached handle is dropped and rebuilt on next call.
    pub fn set_script(&mut self, script: impl Into<String>) -> bool {
        let script = script.into();
        if script == self.script {
            return false;
        }
        self.script = script;
        self.cache.invalidate();
        true
    }

    pub fn cache(&self) -> &DispatchCache {
        &self.cache
    }
}

impl Behavior for ScriptComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Script
    }

    fn copy(&self) -> ComponentData {
        ComponentData::Script(ScriptComponent::new(self.script.clone()))
    }
}
