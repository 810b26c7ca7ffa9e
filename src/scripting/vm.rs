use std::cell::Cell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use bevy::prelude::*;
use mlua::{HookTriggers, Lua, RegistryKey, Table, Value, VmState};

use crate::config::ScriptLimits;
use crate::engine::EngineContext;

pub struct ScriptSource {
    pub source: String,
    pub hash: u64,
}

/// Named script sources plus the class table compiled from each. A class is
/// rebuilt only when its source hash changes.
#[derive(Default)]
pub struct ScriptLibrary {
    sources: HashMap<String, ScriptSource>,
    classes: HashMap<String, (u64, RegistryKey)>,
}

impl ScriptLibrary {
    /// Validates and stores `source`. Returns `Ok(false)` when the stored
    /// source is already identical.
    pub fn load_script(&mut self, name: &str, source: String, limits: &ScriptLimits) -> Result<bool, String> {
        validate_script_source(name, &source, limits)?;
        let hash = source_hash(&source);
        if self.sources.get(name).is_some_and(|s| s.hash == hash) {
            return Ok(false);
        }
        self.sources
            .insert(name.to_string(), ScriptSource { source, hash });
        self.classes.remove(name);
        Ok(true)
    }

    pub fn source(&self, name: &str) -> Option<&ScriptSource> {
        self.sources.get(name)
    }

    pub fn hash_of(&self, name: &str) -> Option<u64> {
        self.sources.get(name).map(|s| s.hash)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

pub fn source_hash(source: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Runs the chunk in a scratch state; it must evaluate to a table of methods.
fn validate_script_source(name: &str, source: &str, limits: &ScriptLimits) -> Result<(), String> {
    let lua = Lua::new();
    let depth = Cell::new(0);
    let value = call_lua_with_budget(&lua, limits, &depth, || {
        lua.load(source).set_name(name).eval::<Value>()
    })
    .map_err(|e| e.to_string())?;
    match value {
        Value::Table(_) => Ok(()),
        other => Err(format!(
            "Script '{name}' must return a table of methods (got {})",
            other.type_name()
        )),
    }
}

/// Installs the time/instruction hook around the outermost script call only;
/// nested calls made from inside script code share the outer budget.
pub fn call_lua_with_budget<T, F>(
    lua: &Lua,
    limits: &ScriptLimits,
    depth: &Cell<u32>,
    f: F,
) -> mlua::Result<T>
where
    F: FnOnce() -> mlua::Result<T>,
{
    let outermost = depth.get() == 0;
    if outermost {
        let started = Instant::now();
        let max_duration = Duration::from_millis(limits.budget_ms);
        let budget_ms = limits.budget_ms;
        let interval = limits.instruction_interval.max(1);
        let max_instructions = limits.max_instructions;
        let executed = Cell::new(0u64);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(interval),
            move |_lua, _debug| {
                executed.set(executed.get().saturating_add(interval as u64));
                if executed.get() > max_instructions {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Script instruction limit exceeded ({max_instructions} instructions)"
                    )));
                }
                if started.elapsed() >= max_duration {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Script execution budget exceeded ({budget_ms}ms)"
                    )));
                }
                Ok(VmState::Continue)
            },
        );
    }
    depth.set(depth.get() + 1);
    let out = f();
    depth.set(depth.get() - 1);
    if outermost {
        lua.remove_hook();
    }
    out
}

/// Class table for `name`, compiled on first use and after every source
/// change.
pub fn class_table(lua: &Lua, ctx: &EngineContext, name: &str) -> Result<Table, String> {
    let (hash, source) = {
        let library = ctx.library.borrow();
        let Some(script) = library.source(name) else {
            return Err(format!("Unknown script '{name}'"));
        };
        if let Some((cached, key)) = library.classes.get(name) {
            if *cached == script.hash {
                if let Ok(class) = lua.registry_value::<Table>(key) {
                    return Ok(class);
                }
            }
        }
        (script.hash, script.source.clone())
    };

    let value = call_lua_with_budget(lua, &ctx.limits, &ctx.call_depth, || {
        lua.load(&source).set_name(name).eval::<Value>()
    })
    .map_err(|e| e.to_string())?;
    let Value::Table(class) = value else {
        return Err(format!("Script '{name}' must return a table of methods"));
    };
    let key = lua
        .create_registry_value(class.clone())
        .map_err(|e| e.to_string())?;
    ctx.library
        .borrow_mut()
        .classes
        .insert(name.to_string(), (hash, key));
    debug!("[Pixie scripts] Compiled class '{name}'");
    Ok(class)
}
