use std::collections::HashMap;
use std::rc::Rc;

use bevy::prelude::*;
use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value};

use crate::collision::{
    ENTITY_COLLISION_ENTER, ENTITY_COLLISION_EXIT, ENTITY_COLLISION_STAY, MAP_COLLISION_ENTER,
    MAP_COLLISION_EXIT, MAP_COLLISION_STAY,
};
use crate::component::{ComponentData, ComponentKey};
use crate::engine::EngineContext;
use crate::entity::EntityKey;
use crate::scripting::value::{from_lua, to_lua};
use crate::scripting::{proxy, vm, ScriptValue, HOT_METHOD_THRESHOLD};

/// Methods every script component may receive from the engine loop. Their
/// handles are resolved once per instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Init,
    Update,
    Draw,
    EntityEnter,
    EntityStay,
    EntityExit,
    MapEnter,
    MapStay,
    MapExit,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 9] = [
        Lifecycle::Init,
        Lifecycle::Update,
        Lifecycle::Draw,
        Lifecycle::EntityEnter,
        Lifecycle::EntityStay,
        Lifecycle::EntityExit,
        Lifecycle::MapEnter,
        Lifecycle::MapStay,
        Lifecycle::MapExit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Lifecycle::Init => "entity_init",
            Lifecycle::Update => "entity_update",
            Lifecycle::Draw => "entity_draw",
            Lifecycle::EntityEnter => ENTITY_COLLISION_ENTER,
            Lifecycle::EntityStay => ENTITY_COLLISION_STAY,
            Lifecycle::EntityExit => ENTITY_COLLISION_EXIT,
            Lifecycle::MapEnter => MAP_COLLISION_ENTER,
            Lifecycle::MapStay => MAP_COLLISION_STAY,
            Lifecycle::MapExit => MAP_COLLISION_EXIT,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Ran(ScriptValue),
    /// No instance or no such method. Not an error.
    NotRun,
    Failed(String),
}

impl CallOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, CallOutcome::Ran(_))
    }

    pub fn value(&self) -> Option<&ScriptValue> {
        match self {
            CallOutcome::Ran(v) => Some(v),
            _ => None,
        }
    }
}

enum MethodSlot {
    Missing,
    Resolved(RegistryKey),
}

/// Per-component memo of the script instance and its method handles.
#[derive(Default)]
pub struct DispatchCache {
    instance: Option<RegistryKey>,
    class_hash: Option<u64>,
    lifecycle: [Option<RegistryKey>; 9],
    methods: HashMap<String, MethodSlot>,
    lookups: HashMap<String, u32>,
    initialized: bool,
}

impl DispatchCache {
    /// Drops the instance and every handle; the next call rebuilds them.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }

    pub fn class_hash(&self) -> Option<u64> {
        self.class_hash
    }

    #[cfg(test)]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[cfg(test)]
    pub fn has_lifecycle(&self, which: Lifecycle) -> bool {
        self.lifecycle[which.index()].is_some()
    }

    #[cfg(test)]
    pub fn is_cached(&self, method: &str) -> bool {
        matches!(self.methods.get(method), Some(MethodSlot::Resolved(_)))
    }

    #[cfg(test)]
    pub fn is_missing(&self, method: &str) -> bool {
        matches!(self.methods.get(method), Some(MethodSlot::Missing))
    }

    pub(crate) fn instance(&self) -> Option<&RegistryKey> {
        self.instance.as_ref()
    }
}

struct Target {
    script: String,
    owner: Option<EntityKey>,
}

fn script_target(ctx: &EngineContext, component: ComponentKey) -> Option<(Target, bool, Option<u64>)> {
    let world = ctx.world.borrow();
    let c = world.component(component)?;
    let script = c.as_script()?;
    Some((
        Target {
            script: script.script().to_string(),
            owner: c.entity(),
        },
        script.cache().has_instance(),
        script.cache().class_hash(),
    ))
}

fn with_cache<R>(ctx: &EngineContext, component: ComponentKey, f: impl FnOnce(&mut DispatchCache) -> R) -> Option<R> {
    let mut world = ctx.world.borrow_mut();
    let script = world.component_mut(component)?.as_script_mut()?;
    Some(f(&mut script.cache))
}

fn instance_table(lua: &Lua, ctx: &EngineContext, component: ComponentKey) -> Option<Table> {
    let world = ctx.world.borrow();
    let key = world.component(component)?.as_script()?.cache().instance()?;
    lua.registry_value::<Table>(key).ok()
}

fn owner_id(ctx: &EngineContext, owner: Option<EntityKey>) -> Option<String> {
    let world = ctx.world.borrow();
    owner
        .and_then(|key| world.entity(key))
        .map(|e| e.id().to_string())
}

fn fail(ctx: &EngineContext, target: &Target, message: String) -> CallOutcome {
    warn!("[Pixie scripts] {}: {}", target.script, message);
    ctx.record_error(&target.script, owner_id(ctx, target.owner), message.clone());
    CallOutcome::Failed(message)
}

/// Resolves the instance for `component`, building it on first use or after
/// the backing script changed. `entity_init` runs once per fresh instance.
fn ensure_instance(lua: &Lua, ctx: &Rc<EngineContext>, component: ComponentKey, target: &Target, cached: bool, cached_hash: Option<u64>) -> Result<Table, String> {
    let Some(hash) = ctx.library.borrow().hash_of(&target.script) else {
        return Err(format!("Unknown script '{}'", target.script));
    };
    if cached && cached_hash == Some(hash) {
        if let Some(instance) = instance_table(lua, ctx, component) {
            return Ok(instance);
        }
    }
    with_cache(ctx, component, DispatchCache::invalidate);

    let class = vm::class_table(lua, ctx, &target.script)?;
    let instance = build_instance(lua, ctx, component, target, &class).map_err(|e| e.to_string())?;
    let mut lifecycle: [Option<RegistryKey>; 9] = Default::default();
    for which in Lifecycle::ALL {
        if let Ok(Value::Function(f)) = class.get::<Value>(which.name()) {
            lifecycle[which.index()] = lua.create_registry_value(f).ok();
        }
    }
    let instance_key = lua
        .create_registry_value(instance.clone())
        .map_err(|e| e.to_string())?;
    let has_init = lifecycle[Lifecycle::Init.index()].is_some();
    with_cache(ctx, component, |cache| {
        cache.instance = Some(instance_key);
        cache.class_hash = Some(hash);
        cache.lifecycle = lifecycle;
        cache.initialized = true;
    });
    if has_init {
        if let CallOutcome::Failed(msg) = call_resolved(lua, ctx, component, target, Lifecycle::Init.name(), &instance, &[]) {
            debug!("[Pixie scripts] entity_init failed for '{}': {msg}", target.script);
        }
    }
    Ok(instance)
}

fn build_instance(lua: &Lua, ctx: &Rc<EngineContext>, component: ComponentKey, target: &Target, class: &Table) -> mlua::Result<Table> {
    let instance = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", class.clone())?;
    instance.set_metatable(Some(meta));
    let defaults = {
        let world = ctx.world.borrow();
        target
            .owner
            .and_then(|key| world.entity(key))
            .map(|e| e.defaults().to_vec())
            .unwrap_or_default()
    };
    for (name, value) in &defaults {
        instance.set(name.as_str(), to_lua(lua, ctx, value, ctx.limits.marshal_depth)?)?;
    }
    if let Some(owner) = target.owner {
        instance.set("entity", proxy::push_entity(lua, ctx, owner)?)?;
    }
    instance.set("component", proxy::push_component(lua, ctx, component)?)?;
    Ok(instance)
}

enum Resolution {
    Function(Function),
    Missing,
}

fn resolve(lua: &Lua, ctx: &EngineContext, component: ComponentKey, method: &str, instance: &Table) -> Resolution {
    if let Some(which) = Lifecycle::from_name(method) {
        let world = ctx.world.borrow();
        let f = world
            .component(component)
            .and_then(|c| c.as_script())
            .and_then(|s| s.cache().lifecycle[which.index()].as_ref())
            .and_then(|key| lua.registry_value::<Function>(key).ok());
        return f.map_or(Resolution::Missing, Resolution::Function);
    }

    {
        let world = ctx.world.borrow();
        let slot = world
            .component(component)
            .and_then(|c| c.as_script())
            .and_then(|s| s.cache().methods.get(method));
        match slot {
            Some(MethodSlot::Missing) => return Resolution::Missing,
            Some(MethodSlot::Resolved(key)) => {
                if let Ok(f) = lua.registry_value::<Function>(key) {
                    return Resolution::Function(f);
                }
            }
            None => {}
        }
    }

    match instance.get::<Value>(method) {
        Ok(Value::Function(f)) => {
            let promote = with_cache(ctx, component, |cache| {
                let count = cache.lookups.entry(method.to_string()).or_insert(0);
                *count += 1;
                *count >= HOT_METHOD_THRESHOLD
            })
            .unwrap_or(false);
            if promote {
                if let Ok(key) = lua.create_registry_value(f.clone()) {
                    with_cache(ctx, component, |cache| {
                        cache.lookups.remove(method);
                        cache
                            .methods
                            .insert(method.to_string(), MethodSlot::Resolved(key));
                    });
                }
            }
            Resolution::Function(f)
        }
        _ => {
            with_cache(ctx, component, |cache| {
                cache.methods.insert(method.to_string(), MethodSlot::Missing);
            });
            Resolution::Missing
        }
    }
}

fn call_resolved(lua: &Lua, ctx: &Rc<EngineContext>, component: ComponentKey, target: &Target, method: &str, instance: &Table, args: &[ScriptValue]) -> CallOutcome {
    let function = match resolve(lua, ctx, component, method, instance) {
        Resolution::Function(f) => f,
        Resolution::Missing => return CallOutcome::NotRun,
    };
    let mut values = Vec::with_capacity(args.len() + 1);
    values.push(Value::Table(instance.clone()));
    for arg in args {
        match to_lua(lua, ctx, arg, ctx.limits.marshal_depth) {
            Ok(v) => values.push(v),
            Err(e) => return fail(ctx, target, format!("{method}: {e}")),
        }
    }
    let result = vm::call_lua_with_budget(lua, &ctx.limits, &ctx.call_depth, || {
        function.call::<Value>(MultiValue::from_vec(values))
    });
    match result {
        Ok(value) => match from_lua(value, ctx.limits.marshal_depth) {
            Ok(v) => CallOutcome::Ran(v),
            Err(e) => {
                debug!("[Pixie scripts] {}: dropping return of {method}: {e}", target.script);
                CallOutcome::Ran(ScriptValue::Nil)
            }
        },
        Err(e) => fail(ctx, target, format!("{method}: {e}")),
    }
}

/// Calls `method` on a script component's instance. Missing methods and
/// non-script components report `NotRun`; runtime errors and budget aborts
/// report `Failed` and are logged.
pub fn call_method(lua: &Lua, ctx: &Rc<EngineContext>, component: ComponentKey, method: &str, args: &[ScriptValue]) -> CallOutcome {
    let Some((target, cached, hash)) = script_target(ctx, component) else {
        return CallOutcome::NotRun;
    };
    let instance = match ensure_instance(lua, ctx, component, &target, cached, hash) {
        Ok(instance) => instance,
        Err(e) => return fail(ctx, &target, e),
    };
    if !ctx.world.borrow().is_component_alive(component) {
        return CallOutcome::NotRun;
    }
    call_resolved(lua, ctx, component, &target, method, &instance, args)
}

pub fn call_lifecycle(lua: &Lua, ctx: &Rc<EngineContext>, component: ComponentKey, which: Lifecycle, args: &[ScriptValue]) -> CallOutcome {
    call_method(lua, ctx, component, which.name(), args)
}

/// Active script components of `entity`, in array order.
pub fn script_components(ctx: &EngineContext, entity: EntityKey) -> Vec<ComponentKey> {
    let world = ctx.world.borrow();
    let Some(e) = world.entity(entity) else {
        return Vec::new();
    };
    e.components()
        .iter()
        .copied()
        .filter(|key| {
            world
                .component(*key)
                .is_some_and(|c| c.active && matches!(c.data, ComponentData::Script(_)))
        })
        .collect()
}

/// Fire-and-forget call into every active script component of `entity`.
/// Returns how many components ran the method.
pub fn dispatch_entity(lua: &Lua, ctx: &Rc<EngineContext>, entity: EntityKey, method: &str, args: &[ScriptValue]) -> usize {
    script_components(ctx, entity)
        .into_iter()
        .filter(|component| call_method(lua, ctx, *component, method, args).ran())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ScriptComponent;
    use crate::engine::Engine;

    fn engine_with(name: &str, source: &str) -> Engine {
        let engine = Engine::default();
        engine.load_script(name, source).expect("load");
        engine
    }

    fn scripted(engine: &Engine, script: &str) -> (EntityKey, ComponentKey) {
        let e = engine.spawn();
        let c = engine
            .context()
            .world
            .borrow_mut()
            .attach_new(e, ComponentData::Script(ScriptComponent::new(script)));
        (e, c)
    }

    fn cache_of<R>(engine: &Engine, c: ComponentKey, f: impl FnOnce(&DispatchCache) -> R) -> R {
        let world = engine.context().world.borrow();
        f(world.component(c).and_then(|c| c.as_script()).expect("script").cache())
    }

    #[test]
    fn missing_method_is_not_run() {
        let engine = engine_with("blank", "return {}");
        let (_, c) = scripted(&engine, "blank");
        let outcome = call_method(engine.lua(), engine.context(), c, "no_such_method", &[]);
        assert_eq!(outcome, CallOutcome::NotRun);
        assert!(cache_of(&engine, c, |cache| cache.is_missing("no_such_method")));
        assert!(engine.context().errors.borrow().entries.is_empty());
    }

    #[test]
    fn arguments_and_returns_are_marshaled() {
        let engine = engine_with(
            "math",
            r#"
local M = {}
function M:add(a, b) return a + b end
function M:echo(t) return { n = t.n * 2, name = t.name } end
return M
"#,
        );
        let (_, c) = scripted(&engine, "math");
        let out = call_method(
            engine.lua(),
            engine.context(),
            c,
            "add",
            &[ScriptValue::Number(2.0), ScriptValue::Number(3.0)],
        );
        assert_eq!(out, CallOutcome::Ran(ScriptValue::Number(5.0)));

        let arg = ScriptValue::from_json(&serde_json::json!({ "n": 4, "name": "x" }));
        let out = call_method(engine.lua(), engine.context(), c, "echo", &[arg]);
        let value = out.value().expect("ran");
        assert_eq!(value.get("n"), Some(&ScriptValue::Number(8.0)));
        assert_eq!(value.get("name"), Some(&ScriptValue::from("x")));
    }

    #[test]
    fn init_runs_once_and_sees_defaults() {
        let engine = engine_with(
            "counter",
            r#"
local C = {}
function C:entity_init() self.count = self.start or 0 end
function C:bump() self.count = self.count + 1; return self.count end
return C
"#,
        );
        let (e, c) = scripted(&engine, "counter");
        if let Some(ent) = engine.context().world.borrow_mut().entity_mut(e) {
            ent.set_default("start", ScriptValue::Number(10.0));
        }
        let lua = engine.lua();
        let ctx = engine.context();
        assert_eq!(call_method(lua, ctx, c, "bump", &[]), CallOutcome::Ran(11.0.into()));
        assert_eq!(call_method(lua, ctx, c, "bump", &[]), CallOutcome::Ran(12.0.into()));
        assert!(cache_of(&engine, c, |cache| cache.is_initialized()
            && cache.has_lifecycle(Lifecycle::Init)
            && !cache.has_lifecycle(Lifecycle::Update)));
    }

    #[test]
    fn frequently_called_methods_are_promoted() {
        let engine = engine_with(
            "hot",
            "local H = {} function H:ping() return 1 end return H",
        );
        let (_, c) = scripted(&engine, "hot");
        for expected_cached in [false, true, true] {
            assert!(call_method(engine.lua(), engine.context(), c, "ping", &[]).ran());
            assert_eq!(cache_of(&engine, c, |cache| cache.is_cached("ping")), expected_cached);
        }
    }

    #[test]
    fn changing_the_script_rebuilds_the_cache() {
        let engine = engine_with("a", "local A = {} function A:who() return 'a' end return A");
        engine
            .load_script("b", "local B = {} function B:who() return 'b' end return B")
            .expect("load b");
        let (_, c) = scripted(&engine, "a");
        let lua = engine.lua();
        let ctx = engine.context();
        for _ in 0..3 {
            call_method(lua, ctx, c, "who", &[]);
        }
        assert!(cache_of(&engine, c, |cache| cache.is_cached("who")));

        let changed = ctx
            .world
            .borrow_mut()
            .component_mut(c)
            .and_then(|c| c.as_script_mut())
            .map(|s| s.set_script("b"));
        assert_eq!(changed, Some(true));
        assert!(cache_of(&engine, c, |cache| !cache.has_instance() && !cache.is_cached("who")));
        assert_eq!(call_method(lua, ctx, c, "who", &[]), CallOutcome::Ran("b".into()));
    }

    #[test]
    fn reloaded_source_invalidates_by_hash() {
        let engine = engine_with("v", "local V = {} function V:n() return 1 end return V");
        let (_, c) = scripted(&engine, "v");
        let (lua, ctx) = (engine.lua(), engine.context());
        assert_eq!(call_method(lua, ctx, c, "n", &[]), CallOutcome::Ran(1.0.into()));
        engine
            .load_script("v", "local V = {} function V:n() return 2 end return V")
            .expect("reload");
        assert_eq!(call_method(lua, ctx, c, "n", &[]), CallOutcome::Ran(2.0.into()));
    }

    #[test]
    fn runtime_errors_fail_without_unwinding() {
        let engine = engine_with(
            "boom",
            "local B = {} function B:go() error('kaboom') end function B:ok() return true end return B",
        );
        let (_, c) = scripted(&engine, "boom");
        let (lua, ctx) = (engine.lua(), engine.context());
        let CallOutcome::Failed(msg) = call_method(lua, ctx, c, "go", &[]) else {
            panic!("expected failure");
        };
        assert!(msg.contains("kaboom"), "{msg}");
        assert_eq!(ctx.errors.borrow().entries.len(), 1);
        assert_eq!(call_method(lua, ctx, c, "ok", &[]), CallOutcome::Ran(true.into()));
    }

    #[test]
    fn unknown_script_fails() {
        let engine = Engine::default();
        let (_, c) = scripted(&engine, "nope");
        let outcome = call_method(engine.lua(), engine.context(), c, "x", &[]);
        assert!(matches!(outcome, CallOutcome::Failed(ref m) if m.contains("Unknown script")));
    }

    #[test]
    fn dispatch_reaches_every_active_script_component() {
        let engine = engine_with(
            "tagger",
            "local T = {} function T:mark(tag) self.entity:add_tag(tag) end return T",
        );
        engine
            .load_script("silent", "return {}")
            .expect("load silent");
        let (e, _) = scripted(&engine, "tagger");
        let ctx = engine.context();
        let silent = ctx
            .world
            .borrow_mut()
            .attach_new(e, ComponentData::Script(ScriptComponent::new("silent")));
        let ran = dispatch_entity(engine.lua(), ctx, e, "mark", &["seen".into()]);
        assert_eq!(ran, 1);
        assert!(ctx.world.borrow().has_tag(e, "SEEN"));

        if let Some(c) = ctx.world.borrow_mut().component_mut(silent) {
            c.active = false;
        }
        assert_eq!(script_components(ctx, e).len(), 1);
    }
}
