use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use bevy::prelude::*;
use mlua::Lua;
use serde::Serialize;

use crate::bus::MessageBus;
use crate::collision::{CollisionOther, CollisionTracker};
use crate::component::ComponentData;
use crate::config::{EngineConfig, ScriptLimits};
use crate::entity::EntityKey;
use crate::render::{present_draw_list, DrawList};
use crate::scripting::{api, dispatch, vm};
use crate::scripting::{Handle, Lifecycle, ScriptError, ScriptErrors, ScriptLibrary, ScriptValue};
use crate::world::World;

/// Bus drain passes per tick. Deliveries published by a delivery handler run
/// in the next pass.
const MAX_BUS_ROUNDS: usize = 4;
const BOOT_BUDGET_MS: u64 = 1_000;

/// Entities the engine simulates, in registration order. The registry holds
/// one reference on each.
#[derive(Default)]
pub struct Registry {
    entities: Vec<EntityKey>,
    ticking: bool,
    pending_removal: Vec<EntityKey>,
}

impl Registry {
    pub fn contains(&self, key: EntityKey) -> bool {
        self.entities.contains(&key)
    }

    pub fn entities(&self) -> &[EntityKey] {
        &self.entities
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    pub fn is_pending_removal(&self, key: EntityKey) -> bool {
        self.pending_removal.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// State shared by the engine and every script proxy. Holds no Lua values
/// directly, only registry keys, so userdata finalizers never touch the VM.
pub struct EngineContext {
    pub world: RefCell<World>,
    pub registry: RefCell<Registry>,
    pub library: RefCell<ScriptLibrary>,
    pub finalize_queue: RefCell<Vec<Handle>>,
    pub errors: RefCell<ScriptErrors>,
    pub draw_list: RefCell<DrawList>,
    pub limits: ScriptLimits,
    pub debug_colliders: bool,
    pub call_depth: Cell<u32>,
    pub tick: Cell<u64>,
}

impl EngineContext {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            world: RefCell::new(World::new(
                Box::new(MessageBus::default()),
                config.component_capacity,
            )),
            registry: RefCell::new(Registry::default()),
            library: RefCell::new(ScriptLibrary::default()),
            finalize_queue: RefCell::new(Vec::new()),
            errors: RefCell::new(ScriptErrors::default()),
            draw_list: RefCell::new(DrawList::default()),
            limits: config.script_limits,
            debug_colliders: config.debug_colliders,
            call_depth: Cell::new(0),
            tick: Cell::new(0),
        }
    }

    /// Called from owning proxies when the collector drops them.
    pub fn defer_finalize(&self, handle: Handle) {
        self.finalize_queue.borrow_mut().push(handle);
    }

    pub fn record_error(&self, script: &str, entity_id: Option<String>, message: String) {
        self.errors.borrow_mut().push(ScriptError {
            script_name: script.to_string(),
            entity_id,
            error_message: message,
            tick: self.tick.get(),
        });
    }

    /// Releases the script reference of every collected owning proxy.
    pub fn drain_finalizers(&self) -> usize {
        let mut drained = 0;
        loop {
            let queued = std::mem::take(&mut *self.finalize_queue.borrow_mut());
            if queued.is_empty() {
                return drained;
            }
            let mut world = self.world.borrow_mut();
            for handle in queued {
                finalize_handle(&mut world, handle);
                drained += 1;
            }
        }
    }
}

fn finalize_handle(world: &mut World, handle: Handle) {
    match handle {
        Handle::Entity(key) if world.is_alive(key) => {
            world.finalize_entity(key);
        }
        Handle::Component(key) if world.is_component_alive(key) => {
            world.finalize_component(key);
        }
        _ => {}
    }
}

/// Adds `key` to the simulation. Re-adding an entity whose removal is still
/// pending cancels the removal.
pub fn register(ctx: &EngineContext, key: EntityKey) -> bool {
    let mut world = ctx.world.borrow_mut();
    if !world.is_alive(key) {
        return false;
    }
    let mut registry = ctx.registry.borrow_mut();
    if registry.contains(key) {
        let Some(i) = registry.pending_removal.iter().position(|k| *k == key) else {
            return false;
        };
        registry.pending_removal.remove(i);
        return true;
    }
    world.ref_entity(key);
    registry.entities.push(key);
    true
}

/// Takes `key` out of the simulation and gives up the registry's reference.
/// During a tick the removal waits until the tick ends.
pub fn unregister(ctx: &EngineContext, key: EntityKey) -> bool {
    let mut registry = ctx.registry.borrow_mut();
    if !registry.contains(key) || registry.is_pending_removal(key) {
        return false;
    }
    if registry.is_ticking() {
        registry.pending_removal.push(key);
        return true;
    }
    registry.entities.retain(|k| *k != key);
    drop(registry);
    ctx.world.borrow_mut().destroy_entity(key);
    true
}

pub fn find_by_tag(ctx: &EngineContext, tag: &str) -> Vec<EntityKey> {
    let world = ctx.world.borrow();
    ctx.registry
        .borrow()
        .entities()
        .iter()
        .copied()
        .filter(|key| world.has_tag(*key, tag))
        .collect()
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct EngineStats {
    pub ticks: u64,
    pub entities: usize,
    /// Registered or not; script-held entities count too.
    pub live_entities: usize,
    pub components: usize,
    pub pair_checks: u64,
    pub collision_events: usize,
    pub deliveries: usize,
    pub finalized: usize,
    pub script_failures: u64,
}

/// Owns the Lua state and the entity registry and runs the fixed tick:
/// update, collision, collision callbacks, bus, draw.
pub struct Engine {
    // Dropped before `ctx` so proxy finalizers still see a live context.
    lua: Lua,
    ctx: Rc<EngineContext>,
    tracker: CollisionTracker,
    stats: EngineStats,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let lua = Lua::new();
        let ctx = Rc::new(EngineContext::new(config));
        if let Err(e) = api::install_globals(&lua, &ctx) {
            error!("[Pixie scripts] Failed to install script globals: {e}");
        }
        Self {
            lua,
            ctx,
            tracker: CollisionTracker::default(),
            stats: EngineStats::default(),
        }
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn context(&self) -> &Rc<EngineContext> {
        &self.ctx
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// New registered entity. The registry is its only owner.
    pub fn spawn(&self) -> EntityKey {
        let key = self.ctx.world.borrow_mut().create_entity();
        self.add_entity(key);
        self.ctx.world.borrow_mut().unref_entity(key);
        key
    }

    pub fn add_entity(&self, key: EntityKey) -> bool {
        register(&self.ctx, key)
    }

    pub fn remove_entity(&self, key: EntityKey) -> bool {
        unregister(&self.ctx, key)
    }

    pub fn entities(&self) -> Vec<EntityKey> {
        self.ctx.registry.borrow().entities().to_vec()
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<EntityKey> {
        find_by_tag(&self.ctx, tag)
    }

    pub fn load_script(&self, name: &str, source: impl Into<String>) -> Result<bool, String> {
        self.ctx
            .library
            .borrow_mut()
            .load_script(name, source.into(), &self.ctx.limits)
    }

    /// Hot-reload entry. Live instances rebuild on their next call because
    /// their cached class hash no longer matches.
    pub fn reload_script(&self, name: &str, source: impl Into<String>) -> Result<bool, String> {
        let changed = self.load_script(name, source)?;
        if changed {
            info!("[Pixie scripts] Reloaded '{name}'");
        }
        Ok(changed)
    }

    /// Loads every `*.lua` file in `dir`, named by file stem.
    pub fn load_scripts_dir(&self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[Pixie scripts] Cannot read {}: {e}", dir.display());
                return 0;
            }
        };
        let mut loaded = 0;
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("lua") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let result = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|source| self.load_script(name, source));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => warn!("[Pixie scripts] Skipping {}: {e}", path.display()),
            }
        }
        info!(
            "[Pixie scripts] Loaded {loaded} scripts from {} ({} in library)",
            dir.display(),
            self.ctx.library.borrow().len()
        );
        loaded
    }

    /// Runs a scene-building chunk against the script globals.
    pub fn run_boot_script(&self, name: &str, source: &str) -> Result<(), String> {
        let limits = ScriptLimits {
            budget_ms: self.ctx.limits.budget_ms.max(BOOT_BUDGET_MS),
            ..self.ctx.limits
        };
        let result = vm::call_lua_with_budget(&self.lua, &limits, &self.ctx.call_depth, || {
            self.lua.load(source).set_name(name).exec()
        });
        self.ctx.drain_finalizers();
        result.map_err(|e| e.to_string())
    }

    pub fn publish(&self, topic: &str, value: ScriptValue) {
        self.ctx.world.borrow_mut().publish(topic, value);
    }

    pub fn publish_json(&self, topic: &str, value: &serde_json::Value) {
        self.publish(topic, ScriptValue::from_json(value));
    }

    /// Full collection; owning proxies that died release their reference.
    pub fn collect_garbage(&self) -> usize {
        for _ in 0..2 {
            if let Err(e) = self.lua.gc_collect() {
                warn!("[Pixie scripts] Collection failed: {e}");
            }
        }
        let drained = self.ctx.drain_finalizers();
        self.expire_released_handles();
        drained
    }

    /// Drops the registry entries that cached proxies of freed objects.
    fn expire_released_handles(&self) {
        let released = self.ctx.world.borrow_mut().take_released_handles();
        for key in released {
            if let Err(e) = self.lua.remove_registry_value(key) {
                warn!("[Pixie scripts] Cannot release proxy handle: {e}");
            }
        }
    }

    /// Removes every registered entity not flagged persistent.
    pub fn clear_scene(&self) -> usize {
        let doomed: Vec<EntityKey> = {
            let world = self.ctx.world.borrow();
            self.ctx
                .registry
                .borrow()
                .entities()
                .iter()
                .copied()
                .filter(|key| world.entity(*key).is_some_and(|e| !e.persistent))
                .collect()
        };
        doomed
            .into_iter()
            .filter(|key| self.remove_entity(*key))
            .count()
    }

    /// Rebuilds the scene from an edited boot script: non-persistent
    /// entities go, collected proxies release, then the chunk runs again.
    pub fn restart_scene(&self, name: &str, source: &str) -> Result<usize, String> {
        let cleared = self.clear_scene();
        self.collect_garbage();
        self.run_boot_script(name, source)?;
        info!("[Pixie scripts] Restarted scene from '{name}' ({cleared} entities cleared)");
        Ok(cleared)
    }

    pub fn tick(&mut self, dt: f32) {
        self.ctx.tick.set(self.ctx.tick.get() + 1);
        self.ctx.registry.borrow_mut().ticking = true;
        let snapshot = self.entities();
        let checks_before = self.tracker.pair_checks;

        self.update_pass(&snapshot, dt);
        let mut finalized = self.ctx.drain_finalizers();
        let collision_events = self.collision_pass(&snapshot);
        let deliveries = self.bus_pass();
        self.draw_pass();

        self.ctx.registry.borrow_mut().ticking = false;
        self.apply_pending_removals();
        finalized += self.ctx.drain_finalizers();
        self.expire_released_handles();

        let world = self.ctx.world.borrow();
        self.stats = EngineStats {
            ticks: self.ctx.tick.get(),
            entities: self.ctx.registry.borrow().len(),
            live_entities: world.entity_count(),
            components: world.component_total(),
            pair_checks: self.tracker.pair_checks - checks_before,
            collision_events,
            deliveries,
            finalized,
            script_failures: self.ctx.errors.borrow().total,
        };
    }

    fn update_pass(&self, entities: &[EntityKey], dt: f32) {
        for &entity in entities {
            let components = {
                let world = self.ctx.world.borrow();
                match world.entity(entity) {
                    Some(e) if e.active => e.components().to_vec(),
                    _ => continue,
                }
            };
            for component in components {
                let scripted = {
                    let mut world = self.ctx.world.borrow_mut();
                    match world.component_mut(component) {
                        Some(c) if c.active && c.entity() == Some(entity) => match &mut c.data {
                            ComponentData::Script(_) => true,
                            data => {
                                data.behavior_mut().update(dt);
                                false
                            }
                        },
                        _ => false,
                    }
                };
                if scripted {
                    dispatch::call_lifecycle(
                        &self.lua,
                        &self.ctx,
                        component,
                        Lifecycle::Update,
                        &[ScriptValue::Number(dt as f64)],
                    );
                }
            }
        }
    }

    fn collision_pass(&mut self, entities: &[EntityKey]) -> usize {
        let live: Vec<EntityKey> = {
            let world = self.ctx.world.borrow();
            entities
                .iter()
                .copied()
                .filter(|key| world.is_alive(*key))
                .collect()
        };
        let events = self
            .tracker
            .resolve(&mut self.ctx.world.borrow_mut(), &live);
        for event in &events {
            let Some(method) = event.callback() else {
                continue;
            };
            let other = match event.other {
                CollisionOther::Entity(key) => Handle::Entity(key),
                CollisionOther::Map { map, .. } => Handle::Component(map),
            };
            if !self.ctx.world.borrow().is_alive(event.entity) {
                continue;
            }
            dispatch::dispatch_entity(
                &self.lua,
                &self.ctx,
                event.entity,
                method,
                &[ScriptValue::Handle(other)],
            );
        }
        let live: Vec<EntityKey> = {
            let world = self.ctx.world.borrow();
            live.into_iter().filter(|key| world.is_alive(*key)).collect()
        };
        self.tracker
            .end_tick(&mut self.ctx.world.borrow_mut(), &live);
        events.len()
    }

    /// Delivers queued bus messages as `method(value, topic)` calls.
    fn bus_pass(&self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_BUS_ROUNDS {
            let deliveries = self.ctx.world.borrow_mut().drain_messages();
            if deliveries.is_empty() {
                break;
            }
            for d in deliveries {
                let active = self
                    .ctx
                    .world
                    .borrow()
                    .entity(d.target)
                    .is_some_and(|e| e.active);
                if !active {
                    continue;
                }
                delivered += dispatch::dispatch_entity(
                    &self.lua,
                    &self.ctx,
                    d.target,
                    &d.method,
                    &[d.value, ScriptValue::String(d.topic)],
                );
            }
        }
        delivered
    }

    fn draw_pass(&self) {
        self.ctx.draw_list.borrow_mut().clear();
        let mut order: Vec<(i32, EntityKey)> = {
            let world = self.ctx.world.borrow();
            self.ctx
                .registry
                .borrow()
                .entities()
                .iter()
                .filter_map(|key| {
                    world
                        .entity(*key)
                        .filter(|e| e.active && e.visible)
                        .map(|e| (e.draw_order, *key))
                })
                .collect()
        };
        order.sort_by_key(|(draw_order, _)| *draw_order);

        for (_, entity) in order {
            let (origin, components) = {
                let world = self.ctx.world.borrow();
                match world.entity(entity) {
                    Some(e) => (e.position(), e.components().to_vec()),
                    None => continue,
                }
            };
            for component in components {
                let scripted = {
                    let world = self.ctx.world.borrow();
                    match world.component(component) {
                        Some(c) if c.active => match &c.data {
                            ComponentData::Script(_) => true,
                            data => {
                                data.behavior()
                                    .draw(origin, &mut *self.ctx.draw_list.borrow_mut());
                                false
                            }
                        },
                        _ => false,
                    }
                };
                if scripted {
                    dispatch::call_lifecycle(&self.lua, &self.ctx, component, Lifecycle::Draw, &[]);
                }
            }
        }
    }

    fn apply_pending_removals(&self) -> usize {
        let pending = std::mem::take(&mut self.ctx.registry.borrow_mut().pending_removal);
        for key in &pending {
            unregister(&self.ctx, *key);
        }
        pending.len()
    }
}

// ---- bevy integration ----

/// Stops the app once the engine has run this many ticks.
#[derive(Resource)]
pub struct TickLimit(pub u64);

/// Script name of the chunk that built the scene. Edits to it restart the
/// scene instead of reloading a behavior.
#[derive(Resource)]
pub struct BootScript(pub String);

pub struct EnginePlugin {
    pub config: EngineConfig,
    /// Published once the scene is built, ahead of the first tick.
    pub startup_messages: Vec<(String, serde_json::Value)>,
}

impl Plugin for EnginePlugin {
    fn build(&self, app: &mut App) {
        let engine = Engine::new(&self.config);
        let scripts_dir = Path::new(&self.config.scripts_dir);
        if scripts_dir.is_dir() {
            engine.load_scripts_dir(scripts_dir);
        }
        if let Some(boot) = &self.config.boot_script {
            let name = boot_engine(&engine, scripts_dir, boot);
            app.insert_resource(BootScript(name));
        }
        for (topic, value) in &self.startup_messages {
            engine.publish_json(topic, value);
        }

        app.insert_resource(Time::<Fixed>::from_hz(self.config.tick_hz))
            .insert_non_send_resource(engine)
            .add_systems(FixedUpdate, run_engine_tick)
            .add_systems(Update, exit_after_tick_limit);
        if !self.config.headless {
            app.add_systems(Startup, spawn_camera)
                .add_systems(Update, present_engine_draw_list);
        }
    }
}

fn boot_engine(engine: &Engine, scripts_dir: &Path, boot: &str) -> String {
    let direct = Path::new(boot);
    let path = if direct.is_file() {
        direct.to_path_buf()
    } else {
        scripts_dir.join(format!("{boot}.lua"))
    };
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(boot)
        .to_string();
    match std::fs::read_to_string(&path) {
        Ok(source) => match engine.run_boot_script(&name, &source) {
            Ok(()) => info!(
                "[Pixie scripts] Boot script '{name}' registered {} entities",
                engine.entities().len()
            ),
            Err(e) => error!("[Pixie scripts] Boot script '{name}' failed: {e}"),
        },
        Err(e) => error!("[Pixie scripts] Cannot read boot script {}: {e}", path.display()),
    }
    name
}

fn run_engine_tick(mut engine: NonSendMut<Engine>, time: Res<Time>) {
    engine.tick(time.delta_secs());
}

fn exit_after_tick_limit(
    engine: NonSend<Engine>,
    limit: Option<Res<TickLimit>>,
    mut exit: EventWriter<AppExit>,
) {
    let Some(limit) = limit else { return };
    if engine.stats().ticks >= limit.0 {
        info!("[Pixie] Tick limit reached: {}", serde_json::to_string(engine.stats()).unwrap_or_default());
        exit.send(AppExit::Success);
    }
}

fn spawn_camera(mut commands: Commands) {
    commands.spawn(Camera2d);
}

fn present_engine_draw_list(engine: NonSend<Engine>, mut gizmos: Gizmos) {
    let draw_list = engine.context().draw_list.borrow();
    present_draw_list(&draw_list.commands, &mut gizmos);
}
