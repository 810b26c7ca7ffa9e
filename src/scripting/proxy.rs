use std::rc::Rc;

use bevy::prelude::Vec2;
use mlua::{
    AnyUserData, Lua, LuaSerdeExt, MetaMethod, Table, UserData, UserDataFields, UserDataMethods,
    Value, Variadic,
};

use crate::component::collider::ColliderRect;
use crate::component::{Component, ComponentData, ComponentKey, ComponentKind, SpriteComponent};
use crate::engine::{self, EngineContext};
use crate::entity::{Entity, EntityKey};
use crate::geometry::Rect;
use crate::scripting::dispatch::{self, CallOutcome};
use crate::scripting::value::{from_lua, to_lua};
use crate::scripting::{Handle, ScriptValue};

fn stale(what: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{what} has been destroyed"))
}

fn args_to_values(args: Variadic<Value>, depth: usize) -> mlua::Result<Vec<ScriptValue>> {
    args.into_iter().map(|v| from_lua(v, depth)).collect()
}

// ---- pushing native objects to script ----

/// Non-owning proxy, cached in the entity's bridge slot so every push of the
/// same entity yields the same userdata. Freed entities push as nil.
pub fn push_entity(lua: &Lua, ctx: &Rc<EngineContext>, key: EntityKey) -> mlua::Result<Value> {
    {
        let world = ctx.world.borrow();
        let Some(entity) = world.entity(key) else {
            return Ok(Value::Nil);
        };
        if let Some(handle) = entity.bridge().handle() {
            if let Ok(ud) = lua.registry_value::<AnyUserData>(handle) {
                return Ok(Value::UserData(ud));
            }
        }
    }
    let ud = lua.create_userdata(LuaEntity {
        key,
        ctx: ctx.clone(),
        owning: false,
    })?;
    let handle = lua.create_registry_value(ud.clone())?;
    if let Some(entity) = ctx.world.borrow_mut().entity_mut(key) {
        entity.bridge.set_handle(handle);
    }
    Ok(Value::UserData(ud))
}

pub fn push_component(lua: &Lua, ctx: &Rc<EngineContext>, key: ComponentKey) -> mlua::Result<Value> {
    {
        let world = ctx.world.borrow();
        let Some(component) = world.component(key) else {
            return Ok(Value::Nil);
        };
        if let Some(handle) = component.bridge().handle() {
            if let Ok(ud) = lua.registry_value::<AnyUserData>(handle) {
                return Ok(Value::UserData(ud));
            }
        }
    }
    let ud = lua.create_userdata(LuaComponent {
        key,
        ctx: ctx.clone(),
        owning: false,
    })?;
    let handle = lua.create_registry_value(ud.clone())?;
    if let Some(component) = ctx.world.borrow_mut().component_mut(key) {
        component.bridge.set_handle(handle);
    }
    Ok(Value::UserData(ud))
}

/// Hands the caller's reference to script. The returned proxy's finalizer
/// releases it.
pub fn push_owned_entity(lua: &Lua, ctx: &Rc<EngineContext>, key: EntityKey) -> mlua::Result<AnyUserData> {
    ctx.world.borrow_mut().hand_entity_to_script(key);
    lua.create_userdata(LuaEntity {
        key,
        ctx: ctx.clone(),
        owning: true,
    })
}

pub fn push_owned_component(lua: &Lua, ctx: &Rc<EngineContext>, key: ComponentKey) -> mlua::Result<AnyUserData> {
    ctx.world.borrow_mut().hand_component_to_script(key);
    lua.create_userdata(LuaComponent {
        key,
        ctx: ctx.clone(),
        owning: true,
    })
}

/// Returns a component detached by pop/shift. The array's reference moves
/// into a fresh owning proxy, whatever other proxies script still holds.
fn hand_back_component(lua: &Lua, ctx: &Rc<EngineContext>, key: ComponentKey) -> mlua::Result<Value> {
    push_owned_component(lua, ctx, key).map(Value::UserData)
}

fn component_key_of(value: &Value) -> Option<ComponentKey> {
    match value {
        Value::UserData(ud) => ud.borrow::<LuaComponent>().ok().map(|c| c.key),
        _ => None,
    }
}

fn point_of(value: &Value) -> mlua::Result<Vec2> {
    match value {
        Value::UserData(ud) => ud.borrow::<LuaPoint>()?.value(),
        Value::Table(t) => Ok(Vec2::new(t.get::<f32>("x")?, t.get::<f32>("y")?)),
        _ => Err(mlua::Error::RuntimeError(
            "expected a point or a { x, y } table".to_string(),
        )),
    }
}

// ---- entity ----

pub struct LuaEntity {
    key: EntityKey,
    ctx: Rc<EngineContext>,
    owning: bool,
}

impl Drop for LuaEntity {
    fn drop(&mut self) {
        if self.owning {
            self.ctx.defer_finalize(Handle::Entity(self.key));
        }
    }
}

impl LuaEntity {
    pub fn key(&self) -> EntityKey {
        self.key
    }

    fn read<R>(&self, f: impl FnOnce(&Entity) -> R) -> mlua::Result<R> {
        let world = self.ctx.world.borrow();
        world.entity(self.key).map(f).ok_or_else(|| stale("entity"))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Entity) -> R) -> mlua::Result<R> {
        let mut world = self.ctx.world.borrow_mut();
        world.entity_mut(self.key).map(f).ok_or_else(|| stale("entity"))
    }

    fn alive(&self) -> mlua::Result<()> {
        self.read(|_| ())
    }

    fn data_table(&self, lua: &Lua) -> mlua::Result<Table> {
        let existing = {
            let world = self.ctx.world.borrow();
            let entity = world.entity(self.key).ok_or_else(|| stale("entity"))?;
            match &entity.data {
                Some(key) => Some(lua.registry_value::<Table>(key)?),
                None => None,
            }
        };
        if let Some(table) = existing {
            return Ok(table);
        }
        let table = lua.create_table()?;
        let key = lua.create_registry_value(table.clone())?;
        self.write(|e| e.data = Some(key))?;
        Ok(table)
    }
}

fn entity_of(ud: &AnyUserData) -> mlua::Result<mlua::UserDataRef<LuaEntity>> {
    ud.borrow::<LuaEntity>()
}

impl UserData for LuaEntity {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| this.read(|e| e.id().to_string()));
        fields.add_field_method_get("active", |_, this| this.read(|e| e.active));
        fields.add_field_function_set("active", |_, ud, v: bool| {
            entity_of(&ud)?.write(|e| e.active = v)
        });
        fields.add_field_method_get("visible", |_, this| this.read(|e| e.visible));
        fields.add_field_function_set("visible", |_, ud, v: bool| {
            entity_of(&ud)?.write(|e| e.visible = v)
        });
        fields.add_field_method_get("persistent", |_, this| this.read(|e| e.persistent));
        fields.add_field_function_set("persistent", |_, ud, v: bool| {
            entity_of(&ud)?.write(|e| e.persistent = v)
        });
        fields.add_field_method_get("draw_order", |_, this| this.read(|e| e.draw_order));
        fields.add_field_function_set("draw_order", |_, ud, v: i32| {
            entity_of(&ud)?.write(|e| e.draw_order = v)
        });
        fields.add_field_method_get("position", |_, this| {
            this.alive()?;
            Ok(LuaPoint::Entity {
                key: this.key,
                ctx: this.ctx.clone(),
            })
        });
        fields.add_field_function_set("position", |_, ud, v: Value| {
            let this = entity_of(&ud)?;
            let p = point_of(&v)?;
            this.alive()?;
            this.ctx.world.borrow_mut().set_position(this.key, p);
            Ok(())
        });
        fields.add_field_method_get("data", |lua, this| this.data_table(lua));
        fields.add_field_method_get("components", |_, this| {
            this.alive()?;
            Ok(LuaComponents {
                entity: this.key,
                ctx: this.ctx.clone(),
            })
        });
        fields.add_field_method_get("tags", |lua, this| {
            let tags = this.read(|e| e.tags().to_vec())?;
            lua.create_sequence_from(tags)
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("is_valid", |_, this, ()| {
            Ok(this.ctx.world.borrow().is_alive(this.key))
        });
        methods.add_method("add_tag", |_, this, tag: String| {
            this.alive()?;
            Ok(this.ctx.world.borrow_mut().add_tag(this.key, &tag))
        });
        methods.add_method("remove_tag", |_, this, tag: String| {
            this.alive()?;
            Ok(this.ctx.world.borrow_mut().remove_tag(this.key, &tag))
        });
        methods.add_method("has_tag", |_, this, tag: String| {
            this.alive()?;
            Ok(this.ctx.world.borrow().has_tag(this.key, &tag))
        });
        methods.add_method("dispatch", |lua, this, (name, args): (String, Variadic<Value>)| {
            this.alive()?;
            let args = args_to_values(args, this.ctx.limits.marshal_depth)?;
            Ok(dispatch::dispatch_entity(lua, &this.ctx, this.key, &name, &args))
        });
        methods.add_method("subscribe", |_, this, (topic, method): (String, String)| {
            this.alive()?;
            Ok(this.ctx.world.borrow_mut().subscribe(this.key, &topic, &method))
        });
        methods.add_method("unsubscribe", |_, this, (topic, method): (String, String)| {
            this.alive()?;
            Ok(this.ctx.world.borrow_mut().unsubscribe(this.key, &topic, &method))
        });
        methods.add_method("set_default", |_, this, (name, value): (String, Value)| {
            let value = from_lua(value, this.ctx.limits.marshal_depth)?;
            this.write(|e| e.set_default(name, value))
        });
        methods.add_method("move", |_, this, (dx, dy): (f32, f32)| {
            this.alive()?;
            this.ctx.world.borrow_mut().translate(this.key, Vec2::new(dx, dy));
            Ok(())
        });
        methods.add_method("destroy", |_, this, ()| {
            this.alive()?;
            Ok(engine::unregister(&this.ctx, this.key))
        });
        methods.add_method("copy", |lua, this, ()| {
            this.alive()?;
            let copy = this.ctx.world.borrow_mut().copy_entity(this.key);
            let data = {
                let world = this.ctx.world.borrow();
                match world.entity(this.key).and_then(|e| e.data.as_ref()) {
                    Some(key) => Some(lua.registry_value::<Table>(key)?),
                    None => None,
                }
            };
            if let Some(table) = data {
                let depth = this.ctx.limits.marshal_depth;
                let snapshot = from_lua(Value::Table(table), depth)?;
                if let Value::Table(cloned) = to_lua(lua, &this.ctx, &snapshot, depth)? {
                    let key = lua.create_registry_value(cloned)?;
                    if let Some(e) = this.ctx.world.borrow_mut().entity_mut(copy) {
                        e.data = Some(key);
                    }
                }
            }
            push_owned_entity(lua, &this.ctx, copy)
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<LuaEntity>()
                .is_ok_and(|o| o.key == this.key))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.read(|e| e.id().to_string()) {
                Ok(id) => format!("Entity({id})"),
                Err(_) => "Entity(<destroyed>)".to_string(),
            })
        });
    }
}

// ---- component ----

pub struct LuaComponent {
    key: ComponentKey,
    ctx: Rc<EngineContext>,
    owning: bool,
}

impl Drop for LuaComponent {
    fn drop(&mut self) {
        if self.owning {
            self.ctx.defer_finalize(Handle::Component(self.key));
        }
    }
}

impl LuaComponent {
    pub fn key(&self) -> ComponentKey {
        self.key
    }

    fn read<R>(&self, f: impl FnOnce(&Component) -> R) -> mlua::Result<R> {
        let world = self.ctx.world.borrow();
        world.component(self.key).map(f).ok_or_else(|| stale("component"))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Component) -> R) -> mlua::Result<R> {
        let mut world = self.ctx.world.borrow_mut();
        world
            .component_mut(self.key)
            .map(f)
            .ok_or_else(|| stale("component"))
    }
}

fn component_of(ud: &AnyUserData) -> mlua::Result<mlua::UserDataRef<LuaComponent>> {
    ud.borrow::<LuaComponent>()
}

fn wrong_kind(kind: ComponentKind, op: &str) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{op} is not supported by {} components", kind.name()))
}

/// Sprite fields read as nil on other kinds.
fn sprite_get<R>(this: &LuaComponent, f: impl FnOnce(&SpriteComponent) -> R) -> mlua::Result<Option<R>> {
    this.read(|c| c.as_sprite().map(f))
}

fn sprite_set(ud: &AnyUserData, field: &str, f: impl FnOnce(&mut SpriteComponent)) -> mlua::Result<()> {
    component_of(ud)?.write(|c| match c.as_sprite_mut() {
        Some(s) => {
            f(s);
            Ok(())
        }
        None => Err(wrong_kind(c.kind(), field)),
    })?
}

fn sprite_fields<F: UserDataFields<LuaComponent>>(fields: &mut F) {
    fields.add_field_method_get("texture", |_, this| sprite_get(this, |s| s.texture.clone()));
    fields.add_field_function_set("texture", |_, ud, v: String| {
        sprite_set(&ud, "texture", |s| s.texture = v)
    });
    fields.add_field_method_get("frames", |lua, this| {
        match sprite_get(this, |s| s.frames.clone())? {
            Some(frames) => lua.to_value(&frames),
            None => Ok(Value::Nil),
        }
    });
    fields.add_field_function_set("frames", |lua, ud, v: Value| {
        let frames: Vec<Rect> = lua.from_value(v)?;
        sprite_set(&ud, "frames", |s| s.set_frames(frames))
    });
    fields.add_field_method_get("fps", |_, this| sprite_get(this, |s| s.fps));
    fields.add_field_function_set("fps", |_, ud, v: f32| sprite_set(&ud, "fps", |s| s.fps = v));
    fields.add_field_method_get("looping", |_, this| sprite_get(this, |s| s.looping));
    fields.add_field_function_set("looping", |_, ud, v: bool| {
        sprite_set(&ud, "looping", |s| s.looping = v)
    });
    fields.add_field_method_get("playing", |_, this| sprite_get(this, |s| s.playing));
    fields.add_field_function_set("playing", |_, ud, v: bool| {
        sprite_set(&ud, "playing", |s| s.playing = v)
    });
    // Frames are 1-based on the script side.
    fields.add_field_method_get("frame", |_, this| sprite_get(this, |s| s.frame + 1));
    fields.add_field_function_set("frame", |_, ud, v: usize| {
        sprite_set(&ud, "frame", |s| {
            s.frame = v.saturating_sub(1).min(s.frames.len().saturating_sub(1));
        })
    });
    fields.add_field_method_get("offset", |_, this| {
        sprite_get(this, |s| LuaPoint::Free(s.offset))
    });
    fields.add_field_function_set("offset", |_, ud, v: Value| {
        let p = point_of(&v)?;
        sprite_set(&ud, "offset", |s| s.offset = p)
    });
    fields.add_field_method_get("scale", |_, this| sprite_get(this, |s| LuaPoint::Free(s.scale)));
    fields.add_field_function_set("scale", |_, ud, v: Value| {
        let p = point_of(&v)?;
        sprite_set(&ud, "scale", |s| s.scale = p)
    });
    fields.add_field_method_get("rotation", |_, this| sprite_get(this, |s| s.rotation));
    fields.add_field_function_set("rotation", |_, ud, v: f32| {
        sprite_set(&ud, "rotation", |s| s.rotation = v)
    });
    fields.add_field_method_get("tint", |_, this| sprite_get(this, |s| s.tint));
    fields.add_field_function_set("tint", |_, ud, v: [f32; 4]| {
        sprite_set(&ud, "tint", |s| s.tint = v)
    });
}

impl UserData for LuaComponent {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| this.read(|c| c.id().to_string()));
        fields.add_field_method_get("type", |_, this| this.read(|c| c.kind().name()));
        fields.add_field_method_get("active", |_, this| this.read(|c| c.active));
        fields.add_field_function_set("active", |_, ud, v: bool| {
            component_of(&ud)?.write(|c| c.active = v)
        });
        fields.add_field_method_get("entity", |lua, this| {
            match this.read(|c| c.entity())? {
                Some(owner) => push_entity(lua, &this.ctx, owner),
                None => Ok(Value::Nil),
            }
        });
        fields.add_field_method_get("script", |_, this| {
            this.read(|c| c.as_script().map(|s| s.script().to_string()))
        });
        fields.add_field_function_set("script", |_, ud, name: String| {
            let this = component_of(&ud)?;
            this.write(|c| match c.as_script_mut() {
                Some(s) => {
                    s.set_script(name);
                    Ok(())
                }
                None => Err(wrong_kind(c.kind(), "script")),
            })?
        });
        fields.add_field_method_get("rects", |lua, this| {
            let rects: Option<Vec<Rect>> = this.read(|c| {
                c.as_collider()
                    .map(|col| col.rects().iter().map(|r| r.rect).collect())
            })?;
            match rects {
                Some(rects) => lua.to_value(&rects),
                None => Ok(Value::Nil),
            }
        });
        fields.add_field_function_set("rects", |lua, ud, v: Value| {
            let this = component_of(&ud)?;
            let rects: Vec<Rect> = lua.from_value(v)?;
            let rects = rects.into_iter().map(ColliderRect::from).collect();
            let mut world = this.ctx.world.borrow_mut();
            if !world.is_component_alive(this.key) {
                return Err(stale("component"));
            }
            if world.set_collider_rects(this.key, rects) {
                Ok(())
            } else {
                Err(mlua::Error::RuntimeError(
                    "rects is only supported by collider components".to_string(),
                ))
            }
        });
        sprite_fields(fields);
        fields.add_field_method_get("debug_draw", |_, this| {
            this.read(|c| c.as_collider().map(|col| col.debug_draw))
        });
        fields.add_field_function_set("debug_draw", |_, ud, v: bool| {
            component_of(&ud)?.write(|c| {
                if let ComponentData::Collider(col) = &mut c.data {
                    col.debug_draw = v;
                }
            })
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("is_valid", |_, this, ()| {
            Ok(this.ctx.world.borrow().is_component_alive(this.key))
        });
        methods.add_method("call", |lua, this, (name, args): (String, Variadic<Value>)| {
            this.read(|_| ())?;
            let args = args_to_values(args, this.ctx.limits.marshal_depth)?;
            match dispatch::call_method(lua, &this.ctx, this.key, &name, &args) {
                CallOutcome::Ran(v) => to_lua(lua, &this.ctx, &v, this.ctx.limits.marshal_depth),
                CallOutcome::NotRun | CallOutcome::Failed(_) => Ok(Value::Nil),
            }
        });
        // 1-based like the rects table; false when out of range.
        methods.add_method("set_rect_enabled", |_, this, (index, enabled): (usize, bool)| {
            let mut world = this.ctx.world.borrow_mut();
            if !world.is_component_alive(this.key) {
                return Err(stale("component"));
            }
            let Some(i) = index.checked_sub(1) else {
                return Ok(false);
            };
            world.set_collider_rect_enabled(this.key, i, enabled).ok_or_else(|| {
                mlua::Error::RuntimeError(
                    "set_rect_enabled is only supported by collider components".to_string(),
                )
            })
        });
        methods.add_method("get_tile", |_, this, (x, y): (i32, i32)| {
            this.read(|c| c.as_map().map_or(0, |m| m.get_tile(x, y)))
        });
        methods.add_method("set_tile", |_, this, (x, y, id): (i32, i32, u8)| {
            this.write(|c| match &mut c.data {
                ComponentData::Map(m) => m.set_tile(x, y, id),
                _ => false,
            })
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<LuaComponent>()
                .is_ok_and(|o| o.key == this.key))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.read(|c| (c.kind().name(), c.id().to_string())) {
                Ok((kind, id)) => format!("Component({kind}, {id})"),
                Err(_) => "Component(<destroyed>)".to_string(),
            })
        });
    }
}

// ---- component array ----

pub struct LuaComponents {
    entity: EntityKey,
    ctx: Rc<EngineContext>,
}

impl LuaComponents {
    fn alive(&self) -> mlua::Result<()> {
        if self.ctx.world.borrow().is_alive(self.entity) {
            Ok(())
        } else {
            Err(stale("entity"))
        }
    }

    fn attachable(&self, value: &Value) -> mlua::Result<ComponentKey> {
        self.alive()?;
        let key = component_key_of(value).ok_or_else(|| {
            mlua::Error::RuntimeError("expected a component".to_string())
        })?;
        if !self.ctx.world.borrow().is_component_alive(key) {
            return Err(stale("component"));
        }
        Ok(key)
    }

    fn count(&self) -> mlua::Result<usize> {
        self.alive()?;
        Ok(self.ctx.world.borrow().component_count(self.entity))
    }
}

impl UserData for LuaComponents {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("count", |_, this, ()| this.count());
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| this.count());
        methods.add_method("add", |_, this, c: Value| {
            let key = this.attachable(&c)?;
            Ok(this.ctx.world.borrow_mut().add_component(this.entity, key))
        });
        methods.add_method("insert", |_, this, (index, c): (usize, Value)| {
            let key = this.attachable(&c)?;
            if index == 0 {
                return Ok(false);
            }
            Ok(this
                .ctx
                .world
                .borrow_mut()
                .insert_component(this.entity, index - 1, key))
        });
        methods.add_method("remove", |_, this, target: Value| {
            this.alive()?;
            let id = match &target {
                Value::String(s) => s.to_string_lossy().to_string(),
                other => match component_key_of(other) {
                    Some(key) => match this.ctx.world.borrow().component(key) {
                        Some(c) => c.id().to_string(),
                        None => return Ok(false),
                    },
                    None => return Ok(false),
                },
            };
            Ok(this.ctx.world.borrow_mut().remove_component(this.entity, &id))
        });
        methods.add_method("pop", |lua, this, ()| {
            this.alive()?;
            let popped = this.ctx.world.borrow_mut().pop_component(this.entity);
            match popped {
                Some(key) => hand_back_component(lua, &this.ctx, key),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method("shift", |lua, this, ()| {
            this.alive()?;
            let shifted = this.ctx.world.borrow_mut().shift_component(this.entity);
            match shifted {
                Some(key) => hand_back_component(lua, &this.ctx, key),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method("find", |lua, this, kind: String| {
            this.alive()?;
            let Some(kind) = ComponentKind::from_name(&kind) else {
                return Ok(Value::Nil);
            };
            let found = this.ctx.world.borrow().find_component(this.entity, kind);
            match found {
                Some(key) => push_component(lua, &this.ctx, key),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method("get", |lua, this, id: String| {
            this.alive()?;
            let found = this.ctx.world.borrow().get_component(this.entity, &id);
            match found {
                Some(key) => push_component(lua, &this.ctx, key),
                None => Ok(Value::Nil),
            }
        });
    }
}

// ---- point ----

/// Either a free-standing value or a live view of an entity's position.
/// Assigning a point to `entity.position` copies its coordinates.
pub enum LuaPoint {
    Free(Vec2),
    Entity {
        key: EntityKey,
        ctx: Rc<EngineContext>,
    },
}

impl LuaPoint {
    fn value(&self) -> mlua::Result<Vec2> {
        match self {
            LuaPoint::Free(p) => Ok(*p),
            LuaPoint::Entity { key, ctx } => ctx
                .world
                .borrow()
                .entity(*key)
                .map(|e| e.position())
                .ok_or_else(|| stale("entity")),
        }
    }

    fn set(&mut self, update: impl FnOnce(&mut Vec2)) -> mlua::Result<()> {
        match self {
            LuaPoint::Free(p) => {
                update(p);
                Ok(())
            }
            LuaPoint::Entity { key, ctx } => {
                let mut world = ctx.world.borrow_mut();
                let mut p = world
                    .entity(*key)
                    .map(|e| e.position())
                    .ok_or_else(|| stale("entity"))?;
                update(&mut p);
                world.set_position(*key, p);
                Ok(())
            }
        }
    }
}

impl UserData for LuaPoint {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("x", |_, this| Ok(this.value()?.x));
        fields.add_field_method_get("y", |_, this| Ok(this.value()?.y));
        fields.add_field_method_set("x", |_, this, x: f32| this.set(|p| p.x = x));
        fields.add_field_method_set("y", |_, this, y: f32| this.set(|p| p.y = y));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("copy", |_, this, ()| Ok(LuaPoint::Free(this.value()?)));
        methods.add_method("unpack", |_, this, ()| {
            let p = this.value()?;
            Ok((p.x, p.y))
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            let other = other.borrow::<LuaPoint>()?.value()?;
            Ok(this.value()? == other)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let p = this.value()?;
            Ok(format!("Point({}, {})", p.x, p.y))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ScriptComponent;
    use crate::engine::Engine;
    use crate::ownership::Ownership;

    #[test]
    fn pushes_of_one_entity_share_a_proxy() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let e = engine.spawn();
        let a = push_entity(lua, ctx, e).expect("push");
        let b = push_entity(lua, ctx, e).expect("push");
        lua.globals().set("a", a).expect("set");
        lua.globals().set("b", b).expect("set");
        assert!(lua.load("return rawequal(a, b)").eval::<bool>().expect("eval"));
        // Native ownership is untouched by plain pushes.
        assert_eq!(
            ctx.world.borrow().entity(e).map(|e| e.bridge().ownership()),
            Some(Ownership::Native)
        );
    }

    #[test]
    fn stale_proxy_raises_but_is_valid_does_not() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let e = engine.spawn();
        lua.globals()
            .set("e", push_entity(lua, ctx, e).expect("push"))
            .expect("set");
        assert!(engine.remove_entity(e));
        assert!(!ctx.world.borrow().is_alive(e));
        assert!(!lua.load("return e:is_valid()").eval::<bool>().expect("is_valid"));
        let err = lua.load("return e.id").eval::<String>().expect_err("stale");
        assert!(err.to_string().contains("destroyed"), "{err}");
    }

    #[test]
    fn position_assignment_copies_instead_of_aliasing() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let a = engine.spawn();
        let b = engine.spawn();
        ctx.world.borrow_mut().set_position(a, Vec2::new(3.0, 4.0));
        lua.globals().set("a", push_entity(lua, ctx, a).expect("a")).expect("set");
        lua.globals().set("b", push_entity(lua, ctx, b).expect("b")).expect("set");
        lua.load("b.position = a.position; a.position.x = 50; b:move(1, 1)")
            .exec()
            .expect("exec");
        let world = ctx.world.borrow();
        assert_eq!(world.entity(a).map(|e| e.position()), Some(Vec2::new(50.0, 4.0)));
        assert_eq!(world.entity(b).map(|e| e.position()), Some(Vec2::new(4.0, 5.0)));
    }

    #[test]
    fn components_proxy_supports_the_array_surface() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let e = engine.spawn();
        let first = ctx
            .world
            .borrow_mut()
            .attach_new(e, ComponentData::Script(ScriptComponent::new("s")));
        lua.globals().set("e", push_entity(lua, ctx, e).expect("push")).expect("set");
        let out: (usize, bool, String, usize) = lua
            .load(
                r#"
local cs = e.components
local col = Collider(0, 0, 4, 4)
cs:add(col)
local found = cs:find("collider")
local same = found == col
local popped = cs:pop()
return cs:count(), same and popped == col, cs:find("script").type, #cs
"#,
            )
            .eval()
            .expect("eval");
        assert_eq!(out, (1, true, "script".to_string(), 1));
        let first_id = ctx
            .world
            .borrow()
            .component(first)
            .map(|c| c.id().to_string())
            .expect("alive");
        let removed: bool = lua
            .load(format!("return e.components:remove('{first_id}')"))
            .eval()
            .expect("remove");
        assert!(removed);
        assert_eq!(ctx.world.borrow().component_count(e), 0);
    }

    #[test]
    fn popped_component_outlives_its_collected_constructor_proxy() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        lua.load(
            r#"
E = Entity()
engine.add(E)
do
  local c = Collider(0, 0, 1, 1)
  E.components:add(c)
end
collectgarbage()
collectgarbage()
P = E.components:pop()
"#,
        )
        .exec()
        .expect("exec");
        let key = lua
            .globals()
            .get::<AnyUserData>("P")
            .expect("P")
            .borrow::<LuaComponent>()
            .expect("component")
            .key;

        engine.collect_garbage();
        assert!(ctx.world.borrow().is_component_alive(key));
        assert_eq!(
            ctx.world.borrow().component(key).map(|c| c.bridge().ref_count()),
            Some(1)
        );
        assert!(lua.load("return P:is_valid()").eval::<bool>().expect("eval"));

        lua.globals().set("P", Value::Nil).expect("clear");
        engine.collect_garbage();
        assert!(!ctx.world.borrow().is_component_alive(key));
    }

    #[test]
    fn tag_methods_are_case_insensitive_from_script() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let e = engine.spawn();
        lua.globals().set("e", push_entity(lua, ctx, e).expect("push")).expect("set");
        let out: (bool, bool, bool, bool, bool) = lua
            .load(
                r#"
local added = e:add_tag("Boss")
local again = e:add_tag("BOSS")
local removed = e:remove_tag("boss")
local missing = e:remove_tag("boss")
return added, again, removed, missing, e:has_tag("Boss")
"#,
            )
            .eval()
            .expect("eval");
        assert_eq!(out, (true, false, true, false, false));
        assert!(ctx.world.borrow().entity(e).is_some_and(|e| e.tags().is_empty()));
    }

    #[test]
    fn data_table_is_per_entity_and_copied_deeply() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let e = engine.spawn();
        lua.globals().set("e", push_entity(lua, ctx, e).expect("push")).expect("set");
        let (hp, copy_hp, copy_tag): (f64, f64, bool) = lua
            .load(
                r#"
e.data.stats = { hp = 5 }
e:add_tag("Hero")
local c = e:copy()
c.data.stats.hp = 1
return e.data.stats.hp, c.data.stats.hp, c:has_tag("hero")
"#,
            )
            .eval()
            .expect("eval");
        assert_eq!((hp, copy_hp, copy_tag), (5.0, 1.0, true));
    }
}
