use std::rc::Rc;

use bevy::prelude::*;
use mlua::{AnyUserData, FromLua, Lua, LuaSerdeExt, Table, Value, Variadic};

use crate::component::{
    ColliderComponent, ComponentData, MapComponent, ScriptComponent, ShapeComponent,
    SpriteComponent,
};
use crate::engine::{self, EngineContext};
use crate::entity::EntityKey;
use crate::geometry::{arc_rect, ray_rect, rect_overlap, Arc, Rect};
use crate::scripting::proxy::{self, LuaEntity, LuaPoint};
use crate::scripting::value::from_lua;

/// Installs the constructors and the `engine`, `Collision` and `log` globals.
/// Every closure carries its own handle to the context.
pub fn install_globals(lua: &Lua, ctx: &Rc<EngineContext>) -> mlua::Result<()> {
    install_constructors(lua, ctx)?;
    lua.globals().set("engine", engine_table(lua, ctx)?)?;
    lua.globals().set("Collision", collision_table(lua)?)?;
    lua.globals().set(
        "log",
        lua.create_function(|_, message: String| {
            info!("[Pixie scripts] {message}");
            Ok(())
        })?,
    )?;
    Ok(())
}

fn owned_component(lua: &Lua, ctx: &Rc<EngineContext>, data: ComponentData) -> mlua::Result<AnyUserData> {
    let key = ctx.world.borrow_mut().create_component(data);
    proxy::push_owned_component(lua, ctx, key)
}

fn entity_key(ud: &AnyUserData) -> mlua::Result<EntityKey> {
    Ok(ud.borrow::<LuaEntity>()?.key())
}

type ColliderArgs = (Value, Option<f32>, Option<f32>, Option<f32>, Option<f32>);

/// `Collider{ {x=..}, ... }`, `Collider{x=.., y=..}` or `Collider(x, y, w, h[, rotation])`.
fn collider_rects(lua: &Lua, (first, y, w, h, rotation): ColliderArgs) -> mlua::Result<Vec<Rect>> {
    match first {
        Value::Nil => Ok(Vec::new()),
        Value::Table(t) if t.raw_len() > 0 => lua.from_value(Value::Table(t)),
        Value::Table(t) => Ok(vec![lua.from_value(Value::Table(t))?]),
        other => {
            let x = f32::from_lua(other, lua)?;
            let (Some(y), Some(w), Some(h)) = (y, w, h) else {
                return Err(mlua::Error::RuntimeError(
                    "Collider expects (x, y, w, h[, rotation]) or a table of rects".to_string(),
                ));
            };
            Ok(vec![Rect::new(x, y, w, h).rotated(rotation.unwrap_or(0.0))])
        }
    }
}

fn install_constructors(lua: &Lua, ctx: &Rc<EngineContext>) -> mlua::Result<()> {
    let globals = lua.globals();

    let c = ctx.clone();
    globals.set(
        "Entity",
        lua.create_function(move |lua, ()| {
            let key = c.world.borrow_mut().create_entity();
            proxy::push_owned_entity(lua, &c, key)
        })?,
    )?;

    let c = ctx.clone();
    globals.set(
        "Collider",
        lua.create_function(move |lua, args: ColliderArgs| {
            let mut collider = ColliderComponent::new(collider_rects(lua, args)?);
            collider.debug_draw = c.debug_colliders;
            owned_component(lua, &c, ComponentData::Collider(collider))
        })?,
    )?;

    let c = ctx.clone();
    globals.set(
        "Script",
        lua.create_function(move |lua, name: String| {
            owned_component(lua, &c, ComponentData::Script(ScriptComponent::new(name)))
        })?,
    )?;

    let c = ctx.clone();
    globals.set(
        "Sprite",
        lua.create_function(
            move |lua, (texture, w, h, frames, fps): (String, f32, f32, Option<Value>, Option<f32>)| {
                let mut sprite = SpriteComponent::new(texture, Vec2::new(w, h));
                if let Some(frames) = frames {
                    let frames: Vec<Rect> = lua.from_value(frames)?;
                    sprite = sprite.with_animation(frames, fps.unwrap_or(0.0));
                }
                owned_component(lua, &c, ComponentData::Sprite(sprite))
            },
        )?,
    )?;

    let c = ctx.clone();
    globals.set(
        "Map",
        lua.create_function(
            move |lua, (width, height, tile_size, tiles): (usize, usize, f32, Option<Vec<u8>>)| {
                let map = match tiles {
                    Some(tiles) => MapComponent::from_tiles(width, height, tile_size, tiles),
                    None => MapComponent::new(width, height, tile_size),
                };
                owned_component(lua, &c, ComponentData::Map(map))
            },
        )?,
    )?;

    let c = ctx.clone();
    globals.set(
        "Shape",
        lua.create_function(move |lua, (lines, closed): (Value, Option<bool>)| {
            let lines: Vec<Vec<[f32; 2]>> = lua.from_value(lines)?;
            let mut shape = ShapeComponent::new(
                lines
                    .into_iter()
                    .map(|line| line.into_iter().map(Vec2::from).collect())
                    .collect(),
            );
            shape.closed = closed.unwrap_or(false);
            owned_component(lua, &c, ComponentData::Shape(shape))
        })?,
    )?;

    globals.set(
        "Point",
        lua.create_function(|_, (x, y): (Option<f32>, Option<f32>)| {
            Ok(LuaPoint::Free(Vec2::new(x.unwrap_or(0.0), y.unwrap_or(0.0))))
        })?,
    )?;
    Ok(())
}

fn engine_table(lua: &Lua, ctx: &Rc<EngineContext>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let c = ctx.clone();
    table.set(
        "add",
        lua.create_function(move |_, e: AnyUserData| Ok(engine::register(&c, entity_key(&e)?)))?,
    )?;

    let c = ctx.clone();
    table.set(
        "remove",
        lua.create_function(move |_, e: AnyUserData| Ok(engine::unregister(&c, entity_key(&e)?)))?,
    )?;

    let c = ctx.clone();
    table.set(
        "find",
        lua.create_function(move |lua, id: String| {
            let found = c.world.borrow().find_entity(&id);
            match found {
                Some(key) => proxy::push_entity(lua, &c, key),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "find_by_tag",
        lua.create_function(move |lua, tag: String| {
            let found = lua.create_table()?;
            for key in engine::find_by_tag(&c, &tag) {
                found.push(proxy::push_entity(lua, &c, key)?)?;
            }
            Ok(found)
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "publish",
        lua.create_function(move |_, (topic, value): (String, Value)| {
            let value = from_lua(value, c.limits.marshal_depth)?;
            c.world.borrow_mut().publish(&topic, value);
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "count",
        lua.create_function(move |_, ()| Ok(c.registry.borrow().len()))?,
    )?;

    let c = ctx.clone();
    table.set("tick", lua.create_function(move |_, ()| Ok(c.tick.get()))?)?;

    Ok(table)
}

fn collision_table(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "point_in_rect",
        lua.create_function(|lua, (x, y, rect): (f32, f32, Value)| {
            let rect: Rect = lua.from_value(rect)?;
            Ok(rect.contains_point(Vec2::new(x, y)))
        })?,
    )?;
    table.set(
        "rects_overlap",
        lua.create_function(|lua, (a, b): (Value, Value)| {
            let a: Rect = lua.from_value(a)?;
            let b: Rect = lua.from_value(b)?;
            Ok(rect_overlap(&a, &b))
        })?,
    )?;
    table.set(
        "ray_rect",
        lua.create_function(
            |lua, (ox, oy, dx, dy, max_distance, rect): (f32, f32, f32, f32, f32, Value)| {
                let rect: Rect = lua.from_value(rect)?;
                Ok(ray_rect(Vec2::new(ox, oy), Vec2::new(dx, dy), max_distance, &rect))
            },
        )?,
    )?;
    table.set(
        "arc_rect",
        lua.create_function(
            |lua, (cx, cy, radius, rest): (f32, f32, f32, Variadic<Value>)| {
                // (start, end, rect) for a sector, or just (rect) for a circle.
                let center = Vec2::new(cx, cy);
                let (arc, rect) = match rest.as_slice() {
                    [rect] => (Arc::circle(center, radius), rect.clone()),
                    [start, end, rect] => {
                        let arc = Arc {
                            center,
                            radius,
                            start: lua.from_value(start.clone())?,
                            end: lua.from_value(end.clone())?,
                        };
                        (arc, rect.clone())
                    }
                    _ => {
                        return Err(mlua::Error::RuntimeError(
                            "Collision.arc_rect expects (x, y, r, rect) or (x, y, r, start, end, rect)"
                                .to_string(),
                        ))
                    }
                };
                let rect: Rect = lua.from_value(rect)?;
                Ok(arc_rect(&arc, &rect))
            },
        )?,
    )?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use bevy::prelude::Vec2;

    use crate::engine::Engine;
    use crate::render::DrawCommand;

    #[test]
    fn collider_constructor_accepts_numbers_and_tables() {
        let engine = Engine::default();
        let (single, listed, rotated): (usize, usize, f32) = engine
            .lua()
            .load(
                r#"
local a = Collider(0, 0, 10, 10)
local b = Collider({ { x = 0, y = 0, w = 4, h = 4 }, { x = 8, y = 0, w = 4, h = 4 } })
local c = Collider({ x = 1, y = 1, w = 2, h = 2, rotation = 0.5 })
return #a.rects, #b.rects, c.rects[1].rotation
"#,
            )
            .eval()
            .expect("eval");
        assert_eq!((single, listed), (1, 2));
        assert!((rotated - 0.5).abs() < 1e-6);
        assert!(engine
            .lua()
            .load("return Collider(1, 2)")
            .exec()
            .is_err());
    }

    #[test]
    fn unattached_components_are_collected() {
        let engine = Engine::default();
        engine
            .lua()
            .load("local s = Sprite('hero', 16, 16) local m = Map(4, 4, 8) local p = Shape({ { {0, 0}, {4, 4} } }, true)")
            .exec()
            .expect("exec");
        assert_eq!(engine.context().world.borrow().component_total(), 3);
        engine.collect_garbage();
        assert_eq!(engine.context().world.borrow().component_total(), 0);
    }

    #[test]
    fn engine_table_registers_and_finds_entities() {
        let engine = Engine::default();
        let lua = engine.lua();
        let (found_same, tagged, count_after): (bool, usize, usize) = lua
            .load(
                r#"
local e = Entity()
e:add_tag("Enemy")
engine.add(e)
local again = engine.find(e.id)
local tagged = #engine.find_by_tag("enemy")
engine.remove(e)
return again == e, tagged, engine.count()
"#,
            )
            .eval()
            .expect("eval");
        assert!(found_same);
        assert_eq!(tagged, 1);
        assert_eq!(count_after, 0);
    }

    #[test]
    fn collision_helpers_use_closed_intervals() {
        let engine = Engine::default();
        let (edge, crossed, hit, arc): (bool, bool, Option<f32>, bool) = engine
            .lua()
            .load(
                r#"
local r = { x = 0, y = 0, w = 10, h = 10 }
return Collision.point_in_rect(10, 10, r),
  Collision.rects_overlap(r, { x = 10, y = 0, w = 5, h = 5 }),
  Collision.ray_rect(-5, 5, 1, 0, 100, r),
  Collision.arc_rect(20, 5, 12, math.pi / 2, 3 * math.pi / 2, r)
"#,
            )
            .eval()
            .expect("eval");
        assert!(edge);
        assert!(crossed);
        assert_eq!(hit, Some(5.0));
        assert!(arc);
    }

    #[test]
    fn arc_rect_without_angles_tests_a_full_circle() {
        let engine = Engine::default();
        let (near, far): (bool, bool) = engine
            .lua()
            .load(
                r#"
local r = { x = 0, y = 0, w = 10, h = 10 }
return Collision.arc_rect(-3, 5, 3, r), Collision.arc_rect(-3, 5, 2.9, r)
"#,
            )
            .eval()
            .expect("eval");
        assert!(near);
        assert!(!far);
        let err = engine
            .lua()
            .load("return Collision.arc_rect(0, 0, 1, 0, {x=0,y=0,w=1,h=1})")
            .eval::<bool>()
            .unwrap_err();
        assert!(err.to_string().contains("arc_rect expects"));
    }

    #[test]
    fn scripted_sprite_animates_and_draws_through_the_tick() {
        let mut engine = Engine::default();
        engine
            .lua()
            .load(
                r#"
E = Entity()
engine.add(E)
S = Sprite("hero", 16, 16, {
  { x = 0, y = 0, w = 16, h = 16 },
  { x = 16, y = 0, w = 16, h = 16 },
  { x = 32, y = 0, w = 16, h = 16 },
}, 10)
E.components:add(S)
S.offset = Point(-8, -8)
S.scale = { x = 2, y = 2 }
S.tint = { 1, 0, 0, 1 }
"#,
            )
            .exec()
            .expect("exec");
        engine.tick(0.25);

        let (frame, playing, fps, scale_x): (usize, bool, f32, f32) = engine
            .lua()
            .load("return S.frame, S.playing, S.fps, S.scale.x")
            .eval()
            .expect("eval");
        assert_eq!((frame, playing, fps, scale_x), (3, true, 10.0, 2.0));

        let ctx = engine.context();
        let draw_list = ctx.draw_list.borrow();
        let Some(DrawCommand::Texture {
            texture,
            source,
            dest,
            tint,
        }) = draw_list.commands.first()
        else {
            panic!("expected a texture command");
        };
        assert_eq!(texture, "hero");
        assert_eq!(source.map(|r| r.x), Some(32.0));
        assert_eq!((dest.x, dest.y, dest.w, dest.h), (-8.0, -8.0, 32.0, 32.0));
        assert_eq!(*tint, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn sprite_fields_reject_other_kinds() {
        let engine = Engine::default();
        let lua = engine.lua();
        let (fps, frames): (Option<f32>, usize) = lua
            .load("local c = Collider(0, 0, 1, 1) local s = Sprite('coin', 8, 8) s.frames = { { x = 0, y = 0, w = 8, h = 8 } } return c.fps, #s.frames")
            .eval()
            .expect("eval");
        assert_eq!((fps, frames), (None, 1));
        let err = lua
            .load("local c = Collider(0, 0, 1, 1) c.fps = 12")
            .exec()
            .expect_err("collider has no fps");
        assert!(err.to_string().contains("not supported"), "{err}");
    }

    #[test]
    fn disabled_collider_rects_drop_out_of_the_bounds() {
        let engine = Engine::default();
        let (ok, out_of_range, zero): (bool, bool, bool) = engine
            .lua()
            .load(
                r#"
E = Entity()
E:add_tag("wall")
engine.add(E)
local c = Collider({ { x = 0, y = 0, w = 4, h = 4 }, { x = 8, y = 0, w = 4, h = 4 } })
E.components:add(c)
return c:set_rect_enabled(2, false), c:set_rect_enabled(3, false), c:set_rect_enabled(0, true)
"#,
            )
            .eval()
            .expect("eval");
        assert_eq!((ok, out_of_range, zero), (true, false, false));
        let e = engine.find_by_tag("wall")[0];
        let b = engine
            .context()
            .world
            .borrow()
            .entity(e)
            .and_then(|e| e.world_bounds())
            .expect("bounds");
        assert_eq!(b.max, Vec2::new(4.0, 4.0));
        let err = engine
            .lua()
            .load("Script('s'):set_rect_enabled(1, false)")
            .exec()
            .expect_err("script has no rects");
        assert!(err.to_string().contains("only supported by collider"), "{err}");
    }

    #[test]
    fn point_constructor_builds_free_points() {
        let engine = Engine::default();
        let (x, y, text): (f32, f32, String) = engine
            .lua()
            .load("local p = Point(3, 4) local q = p:copy() q.x = 9 return p.x, q.y, tostring(q)")
            .eval()
            .expect("eval");
        assert_eq!((x, y), (3.0, 4.0));
        assert_eq!(text, "Point(9, 4)");
    }
}
