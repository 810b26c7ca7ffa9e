use std::rc::Rc;

use mlua::{Lua, Value};

use crate::engine::EngineContext;
use crate::scripting::proxy::{self, LuaComponent, LuaEntity};
use crate::scripting::Handle;

/// Native-side image of a script value. Tables keep their key/value pairs in
/// iteration order.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Table(Vec<(ScriptValue, ScriptValue)>),
    Handle(Handle),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a string key in a table value.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Table(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Bool(*b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => ScriptValue::String(s.clone()),
            serde_json::Value::Array(items) => ScriptValue::Table(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (ScriptValue::Number((i + 1) as f64), ScriptValue::from_json(v)))
                    .collect(),
            ),
            serde_json::Value::Object(map) => ScriptValue::Table(
                map.iter()
                    .map(|(k, v)| (ScriptValue::String(k.clone()), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Tables with keys 1..=n become arrays; handles become their debug text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Nil => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Table(pairs) => {
                let is_array = pairs
                    .iter()
                    .enumerate()
                    .all(|(i, (k, _))| k.as_number() == Some((i + 1) as f64));
                if is_array && !pairs.is_empty() {
                    serde_json::Value::Array(pairs.iter().map(|(_, v)| v.to_json()).collect())
                } else {
                    serde_json::Value::Object(
                        pairs
                            .iter()
                            .map(|(k, v)| (key_text(k), v.to_json()))
                            .collect(),
                    )
                }
            }
            ScriptValue::Handle(h) => serde_json::Value::String(format!("{h:?}")),
        }
    }
}

fn key_text(key: &ScriptValue) -> String {
    match key {
        ScriptValue::String(s) => s.clone(),
        ScriptValue::Number(n) => n.to_string(),
        ScriptValue::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

/// Marshals into the Lua state. Handles to freed objects arrive as nil.
pub fn to_lua(lua: &Lua, ctx: &Rc<EngineContext>, value: &ScriptValue, depth: usize) -> mlua::Result<Value> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::String(s) => Value::String(lua.create_string(s)?),
        ScriptValue::Table(pairs) => {
            if depth == 0 {
                return Err(mlua::Error::RuntimeError(
                    "table nesting exceeds the marshal depth".to_string(),
                ));
            }
            let table = lua.create_table()?;
            for (k, v) in pairs {
                let key = to_lua(lua, ctx, k, depth - 1)?;
                if key.is_nil() {
                    continue;
                }
                table.raw_set(key, to_lua(lua, ctx, v, depth - 1)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Handle(Handle::Entity(key)) => proxy::push_entity(lua, ctx, *key)?,
        ScriptValue::Handle(Handle::Component(key)) => proxy::push_component(lua, ctx, *key)?,
    })
}

/// Marshals out of the Lua state. Functions, threads and foreign userdata
/// have no native image and are rejected.
pub fn from_lua(value: Value, depth: usize) -> mlua::Result<ScriptValue> {
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(b),
        Value::Integer(i) => ScriptValue::Number(i as f64),
        Value::Number(n) => ScriptValue::Number(n),
        Value::String(s) => ScriptValue::String(s.to_string_lossy().to_string()),
        Value::Table(table) => {
            if depth == 0 {
                return Err(mlua::Error::RuntimeError(
                    "table nesting exceeds the marshal depth".to_string(),
                ));
            }
            let mut pairs = Vec::new();
            for pair in table.pairs::<Value, Value>() {
                let (k, v) = pair?;
                pairs.push((from_lua(k, depth - 1)?, from_lua(v, depth - 1)?));
            }
            ScriptValue::Table(pairs)
        }
        Value::UserData(ud) => {
            if let Ok(entity) = ud.borrow::<LuaEntity>() {
                ScriptValue::Handle(Handle::Entity(entity.key()))
            } else if let Ok(component) = ud.borrow::<LuaComponent>() {
                ScriptValue::Handle(Handle::Component(component.key()))
            } else {
                return Err(mlua::Error::RuntimeError(
                    "cannot pass this userdata to native code".to_string(),
                ));
            }
        }
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "cannot pass a {} value to native code",
                other.type_name()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use serde_json::json;

    #[test]
    fn json_arrays_and_objects_survive_conversion() {
        let v = ScriptValue::from_json(&json!({ "hp": 3, "tags": ["a", "b"] }));
        assert_eq!(v.get("hp"), Some(&ScriptValue::Number(3.0)));
        assert_eq!(v.to_json(), json!({ "hp": 3.0, "tags": ["a", "b"] }));
    }

    #[test]
    fn nested_tables_round_trip_through_lua() {
        let engine = Engine::default();
        let (lua, ctx) = (engine.lua(), engine.context());
        let value = ScriptValue::from_json(&json!({ "a": { "b": [1, 2] }, "ok": true }));
        let lua_value = to_lua(lua, ctx, &value, 8).expect("to lua");
        let back = from_lua(lua_value, 8).expect("from lua");
        assert_eq!(back.get("ok"), Some(&ScriptValue::Bool(true)));
        assert_eq!(back.to_json()["a"]["b"], json!([1.0, 2.0]));
    }

    #[test]
    fn depth_limit_rejects_deep_tables() {
        let lua = Lua::new();
        let deep: Value = lua
            .load("return { { { { 1 } } } }")
            .eval()
            .expect("eval");
        assert!(from_lua(deep.clone(), 2).is_err());
        assert!(from_lua(deep, 4).is_ok());
    }

    #[test]
    fn functions_are_not_marshaled() {
        let lua = Lua::new();
        let f: Value = lua.load("return function() end").eval().expect("eval");
        assert!(from_lua(f, 4).is_err());
    }
}
