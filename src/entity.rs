use bevy::prelude::Vec2;
use mlua::RegistryKey;

use crate::arena::Key;
use crate::collision::CollisionTables;
use crate::component::ComponentKey;
use crate::geometry::Bounds;
use crate::ownership::Bridge;
use crate::scripting::ScriptValue;

pub type EntityKey = Key<Entity>;

/// Pub/sub record owned by an entity; released through the bus when the
/// entity is cleaned up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub method: String,
}

/// Tags compare case-insensitively; blank tags are rejected.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_lowercase())
    }
}

pub struct Entity {
    id: String,
    pub(crate) position: Vec2,
    pub active: bool,
    pub visible: bool,
    pub persistent: bool,
    pub draw_order: i32,
    pub(crate) components: Vec<ComponentKey>,
    tags: Vec<String>,
    pub(crate) local_bounds: Option<Bounds>,
    pub(crate) world_bounds: Option<Bounds>,
    pub(crate) bridge: Bridge,
    pub(crate) collisions: CollisionTables,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) defaults: Vec<(String, ScriptValue)>,
    /// Free-form script table, created on first access.
    pub(crate) data: Option<RegistryKey>,
}

impl Entity {
    pub(crate) fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            position: Vec2::ZERO,
            active: true,
            visible: true,
            persistent: false,
            draw_order: 0,
            components: Vec::new(),
            tags: Vec::new(),
            local_bounds: None,
            world_bounds: None,
            bridge: Bridge::native(),
            collisions: CollisionTables::default(),
            subscriptions: Vec::new(),
            defaults: Vec::new(),
            data: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn components(&self) -> &[ComponentKey] {
        &self.components
    }

    pub fn component_capacity(&self) -> usize {
        self.components.capacity()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn local_bounds(&self) -> Option<Bounds> {
        self.local_bounds
    }

    pub fn world_bounds(&self) -> Option<Bounds> {
        self.world_bounds
    }

    pub fn collisions(&self) -> &CollisionTables {
        &self.collisions
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Appends with an explicit growth policy: the first push reserves
    /// `initial_capacity` slots, and a full array doubles.
    pub(crate) fn push_component(&mut self, key: ComponentKey, initial_capacity: usize) {
        self.grow_if_full(initial_capacity);
        self.components.push(key);
    }

    pub(crate) fn insert_component(&mut self, index: usize, key: ComponentKey, initial_capacity: usize) {
        self.grow_if_full(initial_capacity);
        self.components.insert(index, key);
    }

    fn grow_if_full(&mut self, initial_capacity: usize) {
        let cap = self.components.capacity();
        if cap == 0 {
            self.components.reserve_exact(initial_capacity.max(1));
        } else if self.components.len() == cap {
            self.components.reserve_exact(cap);
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn add_tag(&mut self, tag: &str) -> bool {
        let Some(tag) = normalize_tag(tag) else {
            return false;
        };
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let Some(tag) = normalize_tag(tag) else {
            return false;
        };
        match self.tags.iter().position(|t| *t == tag) {
            Some(i) => {
                self.tags.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        normalize_tag(tag).is_some_and(|tag| self.tags.contains(&tag))
    }

    pub fn defaults(&self) -> &[(String, ScriptValue)] {
        &self.defaults
    }

    /// Sets a default property copied into every script instance of this
    /// entity. Re-setting a name replaces its value in place.
    pub fn set_default(&mut self, name: impl Into<String>, value: ScriptValue) {
        let name = name.into();
        match self.defaults.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.defaults.push((name, value)),
        }
    }

    /// Fresh entity (new id, own bridge, empty tables) carrying this one's
    /// transform, flags, tags and defaults. Components are copied by the
    /// world.
    pub(crate) fn duplicate(&self) -> Entity {
        Entity {
            position: self.position,
            active: self.active,
            visible: self.visible,
            persistent: self.persistent,
            draw_order: self.draw_order,
            tags: self.tags.clone(),
            defaults: self.defaults.clone(),
            ..Entity::new()
        }
    }
}
