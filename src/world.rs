use std::collections::HashMap;

use bevy::prelude::*;
use mlua::RegistryKey;

use crate::arena::Arena;
use crate::bus::{Delivery, MessageBus, PubSub};
use crate::component::collider::ColliderRect;
use crate::component::{Component, ComponentData, ComponentKey, ComponentKind};
use crate::entity::{Entity, EntityKey, Subscription};
use crate::geometry::Bounds;
use crate::ownership::Release;
use crate::scripting::ScriptValue;

pub const DEFAULT_COMPONENT_CAPACITY: usize = 4;

/// Owns every live entity and component. All lifetime transitions go through
/// here so the bridge counts and the arenas never disagree.
pub struct World {
    entities: Arena<Entity>,
    components: Arena<Component>,
    ids: HashMap<String, EntityKey>,
    bus: Box<dyn PubSub>,
    initial_capacity: usize,
    // Cached proxy handles of freed objects, removed from the Lua registry
    // by the engine.
    released_handles: Vec<RegistryKey>,
}

impl Default for World {
    fn default() -> Self {
        Self::new(Box::new(MessageBus::default()), DEFAULT_COMPONENT_CAPACITY)
    }
}

impl World {
    pub fn new(bus: Box<dyn PubSub>, initial_capacity: usize) -> Self {
        Self {
            entities: Arena::default(),
            components: Arena::default(),
            ids: HashMap::new(),
            bus,
            initial_capacity: initial_capacity.max(1),
            released_handles: Vec::new(),
        }
    }

    // ---- entities ----

    /// New entity, native-owned, holding one reference for the caller.
    pub fn create_entity(&mut self) -> EntityKey {
        let entity = Entity::new();
        let id = entity.id().to_string();
        let key = self.entities.insert(entity);
        self.ids.insert(id, key);
        key
    }

    pub fn entity(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(key)
    }

    pub fn is_alive(&self, key: EntityKey) -> bool {
        self.entities.contains(key)
    }

    pub fn find_entity(&self, id: &str) -> Option<EntityKey> {
        self.ids.get(id).copied()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn take_released_handles(&mut self) -> Vec<RegistryKey> {
        std::mem::take(&mut self.released_handles)
    }

    fn live_entity_mut(&mut self, key: EntityKey, op: &str) -> &mut Entity {
        match self.entities.get_mut(key) {
            Some(entity) => entity,
            None => panic!("{op}: dangling entity {key:?}"),
        }
    }

    fn live_entity(&self, key: EntityKey, op: &str) -> &Entity {
        match self.entities.get(key) {
            Some(entity) => entity,
            None => panic!("{op}: dangling entity {key:?}"),
        }
    }

    pub fn ref_entity(&mut self, key: EntityKey) -> u32 {
        self.live_entity_mut(key, "ref_entity").bridge.retain()
    }

    /// Drops a reference that is known not to be the last one.
    pub fn unref_entity(&mut self, key: EntityKey) -> u32 {
        let bridge = &mut self.live_entity_mut(key, "unref_entity").bridge;
        assert!(
            bridge.ref_count() > 1,
            "unref_entity would release the last reference of {key:?}; use destroy_entity"
        );
        bridge.unref()
    }

    /// Gives up one reference. Cleanup runs only when none remain.
    pub fn destroy_entity(&mut self, key: EntityKey) -> Release {
        let release = self.live_entity_mut(key, "destroy_entity").bridge.destroy();
        if release == Release::Freed {
            self.cleanup_entity(key);
        }
        release
    }

    pub fn hand_entity_to_script(&mut self, key: EntityKey) {
        self.live_entity_mut(key, "hand_entity_to_script")
            .bridge
            .hand_to_script();
    }

    /// Script finalizer path for an owning proxy.
    pub fn finalize_entity(&mut self, key: EntityKey) -> Option<Release> {
        let release = self.live_entity_mut(key, "finalize_entity").bridge.finalize();
        if release == Some(Release::Freed) {
            self.cleanup_entity(key);
        }
        release
    }

    fn cleanup_entity(&mut self, key: EntityKey) {
        let Some(mut entity) = self.entities.remove(key) else {
            return;
        };
        self.ids.remove(entity.id());
        self.released_handles.extend(entity.bridge.take_handle());
        entity.collisions.clear();
        for component in std::mem::take(&mut entity.components) {
            if let Some(c) = self.components.get_mut(component) {
                c.entity = None;
                self.destroy_component(component);
            }
        }
        for sub in std::mem::take(&mut entity.subscriptions) {
            self.bus.unsubscribe(&sub.topic, key, &sub.method);
        }
        debug!("[Pixie world] Freed entity {}", entity.id());
    }

    // ---- components ----

    /// New detached component holding one reference for the caller.
    pub fn create_component(&mut self, data: ComponentData) -> ComponentKey {
        self.components.insert(Component::new(data))
    }

    pub fn component(&self, key: ComponentKey) -> Option<&Component> {
        self.components.get(key)
    }

    pub fn component_mut(&mut self, key: ComponentKey) -> Option<&mut Component> {
        self.components.get_mut(key)
    }

    pub fn is_component_alive(&self, key: ComponentKey) -> bool {
        self.components.contains(key)
    }

    pub fn component_total(&self) -> usize {
        self.components.len()
    }

    fn live_component_mut(&mut self, key: ComponentKey, op: &str) -> &mut Component {
        match self.components.get_mut(key) {
            Some(component) => component,
            None => panic!("{op}: dangling component {key:?}"),
        }
    }

    pub fn ref_component(&mut self, key: ComponentKey) -> u32 {
        self.live_component_mut(key, "ref_component").bridge.retain()
    }

    pub fn unref_component(&mut self, key: ComponentKey) -> u32 {
        let bridge = &mut self.live_component_mut(key, "unref_component").bridge;
        assert!(
            bridge.ref_count() > 1,
            "unref_component would release the last reference of {key:?}; use destroy_component"
        );
        bridge.unref()
    }

    pub fn destroy_component(&mut self, key: ComponentKey) -> Release {
        let release = self
            .live_component_mut(key, "destroy_component")
            .bridge
            .destroy();
        if release == Release::Freed {
            self.cleanup_component(key);
        }
        release
    }

    pub fn hand_component_to_script(&mut self, key: ComponentKey) {
        self.live_component_mut(key, "hand_component_to_script")
            .bridge
            .hand_to_script();
    }

    pub fn finalize_component(&mut self, key: ComponentKey) -> Option<Release> {
        let release = self
            .live_component_mut(key, "finalize_component")
            .bridge
            .finalize();
        if release == Some(Release::Freed) {
            self.cleanup_component(key);
        }
        release
    }

    fn cleanup_component(&mut self, key: ComponentKey) {
        let Some(mut component) = self.components.remove(key) else {
            return;
        };
        self.released_handles.extend(component.bridge.take_handle());
        if let Some(owner) = component.entity {
            if let Some(entity) = self.entities.get_mut(owner) {
                entity.components.retain(|c| *c != key);
            }
        }
    }

    /// Creates a component and attaches it, leaving the entity's array as the
    /// only owner.
    pub fn attach_new(&mut self, entity: EntityKey, data: ComponentData) -> ComponentKey {
        let key = self.create_component(data);
        self.add_component(entity, key);
        self.unref_component(key);
        key
    }

    /// Appends `component`; the array takes its own reference. False when
    /// the component already belongs to an entity.
    pub fn add_component(&mut self, entity: EntityKey, component: ComponentKey) -> bool {
        let len = self.live_entity(entity, "add_component").components.len();
        self.insert_component(entity, len, component)
    }

    pub fn insert_component(&mut self, entity: EntityKey, index: usize, component: ComponentKey) -> bool {
        let capacity = self.initial_capacity;
        let len = self.live_entity(entity, "insert_component").components.len();
        let c = self.live_component_mut(component, "insert_component");
        if c.entity.is_some() || index > len {
            return false;
        }
        c.entity = Some(entity);
        let is_collider = c.kind() == ComponentKind::Collider;
        self.ref_component(component);
        let e = self.live_entity_mut(entity, "insert_component");
        if index == len {
            e.push_component(component, capacity);
        } else {
            e.insert_component(index, component, capacity);
        }
        if is_collider {
            self.recompute_bounds(entity);
        }
        true
    }

    /// Removes the component with `id` and releases the array's reference.
    pub fn remove_component(&mut self, entity: EntityKey, id: &str) -> bool {
        let Some(index) = self.position_of(entity, id) else {
            return false;
        };
        let key = self
            .live_entity_mut(entity, "remove_component")
            .components
            .swap_remove(index);
        self.release_detached(entity, key);
        true
    }

    fn release_detached(&mut self, entity: EntityKey, key: ComponentKey) {
        let was_collider = self.detach(key);
        self.destroy_component(key);
        if was_collider {
            self.recompute_bounds(entity);
        }
    }

    fn detach(&mut self, key: ComponentKey) -> bool {
        let c = self.live_component_mut(key, "detach");
        c.entity = None;
        c.kind() == ComponentKind::Collider
    }

    fn position_of(&self, entity: EntityKey, id: &str) -> Option<usize> {
        self.live_entity(entity, "component lookup")
            .components
            .iter()
            .position(|key| self.components.get(*key).is_some_and(|c| c.id() == id))
    }

    /// Detaches the last component. The array's reference passes to the
    /// caller.
    pub fn pop_component(&mut self, entity: EntityKey) -> Option<ComponentKey> {
        let key = self.live_entity_mut(entity, "pop_component").components.pop()?;
        if self.detach(key) {
            self.recompute_bounds(entity);
        }
        Some(key)
    }

    /// Detaches the first component, keeping the order of the rest.
    pub fn shift_component(&mut self, entity: EntityKey) -> Option<ComponentKey> {
        let e = self.live_entity_mut(entity, "shift_component");
        if e.components.is_empty() {
            return None;
        }
        let key = e.components.remove(0);
        if self.detach(key) {
            self.recompute_bounds(entity);
        }
        Some(key)
    }

    pub fn find_component(&self, entity: EntityKey, kind: ComponentKind) -> Option<ComponentKey> {
        self.live_entity(entity, "find_component")
            .components
            .iter()
            .copied()
            .find(|key| self.components.get(*key).is_some_and(|c| c.kind() == kind))
    }

    pub fn get_component(&self, entity: EntityKey, id: &str) -> Option<ComponentKey> {
        self.position_of(entity, id)
            .map(|i| self.live_entity(entity, "get_component").components[i])
    }

    pub fn component_count(&self, entity: EntityKey) -> usize {
        self.live_entity(entity, "component_count").components.len()
    }

    // ---- tags ----

    pub fn add_tag(&mut self, entity: EntityKey, tag: &str) -> bool {
        self.live_entity_mut(entity, "add_tag").add_tag(tag)
    }

    pub fn remove_tag(&mut self, entity: EntityKey, tag: &str) -> bool {
        self.live_entity_mut(entity, "remove_tag").remove_tag(tag)
    }

    pub fn has_tag(&self, entity: EntityKey, tag: &str) -> bool {
        self.live_entity(entity, "has_tag").has_tag(tag)
    }

    // ---- transform ----

    pub fn set_position(&mut self, entity: EntityKey, position: Vec2) {
        self.live_entity_mut(entity, "set_position").position = position;
        self.recompute_bounds(entity);
    }

    pub fn translate(&mut self, entity: EntityKey, delta: Vec2) {
        let position = self.live_entity(entity, "translate").position + delta;
        self.set_position(entity, position);
    }

    /// Refreshes every collider's world rects and the entity's cached bounds.
    pub fn recompute_bounds(&mut self, entity: EntityKey) {
        let Some(e) = self.entities.get_mut(entity) else {
            return;
        };
        let origin = e.position;
        let mut local: Option<Bounds> = None;
        for key in &e.components {
            let Some(ComponentData::Collider(collider)) =
                self.components.get_mut(*key).map(|c| &mut c.data)
            else {
                continue;
            };
            collider.recompute(origin);
            if let Some(b) = collider.local_bounds() {
                local = Some(match local {
                    Some(acc) => acc.union(b),
                    None => b,
                });
            }
        }
        e.local_bounds = local;
        e.world_bounds = local.map(|b| b.translated(origin));
    }

    /// Replaces a collider's rects and refreshes its owner's bounds.
    pub fn set_collider_rects(&mut self, component: ComponentKey, rects: Vec<ColliderRect>) -> bool {
        let c = self.live_component_mut(component, "set_collider_rects");
        let ComponentData::Collider(collider) = &mut c.data else {
            return false;
        };
        collider.set_rects(rects);
        if let Some(owner) = c.entity {
            self.recompute_bounds(owner);
        }
        true
    }

    /// Toggles one collider rect. `None` when the component is not a
    /// collider, `Some(false)` when the index is out of range.
    pub fn set_collider_rect_enabled(
        &mut self,
        component: ComponentKey,
        index: usize,
        enabled: bool,
    ) -> Option<bool> {
        let c = self.live_component_mut(component, "set_collider_rect_enabled");
        let ComponentData::Collider(collider) = &mut c.data else {
            return None;
        };
        if !collider.set_enabled(index, enabled) {
            return Some(false);
        }
        if let Some(owner) = c.entity {
            self.recompute_bounds(owner);
        }
        Some(true)
    }

    // ---- copy ----

    /// Deep copy: components, tags and defaults. Subscriptions and the
    /// script data table are not carried over.
    pub fn copy_entity(&mut self, source: EntityKey) -> EntityKey {
        let src = self.live_entity(source, "copy_entity");
        let copies: Vec<(bool, ComponentData)> = src
            .components
            .iter()
            .filter_map(|key| self.components.get(*key))
            .map(|c| (c.active, c.data.behavior().copy()))
            .collect();
        let entity = src.duplicate();
        let id = entity.id().to_string();
        let key = self.entities.insert(entity);
        self.ids.insert(id, key);
        for (active, data) in copies {
            let c = self.attach_new(key, data);
            if let Some(c) = self.components.get_mut(c) {
                c.active = active;
            }
        }
        self.recompute_bounds(key);
        key
    }

    // ---- pub/sub ----

    pub fn subscribe(&mut self, entity: EntityKey, topic: &str, method: &str) -> bool {
        let sub = Subscription {
            topic: topic.to_string(),
            method: method.to_string(),
        };
        if self
            .live_entity(entity, "subscribe")
            .subscriptions
            .contains(&sub)
        {
            return false;
        }
        if !self.bus.subscribe(topic, entity, method) {
            return false;
        }
        self.live_entity_mut(entity, "subscribe").subscriptions.push(sub);
        true
    }

    pub fn unsubscribe(&mut self, entity: EntityKey, topic: &str, method: &str) -> bool {
        let e = self.live_entity_mut(entity, "unsubscribe");
        let Some(i) = e
            .subscriptions
            .iter()
            .position(|s| s.topic == topic && s.method == method)
        else {
            return false;
        };
        e.subscriptions.remove(i);
        self.bus.unsubscribe(topic, entity, method)
    }

    pub fn publish(&mut self, topic: &str, value: ScriptValue) {
        self.bus.publish(topic, value);
    }

    pub fn drain_messages(&mut self) -> Vec<Delivery> {
        self.bus.drain()
    }

    pub fn bus(&self) -> &dyn PubSub {
        self.bus.as_ref()
    }
}
