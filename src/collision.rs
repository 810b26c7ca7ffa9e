use std::collections::HashMap;

use bevy::prelude::*;

use crate::component::{ComponentData, ComponentKey};
use crate::entity::EntityKey;
use crate::geometry::{rect_overlap, Rect};
use crate::world::World;

pub const ENTITY_COLLISION_ENTER: &str = "entity_collision_enter";
pub const ENTITY_COLLISION_STAY: &str = "entity_collision_stay";
pub const ENTITY_COLLISION_EXIT: &str = "entity_collision_exit";
pub const MAP_COLLISION_ENTER: &str = "map_collision_enter";
pub const MAP_COLLISION_STAY: &str = "map_collision_stay";
pub const MAP_COLLISION_EXIT: &str = "map_collision_exit";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollisionState {
    None,
    Enter,
    Stay,
    Leave,
}

impl CollisionState {
    pub fn transition(was_overlapping: bool, overlapping: bool) -> Self {
        match (was_overlapping, overlapping) {
            (false, true) => CollisionState::Enter,
            (true, true) => CollisionState::Stay,
            (true, false) => CollisionState::Leave,
            (false, false) => CollisionState::None,
        }
    }

    pub fn is_overlapping(self) -> bool {
        matches!(self, CollisionState::Enter | CollisionState::Stay)
    }
}

/// Order-independent identity of a tracked pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairKey {
    Entities(EntityKey, EntityKey),
    Map {
        entity: EntityKey,
        owner: EntityKey,
        map: ComponentKey,
    },
}

impl PairKey {
    pub fn entities(a: EntityKey, b: EntityKey) -> Self {
        if a <= b {
            PairKey::Entities(a, b)
        } else {
            PairKey::Entities(b, a)
        }
    }

    pub fn map(entity: EntityKey, owner: EntityKey, map: ComponentKey) -> Self {
        PairKey::Map { entity, owner, map }
    }

    /// The party on the far side of this pair, seen from `entity`.
    pub fn other(&self, entity: EntityKey) -> CollisionOther {
        match *self {
            PairKey::Entities(a, b) => CollisionOther::Entity(if a == entity { b } else { a }),
            PairKey::Map { owner, map, .. } => CollisionOther::Map { owner, map },
        }
    }
}

/// Per-entity overlap history. `current` fills during resolution and is
/// rolled into `previous` by a swap at the tick boundary.
#[derive(Default, Debug)]
pub struct CollisionTables {
    current: HashMap<PairKey, CollisionState>,
    previous: HashMap<PairKey, CollisionState>,
}

impl CollisionTables {
    pub fn current(&self, key: &PairKey) -> Option<CollisionState> {
        self.current.get(key).copied()
    }

    pub fn was_overlapping(&self, key: &PairKey) -> bool {
        self.previous
            .get(key)
            .is_some_and(|state| state.is_overlapping())
    }

    fn record(&mut self, key: PairKey, state: CollisionState) {
        self.current.insert(key, state);
    }

    /// Pairs that overlapped last tick but have not been evaluated this tick.
    fn unresolved(&self) -> Vec<PairKey> {
        self.previous
            .iter()
            .filter(|(key, state)| state.is_overlapping() && !self.current.contains_key(key))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn rollover(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.clear();
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionOther {
    Entity(EntityKey),
    Map { owner: EntityKey, map: ComponentKey },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollisionEvent {
    pub entity: EntityKey,
    pub other: CollisionOther,
    pub state: CollisionState,
}

impl CollisionEvent {
    pub fn callback(&self) -> Option<&'static str> {
        let map = matches!(self.other, CollisionOther::Map { .. });
        Some(match (self.state, map) {
            (CollisionState::Enter, false) => ENTITY_COLLISION_ENTER,
            (CollisionState::Stay, false) => ENTITY_COLLISION_STAY,
            (CollisionState::Leave, false) => ENTITY_COLLISION_EXIT,
            (CollisionState::Enter, true) => MAP_COLLISION_ENTER,
            (CollisionState::Stay, true) => MAP_COLLISION_STAY,
            (CollisionState::Leave, true) => MAP_COLLISION_EXIT,
            (CollisionState::None, _) => return None,
        })
    }
}

#[derive(Default)]
pub struct CollisionTracker {
    pub pair_checks: u64,
}

fn collider_rects(world: &World, entity: EntityKey) -> Vec<Rect> {
    let Some(e) = world.entity(entity) else {
        return Vec::new();
    };
    e.components()
        .iter()
        .filter_map(|key| world.component(*key))
        .filter(|c| c.active)
        .filter_map(|c| c.as_collider())
        .flat_map(|c| c.world_rects().iter().copied())
        .collect()
}

fn expect_alive(world: &World, entity: EntityKey) {
    assert!(
        world.is_alive(entity),
        "collision tracker given a dangling entity {entity:?}"
    );
}

fn recorded(world: &World, entity: EntityKey, key: &PairKey) -> CollisionState {
    world
        .entity(entity)
        .and_then(|e| e.collisions().current(key))
        .unwrap_or(CollisionState::None)
}

impl CollisionTracker {
    /// Evaluates one entity pair for this tick and records each side's
    /// transition against that side's own history. Returns the state seen by
    /// `a`. A pair already evaluated this tick returns its recorded state, so
    /// callers may visit pairs in any order or more than once.
    pub fn test_pair(&mut self, world: &mut World, a: EntityKey, b: EntityKey) -> CollisionState {
        expect_alive(world, a);
        expect_alive(world, b);
        if a == b {
            return CollisionState::None;
        }
        let key = PairKey::entities(a, b);
        if let Some(state) = world.entity(a).and_then(|e| e.collisions().current(&key)) {
            return state;
        }
        let now = self.entities_overlap(world, a, b);
        for side in [a, b] {
            if let Some(e) = world.entity_mut(side) {
                let state = CollisionState::transition(e.collisions.was_overlapping(&key), now);
                if state != CollisionState::None {
                    e.collisions.record(key, state);
                }
            }
        }
        recorded(world, a, &key)
    }

    fn entities_overlap(&mut self, world: &World, a: EntityKey, b: EntityKey) -> bool {
        let (Some(ea), Some(eb)) = (world.entity(a), world.entity(b)) else {
            return false;
        };
        match (ea.world_bounds(), eb.world_bounds()) {
            (Some(ba), Some(bb)) if ba.overlaps(&bb) => {}
            _ => return false,
        }
        let ra = collider_rects(world, a);
        let rb = collider_rects(world, b);
        for x in &ra {
            for y in &rb {
                self.pair_checks += 1;
                if rect_overlap(x, y) {
                    return true;
                }
            }
        }
        false
    }

    /// Entity-versus-map evaluation. Only the entity side keeps history since
    /// the map is not an addressable entity.
    pub fn test_map(
        &mut self,
        world: &mut World,
        entity: EntityKey,
        owner: EntityKey,
        map: ComponentKey,
    ) -> CollisionState {
        expect_alive(world, entity);
        let key = PairKey::map(entity, owner, map);
        let Some(tables) = world.entity(entity).map(|e| e.collisions()) else {
            return CollisionState::None;
        };
        if let Some(state) = tables.current(&key) {
            return state;
        }
        let was = tables.was_overlapping(&key);
        let now = self.map_overlap(world, entity, owner, map);
        let state = CollisionState::transition(was, now);
        if state != CollisionState::None {
            if let Some(e) = world.entity_mut(entity) {
                e.collisions.record(key, state);
            }
        }
        state
    }

    fn map_overlap(&mut self, world: &World, entity: EntityKey, owner: EntityKey, map: ComponentKey) -> bool {
        let Some(origin) = world.entity(owner).map(|e| e.position()) else {
            return false;
        };
        let Some(ComponentData::Map(tiles)) = world.component(map).map(|c| &c.data) else {
            return false;
        };
        collider_rects(world, entity).iter().any(|r| {
            self.pair_checks += 1;
            tiles.overlaps_rect(origin, r)
        })
    }

    /// Resolves every pair among `entities` (active ones only) plus each
    /// entity against every active map owned by another entity. A pair that
    /// overlapped last tick but whose partner is now inactive, freed or
    /// unregistered closes with a LEAVE on the side still taking part.
    pub fn resolve(&mut self, world: &mut World, entities: &[EntityKey]) -> Vec<CollisionEvent> {
        let live: Vec<EntityKey> = entities
            .iter()
            .copied()
            .filter(|key| world.entity(*key).is_some_and(|e| e.active))
            .collect();
        let mut maps: Vec<(EntityKey, ComponentKey)> = Vec::new();
        for owner in &live {
            let Some(e) = world.entity(*owner) else {
                continue;
            };
            for key in e.components() {
                if world
                    .component(*key)
                    .is_some_and(|c| c.active && c.as_map().is_some())
                {
                    maps.push((*owner, *key));
                }
            }
        }

        let mut events = Vec::new();
        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                self.test_pair(world, *a, *b);
                let key = PairKey::entities(*a, *b);
                for (side, other) in [(*a, *b), (*b, *a)] {
                    let state = recorded(world, side, &key);
                    if state != CollisionState::None {
                        events.push(CollisionEvent {
                            entity: side,
                            other: CollisionOther::Entity(other),
                            state,
                        });
                    }
                }
            }
        }
        for entity in &live {
            for (owner, map) in &maps {
                if owner == entity {
                    continue;
                }
                let state = self.test_map(world, *entity, *owner, *map);
                if state != CollisionState::None {
                    events.push(CollisionEvent {
                        entity: *entity,
                        other: CollisionOther::Map {
                            owner: *owner,
                            map: *map,
                        },
                        state,
                    });
                }
            }
        }
        for entity in &live {
            let stale = world
                .entity(*entity)
                .map(|e| e.collisions().unresolved())
                .unwrap_or_default();
            for key in stale {
                if let Some(e) = world.entity_mut(*entity) {
                    e.collisions.record(key, CollisionState::Leave);
                }
                events.push(CollisionEvent {
                    entity: *entity,
                    other: key.other(*entity),
                    state: CollisionState::Leave,
                });
            }
        }
        if !events.is_empty() {
            debug!("[Pixie collision] {} transition callbacks queued", events.len());
        }
        events
    }

    /// Rolls `current` into `previous`. An entity left out of this tick's
    /// resolution keeps its history, so it resumes where it stopped.
    pub fn end_tick(&mut self, world: &mut World, entities: &[EntityKey]) {
        for key in entities {
            if let Some(e) = world.entity_mut(*key) {
                if e.active || !e.collisions.is_empty() {
                    e.collisions.rollover();
                }
            }
        }
    }
}
