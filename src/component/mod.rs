pub mod collider;
pub mod map;
pub mod script;
pub mod shape;
pub mod sprite;

use bevy::prelude::Vec2;

use crate::arena::Key;
use crate::entity::EntityKey;
use crate::ownership::Bridge;
use crate::render::Renderer;

pub use collider::ColliderComponent;
pub use map::MapComponent;
pub use script::ScriptComponent;
pub use shape::ShapeComponent;
pub use sprite::SpriteComponent;

pub type ComponentKey = Key<Component>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Script,
    Collider,
    Map,
    Sprite,
    Shape,
}

impl ComponentKind {
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Script => "script",
            ComponentKind::Collider => "collider",
            ComponentKind::Map => "map",
            ComponentKind::Sprite => "sprite",
            ComponentKind::Shape => "shape",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "script" => Some(ComponentKind::Script),
            "collider" => Some(ComponentKind::Collider),
            "map" | "tilemap" => Some(ComponentKind::Map),
            "sprite" => Some(ComponentKind::Sprite),
            "shape" | "path" => Some(ComponentKind::Shape),
            _ => None,
        }
    }
}

/// Native capability set shared by every component variant. Script-driven
/// behavior goes through the dispatch cache instead, so the defaults here are
/// no-ops.
pub trait Behavior {
    fn kind(&self) -> ComponentKind;

    /// Deep copy for entity duplication. Runtime-only state (script
    /// instances, cached world geometry) starts fresh in the copy.
    fn copy(&self) -> ComponentData;

    fn update(&mut self, _dt: f32) {}

    fn draw(&self, _origin: Vec2, _out: &mut dyn Renderer) {}
}

pub enum ComponentData {
    Script(ScriptComponent),
    Collider(ColliderComponent),
    Map(MapComponent),
    Sprite(SpriteComponent),
    Shape(ShapeComponent),
}

impl ComponentData {
    pub fn behavior(&self) -> &dyn Behavior {
        match self {
            ComponentData::Script(c) => c,
            ComponentData::Collider(c) => c,
            ComponentData::Map(c) => c,
            ComponentData::Sprite(c) => c,
            ComponentData::Shape(c) => c,
        }
    }

    pub fn behavior_mut(&mut self) -> &mut dyn Behavior {
        match self {
            ComponentData::Script(c) => c,
            ComponentData::Collider(c) => c,
            ComponentData::Map(c) => c,
            ComponentData::Sprite(c) => c,
            ComponentData::Shape(c) => c,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.behavior().kind()
    }
}

pub struct Component {
    id: String,
    pub active: bool,
    /// Owning entity. Non-owning: never counted in the component's bridge.
    pub(crate) entity: Option<EntityKey>,
    pub(crate) bridge: Bridge,
    pub data: ComponentData,
}

impl Component {
    pub(crate) fn new(data: ComponentData) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            active: true,
            entity: None,
            bridge: Bridge::native(),
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ComponentKind {
        self.data.kind()
    }

    pub fn entity(&self) -> Option<EntityKey> {
        self.entity
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn as_script(&self) -> Option<&ScriptComponent> {
        match &self.data {
            ComponentData::Script(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_script_mut(&mut self) -> Option<&mut ScriptComponent> {
        match &mut self.data {
            ComponentData::Script(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_collider(&self) -> Option<&ColliderComponent> {
        match &self.data {
            ComponentData::Collider(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_sprite(&self) -> Option<&SpriteComponent> {
        match &self.data {
            ComponentData::Sprite(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sprite_mut(&mut self) -> Option<&mut SpriteComponent> {
        match &mut self.data {
            ComponentData::Sprite(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapComponent> {
        match &self.data {
            ComponentData::Map(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::Ownership;

    #[test]
    fn kind_names_roundtrip_case_insensitively() {
        for kind in [
            ComponentKind::Script,
            ComponentKind::Collider,
            ComponentKind::Map,
            ComponentKind::Sprite,
            ComponentKind::Shape,
        ] {
            assert_eq!(ComponentKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ComponentKind::from_name(" Collider "), Some(ComponentKind::Collider));
        assert_eq!(ComponentKind::from_name("tilemap"), Some(ComponentKind::Map));
        assert_eq!(ComponentKind::from_name("rigidbody"), None);
    }

    #[test]
    fn new_components_get_distinct_ids_and_native_ownership() {
        let a = Component::new(ComponentData::Collider(ColliderComponent::default()));
        let b = Component::new(ComponentData::Collider(ColliderComponent::default()));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.bridge().ref_count(), 1);
        assert_eq!(a.bridge().ownership(), Ownership::Native);
        assert!(a.entity().is_none());
    }
}
