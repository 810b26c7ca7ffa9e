use bevy::prelude::Vec2;
use serde::{Deserialize, Serialize};

use crate::component::{Behavior, ComponentData, ComponentKind};
use crate::geometry::{Bounds, Rect};
use crate::render::{DrawCommand, Renderer};

const DEBUG_COLOR: [f32; 4] = [0.2, 1.0, 0.4, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColliderRect {
    pub rect: Rect,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<Rect> for ColliderRect {
    fn from(rect: Rect) -> Self {
        Self {
            rect,
            enabled: true,
        }
    }
}

/// One or more rectangles in entity-local space. World-space copies are
/// cached and refreshed whenever the owner moves or the geometry changes.
#[derive(Default)]
pub struct ColliderComponent {
    rects: Vec<ColliderRect>,
    world: Vec<Rect>,
    local_bounds: Option<Bounds>,
    world_bounds: Option<Bounds>,
    pub debug_draw: bool,
}

impl ColliderComponent {
    pub fn new(rects: impl IntoIterator<Item = Rect>) -> Self {
        Self {
            rects: rects.into_iter().map(ColliderRect::from).collect(),
            ..Self::default()
        }
    }

    pub fn rects(&self) -> &[ColliderRect] {
        &self.rects
    }

    /// Replaces the geometry. The caller must refresh world space through
    /// `World::recompute_bounds` so the owning entity's bounds follow.
    pub fn set_rects(&mut self, rects: Vec<ColliderRect>) {
        self.rects = rects;
        self.world.clear();
        self.world_bounds = None;
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> bool {
        match self.rects.get_mut(index) {
            Some(r) => {
                r.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn recompute(&mut self, origin: Vec2) {
        self.world = self
            .rects
            .iter()
            .filter(|r| r.enabled && !r.rect.is_degenerate())
            .map(|r| r.rect.translated(origin))
            .collect();
        self.local_bounds = self
            .rects
            .iter()
            .filter(|r| r.enabled && !r.rect.is_degenerate())
            .map(|r| r.rect.bounds())
            .reduce(Bounds::union);
        self.world_bounds = self.local_bounds.map(|b| b.translated(origin));
    }

    /// Enabled, non-degenerate rectangles in world space.
    pub fn world_rects(&self) -> &[Rect] {
        &self.world
    }

    pub fn local_bounds(&self) -> Option<Bounds> {
        self.local_bounds
    }

    pub fn world_bounds(&self) -> Option<Bounds> {
        self.world_bounds
    }
}

impl Behavior for ColliderComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Collider
    }

    fn copy(&self) -> ComponentData {
        ComponentData::Collider(ColliderComponent {
            rects: self.rects.clone(),
            debug_draw: self.debug_draw,
            ..ColliderComponent::default()
        })
    }

    fn draw(&self, _origin: Vec2, out: &mut dyn Renderer) {
        if !self.debug_draw {
            return;
        }
        for rect in &self.world {
            out.draw(DrawCommand::Rect {
                rect: *rect,
                color: DEBUG_COLOR,
                filled: false,
            });
        }
    }
}
