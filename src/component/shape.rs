use bevy::prelude::Vec2;

use crate::component::{Behavior, ComponentData, ComponentKind};
use crate::render::{DrawCommand, Renderer, Rgba, WHITE};

/// Vector outline made of pre-flattened polylines in entity-local space.
/// Path parsing happens before the shape is built.
#[derive(Clone)]
pub struct ShapeComponent {
    pub polylines: Vec<Vec<Vec2>>,
    pub color: Rgba,
    pub closed: bool,
}

impl ShapeComponent {
    pub fn new(polylines: Vec<Vec<Vec2>>) -> Self {
        Self {
            polylines,
            color: WHITE,
            closed: false,
        }
    }
}

impl Behavior for ShapeComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Shape
    }

    fn copy(&self) -> ComponentData {
        ComponentData::Shape(self.clone())
    }

    fn draw(&self, origin: Vec2, out: &mut dyn Renderer) {
        for line in self.polylines.iter().filter(|l| l.len() >= 2) {
            out.draw(DrawCommand::Polyline {
                points: line.iter().map(|p| *p + origin).collect(),
                color: self.color,
                closed: self.closed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::DrawList;

    #[test]
    fn draw_translates_points_and_skips_single_point_lines() {
        let shape = ShapeComponent::new(vec![
            vec![Vec2::ZERO, Vec2::new(10.0, 0.0)],
            vec![Vec2::new(1.0, 1.0)],
        ]);
        let mut list = DrawList::default();
        shape.draw(Vec2::new(5.0, 5.0), &mut list);
        assert_eq!(list.len(), 1);
        let DrawCommand::Polyline { points, .. } = &list.commands[0] else {
            panic!("expected polyline");
        };
        assert_eq!(points, &vec![Vec2::new(5.0, 5.0), Vec2::new(15.0, 5.0)]);
    }
}
