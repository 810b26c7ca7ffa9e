use bevy::prelude::Vec2;

use crate::component::{Behavior, ComponentData, ComponentKind};
use crate::geometry::{rect_overlap, Rect};
use crate::render::{DrawCommand, Renderer};

const TILE_COLOR: [f32; 4] = [0.55, 0.5, 0.45, 1.0];

/// Tile grid anchored at the owning entity's position. Tile id 0 is empty;
/// every other id is solid for collision purposes.
#[derive(Clone)]
pub struct MapComponent {
    pub width: usize,
    pub height: usize,
    pub tile_size: f32,
    pub tiles: Vec<u8>,
}

impl MapComponent {
    pub fn new(width: usize, height: usize, tile_size: f32) -> Self {
        Self {
            width,
            height,
            tile_size,
            tiles: vec![0; width * height],
        }
    }

    /// Builds from row-major tile ids, padding or truncating to the grid size.
    pub fn from_tiles(width: usize, height: usize, tile_size: f32, mut tiles: Vec<u8>) -> Self {
        tiles.resize(width * height, 0);
        Self {
            width,
            height,
            tile_size,
            tiles,
        }
    }

    pub fn get_tile(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.tiles[y as usize * self.width + x as usize]
    }

    pub fn set_tile(&mut self, x: i32, y: i32, tile_id: u8) -> bool {
        if x >= 0 && y >= 0 && x < self.width as i32 && y < self.height as i32 {
            self.tiles[y as usize * self.width + x as usize] = tile_id;
            true
        } else {
            false
        }
    }

    pub fn is_solid(&self, x: i32, y: i32) -> bool {
        self.get_tile(x, y) != 0
    }

    pub fn tile_rect(&self, origin: Vec2, x: i32, y: i32) -> Rect {
        Rect::new(
            origin.x + x as f32 * self.tile_size,
            origin.y + y as f32 * self.tile_size,
            self.tile_size,
            self.tile_size,
        )
    }

    /// Solid tiles whose cells intersect the world-space bounds of `rect`.
    pub fn solid_tiles_near(&self, origin: Vec2, rect: &Rect) -> Vec<(i32, i32)> {
        if self.tile_size <= 0.0 || rect.is_degenerate() {
            return Vec::new();
        }
        let b = rect.bounds();
        let ts = self.tile_size;
        let min_tx = ((b.min.x - origin.x) / ts).floor() as i32;
        let max_tx = ((b.max.x - origin.x) / ts).floor() as i32;
        let min_ty = ((b.min.y - origin.y) / ts).floor() as i32;
        let max_ty = ((b.max.y - origin.y) / ts).floor() as i32;
        let mut out = Vec::new();
        for ty in min_ty.max(0)..=max_ty.min(self.height as i32 - 1) {
            for tx in min_tx.max(0)..=max_tx.min(self.width as i32 - 1) {
                if self.is_solid(tx, ty) {
                    out.push((tx, ty));
                }
            }
        }
        out
    }

    pub fn overlaps_rect(&self, origin: Vec2, rect: &Rect) -> bool {
        self.solid_tiles_near(origin, rect)
            .into_iter()
            .any(|(tx, ty)| rect_overlap(&self.tile_rect(origin, tx, ty), rect))
    }
}

impl Behavior for MapComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Map
    }

    fn copy(&self) -> ComponentData {
        ComponentData::Map(self.clone())
    }

    fn draw(&self, origin: Vec2, out: &mut dyn Renderer) {
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                if self.is_solid(x, y) {
                    out.draw(DrawCommand::Rect {
                        rect: self.tile_rect(origin, x, y),
                        color: TILE_COLOR,
                        filled: true,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::DrawList;

    fn floor_map() -> MapComponent {
        let mut map = MapComponent::new(8, 4, 16.0);
        for x in 0..8 {
            map.set_tile(x, 3, 1);
        }
        map
    }

    #[test]
    fn out_of_range_tiles_read_as_empty() {
        let map = floor_map();
        assert_eq!(map.get_tile(-1, 3), 0);
        assert_eq!(map.get_tile(8, 3), 0);
        assert!(!map.clone().set_tile(9, 0, 1));
    }

    #[test]
    fn rect_touching_floor_overlaps_and_rect_above_does_not() {
        let map = floor_map();
        let origin = Vec2::new(100.0, 0.0);
        // Floor row spans y in [48, 64].
        let standing = Rect::new(110.0, 32.0, 16.0, 16.0);
        let hovering = Rect::new(110.0, 20.0, 16.0, 16.0);
        assert!(map.overlaps_rect(origin, &standing));
        assert!(!map.overlaps_rect(origin, &hovering));
        let outside = Rect::new(0.0, 50.0, 16.0, 4.0);
        assert!(!map.overlaps_rect(origin, &outside));
    }

    #[test]
    fn draws_one_rect_per_solid_tile() {
        let map = floor_map();
        let mut list = DrawList::default();
        map.draw(Vec2::ZERO, &mut list);
        assert_eq!(list.len(), 8);
    }
}
