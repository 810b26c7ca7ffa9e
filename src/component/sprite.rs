use bevy::prelude::Vec2;

use crate::component::{Behavior, ComponentData, ComponentKind};
use crate::geometry::Rect;
use crate::render::{DrawCommand, Renderer, Rgba, WHITE};

/// Textured quad with an optional frame animation over atlas source rects.
#[derive(Clone)]
pub struct SpriteComponent {
    pub texture: String,
    pub frames: Vec<Rect>,
    pub fps: f32,
    pub looping: bool,
    pub playing: bool,
    pub frame: usize,
    elapsed: f32,
    pub size: Vec2,
    pub offset: Vec2,
    pub scale: Vec2,
    pub rotation: f32,
    pub tint: Rgba,
}

impl SpriteComponent {
    pub fn new(texture: impl Into<String>, size: Vec2) -> Self {
        Self {
            texture: texture.into(),
            frames: Vec::new(),
            fps: 0.0,
            looping: true,
            playing: false,
            frame: 0,
            elapsed: 0.0,
            size,
            offset: Vec2::ZERO,
            scale: Vec2::ONE,
            rotation: 0.0,
            tint: WHITE,
        }
    }

    pub fn with_animation(mut self, frames: Vec<Rect>, fps: f32) -> Self {
        self.fps = fps;
        self.set_frames(frames);
        self
    }

    /// Replaces the frame list and restarts from the first frame. Playback
    /// starts whenever there is something to animate.
    pub fn set_frames(&mut self, frames: Vec<Rect>) {
        self.frames = frames;
        self.frame = 0;
        self.elapsed = 0.0;
        self.playing = self.frames.len() > 1 && self.fps > 0.0;
    }

    pub fn current_frame(&self) -> Option<Rect> {
        self.frames.get(self.frame).copied()
    }
}

impl Behavior for SpriteComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Sprite
    }

    fn copy(&self) -> ComponentData {
        let mut copy = self.clone();
        copy.frame = 0;
        copy.elapsed = 0.0;
        ComponentData::Sprite(copy)
    }

    fn update(&mut self, dt: f32) {
        if !self.playing || self.frames.len() < 2 || self.fps <= 0.0 {
            return;
        }
        self.elapsed += dt;
        let frame_time = 1.0 / self.fps;
        while self.elapsed >= frame_time {
            self.elapsed -= frame_time;
            if self.frame + 1 < self.frames.len() {
                self.frame += 1;
            } else if self.looping {
                self.frame = 0;
            } else {
                self.playing = false;
                self.elapsed = 0.0;
                break;
            }
        }
    }

    fn draw(&self, origin: Vec2, out: &mut dyn Renderer) {
        let size = self.size * self.scale;
        let pos = origin + self.offset;
        out.draw(DrawCommand::Texture {
            texture: self.texture.clone(),
            source: self.current_frame(),
            dest: Rect::new(pos.x, pos.y, size.x, size.y).rotated(self.rotation),
            tint: self.tint,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::DrawList;

    fn strip(n: usize) -> Vec<Rect> {
        (0..n)
            .map(|i| Rect::new(i as f32 * 16.0, 0.0, 16.0, 16.0))
            .collect()
    }

    #[test]
    fn animation_loops_and_one_shot_stops_on_last_frame() {
        let mut looping = SpriteComponent::new("hero", Vec2::splat(16.0)).with_animation(strip(3), 10.0);
        looping.update(0.35);
        assert_eq!(looping.frame, 0);

        let mut once = SpriteComponent::new("hero", Vec2::splat(16.0)).with_animation(strip(3), 10.0);
        once.looping = false;
        once.update(1.0);
        assert_eq!(once.frame, 2);
        assert!(!once.playing);
    }

    #[test]
    fn draw_places_scaled_quad_at_offset() {
        let mut sprite = SpriteComponent::new("coin", Vec2::new(8.0, 8.0));
        sprite.scale = Vec2::splat(2.0);
        sprite.offset = Vec2::new(-8.0, -8.0);
        let mut list = DrawList::default();
        sprite.draw(Vec2::new(100.0, 100.0), &mut list);
        let DrawCommand::Texture { dest, texture, .. } = &list.commands[0] else {
            panic!("expected texture");
        };
        assert_eq!(texture, "coin");
        assert_eq!((dest.x, dest.y, dest.w, dest.h), (92.0, 92.0, 16.0, 16.0));
    }
}
