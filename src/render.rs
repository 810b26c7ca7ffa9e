use bevy::prelude::*;

use crate::geometry::Rect;

pub type Rgba = [f32; 4];

pub const WHITE: Rgba = [1.0, 1.0, 1.0, 1.0];

/// Screen-space primitive handed to the rendering backend. Everything is
/// already resolved to world coordinates; the backend only rasterizes.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawCommand {
    Texture {
        texture: String,
        source: Option<Rect>,
        dest: Rect,
        tint: Rgba,
    },
    Rect {
        rect: Rect,
        color: Rgba,
        filled: bool,
    },
    Polyline {
        points: Vec<Vec2>,
        color: Rgba,
        closed: bool,
    },
}

/// Rendering backend seam. The engine never talks to a GPU directly.
pub trait Renderer {
    fn draw(&mut self, command: DrawCommand);
}

#[derive(Default)]
pub struct DrawList {
    pub commands: Vec<DrawCommand>,
}

impl DrawList {
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Renderer for DrawList {
    fn draw(&mut self, command: DrawCommand) {
        self.commands.push(command);
    }
}

fn color(c: Rgba) -> Color {
    Color::srgba(c[0], c[1], c[2], c[3])
}

fn present_rect(gizmos: &mut Gizmos, rect: &Rect, c: Color) {
    // Engine space is y-down; bevy world space is y-up.
    let center = rect.center();
    gizmos.rect_2d(
        Isometry2d::new(Vec2::new(center.x, -center.y), Rot2::radians(-rect.rotation)),
        Vec2::new(rect.w, rect.h),
        c,
    );
}

/// Presents the last tick's draw list with gizmos. Textures are outlined at
/// their destination since atlas loading lives outside the engine core.
pub fn present_draw_list(commands: &[DrawCommand], gizmos: &mut Gizmos) {
    for command in commands {
        match command {
            DrawCommand::Texture { dest, tint, .. } => present_rect(gizmos, dest, color(*tint)),
            DrawCommand::Rect { rect, color: c, .. } => present_rect(gizmos, rect, color(*c)),
            DrawCommand::Polyline {
                points,
                color: c,
                closed,
            } => {
                let mut flipped: Vec<Vec2> = points.iter().map(|p| Vec2::new(p.x, -p.y)).collect();
                if *closed {
                    if let Some(first) = flipped.first().copied() {
                        flipped.push(first);
                    }
                }
                gizmos.linestrip_2d(flipped, color(*c));
            }
        }
    }
}
