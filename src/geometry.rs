use bevy::prelude::Vec2;
use serde::{Deserialize, Serialize};

use std::f32::consts::TAU;

const ANGLE_EPSILON: f32 = 1e-5;

/// Axis-aligned world bounds, inclusive on every edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Vec2,
    pub max: Vec2,
}

impl Bounds {
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn translated(self, offset: Vec2) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.max.x >= other.min.x
            && self.min.x <= other.max.x
            && self.max.y >= other.min.y
            && self.min.y <= other.max.y
    }
}

/// Rectangle anchored at its top-left corner, rotated by `rotation` radians
/// around its own center.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(default)]
    pub rotation: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            rotation: 0.0,
        }
    }

    pub fn rotated(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn translated(mut self, offset: Vec2) -> Self {
        self.x += offset.x;
        self.y += offset.y;
        self
    }

    /// Zero-area or non-finite rectangles never collide with anything.
    pub fn is_degenerate(&self) -> bool {
        !(self.w > 0.0 && self.h > 0.0)
            || !self.x.is_finite()
            || !self.y.is_finite()
            || !self.w.is_finite()
            || !self.h.is_finite()
            || !self.rotation.is_finite()
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x + self.w * 0.5, self.y + self.h * 0.5)
    }

    /// Maps a world point into the unrotated frame of this rectangle, where
    /// the rectangle spans `[x, x + w] × [y, y + h]`.
    pub fn to_local(&self, p: Vec2) -> Vec2 {
        if self.rotation == 0.0 {
            return p;
        }
        let c = self.center();
        let (sin, cos) = (-self.rotation).sin_cos();
        let d = p - c;
        c + Vec2::new(d.x * cos - d.y * sin, d.x * sin + d.y * cos)
    }

    fn to_world(&self, p: Vec2) -> Vec2 {
        if self.rotation == 0.0 {
            return p;
        }
        let c = self.center();
        let (sin, cos) = self.rotation.sin_cos();
        let d = p - c;
        c + Vec2::new(d.x * cos - d.y * sin, d.x * sin + d.y * cos)
    }

    fn local_contains(&self, p: Vec2) -> bool {
        p.x >= self.x && p.x <= self.x + self.w && p.y >= self.y && p.y <= self.y + self.h
    }

    pub fn contains_point(&self, p: Vec2) -> bool {
        if self.is_degenerate() {
            return false;
        }
        self.local_contains(self.to_local(p))
    }

    pub fn corners(&self) -> [Vec2; 4] {
        [
            self.to_world(Vec2::new(self.x, self.y)),
            self.to_world(Vec2::new(self.x + self.w, self.y)),
            self.to_world(Vec2::new(self.x + self.w, self.y + self.h)),
            self.to_world(Vec2::new(self.x, self.y + self.h)),
        ]
    }

    pub fn edges(&self) -> [(Vec2, Vec2); 4] {
        let [a, b, c, d] = self.corners();
        [(a, b), (b, c), (c, d), (d, a)]
    }

    pub fn bounds(&self) -> Bounds {
        let [a, b, c, d] = self.corners();
        Bounds {
            min: a.min(b).min(c).min(d),
            max: a.max(b).max(c).max(d),
        }
    }
}

fn cross(a: Vec2, b: Vec2) -> f32 {
    a.x * b.y - a.y * b.x
}

fn on_segment(p: Vec2, a: Vec2, b: Vec2) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Closed segment intersection: touching endpoints and collinear overlap count.
pub fn segments_intersect(a0: Vec2, a1: Vec2, b0: Vec2, b1: Vec2) -> bool {
    let d1 = cross(b1 - b0, a0 - b0);
    let d2 = cross(b1 - b0, a1 - b0);
    let d3 = cross(a1 - a0, b0 - a0);
    let d4 = cross(a1 - a0, b1 - a0);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(a0, b0, b1))
        || (d2 == 0.0 && on_segment(a1, b0, b1))
        || (d3 == 0.0 && on_segment(b0, a0, a1))
        || (d4 == 0.0 && on_segment(b1, a0, a1))
}

/// Overlap between two (possibly rotated) rectangles. Corners of each are
/// tested inside the other's local frame; crossing edges catch the case where
/// neither contains a corner of the other.
pub fn rect_overlap(a: &Rect, b: &Rect) -> bool {
    if a.is_degenerate() || b.is_degenerate() {
        return false;
    }
    if a.rotation == 0.0 && b.rotation == 0.0 {
        return a.x <= b.x + b.w && a.x + a.w >= b.x && a.y <= b.y + b.h && a.y + a.h >= b.y;
    }
    if !a.bounds().overlaps(&b.bounds()) {
        return false;
    }
    if a.corners().iter().any(|p| b.contains_point(*p))
        || b.corners().iter().any(|p| a.contains_point(*p))
    {
        return true;
    }
    a.edges().iter().any(|(a0, a1)| {
        b.edges()
            .iter()
            .any(|(b0, b1)| segments_intersect(*a0, *a1, *b0, *b1))
    })
}

/// Distance along a normalized ray to the first point of `rect`, using the
/// slab method in the rectangle's local frame. A ray starting inside reports
/// its exit distance; grazing an edge counts as a hit.
pub fn ray_rect(origin: Vec2, direction: Vec2, max_distance: f32, rect: &Rect) -> Option<f32> {
    if rect.is_degenerate() {
        return None;
    }
    let len = direction.length();
    if len <= 0.0001 {
        return None;
    }
    let world_dir = direction / len;
    let o = rect.to_local(origin);
    let d = rect.to_local(origin + world_dir) - o;
    let min = Vec2::new(rect.x, rect.y);
    let max = Vec2::new(rect.x + rect.w, rect.y + rect.h);

    let mut tmin = f32::NEG_INFINITY;
    let mut tmax = f32::INFINITY;
    for axis in 0..2 {
        let (o, d, mn, mx) = if axis == 0 {
            (o.x, d.x, min.x, max.x)
        } else {
            (o.y, d.y, min.y, max.y)
        };
        if d.abs() < 1e-6 {
            if o < mn || o > mx {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d;
        let mut t1 = (mn - o) * inv;
        let mut t2 = (mx - o) * inv;
        if t1 > t2 {
            std::mem::swap(&mut t1, &mut t2);
        }
        tmin = tmin.max(t1);
        tmax = tmax.min(t2);
        if tmin > tmax {
            return None;
        }
    }
    if tmax < 0.0 {
        return None;
    }
    let hit = if tmin >= 0.0 { tmin } else { tmax };
    (hit <= max_distance).then_some(hit)
}

/// Circular sector: every point within `radius` of `center` whose direction
/// lies in the counter-clockwise sweep from `start` to `end` (radians).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Arc {
    pub center: Vec2,
    pub radius: f32,
    pub start: f32,
    pub end: f32,
}

impl Arc {
    pub fn circle(center: Vec2, radius: f32) -> Self {
        Self {
            center,
            radius,
            start: 0.0,
            end: TAU,
        }
    }

    fn sweep(&self) -> f32 {
        self.end - self.start
    }

    fn is_full(&self) -> bool {
        self.sweep().abs() >= TAU - ANGLE_EPSILON
    }

    fn contains_angle(&self, angle: f32) -> bool {
        if self.is_full() {
            return true;
        }
        let sweep = self.sweep().rem_euclid(TAU);
        let rel = (angle - self.start).rem_euclid(TAU);
        rel <= sweep + ANGLE_EPSILON || rel >= TAU - ANGLE_EPSILON
    }

    pub fn contains_point(&self, p: Vec2) -> bool {
        let d = p - self.center;
        if d.length_squared() > self.radius * self.radius {
            return false;
        }
        if d.length_squared() == 0.0 {
            return true;
        }
        self.contains_angle(d.y.atan2(d.x))
    }
}

fn segment_circle_points(a: Vec2, b: Vec2, center: Vec2, radius: f32) -> Vec<Vec2> {
    let d = b - a;
    let f = a - center;
    let qa = d.dot(d);
    if qa == 0.0 {
        return Vec::new();
    }
    let qb = 2.0 * f.dot(d);
    let qc = f.dot(f) - radius * radius;
    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return Vec::new();
    }
    let root = disc.sqrt();
    [(-qb - root) / (2.0 * qa), (-qb + root) / (2.0 * qa)]
        .into_iter()
        .filter(|t| (0.0..=1.0).contains(t))
        .map(|t| a + d * t)
        .collect()
}

/// Sector-vs-rectangle overlap with closed semantics: tangential contact with
/// the arc, a radial edge or a rectangle edge all count.
pub fn arc_rect(arc: &Arc, rect: &Rect) -> bool {
    if rect.is_degenerate() || !(arc.radius > 0.0) || !arc.radius.is_finite() {
        return false;
    }
    if rect.contains_point(arc.center) {
        return true;
    }
    if rect.corners().iter().any(|p| arc.contains_point(*p)) {
        return true;
    }
    let edges = rect.edges();
    if !arc.is_full() {
        for angle in [arc.start, arc.end] {
            let tip = arc.center + Vec2::new(angle.cos(), angle.sin()) * arc.radius;
            if edges
                .iter()
                .any(|(a, b)| segments_intersect(arc.center, tip, *a, *b))
            {
                return true;
            }
        }
    }
    edges.iter().any(|(a, b)| {
        segment_circle_points(*a, *b, arc.center, arc.radius)
            .into_iter()
            .any(|p| {
                let d = p - arc.center;
                arc.contains_angle(d.y.atan2(d.x))
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    #[test]
    fn containment_is_boundary_inclusive() {
        let r = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(r.contains_point(Vec2::new(10.0, 10.0)));
        assert!(r.contains_point(Vec2::new(0.0, 5.0)));
        assert!(!r.contains_point(Vec2::new(10.01, 5.0)));
    }

    #[test]
    fn rotation_is_periodic() {
        let samples = [
            Vec2::new(50.0, 50.0),
            Vec2::new(50.0, 5.0),
            Vec2::new(95.0, 50.0),
            Vec2::new(-20.0, 50.0),
            Vec2::new(0.0, 0.0),
        ];
        for step in 0..16 {
            let theta = step as f32 * PI / 8.0;
            let a = Rect::new(0.0, 30.0, 100.0, 40.0).rotated(theta);
            let b = a.rotated(theta + TAU);
            for p in samples {
                assert_eq!(
                    a.contains_point(p),
                    b.contains_point(p),
                    "theta={theta} point={p:?}"
                );
            }
        }
    }

    #[test]
    fn rotated_rect_containment_uses_local_frame() {
        // A 100x10 bar rotated a quarter turn stands vertically around (50, 5).
        let bar = Rect::new(0.0, 0.0, 100.0, 10.0).rotated(FRAC_PI_2);
        assert!(bar.contains_point(Vec2::new(50.0, 40.0)));
        assert!(!bar.contains_point(Vec2::new(90.0, 5.0)));
    }

    #[test]
    fn crossed_rectangles_overlap_without_shared_corners() {
        let horizontal = Rect::new(0.0, 45.0, 100.0, 10.0);
        let vertical = Rect::new(0.0, 45.0, 100.0, 10.0).rotated(FRAC_PI_2);
        assert!(rect_overlap(&horizontal, &vertical));
        assert!(rect_overlap(&vertical, &horizontal));
    }

    #[test]
    fn touching_edges_overlap_and_degenerate_never_does() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(10.0, 0.0, 10.0, 10.0);
        assert!(rect_overlap(&a, &b));
        let c = Rect::new(10.5, 0.0, 10.0, 10.0);
        assert!(!rect_overlap(&a, &c));
        let flat = Rect::new(5.0, 5.0, 0.0, 10.0);
        assert!(!rect_overlap(&a, &flat));
        assert!(!flat.contains_point(Vec2::new(5.0, 5.0)));
    }

    #[test]
    fn rotated_diamond_misses_corner_gap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        // Diamond centered at (20, 20) with half-diagonal ~7.07 stays clear.
        let diamond = Rect::new(15.0, 15.0, 10.0, 10.0).rotated(FRAC_PI_4);
        assert!(!rect_overlap(&a, &diamond));
    }

    #[test]
    fn ray_hits_rect_and_grazes_edge() {
        let r = Rect::new(10.0, -5.0, 10.0, 10.0);
        let hit = ray_rect(Vec2::ZERO, Vec2::X, 100.0, &r).expect("hit");
        assert!((hit - 10.0).abs() < 1e-4);
        let graze = ray_rect(Vec2::new(0.0, 5.0), Vec2::X, 100.0, &r);
        assert!(graze.is_some());
        assert!(ray_rect(Vec2::new(0.0, 5.5), Vec2::X, 100.0, &r).is_none());
        assert!(ray_rect(Vec2::ZERO, Vec2::X, 5.0, &r).is_none());
    }

    #[test]
    fn ray_from_inside_reports_exit_distance() {
        let r = Rect::new(10.0, -5.0, 10.0, 10.0);
        let exit = ray_rect(Vec2::new(15.0, 0.0), Vec2::X, 100.0, &r).expect("exit");
        assert!((exit - 5.0).abs() < 1e-4);
        let back = ray_rect(Vec2::new(12.0, 0.0), -Vec2::X, 100.0, &r).expect("exit");
        assert!((back - 2.0).abs() < 1e-4);
        assert!(ray_rect(Vec2::new(15.0, 0.0), Vec2::X, 3.0, &r).is_none());
        // Pointing away from a rect behind the origin.
        assert!(ray_rect(Vec2::new(30.0, 0.0), Vec2::X, 100.0, &r).is_none());
    }

    #[test]
    fn ray_respects_rotation() {
        // Rotating the square a quarter turn about its center leaves it in place.
        let r = Rect::new(10.0, -5.0, 10.0, 10.0).rotated(FRAC_PI_2);
        let hit = ray_rect(Vec2::ZERO, Vec2::X, 100.0, &r).expect("hit");
        assert!((hit - 10.0).abs() < 1e-3);
    }

    #[test]
    fn arc_tangent_and_sector_limits() {
        let r = Rect::new(10.0, -5.0, 10.0, 10.0);
        assert!(arc_rect(&Arc::circle(Vec2::ZERO, 10.0), &r));
        assert!(!arc_rect(&Arc::circle(Vec2::ZERO, 9.9), &r));

        let facing_away = Arc {
            center: Vec2::ZERO,
            radius: 50.0,
            start: FRAC_PI_2,
            end: 3.0 * FRAC_PI_2,
        };
        assert!(!arc_rect(&facing_away, &r));

        let facing = Arc {
            center: Vec2::ZERO,
            radius: 50.0,
            start: -FRAC_PI_4,
            end: FRAC_PI_4,
        };
        assert!(arc_rect(&facing, &r));
    }

    #[test]
    fn bounds_union_and_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0).bounds();
        let b = Rect::new(20.0, 0.0, 10.0, 10.0).bounds();
        assert!(!a.overlaps(&b));
        let u = a.union(b);
        assert_eq!(u.min, Vec2::ZERO);
        assert_eq!(u.max, Vec2::new(30.0, 10.0));
        assert!(u.overlaps(&b));
    }
}
