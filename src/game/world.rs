//! Static box world answering ray and sweep queries

use glam::Vec3;

use super::capabilities::{ObjectId, WorldGeometry, WorldHit};

/// Axis-aligned solid box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBox {
    pub id: ObjectId,
    pub min: Vec3,
    pub max: Vec3,
}

impl WorldBox {
    pub fn new(id: ObjectId, min: Vec3, max: Vec3) -> Self {
        Self {
            id,
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Entry fraction and normal of the segment into this box grown by `radius`
    fn intersect(&self, start: Vec3, end: Vec3, radius: f32) -> Option<(f32, Vec3)> {
        let min = self.min - Vec3::splat(radius);
        let max = self.max + Vec3::splat(radius);
        let delta = end - start;

        let mut t_enter = 0.0_f32;
        let mut t_exit = 1.0_f32;
        let mut normal = Vec3::ZERO;

        for axis in 0..3 {
            let s = start[axis];
            let d = delta[axis];
            if d.abs() < 1.0e-8 {
                if s < min[axis] || s > max[axis] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (min[axis] - s) * inv;
            let mut t1 = (max[axis] - s) * inv;
            let mut face = -1.0;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
                face = 1.0;
            }
            if t0 > t_enter {
                t_enter = t0;
                normal = Vec3::ZERO;
                normal[axis] = face;
            }
            t_exit = t_exit.min(t1);
            if t_enter > t_exit {
                return None;
            }
        }

        // Starting inside counts as an immediate hit facing back along the trace
        if normal == Vec3::ZERO {
            normal = -delta.normalize_or(Vec3::X);
        }
        Some((t_enter, normal))
    }
}

/// World made of static boxes
#[derive(Debug, Clone, Default)]
pub struct StaticWorld {
    boxes: Vec<WorldBox>,
}

impl StaticWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_box(mut self, world_box: WorldBox) -> Self {
        self.boxes.push(world_box);
        self
    }

    pub fn add_box(&mut self, world_box: WorldBox) {
        self.boxes.push(world_box);
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

impl WorldGeometry for StaticWorld {
    fn trace(&self, start: Vec3, end: Vec3, radius: f32, ignore: &[ObjectId]) -> Option<WorldHit> {
        self.boxes
            .iter()
            .filter(|b| !ignore.contains(&b.id))
            .filter_map(|b| {
                b.intersect(start, end, radius).map(|(fraction, normal)| WorldHit {
                    point: start.lerp(end, fraction),
                    normal,
                    fraction,
                    object: b.id,
                })
            })
            .min_by(|a, b| a.fraction.total_cmp(&b.fraction))
    }
}
