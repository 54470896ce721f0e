//! Segment and capsule intersection helpers
//!
//! World space is Z-up. Combatant hitboxes are vertical capsules described by
//! a radius and a half-height that includes the hemispherical caps, so the
//! capsule's inner axis spans `half_height - radius` above and below the center.

use glam::Vec3;

const EPSILON: f32 = 1.0e-6;

/// Closest point on segment `a..b` to `p`, with its parameter in [0, 1]
pub fn closest_point_on_segment(p: Vec3, a: Vec3, b: Vec3) -> (Vec3, f32) {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= EPSILON {
        return (a, 0.0);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    (a + ab * t, t)
}

/// Closest points between two segments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPair {
    /// Point on the first segment
    pub on_first: Vec3,
    /// Point on the second segment
    pub on_second: Vec3,
    /// Parameter along the first segment
    pub s: f32,
    /// Parameter along the second segment
    pub t: f32,
    pub distance: f32,
}

/// Closest points between segments `p1..q1` and `p2..q2`
pub fn closest_points_between_segments(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> SegmentPair {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (s, t) = if a <= EPSILON && e <= EPSILON {
        (0.0, 0.0)
    } else if a <= EPSILON {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d1.dot(r);
        if e <= EPSILON {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            // Parallel segments: any s works, pick the start
            let mut s = if denom > EPSILON {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };

    let on_first = p1 + d1 * s;
    let on_second = p2 + d2 * t;
    SegmentPair {
        on_first,
        on_second,
        s,
        t,
        distance: on_first.distance(on_second),
    }
}

/// Angle in radians between `direction` and the ray from `origin` to `point`
pub fn angle_to_point(origin: Vec3, direction: Vec3, point: Vec3) -> f32 {
    let to_point = point - origin;
    if to_point.length_squared() <= EPSILON || direction.length_squared() <= EPSILON {
        return 0.0;
    }
    direction.angle_between(to_point)
}

/// Vertical capsule hitbox
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capsule {
    pub center: Vec3,
    pub radius: f32,
    pub half_height: f32,
}

/// Where a shot segment passes a capsule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapsuleContact {
    /// Closest point on the shot segment
    pub point: Vec3,
    /// Closest point on the capsule axis (the center for spheres)
    pub axis_point: Vec3,
    /// Fraction of the shot segment travelled to `point`
    pub fraction: f32,
    /// Distance between the shot segment and the capsule axis
    pub separation: f32,
}

impl CapsuleContact {
    /// Outward normal at the contact, pointing from the axis to the shot
    pub fn normal(&self) -> Vec3 {
        (self.point - self.axis_point).normalize_or(Vec3::Z)
    }
}

impl Capsule {
    pub fn vertical(center: Vec3, radius: f32, half_height: f32) -> Self {
        Self {
            center,
            radius,
            half_height,
        }
    }

    /// A capsule no taller than it is wide degenerates to a sphere
    pub fn is_sphere(&self) -> bool {
        self.radius >= self.half_height
    }

    /// Inner axis segment (both ends equal the center for spheres)
    pub fn axis(&self) -> (Vec3, Vec3) {
        if self.is_sphere() {
            return (self.center, self.center);
        }
        let offset = Vec3::Z * (self.half_height - self.radius);
        (self.center - offset, self.center + offset)
    }

    /// Closest approach of the segment `start..end` to this capsule
    pub fn closest_approach(&self, start: Vec3, end: Vec3) -> CapsuleContact {
        if self.is_sphere() {
            let (point, fraction) = closest_point_on_segment(self.center, start, end);
            return CapsuleContact {
                point,
                axis_point: self.center,
                fraction,
                separation: point.distance(self.center),
            };
        }

        let (bottom, top) = self.axis();
        let pair = closest_points_between_segments(start, end, bottom, top);
        CapsuleContact {
            point: pair.on_first,
            axis_point: pair.on_second,
            fraction: pair.s,
            separation: pair.distance,
        }
    }

    /// Test the segment against the capsule inflated by `extra_radius`
    pub fn test_segment(&self, start: Vec3, end: Vec3, extra_radius: f32) -> Option<CapsuleContact> {
        let contact = self.closest_approach(start, end);
        (contact.separation <= self.radius + extra_radius).then_some(contact)
    }

    /// Point on the capsule surface nearest to `from`
    pub fn surface_point_toward(&self, from: Vec3) -> Vec3 {
        let (bottom, top) = self.axis();
        let (axis_point, _) = closest_point_on_segment(from, bottom, top);
        let outward = (from - axis_point).normalize_or_zero();
        axis_point + outward * self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1.0e-4
    }

    #[test]
    fn point_projects_onto_segment_interior() {
        let (p, t) = closest_point_on_segment(Vec3::new(5.0, 3.0, 0.0), Vec3::ZERO, Vec3::X * 10.0);
        assert_eq!(p, Vec3::new(5.0, 0.0, 0.0));
        assert!(approx(t, 0.5));
    }

    #[test]
    fn point_clamps_to_segment_ends() {
        let (p, t) = closest_point_on_segment(Vec3::new(-4.0, 1.0, 0.0), Vec3::ZERO, Vec3::X * 10.0);
        assert_eq!(p, Vec3::ZERO);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn crossing_segments_have_expected_gap() {
        let pair = closest_points_between_segments(
            Vec3::new(-10.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(0.0, -10.0, 5.0),
            Vec3::new(0.0, 10.0, 5.0),
        );
        assert!(approx(pair.distance, 5.0));
        assert!(approx(pair.s, 0.5));
        assert!(approx(pair.t, 0.5));
    }

    #[test]
    fn parallel_segments_report_their_separation() {
        let pair = closest_points_between_segments(
            Vec3::ZERO,
            Vec3::X * 10.0,
            Vec3::new(0.0, 3.0, 0.0),
            Vec3::new(10.0, 3.0, 0.0),
        );
        assert!(approx(pair.distance, 3.0));
    }

    #[test]
    fn wide_capsule_is_tested_as_sphere() {
        // radius 30 >= half-height 20
        let capsule = Capsule::vertical(Vec3::ZERO, 30.0, 20.0);
        assert!(capsule.is_sphere());
        assert_eq!(capsule.axis(), (Vec3::ZERO, Vec3::ZERO));

        let grazing = capsule.test_segment(Vec3::new(-100.0, 0.0, 29.0), Vec3::new(100.0, 0.0, 29.0), 0.0);
        assert!(grazing.is_some());

        // A capsule axis built from the negative inner half-length would reach
        // z = 10 and accept this shot; the sphere must not.
        let above = capsule.test_segment(Vec3::new(-100.0, 0.0, 35.0), Vec3::new(100.0, 0.0, 35.0), 0.0);
        assert!(above.is_none());
    }

    #[test]
    fn tall_capsule_uses_axis_segment() {
        let capsule = Capsule::vertical(Vec3::ZERO, 20.0, 90.0);
        assert!(!capsule.is_sphere());

        // Passes 60 units above the center: inside the capsule, outside a sphere.
        let contact = capsule
            .test_segment(Vec3::new(-100.0, 10.0, 60.0), Vec3::new(100.0, 10.0, 60.0), 0.0)
            .unwrap();
        assert!(approx(contact.separation, 10.0));
        assert!(approx(contact.fraction, 0.5));

        assert!(capsule
            .test_segment(Vec3::new(-100.0, 0.0, 95.0), Vec3::new(100.0, 0.0, 95.0), 0.0)
            .is_none());
    }

    #[test]
    fn extra_radius_widens_the_test() {
        let capsule = Capsule::vertical(Vec3::ZERO, 10.0, 40.0);
        let start = Vec3::new(-50.0, 14.0, 0.0);
        let end = Vec3::new(50.0, 14.0, 0.0);
        assert!(capsule.test_segment(start, end, 0.0).is_none());
        assert!(capsule.test_segment(start, end, 5.0).is_some());
    }

    #[test]
    fn surface_point_faces_the_viewer() {
        let capsule = Capsule::vertical(Vec3::ZERO, 10.0, 40.0);
        let surface = capsule.surface_point_toward(Vec3::new(100.0, 0.0, 0.0));
        assert!(approx(surface.x, 10.0));
        assert!(approx(surface.z, 0.0));
    }

    #[test]
    fn angle_to_point_measures_offset() {
        let angle = angle_to_point(Vec3::ZERO, Vec3::X, Vec3::new(10.0, 10.0, 0.0));
        assert!(approx(angle, std::f32::consts::FRAC_PI_4));
    }
}
