use glam::Vec3;
use serde::{Deserialize, Serialize};

pub const MAX_ENTITIES: usize = 2048;

const ORIGIN_SCALE: f32 = 32.0;
const VELOCITY_SCALE: f32 = 100.0;
const ANGLE_SCALE: f32 = 10000.0;
const MAX_VELOCITY: f32 = 327.0;

/// Wire-quantized state of one entity at one tick. All fields are stored
/// in their quantized integer form so delta round-trips are exact.
/// Serde support is for baseline tables loaded from game data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity: u16,
    pub class: u8,
    pub origin: [i32; 3],
    pub velocity: [i16; 3],
    pub angles: [i16; 2],
    pub frame: u8,
    pub skin: u8,
    pub effects: u16,
    pub health: i16,
}

impl EntityState {
    pub fn new(entity: u16, class: u8) -> Self {
        Self {
            entity,
            class,
            origin: [0; 3],
            velocity: [0; 3],
            angles: [0; 2],
            frame: 0,
            skin: 0,
            effects: 0,
            health: 0,
        }
    }

    pub fn set_origin(&mut self, origin: Vec3) {
        self.origin = [
            (origin.x * ORIGIN_SCALE) as i32,
            (origin.y * ORIGIN_SCALE) as i32,
            (origin.z * ORIGIN_SCALE) as i32,
        ];
    }

    pub fn origin_vec(&self) -> Vec3 {
        Vec3::new(
            self.origin[0] as f32 / ORIGIN_SCALE,
            self.origin[1] as f32 / ORIGIN_SCALE,
            self.origin[2] as f32 / ORIGIN_SCALE,
        )
    }

    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = [
            (velocity.x.clamp(-MAX_VELOCITY, MAX_VELOCITY) * VELOCITY_SCALE) as i16,
            (velocity.y.clamp(-MAX_VELOCITY, MAX_VELOCITY) * VELOCITY_SCALE) as i16,
            (velocity.z.clamp(-MAX_VELOCITY, MAX_VELOCITY) * VELOCITY_SCALE) as i16,
        ];
    }

    pub fn velocity_vec(&self) -> Vec3 {
        Vec3::new(
            self.velocity[0] as f32 / VELOCITY_SCALE,
            self.velocity[1] as f32 / VELOCITY_SCALE,
            self.velocity[2] as f32 / VELOCITY_SCALE,
        )
    }

    pub fn set_angles(&mut self, yaw: f32, pitch: f32) {
        self.angles = [
            (normalize_angle(yaw) * ANGLE_SCALE) as i16,
            (pitch.clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2) * ANGLE_SCALE)
                as i16,
        ];
    }

    pub fn angles_rad(&self) -> (f32, f32) {
        (
            self.angles[0] as f32 / ANGLE_SCALE,
            self.angles[1] as f32 / ANGLE_SCALE,
        )
    }
}

fn normalize_angle(angle: f32) -> f32 {
    let two_pi = std::f32::consts::TAU;
    let mut normalized = angle % two_pi;
    if normalized > std::f32::consts::PI {
        normalized -= two_pi;
    } else if normalized < -std::f32::consts::PI {
        normalized += two_pi;
    }
    normalized
}

/// Per-class canonical zero states, shared read-only by every session.
/// Built at level load and replaced wholesale on level change.
#[derive(Debug, Clone)]
pub struct BaselineTable {
    classes: Vec<EntityState>,
}

impl BaselineTable {
    pub fn new(class_count: u8) -> Self {
        let classes = (0..class_count).map(|c| EntityState::new(0, c)).collect();
        Self { classes }
    }

    pub fn set(&mut self, class: u8, mut baseline: EntityState) {
        baseline.entity = 0;
        baseline.class = class;
        if let Some(slot) = self.classes.get_mut(class as usize) {
            *slot = baseline;
        }
    }

    /// Baseline for a class; unknown classes fall back to an all-zero
    /// state so a bad class id never fails a snapshot build.
    pub fn get(&self, class: u8) -> EntityState {
        self.classes
            .get(class as usize)
            .copied()
            .unwrap_or_else(|| EntityState::new(0, class))
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_quantization_roundtrip() {
        let mut state = EntityState::new(1, 0);
        state.set_origin(Vec3::new(100.5, -30.25, 4.0));

        let origin = state.origin_vec();
        assert!((origin.x - 100.5).abs() < 1.0 / ORIGIN_SCALE);
        assert!((origin.y - -30.25).abs() < 1.0 / ORIGIN_SCALE);
    }

    #[test]
    fn test_velocity_clamped() {
        let mut state = EntityState::new(1, 0);
        state.set_velocity(Vec3::new(9999.0, 0.0, 0.0));
        assert!(state.velocity_vec().x <= MAX_VELOCITY);
    }

    #[test]
    fn test_angles_normalized() {
        let mut state = EntityState::new(1, 0);
        state.set_angles(std::f32::consts::TAU + 0.5, 0.1);
        let (yaw, _) = state.angles_rad();
        assert!((yaw - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_baseline_table() {
        let mut baselines = BaselineTable::new(4);
        let mut b = EntityState::new(99, 2);
        b.health = 100;
        baselines.set(2, b);

        let got = baselines.get(2);
        assert_eq!(got.health, 100);
        assert_eq!(got.entity, 0);
        assert_eq!(got.class, 2);

        // Out-of-range class falls back to zero state.
        assert_eq!(baselines.get(200).health, 0);
    }
}
