//! Mapping between machine XYZ coordinates and per-motor step counts for
//! the supported geometries.

use crate::delta::DeltaParameters;
use crate::{AXES, X_AXIS, Y_AXIS, Z_AXIS};

/// Belt-coupled geometry selection for non-delta machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreMode {
    #[default]
    Cartesian,
    /// X motor = x + y, Y motor = y - x
    CoreXY,
    /// X motor = x + z, Z motor = z - x
    CoreXZ,
    /// Y motor = y + z, Z motor = z - y
    CoreYZ,
}

impl CoreMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cartesian" => Some(CoreMode::Cartesian),
            "corexy" => Some(CoreMode::CoreXY),
            "corexz" => Some(CoreMode::CoreXZ),
            "coreyz" => Some(CoreMode::CoreYZ),
            _ => None,
        }
    }
}

/// Geometry dispatch. Delta parameters are always present; the machine is a
/// delta whenever they describe a feasible geometry, otherwise the core mode
/// applies.
#[derive(Debug, Clone, Default)]
pub struct Kinematics {
    pub core_mode: CoreMode,
    pub delta: DeltaParameters,
}

/// Steps for a length in drive units.
pub fn motor_end_point(coord: f64, steps_per_unit: f64) -> i32 {
    (coord * steps_per_unit).round() as i32
}

impl Kinematics {
    pub fn new(core_mode: CoreMode, delta: DeltaParameters) -> Self {
        Self { core_mode, delta }
    }

    pub fn is_delta_mode(&self) -> bool {
        self.delta.is_delta_mode()
    }

    pub fn geometry_name(&self) -> &'static str {
        if self.is_delta_mode() {
            "delta"
        } else {
            match self.core_mode {
                CoreMode::Cartesian => "cartesian",
                CoreMode::CoreXY => "coreXY",
                CoreMode::CoreXZ => "coreXZ",
                CoreMode::CoreYZ => "coreYZ",
            }
        }
    }

    /// Convert a Cartesian machine position to motor step counts for the
    /// three axis drives.
    pub fn machine_to_motor(
        &self,
        machine_pos: &[f64; AXES],
        steps_per_unit: &[f64; AXES],
    ) -> [i32; AXES] {
        if self.is_delta_mode() {
            let mut motor = [0; AXES];
            for (axis, out) in motor.iter_mut().enumerate() {
                *out = motor_end_point(self.delta.transform(machine_pos, axis), steps_per_unit[axis]);
            }
            motor
        } else {
            let [x, y, z] = *machine_pos;
            let (mx, my, mz) = match self.core_mode {
                CoreMode::Cartesian => (x, y, z),
                CoreMode::CoreXY => (x + y, y - x, z),
                CoreMode::CoreXZ => (x + z, y, z - x),
                CoreMode::CoreYZ => (x, y + z, z - y),
            };
            [
                motor_end_point(mx, steps_per_unit[X_AXIS]),
                motor_end_point(my, steps_per_unit[Y_AXIS]),
                motor_end_point(mz, steps_per_unit[Z_AXIS]),
            ]
        }
    }

    /// Convert motor step counts back to a Cartesian machine position. This
    /// is expensive on a delta, so it is never called from the step
    /// interrupt.
    pub fn motor_to_machine(
        &self,
        motor_pos: &[i32; AXES],
        steps_per_unit: &[f64; AXES],
    ) -> [f64; AXES] {
        if self.is_delta_mode() {
            return self.delta.inverse_transform(
                motor_pos[X_AXIS] as f64 / steps_per_unit[X_AXIS],
                motor_pos[Y_AXIS] as f64 / steps_per_unit[Y_AXIS],
                motor_pos[Z_AXIS] as f64 / steps_per_unit[Z_AXIS],
            );
        }

        let spu = steps_per_unit;
        let m = motor_pos;
        match self.core_mode {
            CoreMode::Cartesian => [
                m[X_AXIS] as f64 / spu[X_AXIS],
                m[Y_AXIS] as f64 / spu[Y_AXIS],
                m[Z_AXIS] as f64 / spu[Z_AXIS],
            ],
            CoreMode::CoreXY => [
                (m[X_AXIS] as f64 * spu[Y_AXIS] - m[Y_AXIS] as f64 * spu[X_AXIS])
                    / (2.0 * spu[X_AXIS] * spu[Y_AXIS]),
                (m[X_AXIS] as f64 * spu[Y_AXIS] + m[Y_AXIS] as f64 * spu[X_AXIS])
                    / (2.0 * spu[X_AXIS] * spu[Y_AXIS]),
                m[Z_AXIS] as f64 / spu[Z_AXIS],
            ],
            CoreMode::CoreXZ => [
                (m[X_AXIS] as f64 * spu[Z_AXIS] - m[Z_AXIS] as f64 * spu[X_AXIS])
                    / (2.0 * spu[X_AXIS] * spu[Z_AXIS]),
                m[Y_AXIS] as f64 / spu[Y_AXIS],
                (m[X_AXIS] as f64 * spu[Z_AXIS] + m[Z_AXIS] as f64 * spu[X_AXIS])
                    / (2.0 * spu[X_AXIS] * spu[Z_AXIS]),
            ],
            CoreMode::CoreYZ => [
                m[X_AXIS] as f64 / spu[X_AXIS],
                (m[Y_AXIS] as f64 * spu[Z_AXIS] - m[Z_AXIS] as f64 * spu[Y_AXIS])
                    / (2.0 * spu[Y_AXIS] * spu[Z_AXIS]),
                (m[Y_AXIS] as f64 * spu[Z_AXIS] + m[Z_AXIS] as f64 * spu[Y_AXIS])
                    / (2.0 * spu[Y_AXIS] * spu[Z_AXIS]),
            ],
        }
    }
}
