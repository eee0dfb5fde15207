//! A single move descriptor: per-drive step targets, a trapezoidal velocity
//! profile, and the bounded step function driven by the timer interrupt.

use crate::fsquare;
use crate::kinematics::{motor_end_point, Kinematics};
use crate::platform::{MoveRequest, Platform, STEP_CLOCK_RATE};
use crate::{AXES, DRIVES};

/// Number of slots in the move ring.
pub const DDA_RING_LENGTH: usize = 20;

// Slower moves are planned at this speed, in mm/s.
const MINIMUM_MOVEMENT_SPEED: f64 = 0.5;

// A step issued later than this after its due time counts as a step error.
const LATE_STEP_CLOCKS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdaState {
    /// Slot is free; only the end-point fields are meaningful (they anchor
    /// the next move).
    #[default]
    Empty,
    /// Initialised from a move tuple; still subject to look-ahead.
    Provisional,
    /// Trajectory shaping finished; ready for the step interrupt.
    Frozen,
    /// Owned by the step interrupt.
    Executing,
    /// All steps issued; awaiting release.
    Completed,
}

/// What the step interrupt should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Another step is due before the next scheduled interrupt; call again.
    MoreDue,
    /// Nothing due yet; the next step falls at the given absolute clock.
    Waiting { next_due: u64 },
    /// The move has issued its last step.
    Finished,
}

#[derive(Debug, Clone)]
pub struct Dda {
    state: DdaState,
    // Absolute motor positions at the end of the move.
    end_point: [i32; DRIVES],
    // Cartesian end position in transformed machine coordinates, when known.
    end_coordinates: [f64; AXES],
    end_coords_valid: bool,
    delta_steps: [i32; DRIVES],
    total_steps: [u32; DRIVES],
    // Signed per-drive fraction of the total move distance.
    direction_vector: [f64; DRIVES],
    total_distance: f64,
    requested_speed: f64,
    start_speed: f64,
    top_speed: f64,
    end_speed: f64,
    acceleration: f64,
    accel_distance: f64,
    steady_distance: f64,
    decel_distance: f64,
    accel_time: f64,
    steady_time: f64,
    decel_time: f64,
    total_clocks: u64,
    start_time: u64,
    step_index: [u32; DRIVES],
    step_errors: u32,
    endstop_checks: u32,
    file_position: Option<u64>,
    can_pause_after: bool,
}

impl Default for Dda {
    fn default() -> Self {
        Self {
            state: DdaState::Empty,
            end_point: [0; DRIVES],
            end_coordinates: [0.0; AXES],
            end_coords_valid: false,
            delta_steps: [0; DRIVES],
            total_steps: [0; DRIVES],
            direction_vector: [0.0; DRIVES],
            total_distance: 0.0,
            requested_speed: 0.0,
            start_speed: 0.0,
            top_speed: 0.0,
            end_speed: 0.0,
            acceleration: 0.0,
            accel_distance: 0.0,
            steady_distance: 0.0,
            decel_distance: 0.0,
            accel_time: 0.0,
            steady_time: 0.0,
            decel_time: 0.0,
            total_clocks: 0,
            start_time: 0,
            step_index: [0; DRIVES],
            step_errors: 0,
            endstop_checks: 0,
            file_position: None,
            can_pause_after: false,
        }
    }
}

impl Dda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DdaState {
        self.state
    }

    pub fn requested_speed(&self) -> f64 {
        self.requested_speed
    }

    pub fn end_speed(&self) -> f64 {
        self.end_speed
    }

    pub fn top_speed(&self) -> f64 {
        self.top_speed
    }

    pub fn file_position(&self) -> Option<u64> {
        self.file_position
    }

    pub fn endstop_checks(&self) -> u32 {
        self.endstop_checks
    }

    pub fn end_point(&self) -> &[i32; DRIVES] {
        &self.end_point
    }

    pub fn drive_coordinate(&self, drive: usize) -> i32 {
        self.end_point[drive]
    }

    /// Overwrite one motor end point. Used for endstop hits and calibration
    /// corrections; the cached Cartesian endpoint is no longer trustworthy.
    pub fn set_drive_coordinate(&mut self, drive: usize, end_point: i32) {
        self.end_point[drive] = end_point;
        self.end_coords_valid = false;
    }

    pub fn end_coordinates_valid(&self) -> bool {
        self.end_coords_valid
    }

    pub fn end_coordinate(&self, axis: usize) -> f64 {
        self.end_coordinates[axis]
    }

    /// Cache a Cartesian endpoint computed outside the descriptor.
    pub fn cache_end_coordinates(&mut self, coords: [f64; AXES]) {
        self.end_coordinates = coords;
        self.end_coords_valid = true;
    }

    /// Anchor the ring: record absolute positions on a slot without queueing
    /// a move. The slot stays empty.
    pub fn set_positions(&mut self, end_point: [i32; DRIVES], coords: [f64; AXES]) {
        self.end_point = end_point;
        self.end_coordinates = coords;
        self.end_coords_valid = true;
    }

    pub fn set_feed_rate(&mut self, feed_rate: f64) {
        self.requested_speed = feed_rate;
    }

    pub fn step_errors(&self) -> u32 {
        self.step_errors
    }

    pub fn direction_vector(&self) -> &[f64; DRIVES] {
        &self.direction_vector
    }

    /// Step direction per drive: true for forwards.
    pub fn drive_direction(&self, drive: usize) -> bool {
        self.delta_steps[drive] >= 0
    }

    /// Exit speed tuning by look-ahead. Only meaningful while provisional.
    pub fn set_end_speed(&mut self, speed: f64) {
        debug_assert_eq!(self.state, DdaState::Provisional);
        self.end_speed = speed;
    }

    /// Fill in this descriptor from a move tuple. Returns false (and leaves
    /// the slot empty) when the move is a no-op after mapping.
    ///
    /// `prev` is the descriptor holding the current end position of the
    /// machine, normally the previous ring slot.
    pub fn initialize(
        &mut self,
        prev: &Dda,
        req: &MoveRequest,
        apply_motor_mapping: bool,
        kinematics: &Kinematics,
        platform: &dyn Platform,
    ) -> bool {
        debug_assert_eq!(self.state, DdaState::Empty);

        let axis_steps: [f64; AXES] = [
            platform.steps_per_unit(0),
            platform.steps_per_unit(1),
            platform.steps_per_unit(2),
        ];

        let mut end_point = [0i32; DRIVES];
        let target_xyz = [req.coords[0], req.coords[1], req.coords[2]];
        if apply_motor_mapping {
            let motor = kinematics.machine_to_motor(&target_xyz, &axis_steps);
            end_point[..AXES].copy_from_slice(&motor);
        } else {
            for axis in 0..AXES {
                end_point[axis] = motor_end_point(req.coords[axis], axis_steps[axis]);
            }
        }
        // Extruder amounts are relative.
        for drive in AXES..DRIVES {
            end_point[drive] = prev.end_point[drive]
                + motor_end_point(req.coords[drive], platform.steps_per_unit(drive));
        }

        let mut delta_steps = [0i32; DRIVES];
        let mut any_steps = false;
        for drive in 0..DRIVES {
            delta_steps[drive] = end_point[drive] - prev.end_point[drive];
            any_steps |= delta_steps[drive] != 0;
        }
        if !any_steps {
            return false;
        }

        // Distance basis: Cartesian axis deltas when the previous endpoint
        // is known in machine coordinates, per-drive motor distances
        // otherwise.
        let mut drive_mm = [0.0f64; DRIVES];
        if apply_motor_mapping && prev.end_coords_valid {
            for axis in 0..AXES {
                drive_mm[axis] = target_xyz[axis] - prev.end_coordinates[axis];
            }
        } else {
            for axis in 0..AXES {
                drive_mm[axis] = delta_steps[axis] as f64 / axis_steps[axis];
            }
        }
        for drive in AXES..DRIVES {
            drive_mm[drive] = req.coords[drive];
        }

        let axis_distance =
            (fsquare(drive_mm[0]) + fsquare(drive_mm[1]) + fsquare(drive_mm[2])).sqrt();
        let total_distance = if axis_distance > 0.0 {
            axis_distance
        } else {
            // Extruder-only move.
            drive_mm[AXES..]
                .iter()
                .fold(0.0f64, |acc, &amount| acc.max(amount.abs()))
        };
        if total_distance <= 0.0 {
            return false;
        }

        let mut direction_vector = [0.0f64; DRIVES];
        for drive in 0..DRIVES {
            direction_vector[drive] = drive_mm[drive] / total_distance;
        }

        let mut acceleration = f64::INFINITY;
        for drive in 0..DRIVES {
            if delta_steps[drive] != 0 {
                acceleration = acceleration.min(platform.acceleration(drive));
            }
        }

        self.end_point = end_point;
        self.end_coordinates = target_xyz;
        self.end_coords_valid = apply_motor_mapping;
        self.delta_steps = delta_steps;
        for drive in 0..DRIVES {
            self.total_steps[drive] = delta_steps[drive].unsigned_abs();
        }
        self.direction_vector = direction_vector;
        self.total_distance = total_distance;
        self.requested_speed = req.feed_rate.max(MINIMUM_MOVEMENT_SPEED);
        self.start_speed = 0.0;
        self.top_speed = 0.0;
        self.end_speed = 0.0;
        self.acceleration = acceleration;
        self.step_index = [0; DRIVES];
        self.step_errors = 0;
        self.endstop_checks = req.endstop_checks;
        self.file_position = req.file_position;
        self.can_pause_after = req.endstop_checks == 0;
        self.state = DdaState::Provisional;
        true
    }

    /// Finish trajectory shaping and freeze the descriptor. `entry_speed` is
    /// the predecessor's exit speed; `pause_speed` is the largest exit speed
    /// a mid-flight abort tolerates. Idempotent once frozen.
    pub fn prepare(&mut self, entry_speed: f64, pause_speed: f64) {
        if self.state != DdaState::Provisional {
            return;
        }

        let a = self.acceleration;
        let d = self.total_distance;
        self.start_speed = entry_speed.min(self.requested_speed);

        // The exit speed must be reachable from the entry speed within the
        // move.
        let max_exit = (fsquare(self.start_speed) + 2.0 * a * d).sqrt();
        self.end_speed = self.end_speed.min(self.requested_speed).min(max_exit);

        // Peak speed the distance allows with a full accelerate/decelerate
        // profile; the trapezoid degenerates to a triangle when the
        // requested speed is out of reach.
        let peak =
            ((2.0 * a * d + fsquare(self.start_speed) + fsquare(self.end_speed)) / 2.0).sqrt();
        self.top_speed = self
            .requested_speed
            .min(peak)
            .max(self.start_speed)
            .max(self.end_speed);

        self.accel_distance =
            (fsquare(self.top_speed) - fsquare(self.start_speed)) / (2.0 * a).max(f64::MIN_POSITIVE);
        self.decel_distance =
            (fsquare(self.top_speed) - fsquare(self.end_speed)) / (2.0 * a).max(f64::MIN_POSITIVE);
        self.steady_distance = (d - self.accel_distance - self.decel_distance).max(0.0);

        self.accel_time = (self.top_speed - self.start_speed) / a;
        self.steady_time = self.steady_distance / self.top_speed;
        self.decel_time = (self.top_speed - self.end_speed) / a;
        self.total_clocks = to_clocks(self.accel_time + self.steady_time + self.decel_time);

        self.can_pause_after = self.endstop_checks == 0 && self.end_speed <= pause_speed;
        self.state = DdaState::Frozen;
    }

    /// Whether aborting after this move cannot skip steps.
    pub fn can_pause(&self) -> bool {
        match self.state {
            DdaState::Provisional => self.endstop_checks == 0,
            DdaState::Frozen | DdaState::Executing => self.can_pause_after,
            _ => false,
        }
    }

    /// Duration of the move in seconds: exact once frozen, estimated from
    /// the requested speed while provisional.
    pub fn calc_time(&self) -> f64 {
        match self.state {
            DdaState::Frozen | DdaState::Executing | DdaState::Completed => {
                self.total_clocks as f64 / STEP_CLOCK_RATE as f64
            }
            _ => self.total_distance / self.requested_speed.max(MINIMUM_MOVEMENT_SPEED),
        }
    }

    /// Remaining execution time in step clocks.
    pub fn time_left(&self, now: u64) -> u64 {
        match self.state {
            DdaState::Frozen => self.total_clocks,
            DdaState::Executing => (self.start_time + self.total_clocks).saturating_sub(now),
            _ => 0,
        }
    }

    /// Hand the descriptor to the step interrupt. Must be called with the
    /// step interrupt masked. Returns whether to service the interrupt
    /// immediately.
    pub fn start(&mut self, start_time: u64) -> bool {
        debug_assert_eq!(self.state, DdaState::Frozen);
        self.state = DdaState::Executing;
        self.start_time = start_time;
        true
    }

    /// Issue due steps. Runs in interrupt context: no allocation, no
    /// platform calls, bounded work per invocation.
    pub fn step(&mut self, now: u64) -> StepOutcome {
        debug_assert_eq!(self.state, DdaState::Executing);

        let mut next_due = u64::MAX;
        for drive in 0..DRIVES {
            if self.step_index[drive] < self.total_steps[drive] {
                let t = self.next_step_clocks(drive);
                if t < next_due {
                    next_due = t;
                }
            }
        }

        if next_due == u64::MAX {
            self.state = DdaState::Completed;
            return StepOutcome::Finished;
        }

        let due_abs = self.start_time + next_due;
        if due_abs > now {
            return StepOutcome::Waiting { next_due: due_abs };
        }
        if now - due_abs > LATE_STEP_CLOCKS {
            self.step_errors += 1;
        }

        let mut remaining = false;
        for drive in 0..DRIVES {
            if self.step_index[drive] < self.total_steps[drive] {
                if self.next_step_clocks(drive) <= next_due {
                    self.step_index[drive] += 1;
                }
                remaining |= self.step_index[drive] < self.total_steps[drive];
            }
        }

        if remaining {
            StepOutcome::MoreDue
        } else {
            self.state = DdaState::Completed;
            StepOutcome::Finished
        }
    }

    /// Copy out the motor end points and, when it was cached at queue time,
    /// the Cartesian end position. Returns whether the Cartesian position is
    /// valid; if not, the caller must run the inverse transform outside the
    /// interrupt.
    pub fn fetch_end_position(
        &self,
        end_points: &mut [i32; DRIVES],
        coordinates: &mut [f64; AXES],
    ) -> bool {
        *end_points = self.end_point;
        if self.end_coords_valid {
            *coordinates = self.end_coordinates;
        }
        self.end_coords_valid
    }

    /// Return the slot to the ring. The end-point fields survive so the
    /// slot keeps anchoring the next move.
    pub fn release(&mut self) {
        self.state = DdaState::Empty;
    }

    // Time in clocks (relative to the move start) of this drive's next step.
    fn next_step_clocks(&self, drive: usize) -> u64 {
        let fraction = (self.step_index[drive] + 1) as f64 / self.total_steps[drive] as f64;
        to_clocks(self.time_for_distance(fraction * self.total_distance))
    }

    // Invert the trapezoidal distance profile.
    fn time_for_distance(&self, s: f64) -> f64 {
        let a = self.acceleration;
        if s <= self.accel_distance {
            ((fsquare(self.start_speed) + 2.0 * a * s).sqrt() - self.start_speed) / a
        } else if s < self.accel_distance + self.steady_distance {
            self.accel_time + (s - self.accel_distance) / self.top_speed
        } else {
            let remaining = (self.total_distance - s).max(0.0);
            let tail = ((fsquare(self.end_speed) + 2.0 * a * remaining).sqrt() - self.end_speed) / a;
            self.accel_time + self.steady_time + (self.decel_time - tail).max(0.0)
        }
    }
}

fn to_clocks(seconds: f64) -> u64 {
    (seconds * STEP_CLOCK_RATE as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::CoreMode;
    use crate::platform::{FixedPlatform, MoveKind};

    fn request(coords: [f64; DRIVES], feed: f64) -> MoveRequest {
        MoveRequest {
            coords,
            feed_rate: feed,
            endstop_checks: 0,
            kind: MoveKind::Normal,
            file_position: None,
        }
    }

    fn cartesian() -> Kinematics {
        Kinematics::new(CoreMode::Cartesian, Default::default())
    }

    fn initialized(coords: [f64; DRIVES], feed: f64) -> Dda {
        let platform = FixedPlatform::new();
        let mut prev = Dda::new();
        prev.set_positions([0; DRIVES], [0.0; AXES]);
        let mut dda = Dda::new();
        assert!(dda.initialize(&prev, &request(coords, feed), true, &cartesian(), &platform));
        dda
    }

    #[test]
    fn refuses_zero_length_move() {
        let platform = FixedPlatform::new();
        let mut prev = Dda::new();
        prev.set_positions([0; DRIVES], [0.0; AXES]);
        let mut dda = Dda::new();
        let accepted = dda.initialize(
            &prev,
            &request([0.0; DRIVES], 50.0),
            true,
            &cartesian(),
            &platform,
        );
        assert!(!accepted);
        assert_eq!(dda.state(), DdaState::Empty);
    }

    #[test]
    fn trapezoid_phases_cover_the_distance() {
        let mut dda = initialized([40.0, 0.0, 0.0, 0.0, 0.0], 100.0);
        dda.prepare(0.0, 15.0);
        assert_eq!(dda.state(), DdaState::Frozen);
        assert!((dda.top_speed() - 100.0).abs() < 1e-9);
        let covered = dda.accel_distance + dda.steady_distance + dda.decel_distance;
        assert!((covered - dda.total_distance).abs() < 1e-9);
        assert!(dda.calc_time() > 0.0);
    }

    #[test]
    fn short_move_degenerates_to_triangle() {
        let mut dda = initialized([1.0, 0.0, 0.0, 0.0, 0.0], 300.0);
        dda.prepare(0.0, 15.0);
        // 1 mm at 3000 mm/s^2 cannot reach 300 mm/s.
        assert!(dda.top_speed() < 300.0);
        assert!(dda.steady_distance < 1e-9);
    }

    #[test]
    fn prepare_is_idempotent_once_frozen() {
        let mut dda = initialized([10.0, 0.0, 0.0, 0.0, 0.0], 50.0);
        dda.prepare(0.0, 15.0);
        let clocks = dda.total_clocks;
        dda.prepare(40.0, 15.0);
        assert_eq!(dda.total_clocks, clocks);
    }

    #[test]
    fn steps_are_monotone_and_complete() {
        let mut dda = initialized([2.0, 1.0, 0.0, 0.0, 0.0], 60.0);
        dda.prepare(0.0, 15.0);
        assert!(dda.start(0));

        let mut now = 0u64;
        let mut last_due = 0u64;
        let mut events = 0u32;
        loop {
            match dda.step(now) {
                StepOutcome::MoreDue => {}
                StepOutcome::Waiting { next_due } => {
                    assert!(next_due >= last_due, "step times must be monotone");
                    last_due = next_due;
                    now = next_due;
                }
                StepOutcome::Finished => break,
            }
            events += 1;
            assert!(events < 10_000, "move failed to complete");
        }
        assert_eq!(dda.state(), DdaState::Completed);
        // 2 mm and 1 mm at 80 steps/mm.
        assert_eq!(dda.step_index[0], 160);
        assert_eq!(dda.step_index[1], 80);
    }

    #[test]
    fn pause_safety_follows_end_speed() {
        let mut fast = initialized([20.0, 0.0, 0.0, 0.0, 0.0], 100.0);
        fast.set_end_speed(100.0);
        fast.prepare(0.0, 15.0);
        assert!(!fast.can_pause());

        let mut slow = initialized([20.0, 0.0, 0.0, 0.0, 0.0], 100.0);
        slow.prepare(0.0, 15.0);
        assert!(slow.can_pause());
    }

    #[test]
    fn endstop_moves_are_never_pause_safe() {
        let platform = FixedPlatform::new();
        let mut prev = Dda::new();
        prev.set_positions([0; DRIVES], [0.0; AXES]);
        let mut dda = Dda::new();
        let mut req = request([5.0, 0.0, 0.0, 0.0, 0.0], 20.0);
        req.endstop_checks = 0b1;
        assert!(dda.initialize(&prev, &req, true, &cartesian(), &platform));
        assert!(!dda.can_pause());
        dda.prepare(0.0, 15.0);
        assert!(!dda.can_pause());
    }

    #[test]
    fn fetch_end_position_reports_validity() {
        let mut dda = initialized([3.0, 4.0, 0.0, 0.0, 0.0], 50.0);
        let mut ep = [0; DRIVES];
        let mut coords = [0.0; AXES];
        assert!(dda.fetch_end_position(&mut ep, &mut coords));
        assert_eq!(ep[0], 240);
        assert_eq!(ep[1], 320);
        assert!((coords[0] - 3.0).abs() < 1e-12);

        // A motor-space correction invalidates the cached endpoint.
        dda.set_drive_coordinate(0, 200);
        assert!(!dda.fetch_end_position(&mut ep, &mut coords));
    }

    #[test]
    fn extruder_only_move_uses_extrusion_distance() {
        let platform = FixedPlatform::new();
        let mut prev = Dda::new();
        prev.set_positions([0; DRIVES], [0.0; AXES]);
        let mut dda = Dda::new();
        let accepted = dda.initialize(
            &prev,
            &request([0.0, 0.0, 0.0, 2.5, 0.0], 5.0),
            true,
            &cartesian(),
            &platform,
        );
        assert!(accepted);
        assert!((dda.total_distance - 2.5).abs() < 1e-12);
        assert_eq!(dda.end_point()[3], 1050);
    }

    #[test]
    fn extrusion_accumulates_across_moves() {
        let platform = FixedPlatform::new();
        let mut prev = Dda::new();
        prev.set_positions([0; DRIVES], [0.0; AXES]);

        let mut first = Dda::new();
        assert!(first.initialize(
            &prev,
            &request([1.0, 0.0, 0.0, 1.0, 0.0], 30.0),
            true,
            &cartesian(),
            &platform
        ));
        let mut second = Dda::new();
        assert!(second.initialize(
            &first,
            &request([2.0, 0.0, 0.0, 1.0, 0.0], 30.0),
            true,
            &cartesian(),
            &platform
        ));
        assert_eq!(second.end_point()[3], 840);
    }
}
