//! The move ring and the planner that feeds it.
//!
//! A fixed ring of DDA slots with two cursors: `add`, where the next move
//! tuple lands, and `get`, the oldest not-yet-released descriptor. The
//! planner runs from the cooperative tick ([`MoveQueue::spin`]); the step
//! interrupt consumes descriptors through [`MoveQueue::interrupt`]. The
//! descriptor at `current` is interrupt-owned; everything else belongs to
//! the planner.

use thiserror::Error;

use crate::bed::{AxisShear, BedCompensation, BedError};
use crate::calibration::{self, Adjustment, CalibrationError, ProbePoint};
use crate::dda::{Dda, DdaState, StepOutcome, DDA_RING_LENGTH};
use crate::kinematics::{motor_end_point, Kinematics};
use crate::platform::{MoveKind, MoveProvider, Platform, DEFAULT_IDLE_TIMEOUT, STEP_CLOCK_RATE};
use crate::{AXES, DRIVES, Z_AXIS};

// Look-ahead admission bounds, in seconds. Only accept a new move while the
// unprepared queue is short enough for speed and extrusion edits to take
// effect promptly.
const MAX_UNPREPARED_TIME: f64 = 0.5;
const MAX_QUEUED_TIME: f64 = 2.0;

// Ticks without an accepted move before dispatching, so look-ahead has a few
// moves to work with.
const DISPATCH_IDLE_COUNT: u32 = 10;

// Prepare moves one eighth of a second ahead of when they will be needed.
const PREPARE_HORIZON_CLOCKS: u64 = (STEP_CLOCK_RATE / 8) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Idle,
    Busy,
    Timing,
}

#[derive(Debug, Error)]
pub enum ProbingError {
    #[error("bed calibration error: {requested} points requested but only {provided} provided")]
    PointCountMismatch { requested: usize, provided: usize },

    #[error(transparent)]
    Bed(#[from] BedError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

pub struct MoveQueue {
    slots: [Dda; DDA_RING_LENGTH],
    add: usize,
    get: usize,
    /// Interrupt-owned descriptor index; `None` when no move executes.
    current: Option<usize>,
    live_end_points: [i32; DRIVES],
    live_coordinates: [f64; DRIVES],
    live_coordinates_valid: bool,
    kinematics: Kinematics,
    bed: BedCompensation,
    shear: AxisShear,
    current_feedrate: f64,
    idle_state: IdleState,
    idle_count: u32,
    idle_timeout: f64,
    last_move_time: f64,
    add_no_more_moves: bool,
    simulating: bool,
    simulation_time: f64,
    max_isr_loops: u32,
}

impl MoveQueue {
    pub fn new(kinematics: Kinematics, platform: &mut dyn Platform) -> Self {
        let mut queue = Self {
            slots: std::array::from_fn(|_| Dda::new()),
            add: 0,
            get: 0,
            current: None,
            live_end_points: [0; DRIVES],
            live_coordinates: [0.0; DRIVES],
            live_coordinates_valid: false,
            kinematics,
            bed: BedCompensation::new(platform.axis_maximum(0), platform.axis_maximum(1)),
            shear: AxisShear::new(),
            current_feedrate: 0.0,
            idle_state: IdleState::Idle,
            idle_count: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_move_time: platform.time(),
            add_no_more_moves: false,
            simulating: false,
            simulation_time: 0.0,
            max_isr_loops: 0,
        };

        let origin = [0.0; DRIVES];
        for drive in 0..DRIVES {
            platform.set_direction(drive, true);
        }
        queue.set_live_coordinates(&origin, platform);
        queue.set_positions(&origin, platform);
        queue.current_feedrate = platform.home_feed_rate(platform.slowest_drive());
        queue
    }

    fn next(idx: usize) -> usize {
        (idx + 1) % DDA_RING_LENGTH
    }

    fn prev(idx: usize) -> usize {
        (idx + DDA_RING_LENGTH - 1) % DDA_RING_LENGTH
    }

    pub fn ring_empty(&self) -> bool {
        self.get == self.add && self.slots[self.add].state() == DdaState::Empty
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    pub fn bed(&self) -> &BedCompensation {
        &self.bed
    }

    pub fn bed_mut(&mut self) -> &mut BedCompensation {
        &mut self.bed
    }

    pub fn shear(&self) -> &AxisShear {
        &self.shear
    }

    pub fn shear_mut(&mut self) -> &mut AxisShear {
        &mut self.shear
    }

    pub fn geometry_name(&self) -> &'static str {
        self.kinematics.geometry_name()
    }

    pub fn current_feedrate(&self) -> f64 {
        self.current_feedrate
    }

    pub fn idle_state(&self) -> IdleState {
        self.idle_state
    }

    pub fn set_idle_timeout(&mut self, seconds: f64) {
        self.idle_timeout = seconds;
    }

    /// Stop accepting moves from the front-end, e.g. while a pause is in
    /// progress.
    pub fn set_no_more_moves(&mut self, no_more: bool) {
        self.add_no_more_moves = no_more;
    }

    pub fn simulate(&mut self, simulating: bool) {
        self.simulating = simulating;
        if simulating {
            self.simulation_time = 0.0;
        }
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    pub fn simulation_time(&self) -> f64 {
        self.simulation_time
    }

    /// Apply axis skew then bed compensation.
    pub fn transform(&self, xyz: &mut [f64; AXES]) {
        self.shear.apply(xyz);
        self.bed.apply(xyz);
    }

    /// Undo bed compensation then axis skew.
    pub fn inverse_transform(&self, xyz: &mut [f64; AXES]) {
        self.bed.invert(xyz);
        self.shear.invert(xyz);
    }

    fn end_point_to_machine(&self, coords: &[f64; DRIVES], platform: &dyn Platform) -> [i32; DRIVES] {
        let axis_steps = [
            platform.steps_per_unit(0),
            platform.steps_per_unit(1),
            platform.steps_per_unit(2),
        ];
        let motor = self
            .kinematics
            .machine_to_motor(&[coords[0], coords[1], coords[2]], &axis_steps);
        let mut end_points = [0; DRIVES];
        end_points[..AXES].copy_from_slice(&motor);
        for drive in AXES..DRIVES {
            end_points[drive] = motor_end_point(coords[drive], platform.steps_per_unit(drive));
        }
        end_points
    }

    // Smallest per-drive speed change tolerance: the exit speed bound for a
    // pause-safe move.
    fn pause_speed(platform: &dyn Platform) -> f64 {
        (0..DRIVES).fold(f64::INFINITY, |acc, drive| acc.min(platform.instant_dv(drive)))
    }

    /// One planner tick: accept a move if timing admits it, dispatch and
    /// prepare work for the interrupt, and run the idle-hold state machine.
    pub fn spin(&mut self, platform: &mut dyn Platform, gcodes: &mut dyn MoveProvider) {
        if self.idle_count < 1000 {
            self.idle_count += 1;
        }

        // See if we can add another move to the ring.
        if !self.add_no_more_moves && self.slots[self.add].state() == DdaState::Empty {
            // In order to react faster to speed and extrusion rate changes,
            // only add more moves if the total duration of all un-frozen
            // moves is less than 2 seconds, or the total duration of all but
            // the oldest un-frozen move is less than 0.5 seconds.
            let mut unprepared_time = 0.0;
            let mut prev_move_time = 0.0;
            let mut idx = self.add;
            loop {
                idx = Self::prev(idx);
                if self.slots[idx].state() != DdaState::Provisional || idx == self.add {
                    break;
                }
                unprepared_time += prev_move_time;
                prev_move_time = self.slots[idx].calc_time();
            }

            if unprepared_time < MAX_UNPREPARED_TIME
                || unprepared_time + prev_move_time < MAX_QUEUED_TIME
            {
                if let Some(mut req) = gcodes.read_move() {
                    self.current_feedrate = req.feed_rate;
                    let do_motor_mapping = match req.kind {
                        MoveKind::Normal => true,
                        MoveKind::RawAxes => !self.kinematics.is_delta_mode(),
                        MoveKind::MotorSpace => false,
                    };
                    if req.kind == MoveKind::Normal {
                        let mut xyz = [req.coords[0], req.coords[1], req.coords[2]];
                        self.transform(&mut xyz);
                        req.coords[..AXES].copy_from_slice(&xyz);
                    }

                    let prev_idx = Self::prev(self.add);
                    let prev_dda = self.slots[prev_idx].clone();
                    let add = self.add;
                    if self.slots[add].initialize(
                        &prev_dda,
                        &req,
                        do_motor_mapping,
                        &self.kinematics,
                        platform,
                    ) {
                        self.adjust_junction(prev_idx, add);
                        self.add = Self::next(add);
                        self.idle_count = 0;
                    }
                }
            }
        }

        if self.simulating {
            if self.idle_count > DISPATCH_IDLE_COUNT && !self.ring_empty() {
                // No move added this tick, so pretend to execute one already
                // in the queue.
                let get = self.get;
                self.simulation_time += self.slots[get].calc_time();
                let mut coords = [0.0; AXES];
                self.live_coordinates_valid =
                    self.slots[get].fetch_end_position(&mut self.live_end_points, &mut coords);
                if self.live_coordinates_valid {
                    self.live_coordinates[..AXES].copy_from_slice(&coords);
                }
                for drive in AXES..DRIVES {
                    self.live_coordinates[drive] =
                        self.live_end_points[drive] as f64 / platform.steps_per_unit(drive);
                }
                self.slots[get].release();
                self.get = Self::next(get);
            }
            return;
        }

        match self.current {
            None => {
                // No move executing; start one if the queue has had time to
                // fill, otherwise run the idle-hold timer.
                if self.idle_count > DISPATCH_IDLE_COUNT {
                    let get = self.get;
                    if self.slots[get].state() == DdaState::Provisional {
                        self.prepare_dda(get, platform);
                    }
                    if self.slots[get].state() == DdaState::Frozen {
                        // The step interrupt must be masked from here until
                        // the move has started.
                        let now = platform.interrupt_clocks();
                        if self.start_next_move(platform, now) {
                            self.interrupt(platform);
                        }
                        self.idle_state = IdleState::Busy;
                    } else if self.idle_state == IdleState::Busy
                        && !gcodes.is_paused()
                        && self.idle_timeout > 0.0
                    {
                        self.last_move_time = platform.time();
                        self.idle_state = IdleState::Timing;
                    } else if self.idle_state == IdleState::Timing
                        && platform.time() - self.last_move_time >= self.idle_timeout
                    {
                        for drive in 0..DRIVES {
                            platform.set_drive_idle(drive);
                        }
                        self.idle_state = IdleState::Idle;
                    }
                }
            }
            Some(current) => {
                // Walk the prepared tail of the queue, then freeze further
                // provisional moves until the prepared time covers the
                // horizon.
                let now = platform.interrupt_clocks();
                let mut prepared_clocks = 0u64;
                let mut idx = current;
                loop {
                    match self.slots[idx].state() {
                        DdaState::Completed | DdaState::Executing | DdaState::Frozen => {
                            prepared_clocks += self.slots[idx].time_left(now);
                            idx = Self::next(idx);
                        }
                        _ => break,
                    }
                    if idx == current {
                        return;
                    }
                }
                while self.slots[idx].state() == DdaState::Provisional
                    && prepared_clocks < PREPARE_HORIZON_CLOCKS
                {
                    self.prepare_dda(idx, platform);
                    prepared_clocks += self.slots[idx].time_left(now);
                    idx = Self::next(idx);
                }
            }
        }
    }

    // Raise the predecessor's exit speed now that we know where the next
    // move goes. Junctions that reverse direction keep a standing start.
    fn adjust_junction(&mut self, prev_idx: usize, new_idx: usize) {
        if self.slots[prev_idx].state() != DdaState::Provisional {
            return;
        }
        let cos = self.slots[prev_idx]
            .direction_vector()
            .iter()
            .zip(self.slots[new_idx].direction_vector())
            .map(|(a, b)| a * b)
            .sum::<f64>();
        if cos <= 0.0 {
            return;
        }
        let target = self.slots[prev_idx]
            .requested_speed()
            .min(self.slots[new_idx].requested_speed())
            * cos.min(1.0);
        if target > self.slots[prev_idx].end_speed() {
            self.slots[prev_idx].set_end_speed(target);
        }
    }

    fn prepare_dda(&mut self, idx: usize, platform: &dyn Platform) {
        let prev_idx = Self::prev(idx);
        let entry_speed = match self.slots[prev_idx].state() {
            DdaState::Provisional => 0.0,
            _ => self.slots[prev_idx].end_speed(),
        };
        self.slots[idx].prepare(entry_speed, Self::pause_speed(platform));
    }

    /// Start the next move if one is frozen at the get cursor. Must be
    /// called with the step interrupt masked. Returns whether the interrupt
    /// should be serviced immediately.
    fn start_next_move(&mut self, platform: &mut dyn Platform, start_time: u64) -> bool {
        let get = self.get;
        if self.slots[get].state() != DdaState::Frozen {
            return false;
        }
        for drive in 0..DRIVES {
            platform.set_direction(drive, self.slots[get].drive_direction(drive));
        }
        self.current = Some(get);
        self.slots[get].start(start_time)
    }

    /// The step interrupt body: issue every due step, chaining into the next
    /// frozen move on completion.
    pub fn interrupt(&mut self, platform: &mut dyn Platform) {
        let mut reps = 0u32;
        while let Some(current) = self.current {
            match self.slots[current].step(platform.interrupt_clocks()) {
                StepOutcome::MoreDue => {
                    reps += 1;
                }
                StepOutcome::Waiting { .. } => break,
                StepOutcome::Finished => {
                    self.current_move_completed(platform);
                    let now = platform.interrupt_clocks();
                    if !self.start_next_move(platform, now) {
                        break;
                    }
                }
            }
        }
        if reps > self.max_isr_loops {
            self.max_isr_loops = reps;
        }
    }

    // Called when the current move has issued its last step: save the live
    // position, release the descriptor, and advance the get cursor.
    fn current_move_completed(&mut self, platform: &dyn Platform) {
        let current = match self.current {
            Some(idx) => idx,
            None => return,
        };
        let mut coords = [0.0; AXES];
        self.live_coordinates_valid =
            self.slots[current].fetch_end_position(&mut self.live_end_points, &mut coords);
        if self.live_coordinates_valid {
            self.live_coordinates[..AXES].copy_from_slice(&coords);
        }
        for drive in AXES..DRIVES {
            self.live_coordinates[drive] =
                self.live_end_points[drive] as f64 / platform.steps_per_unit(drive);
        }
        self.slots[current].release();
        self.current = None;
        self.get = Self::next(self.get);
    }

    /// Pause as soon as safely possible. Returns the file position of the
    /// first skipped move, or `None` if nothing was skipped. When moves were
    /// skipped, `positions` receives the axis end coordinates and requested
    /// feed rate of the last move that will still execute.
    pub fn pause(
        &mut self,
        positions: &mut [f64; DRIVES + 1],
        platform: &dyn Platform,
    ) -> Option<u64> {
        let saved_add = self.add;

        // The truncation must be atomic with respect to the interrupt.
        let mut last_kept: Option<usize> = None;
        match self.current {
            Some(current) => {
                if self.slots[current].can_pause() {
                    self.add = Self::next(current);
                    last_kept = Some(current);
                } else {
                    // The executing move ends too fast to stop after;
                    // search onwards for the first pause-safe move.
                    let mut idx = self.get;
                    while idx != saved_add {
                        if self.slots[idx].can_pause() {
                            self.add = Self::next(idx);
                            last_kept = Some(idx);
                            break;
                        }
                        idx = Self::next(idx);
                    }
                }
            }
            None => {
                self.add = self.get;
            }
        }

        if self.add == saved_add {
            // Nothing skipped.
            self.get_current_user_position(positions, MoveKind::Normal, platform);
            return None;
        }

        if let Some(kept) = last_kept {
            for axis in 0..AXES {
                positions[axis] = self.end_coordinate(kept, axis, false, platform);
            }
            positions[DRIVES] = self.slots[kept].requested_speed();
            // The kept move is now the last in the queue; it must come to a
            // standstill.
            if self.slots[kept].state() == DdaState::Provisional {
                self.slots[kept].set_end_speed(0.0);
            }
        } else {
            let mut machine = [0.0; DRIVES + 1];
            self.get_current_machine_position(&mut machine, false, platform);
            positions[..AXES].copy_from_slice(&machine[..AXES]);
            positions[DRIVES] = self.current_feedrate;
        }

        let mut file_position = None;
        let mut idx = self.add;
        while idx != saved_add {
            if file_position.is_none() {
                file_position = self.slots[idx].file_position();
            }
            self.slots[idx].release();
            idx = Self::next(idx);
        }
        file_position
    }

    /// Set the machine position directly. Refused while moves are queued.
    pub fn set_positions(&mut self, coords: &[f64; DRIVES], platform: &dyn Platform) {
        if !self.ring_empty() {
            tracing::error!("set_positions called when the DDA ring is not empty");
            return;
        }
        let end_points = self.end_point_to_machine(coords, platform);
        let anchor = Self::prev(self.add);
        self.slots[anchor].set_positions(end_points, [coords[0], coords[1], coords[2]]);
    }

    /// Change the feed rate carried into the next move. Refused while moves
    /// are queued.
    pub fn set_feedrate(&mut self, feed_rate: f64) {
        if !self.ring_empty() {
            tracing::error!("set_feedrate called when the DDA ring is not empty");
            return;
        }
        self.current_feedrate = feed_rate;
        let anchor = Self::prev(self.add);
        self.slots[anchor].set_feed_rate(feed_rate);
    }

    // Axis end coordinate of a queued descriptor, running the inverse
    // transform (and caching the result) when it was not recorded at queue
    // time. Never called from the interrupt.
    fn end_coordinate(
        &mut self,
        idx: usize,
        axis: usize,
        disable_motor_mapping: bool,
        platform: &dyn Platform,
    ) -> f64 {
        if disable_motor_mapping {
            return self.slots[idx].drive_coordinate(axis) as f64 / platform.steps_per_unit(axis);
        }
        if !self.slots[idx].end_coordinates_valid() {
            let motor = [
                self.slots[idx].drive_coordinate(0),
                self.slots[idx].drive_coordinate(1),
                self.slots[idx].drive_coordinate(2),
            ];
            let axis_steps = [
                platform.steps_per_unit(0),
                platform.steps_per_unit(1),
                platform.steps_per_unit(2),
            ];
            let coords = self.kinematics.motor_to_machine(&motor, &axis_steps);
            self.slots[idx].cache_end_coordinates(coords);
        }
        self.slots[idx].end_coordinate(axis)
    }

    /// The untransformed machine position after the last queued move.
    pub fn get_current_machine_position(
        &mut self,
        m: &mut [f64; DRIVES + 1],
        disable_motor_mapping: bool,
        platform: &dyn Platform,
    ) {
        let last_queued = Self::prev(self.add);
        for drive in 0..DRIVES {
            m[drive] = if drive < AXES {
                self.end_coordinate(last_queued, drive, disable_motor_mapping, platform)
            } else {
                0.0
            };
        }
        m[DRIVES] = self.current_feedrate;
    }

    /// The user-space position after the last queued move, honouring the
    /// transform rules of the given move kind.
    pub fn get_current_user_position(
        &mut self,
        m: &mut [f64; DRIVES + 1],
        kind: MoveKind,
        platform: &dyn Platform,
    ) {
        let disable = kind == MoveKind::MotorSpace
            || (kind == MoveKind::RawAxes && self.kinematics.is_delta_mode());
        self.get_current_machine_position(m, disable, platform);
        if kind == MoveKind::Normal {
            let mut xyz = [m[0], m[1], m[2]];
            self.inverse_transform(&mut xyz);
            m[..AXES].copy_from_slice(&xyz);
        }
    }

    /// The live position, including any move in flight. The snapshot is
    /// copied coherently; delta inverse transforms run outside the critical
    /// window and are cached back only if the interrupt did not advance in
    /// the meantime.
    pub fn live_coordinates(&mut self, m: &mut [f64; DRIVES], platform: &dyn Platform) {
        if self.live_coordinates_valid {
            // All coordinates are valid, so copy them across.
            m.copy_from_slice(&self.live_coordinates);
        } else {
            // Only the extruder coordinates are valid; convert the motor
            // endpoints with the interrupt unmasked, it is slow on a delta.
            m[AXES..].copy_from_slice(&self.live_coordinates[AXES..]);
            let sampled = [
                self.live_end_points[0],
                self.live_end_points[1],
                self.live_end_points[2],
            ];
            let axis_steps = [
                platform.steps_per_unit(0),
                platform.steps_per_unit(1),
                platform.steps_per_unit(2),
            ];
            let coords = self.kinematics.motor_to_machine(&sampled, &axis_steps);
            m[..AXES].copy_from_slice(&coords);

            // If the interrupt has not updated the endpoints, store the
            // result so we do not convert again.
            if sampled
                == [
                    self.live_end_points[0],
                    self.live_end_points[1],
                    self.live_end_points[2],
                ]
            {
                self.live_coordinates[..AXES].copy_from_slice(&coords);
                self.live_coordinates_valid = true;
            }
        }
        let mut xyz = [m[0], m[1], m[2]];
        self.inverse_transform(&mut xyz);
        m[..AXES].copy_from_slice(&xyz);
    }

    /// Overwrite the live position. Not callable from the interrupt.
    pub fn set_live_coordinates(&mut self, coords: &[f64; DRIVES], platform: &dyn Platform) {
        self.live_coordinates.copy_from_slice(coords);
        self.live_coordinates_valid = true;
        let end_points = self.end_point_to_machine(coords, platform);
        self.live_end_points[..AXES].copy_from_slice(&end_points[..AXES]);
    }

    /// A low endstop was hit during the current move.
    pub fn hit_low_stop(
        &mut self,
        drive: usize,
        platform: &dyn Platform,
        gcodes: &mut dyn MoveProvider,
    ) {
        if drive < AXES && !self.kinematics.is_delta_mode() {
            let hit_point = if drive == Z_AXIS {
                // A Z homing move on a Cartesian machine stops at the probe
                // trigger height.
                platform.z_probe_stop_height()
            } else {
                platform.axis_minimum(drive)
            };
            let coord = motor_end_point(hit_point, platform.steps_per_unit(drive));
            if let Some(current) = self.current {
                self.slots[current].set_drive_coordinate(drive, coord);
            }
            gcodes.set_axis_is_homed(drive);
        }
    }

    /// A high endstop was hit during the current move.
    pub fn hit_high_stop(
        &mut self,
        drive: usize,
        platform: &dyn Platform,
        gcodes: &mut dyn MoveProvider,
    ) {
        if drive < AXES {
            let position = if self.kinematics.is_delta_mode() {
                // On a delta the carriage is at the homed height for this
                // tower.
                self.kinematics.delta.homed_carriage_height(drive)
            } else {
                platform.axis_maximum(drive)
            };
            let coord = motor_end_point(position, platform.steps_per_unit(drive));
            if let Some(current) = self.current {
                self.slots[current].set_drive_coordinate(drive, coord);
            }
            gcodes.set_axis_is_homed(drive);
        }
    }

    /// Act on the probe results: report, fit the bed equation, or run delta
    /// auto-calibration. `s_param` is the requested point count; zero means
    /// "all probed points", negative just reports the heights.
    pub fn finished_bed_probing(
        &mut self,
        s_param: i32,
        platform: &dyn Platform,
    ) -> Result<String, ProbingError> {
        if s_param < 0 {
            let mut reply = String::from("Bed probe heights:");
            for i in 0..self.bed.number_of_points() {
                reply.push_str(&format!(" {:.2}", self.bed.z_probe_point(i)));
            }
            return Ok(reply);
        }

        let requested = s_param as usize;
        let provided = self.bed.number_of_points();
        if provided < requested {
            return Err(ProbingError::PointCountMismatch { requested, provided });
        }

        let num_points = if requested == 0 { provided } else { requested };
        if self.kinematics.is_delta_mode() {
            self.do_delta_calibration(num_points, platform)
        } else {
            Ok(self.bed.set_probed_bed_equation(num_points)?)
        }
    }

    /// Least-squares delta calibration from the probe point table.
    pub fn do_delta_calibration(
        &mut self,
        num_points: usize,
        platform: &dyn Platform,
    ) -> Result<String, ProbingError> {
        let mut points = Vec::with_capacity(num_points);
        for i in 0..num_points.min(self.bed.number_of_points()) {
            points.push(ProbePoint {
                x: self.bed.x_probe_point(i),
                y: self.bed.y_probe_point(i),
                z: self.bed.z_probe_point(i),
            });
        }

        let adjustment = calibration::solve(&self.kinematics.delta, &points)?;
        self.adjust_delta_parameters(&adjustment, platform);
        Ok(self.kinematics.delta.print_parameters(true))
    }

    /// Apply a calibration adjustment and correct the queued end
    /// coordinates for the change in homed carriage heights.
    pub fn adjust_delta_parameters(&mut self, adjustment: &Adjustment, platform: &dyn Platform) {
        let old_heights: [f64; AXES] =
            std::array::from_fn(|axis| self.kinematics.delta.homed_carriage_height(axis));

        calibration::apply(&mut self.kinematics.delta, adjustment);

        let last_queued = Self::prev(self.add);
        for drive in 0..AXES {
            let height_adjust =
                self.kinematics.delta.homed_carriage_height(drive) - old_heights[drive];
            let end_point = self.slots[last_queued].drive_coordinate(drive)
                + (height_adjust * platform.steps_per_unit(drive)) as i32;
            self.slots[last_queued].set_drive_coordinate(drive, end_point);
            self.live_end_points[drive] = end_point;
        }
        // Force the live Cartesian position to be recalculated.
        self.live_coordinates_valid = false;
    }

    /// Diagnostic report; resets the high-water counters.
    pub fn diagnostics(&mut self) -> String {
        let step_errors: u32 = self.slots.iter().map(|dda| dda.step_errors()).sum();
        let reply = format!(
            "Move diagnostics: max interrupt loops {}, step errors {}",
            self.max_isr_loops, step_errors
        );
        self.max_isr_loops = 0;
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaParameters;
    use crate::kinematics::CoreMode;
    use crate::platform::{FixedPlatform, MoveRequest};
    use std::collections::VecDeque;

    struct ScriptedMoves {
        moves: VecDeque<MoveRequest>,
        paused: bool,
        homed: [bool; AXES],
    }

    impl ScriptedMoves {
        fn new() -> Self {
            Self {
                moves: VecDeque::new(),
                paused: false,
                homed: [false; AXES],
            }
        }

        fn push(&mut self, coords: [f64; DRIVES], feed: f64, file_position: u64) {
            self.moves.push_back(MoveRequest {
                coords,
                feed_rate: feed,
                endstop_checks: 0,
                kind: MoveKind::Normal,
                file_position: Some(file_position),
            });
        }
    }

    impl MoveProvider for ScriptedMoves {
        fn read_move(&mut self) -> Option<MoveRequest> {
            self.moves.pop_front()
        }

        fn set_axis_is_homed(&mut self, axis: usize) {
            self.homed[axis] = true;
        }

        fn is_paused(&self) -> bool {
            self.paused
        }
    }

    fn cartesian_queue() -> (MoveQueue, FixedPlatform) {
        let mut platform = FixedPlatform::new();
        let kin = Kinematics::new(CoreMode::Cartesian, DeltaParameters::new());
        let queue = MoveQueue::new(kin, &mut platform);
        (queue, platform)
    }

    fn x_move(x: f64, feed: f64, pos: u64) -> ([f64; DRIVES], f64, u64) {
        ([x, 0.0, 0.0, 0.0, 0.0], feed, pos)
    }

    // Tick the planner and interrupt together until the queue drains.
    fn run_to_completion(
        queue: &mut MoveQueue,
        platform: &mut FixedPlatform,
        gcodes: &mut ScriptedMoves,
    ) {
        for _ in 0..100_000 {
            queue.spin(platform, gcodes);
            platform.advance(0.001);
            queue.interrupt(platform);
            if queue.ring_empty() && queue.current_index().is_none() && gcodes.moves.is_empty() {
                return;
            }
        }
        panic!("queue failed to drain");
    }

    fn assert_ring_invariants(queue: &MoveQueue) {
        let executing = queue
            .slots
            .iter()
            .filter(|dda| dda.state() == DdaState::Executing)
            .count();
        assert!(executing <= 1, "at most one descriptor may be executing");
        if let Some(current) = queue.current {
            assert_eq!(current, queue.get, "the interrupt owns the get cursor");
            assert!(matches!(
                queue.slots[current].state(),
                DdaState::Frozen | DdaState::Executing
            ));
        } else {
            assert_eq!(executing, 0);
        }
        // Between add and get (exclusive of queued range), slots are empty.
        let mut idx = queue.add;
        while idx != queue.get {
            assert_eq!(queue.slots[idx].state(), DdaState::Empty);
            idx = MoveQueue::next(idx);
        }
    }

    #[test]
    fn accepts_and_executes_moves() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        for i in 0..3 {
            let (coords, feed, pos) = x_move((i + 1) as f64, 20.0, i);
            gcodes.push(coords, feed, pos);
        }

        run_to_completion(&mut queue, &mut platform, &mut gcodes);
        assert_ring_invariants(&queue);

        let mut live = [0.0; DRIVES];
        queue.live_coordinates(&mut live, &platform);
        assert!((live[0] - 3.0).abs() < 0.02, "live X was {}", live[0]);
    }

    #[test]
    fn admission_policy_bounds_queued_time() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        // Three long moves: 20 mm at 10 mm/s is 2 s each.
        for i in 0..3 {
            let (coords, feed, pos) = x_move(20.0 * (i + 1) as f64, 10.0, i);
            gcodes.push(coords, feed, pos);
        }

        // Spin a few times without letting the dispatcher start anything.
        for _ in 0..5 {
            queue.spin(&mut platform, &mut gcodes);
        }
        // The first move was accepted; the second too (unprepared time of
        // everything but the oldest is still zero); the third must wait.
        assert_eq!(gcodes.moves.len(), 1);
        assert_ring_invariants(&queue);
    }

    #[test]
    fn pause_mid_move_skips_remaining_moves() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        for i in 0..6 {
            let (coords, feed, pos) = x_move((i + 1) as f64, 10.0, 100 + i);
            gcodes.push(coords, feed, pos);
        }

        // Accept all six, then let the dispatcher start the first.
        while queue.current_index().is_none() {
            queue.spin(&mut platform, &mut gcodes);
            platform.advance(0.0001);
        }
        assert!(gcodes.moves.is_empty());
        assert_ring_invariants(&queue);

        let current = queue.current_index().unwrap();
        let mut positions = [0.0; DRIVES + 1];
        let file_position = queue.pause(&mut positions, &platform);

        // The move after the executing one is the first skipped.
        assert_eq!(file_position, Some(101));
        assert_eq!(queue.add, MoveQueue::next(current));
        // Exactly the five moves after the current one were released.
        let mut released = 0;
        let mut idx = queue.add;
        for _ in 0..5 {
            assert_eq!(queue.slots[idx].state(), DdaState::Empty);
            released += 1;
            idx = MoveQueue::next(idx);
        }
        assert_eq!(released, 5);

        // Positions reflect the end of the move still executing.
        assert!((positions[0] - 1.0).abs() < 1e-9);
        assert!((positions[DRIVES] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn pause_with_empty_queue_reports_nothing_skipped() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        queue.spin(&mut platform, &mut gcodes);

        let mut positions = [0.0; DRIVES + 1];
        assert_eq!(queue.pause(&mut positions, &platform), None);
        assert!(positions[0].abs() < 1e-9);
    }

    #[test]
    fn simulation_advances_virtual_clock_only() {
        let (mut queue, mut platform) = cartesian_queue();
        queue.simulate(true);
        let mut gcodes = ScriptedMoves::new();
        for i in 0..3 {
            let (coords, feed, pos) = x_move(10.0 * (i + 1) as f64, 10.0, i);
            gcodes.push(coords, feed, pos);
        }

        for _ in 0..200 {
            queue.spin(&mut platform, &mut gcodes);
            if queue.ring_empty() && gcodes.moves.is_empty() {
                break;
            }
        }
        assert!(queue.ring_empty());
        assert!(queue.current_index().is_none());
        // Three 10 mm moves at 10 mm/s.
        assert!(
            (queue.simulation_time() - 3.0).abs() < 0.05,
            "simulated {}",
            queue.simulation_time()
        );
        let mut live = [0.0; DRIVES];
        queue.live_coordinates(&mut live, &platform);
        assert!((live[0] - 30.0).abs() < 0.02);
    }

    #[test]
    fn idle_hold_engages_after_timeout() {
        let (mut queue, mut platform) = cartesian_queue();
        queue.set_idle_timeout(0.5);
        let mut gcodes = ScriptedMoves::new();
        let (coords, feed, pos) = x_move(1.0, 10.0, 0);
        gcodes.push(coords, feed, pos);

        run_to_completion(&mut queue, &mut platform, &mut gcodes);
        assert_eq!(queue.idle_state(), IdleState::Busy);

        // Nothing to run: the queue starts timing, then idles the drives.
        queue.spin(&mut platform, &mut gcodes);
        assert_eq!(queue.idle_state(), IdleState::Timing);
        platform.advance(0.6);
        queue.spin(&mut platform, &mut gcodes);
        assert_eq!(queue.idle_state(), IdleState::Idle);
        for drive in 0..DRIVES {
            assert_eq!(platform.idle_commands(drive), 1);
        }
    }

    #[test]
    fn set_positions_refused_while_moves_queued() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        let (coords, feed, pos) = x_move(5.0, 20.0, 0);
        gcodes.push(coords, feed, pos);
        queue.spin(&mut platform, &mut gcodes);
        assert!(!queue.ring_empty());

        let before = queue.slots[MoveQueue::prev(queue.add)].end_point()[0];
        queue.set_positions(&[9.0, 0.0, 0.0, 0.0, 0.0], &platform);
        // Refused: the anchor endpoint is whatever the queued move set.
        assert_eq!(queue.slots[MoveQueue::prev(queue.add)].end_point()[0], before);
    }

    #[test]
    fn calibration_adjusts_queued_end_points() {
        let mut platform = FixedPlatform::new();
        platform.steps_per_unit = [80.0, 80.0, 80.0, 420.0, 420.0];
        let mut delta = DeltaParameters::new();
        delta.set_diagonal(215.0);
        delta.set_radius(105.0);
        delta.set_homed_height(240.0);
        let kin = Kinematics::new(CoreMode::Cartesian, delta);
        let mut queue = MoveQueue::new(kin, &mut platform);
        assert_eq!(queue.geometry_name(), "delta");

        let anchor = MoveQueue::prev(queue.add);
        let before = queue.slots[anchor].end_point()[0];

        // A pure endstop shift of +0.1 on every tower raises every homed
        // carriage height by 0.1 mm.
        let adjustment = Adjustment {
            values: [0.1, 0.1, 0.1, 0.0, 0.0, 0.0, 0.0],
            num_factors: 4,
        };
        queue.adjust_delta_parameters(&adjustment, &platform);

        let after = queue.slots[anchor].end_point()[0];
        assert_eq!(after - before, 8); // 0.1 mm at 80 steps/mm
        assert!(!queue.live_coordinates_valid);
    }

    #[test]
    fn probe_count_mismatch_reports_both_counts() {
        let (mut queue, platform) = cartesian_queue();
        queue.bed_mut().set_x_probe_point(0, 10.0).unwrap();
        queue.bed_mut().set_y_probe_point(0, 10.0).unwrap();
        queue.bed_mut().set_z_probe_point(0, 0.1).unwrap();

        let err = queue.finished_bed_probing(5, &platform).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bed calibration error: 5 points requested but only 1 provided"
        );
    }

    #[test]
    fn negative_probe_parameter_reports_heights() {
        let (mut queue, platform) = cartesian_queue();
        for (i, z) in [0.11, 0.22].iter().enumerate() {
            queue.bed_mut().set_x_probe_point(i, 10.0).unwrap();
            queue.bed_mut().set_y_probe_point(i, 10.0).unwrap();
            queue.bed_mut().set_z_probe_point(i, *z).unwrap();
        }
        let reply = queue.finished_bed_probing(-1, &platform).unwrap();
        assert_eq!(reply, "Bed probe heights: 0.11 0.22");
    }

    #[test]
    fn endstop_hits_clamp_and_notify() {
        let (mut queue, mut platform) = cartesian_queue();
        let mut gcodes = ScriptedMoves::new();
        gcodes.push([5.0, 0.0, 0.0, 0.0, 0.0], 10.0, 0);
        while queue.current_index().is_none() {
            queue.spin(&mut platform, &mut gcodes);
            platform.advance(0.0001);
        }

        queue.hit_high_stop(0, &platform, &mut gcodes);
        assert!(gcodes.homed[0]);
        let current = queue.current_index().unwrap();
        assert_eq!(
            queue.slots[current].end_point()[0],
            motor_end_point(platform.axis_maximum(0), platform.steps_per_unit(0))
        );

        queue.hit_low_stop(1, &platform, &mut gcodes);
        assert!(gcodes.homed[1]);
    }

    #[test]
    fn user_position_inverts_bed_and_skew() {
        let (mut queue, mut platform) = cartesian_queue();
        queue.shear_mut().set_axis_compensation(0, 0.01);
        let mut gcodes = ScriptedMoves::new();
        gcodes.push([10.0, 10.0, 0.0, 0.0, 0.0], 20.0, 0);
        run_to_completion(&mut queue, &mut platform, &mut gcodes);

        let mut m = [0.0; DRIVES + 1];
        queue.get_current_user_position(&mut m, MoveKind::Normal, &platform);
        assert!((m[0] - 10.0).abs() < 0.02, "user X was {}", m[0]);
        assert!((m[1] - 10.0).abs() < 0.02);
    }
}
