//! Delta (parallel-arm) geometry: forward and inverse transforms between
//! Cartesian space and the three tower carriage heights, plus the parameter
//! adjustments used by auto-calibration.

use crate::{fsquare, A_AXIS, AXES, B_AXIS, C_AXIS, X_AXIS, Y_AXIS, Z_AXIS};

pub const DEFAULT_PRINT_RADIUS: f64 = 50.0;
pub const DEFAULT_DELTA_HOMED_HEIGHT: f64 = 200.0;

// Perturbation used by the numeric parameter derivatives, in mm.
const DERIVATIVE_PERTURB: f64 = 0.2;

/// Tower geometry and the cached coefficients of the inverse transform.
///
/// The cache (`xbc..yab`, `core_fa..core_fc`, `q`, `q2`, `d2`) is recomputed
/// by [`DeltaParameters::recalc`] whenever the geometry changes, so it is
/// always consistent with the tower positions and the diagonal rod length.
#[derive(Debug, Clone)]
pub struct DeltaParameters {
    diagonal: f64,
    radius: f64,
    print_radius: f64,
    homed_height: f64,
    homed_carriage_height: f64,
    is_equilateral: bool,
    delta_mode: bool,
    tower_x: [f64; AXES],
    tower_y: [f64; AXES],
    endstop_adjustments: [f64; AXES],
    xbc: f64,
    xca: f64,
    xab: f64,
    ybc: f64,
    yca: f64,
    yab: f64,
    core_fa: f64,
    core_fb: f64,
    core_fc: f64,
    q: f64,
    q2: f64,
    d2: f64,
}

impl Default for DeltaParameters {
    fn default() -> Self {
        Self {
            diagonal: 0.0,
            radius: 0.0,
            print_radius: DEFAULT_PRINT_RADIUS,
            homed_height: DEFAULT_DELTA_HOMED_HEIGHT,
            homed_carriage_height: DEFAULT_DELTA_HOMED_HEIGHT,
            is_equilateral: true,
            delta_mode: false,
            tower_x: [0.0; AXES],
            tower_y: [0.0; AXES],
            endstop_adjustments: [0.0; AXES],
            xbc: 0.0,
            xca: 0.0,
            xab: 0.0,
            ybc: 0.0,
            yca: 0.0,
            yab: 0.0,
            core_fa: 0.0,
            core_fb: 0.0,
            core_fc: 0.0,
            q: 0.0,
            q2: 0.0,
            d2: 0.0,
        }
    }
}

impl DeltaParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_delta_mode(&self) -> bool {
        self.delta_mode
    }

    pub fn is_equilateral(&self) -> bool {
        self.is_equilateral
    }

    pub fn diagonal(&self) -> f64 {
        self.diagonal
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn print_radius(&self) -> f64 {
        self.print_radius
    }

    pub fn homed_height(&self) -> f64 {
        self.homed_height
    }

    pub fn tower_position(&self, axis: usize) -> (f64, f64) {
        (self.tower_x[axis], self.tower_y[axis])
    }

    pub fn endstop_adjustment(&self, axis: usize) -> f64 {
        self.endstop_adjustments[axis]
    }

    /// Carriage height reading on the given tower when the machine is homed.
    pub fn homed_carriage_height(&self, axis: usize) -> f64 {
        self.homed_carriage_height + self.endstop_adjustments[axis]
    }

    pub fn set_diagonal(&mut self, diagonal: f64) {
        self.diagonal = diagonal;
        self.recalc();
    }

    /// Place the towers at the corners of a regular triangle of the given
    /// circumradius and recompute the cached coefficients.
    pub fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        self.is_equilateral = true;

        let cos30 = 3.0f64.sqrt() / 2.0;
        let sin30 = 0.5;

        self.tower_x[A_AXIS] = -(radius * cos30);
        self.tower_x[B_AXIS] = radius * cos30;
        self.tower_x[C_AXIS] = 0.0;

        self.tower_y[A_AXIS] = -(radius * sin30);
        self.tower_y[B_AXIS] = -(radius * sin30);
        self.tower_y[C_AXIS] = radius;

        self.recalc();
    }

    pub fn set_print_radius(&mut self, print_radius: f64) {
        self.print_radius = print_radius;
    }

    pub fn set_homed_height(&mut self, homed_height: f64) {
        self.homed_height = homed_height;
        self.recalc();
    }

    pub fn set_endstop_adjustment(&mut self, axis: usize, adjustment: f64) {
        self.endstop_adjustments[axis] = adjustment;
    }

    /// Recompute the inverse-transform cache and the homed carriage height.
    pub fn recalc(&mut self) {
        self.delta_mode = self.radius > 0.0 && self.diagonal > self.radius;
        if !self.delta_mode {
            return;
        }

        self.xbc = self.tower_x[C_AXIS] - self.tower_x[B_AXIS];
        self.xca = self.tower_x[A_AXIS] - self.tower_x[C_AXIS];
        self.xab = self.tower_x[B_AXIS] - self.tower_x[A_AXIS];
        self.ybc = self.tower_y[C_AXIS] - self.tower_y[B_AXIS];
        self.yca = self.tower_y[A_AXIS] - self.tower_y[C_AXIS];
        self.yab = self.tower_y[B_AXIS] - self.tower_y[A_AXIS];
        self.core_fa = fsquare(self.tower_x[A_AXIS]) + fsquare(self.tower_y[A_AXIS]);
        self.core_fb = fsquare(self.tower_x[B_AXIS]) + fsquare(self.tower_y[B_AXIS]);
        self.core_fc = fsquare(self.tower_x[C_AXIS]) + fsquare(self.tower_y[C_AXIS]);
        self.q = 2.0 * (self.xca * self.yab - self.xab * self.yca);
        self.q2 = fsquare(self.q);
        self.d2 = fsquare(self.diagonal);

        // Base carriage height when the printer is homed. Any sensible
        // carriage height works here; the diagonal is convenient.
        let temp_height = self.diagonal;
        let machine_pos = self.inverse_transform(
            temp_height + self.endstop_adjustments[A_AXIS],
            temp_height + self.endstop_adjustments[B_AXIS],
            temp_height + self.endstop_adjustments[C_AXIS],
        );
        self.homed_carriage_height = self.homed_height + temp_height - machine_pos[Z_AXIS];
    }

    /// Make the average of the endstop adjustments zero without changing the
    /// individual homed carriage heights.
    pub fn normalise_endstop_adjustments(&mut self) {
        let eav = (self.endstop_adjustments[A_AXIS]
            + self.endstop_adjustments[B_AXIS]
            + self.endstop_adjustments[C_AXIS])
            / 3.0;
        self.endstop_adjustments[A_AXIS] -= eav;
        self.endstop_adjustments[B_AXIS] -= eav;
        self.endstop_adjustments[C_AXIS] -= eav;
        self.homed_height += eav;
        self.homed_carriage_height += eav;
    }

    /// Carriage height along one tower for a Cartesian machine position.
    pub fn transform(&self, machine_pos: &[f64; AXES], axis: usize) -> f64 {
        machine_pos[Z_AXIS]
            + (self.d2
                - fsquare(machine_pos[X_AXIS] - self.tower_x[axis])
                - fsquare(machine_pos[Y_AXIS] - self.tower_y[axis]))
            .sqrt()
    }

    /// Cartesian machine position for three tower carriage heights.
    pub fn inverse_transform(&self, ha: f64, hb: f64, hc: f64) -> [f64; AXES] {
        let fa = self.core_fa + fsquare(ha);
        let fb = self.core_fb + fsquare(hb);
        let fc = self.core_fc + fsquare(hc);

        // Set up PQRSU such that x = -(S - Uz)/Q, y = (P - Rz)/Q.
        let p = self.xbc * fa + self.xca * fb + self.xab * fc;
        let s = self.ybc * fa + self.yca * fb + self.yab * fc;
        let r = 2.0 * (self.xbc * ha + self.xca * hb + self.xab * hc);
        let u = 2.0 * (self.ybc * ha + self.yca * hb + self.yab * hc);

        let a = fsquare(u) + fsquare(r) + self.q2;
        let minus_half_b = s * u + p * r + ha * self.q2 + self.tower_x[A_AXIS] * u * self.q
            - self.tower_y[A_AXIS] * r * self.q;
        let c = fsquare(s + self.tower_x[A_AXIS] * self.q)
            + fsquare(p - self.tower_y[A_AXIS] * self.q)
            + (fsquare(ha) - self.d2) * self.q2;

        let z = (minus_half_b - (fsquare(minus_half_b) - a * c).sqrt()) / a;
        [(u * z - s) / self.q, (p - r * z) / self.q, z]
    }

    /// Derivative of the inverse-transformed height with respect to one
    /// calibration parameter, at the given carriage heights. The parameter is
    /// indexed as follows:
    ///
    /// 0, 1, 2 = A, B, C tower endstop adjustments
    /// 3, 4 = A, B tower X positions
    /// 5 = C tower Y position (moved so the centroid Y is preserved)
    /// 6 = diagonal rod length
    pub fn compute_derivative(&self, deriv: usize, ha: f64, hb: f64, hc: f64) -> f64 {
        let perturb = DERIVATIVE_PERTURB;
        let mut hi_params = self.clone();
        let mut lo_params = self.clone();
        match deriv {
            0..=2 => {}

            3 | 4 => {
                hi_params.tower_x[deriv - 3] += perturb;
                lo_params.tower_x[deriv - 3] -= perturb;
            }

            5 => {
                let y_adj = perturb * (1.0 / 3.0);
                hi_params.tower_y[A_AXIS] -= y_adj;
                hi_params.tower_y[B_AXIS] -= y_adj;
                hi_params.tower_y[C_AXIS] += perturb - y_adj;
                lo_params.tower_y[A_AXIS] += y_adj;
                lo_params.tower_y[B_AXIS] += y_adj;
                lo_params.tower_y[C_AXIS] -= perturb - y_adj;
            }

            _ => {
                hi_params.diagonal += perturb;
                lo_params.diagonal -= perturb;
            }
        }

        hi_params.recalc();
        lo_params.recalc();

        let hi_pos = hi_params.inverse_transform(
            if deriv == 0 { ha + perturb } else { ha },
            if deriv == 1 { hb + perturb } else { hb },
            if deriv == 2 { hc + perturb } else { hc },
        );
        let lo_pos = lo_params.inverse_transform(
            if deriv == 0 { ha - perturb } else { ha },
            if deriv == 1 { hb - perturb } else { hb },
            if deriv == 2 { hc - perturb } else { hc },
        );

        (hi_pos[Z_AXIS] - lo_pos[Z_AXIS]) / (2.0 * perturb)
    }

    /// Four-factor adjustment: the three endstop corrections plus the delta
    /// radius. Keeps the geometry equilateral.
    pub fn adjust_four(&mut self, v: &[f64; 4]) {
        self.endstop_adjustments[A_AXIS] += v[0];
        self.endstop_adjustments[B_AXIS] += v[1];
        self.endstop_adjustments[C_AXIS] += v[2];
        self.normalise_endstop_adjustments();
        self.set_radius(self.radius + v[3]);
    }

    /// Seven-factor adjustment: the three endstop corrections, the A and B
    /// tower X positions, the C tower Y position, and the diagonal rod
    /// length. The geometry is no longer equilateral afterwards.
    pub fn adjust_seven(&mut self, v: &[f64; 7]) {
        let old_carriage_height_a = self.homed_carriage_height(A_AXIS);

        self.endstop_adjustments[A_AXIS] += v[0];
        self.endstop_adjustments[B_AXIS] += v[1];
        self.endstop_adjustments[C_AXIS] += v[2];
        self.normalise_endstop_adjustments();

        self.tower_x[A_AXIS] += v[3];
        self.tower_x[B_AXIS] += v[4];

        let y_adj = v[5] * (1.0 / 3.0);
        self.tower_y[A_AXIS] -= y_adj;
        self.tower_y[B_AXIS] -= y_adj;
        self.tower_y[C_AXIS] += v[5] - y_adj;
        self.diagonal += v[6];
        self.is_equilateral = false;

        self.recalc();

        // Moving the towers and the diagonal changes the homed carriage
        // height; compensate so the net effect on tower A matches the
        // requested endstop correction.
        let height_error = self.homed_carriage_height(A_AXIS) - old_carriage_height_a - v[0];
        self.homed_height -= height_error;
        self.homed_carriage_height -= height_error;
    }

    /// Human-readable parameter report. Equilateral geometries are condensed
    /// to the radius unless `full` is requested.
    pub fn print_parameters(&self, full: bool) -> String {
        let mut reply = format!(
            "Endstops X{:.2} Y{:.2} Z{:.2}, height {:.2}, diagonal {:.2}, ",
            self.endstop_adjustments[A_AXIS],
            self.endstop_adjustments[B_AXIS],
            self.endstop_adjustments[C_AXIS],
            self.homed_height,
            self.diagonal
        );
        if self.is_equilateral && !full {
            reply.push_str(&format!("radius {:.2}", self.radius));
        } else {
            reply.push_str(&format!(
                "towers ({:.2},{:.2}) ({:.2},{:.2}) ({:.2},{:.2})",
                self.tower_x[A_AXIS],
                self.tower_y[A_AXIS],
                self.tower_x[B_AXIS],
                self.tower_y[B_AXIS],
                self.tower_x[C_AXIS],
                self.tower_y[C_AXIS]
            ));
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn equilateral() -> DeltaParameters {
        let mut params = DeltaParameters::new();
        params.set_diagonal(215.0);
        params.set_radius(105.0);
        params.set_homed_height(240.0);
        params
    }

    #[test]
    fn equilateral_round_trip_at_centre() {
        let params = equilateral();
        assert!(params.is_delta_mode());

        let pos = [0.0, 0.0, 100.0];
        let ha = params.transform(&pos, A_AXIS);
        let hb = params.transform(&pos, B_AXIS);
        let hc = params.transform(&pos, C_AXIS);
        assert!((ha - hb).abs() < 1e-9);
        assert!((hb - hc).abs() < 1e-9);

        let back = params.inverse_transform(ha, hb, hc);
        for axis in 0..AXES {
            assert!(
                (back[axis] - pos[axis]).abs() < 1e-3,
                "axis {} came back as {}",
                axis,
                back[axis]
            );
        }
    }

    #[test]
    fn round_trip_inside_printable_volume() {
        let params = equilateral();
        for &(x, y, z) in &[
            (30.0, -20.0, 5.0),
            (-50.0, 40.0, 120.0),
            (0.0, 84.0, 10.0),
            (-12.5, -61.0, 200.0),
        ] {
            let pos = [x, y, z];
            let back = params.inverse_transform(
                params.transform(&pos, A_AXIS),
                params.transform(&pos, B_AXIS),
                params.transform(&pos, C_AXIS),
            );
            for axis in 0..AXES {
                assert!((back[axis] - pos[axis]).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn tower_placement_is_regular_triangle() {
        let params = equilateral();
        let cos30 = 3.0f64.sqrt() / 2.0;
        let (ax, ay) = params.tower_position(A_AXIS);
        let (bx, by) = params.tower_position(B_AXIS);
        let (cx, cy) = params.tower_position(C_AXIS);
        assert!((ax + 105.0 * cos30).abs() < 1e-9);
        assert!((bx - 105.0 * cos30).abs() < 1e-9);
        assert!(cx.abs() < 1e-9);
        assert!((ay + 52.5).abs() < 1e-9);
        assert!((by + 52.5).abs() < 1e-9);
        assert!((cy - 105.0).abs() < 1e-9);
    }

    #[test]
    fn normalise_zeroes_mean_and_keeps_carriage_heights() {
        let mut params = equilateral();
        params.set_endstop_adjustment(A_AXIS, 1.0);
        params.set_endstop_adjustment(B_AXIS, -0.5);
        params.set_endstop_adjustment(C_AXIS, 0.2);
        params.recalc();

        let heights_before: Vec<f64> = (0..AXES).map(|a| params.homed_carriage_height(a)).collect();
        params.normalise_endstop_adjustments();

        let mean = (0..AXES).map(|a| params.endstop_adjustment(a)).sum::<f64>() / 3.0;
        assert!(mean.abs() < 1e-6);
        for axis in 0..AXES {
            assert!((params.homed_carriage_height(axis) - heights_before[axis]).abs() < 1e-4);
        }
    }

    #[test]
    fn derivative_matches_fresh_finite_difference() {
        let params = equilateral();
        let probe = [40.0, -25.0, 0.0];
        let ha = params.transform(&probe, A_AXIS);
        let hb = params.transform(&probe, B_AXIS);
        let hc = params.transform(&probe, C_AXIS);

        // Re-derive the diagonal derivative with a different step size; the
        // two quotients agree to within the finite-difference error.
        let analytic = params.compute_derivative(6, ha, hb, hc);
        let eps = 0.05;
        let mut hi = params.clone();
        let mut lo = params.clone();
        hi.set_diagonal(params.diagonal() + eps);
        lo.set_diagonal(params.diagonal() - eps);
        let fresh =
            (hi.inverse_transform(ha, hb, hc)[Z_AXIS] - lo.inverse_transform(ha, hb, hc)[Z_AXIS])
                / (2.0 * eps);
        assert!(
            (analytic - fresh).abs() < 1e-3,
            "derivative {} vs fresh {}",
            analytic,
            fresh
        );
    }

    #[test]
    fn endstop_derivative_has_unit_scale_at_centre() {
        let params = equilateral();
        let centre = [0.0, 0.0, 0.0];
        let ha = params.transform(&centre, A_AXIS);
        let hb = params.transform(&centre, B_AXIS);
        let hc = params.transform(&centre, C_AXIS);
        // Raising all three carriages by the same amount raises Z by that
        // amount, so the three endstop derivatives sum to about one.
        let sum: f64 = (0..3).map(|j| params.compute_derivative(j, ha, hb, hc)).sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum of endstop derivatives {}", sum);
    }

    #[test]
    fn adjust_seven_applies_requested_endstop_change() {
        let mut params = equilateral();
        let old_height_a = params.homed_carriage_height(A_AXIS);
        let v = [0.3, -0.1, -0.2, 0.5, -0.4, 0.6, 0.8];
        params.adjust_seven(&v);
        assert!(!params.is_equilateral());
        let new_height_a = params.homed_carriage_height(A_AXIS);
        assert!((new_height_a - old_height_a - v[0]).abs() < 1e-9);
    }

    #[test]
    fn report_condenses_equilateral_geometry() {
        let mut params = equilateral();
        let condensed = params.print_parameters(false);
        assert!(condensed.contains("radius 105.00"));
        assert!(condensed.contains("diagonal 215.00"));

        let full = params.print_parameters(true);
        assert!(full.contains("towers ("));

        params.adjust_seven(&[0.0; 7]);
        assert!(params.print_parameters(false).contains("towers ("));
    }
}
