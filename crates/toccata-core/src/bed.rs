//! Bed-plane height compensation and axis skew correction.
//!
//! Z compensation is fitted from the probe point table: three points give a
//! plane, four a bilinear ruled surface over the probed rectangle, five a
//! barycentric interpolation over four triangles fanned from the centre
//! point.

use thiserror::Error;

use crate::{AXES, X_AXIS, Y_AXIS, Z_AXIS};

pub const MAX_PROBE_POINTS: usize = 9;

/// Barycentric epsilon: a point belongs to a triangle when all three of its
/// coordinates exceed this.
pub const TRIANGLE_0: f64 = -0.001;

const X_SET: u8 = 1 << 0;
const Y_SET: u8 = 1 << 1;
const Z_SET: u8 = 1 << 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BedError {
    #[error("probe point index {0} out of range")]
    PointIndexOutOfRange(usize),

    #[error("bed calibration error: {0} points provided but only 3, 4 and 5 supported")]
    UnsupportedPointCount(usize),
}

/// Probe point table and the fitted compensation state.
#[derive(Debug, Clone)]
pub struct BedCompensation {
    x_points: [f64; MAX_PROBE_POINTS],
    y_points: [f64; MAX_PROBE_POINTS],
    z_points: [f64; MAX_PROBE_POINTS],
    point_set: [u8; MAX_PROBE_POINTS],
    // 5-point interpolation works on corners pushed out from the centre so
    // that the four triangles cover the whole bed.
    bary_x: [f64; 5],
    bary_y: [f64; 5],
    bary_z: [f64; 5],
    a_x: f64,
    a_y: f64,
    a_c: f64,
    x_rectangle: f64,
    y_rectangle: f64,
    identity: bool,
}

impl BedCompensation {
    /// A fresh table with default probe positions guessed from the axis
    /// maxima. These are only a guess; the front-end normally overwrites
    /// them before probing.
    pub fn new(x_max: f64, y_max: f64) -> Self {
        let mut comp = Self {
            x_points: [0.0; MAX_PROBE_POINTS],
            y_points: [0.0; MAX_PROBE_POINTS],
            z_points: [0.0; MAX_PROBE_POINTS],
            point_set: [0; MAX_PROBE_POINTS],
            bary_x: [0.0; 5],
            bary_y: [0.0; 5],
            bary_z: [0.0; 5],
            a_x: 0.0,
            a_y: 0.0,
            a_c: 0.0,
            x_rectangle: 1.0 / (0.8 * x_max),
            y_rectangle: 1.0 / (0.8 * x_max),
            identity: true,
        };
        for point in 0..4 {
            comp.x_points[point] = (0.3 + 0.6 * (point % 2) as f64) * x_max;
            comp.y_points[point] = 0.9 * (point / 2) as f64 * y_max;
        }
        comp
    }

    pub fn set_identity(&mut self) {
        self.identity = true;
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn set_x_probe_point(&mut self, index: usize, x: f64) -> Result<(), BedError> {
        if index >= MAX_PROBE_POINTS {
            return Err(BedError::PointIndexOutOfRange(index));
        }
        self.x_points[index] = x;
        self.point_set[index] |= X_SET;
        Ok(())
    }

    pub fn set_y_probe_point(&mut self, index: usize, y: f64) -> Result<(), BedError> {
        if index >= MAX_PROBE_POINTS {
            return Err(BedError::PointIndexOutOfRange(index));
        }
        self.y_points[index] = y;
        self.point_set[index] |= Y_SET;
        Ok(())
    }

    pub fn set_z_probe_point(&mut self, index: usize, z: f64) -> Result<(), BedError> {
        if index >= MAX_PROBE_POINTS {
            return Err(BedError::PointIndexOutOfRange(index));
        }
        self.z_points[index] = z;
        self.point_set[index] |= Z_SET;
        Ok(())
    }

    pub fn x_probe_point(&self, index: usize) -> f64 {
        self.x_points[index]
    }

    pub fn y_probe_point(&self, index: usize) -> f64 {
        self.y_points[index]
    }

    pub fn z_probe_point(&self, index: usize) -> f64 {
        self.z_points[index]
    }

    pub fn all_coordinates_set(&self, index: usize) -> bool {
        self.point_set[index] == X_SET | Y_SET | Z_SET
    }

    pub fn xy_coordinates_set(&self, index: usize) -> bool {
        (self.point_set[index] & X_SET) != 0 && (self.point_set[index] & Y_SET) != 0
    }

    /// Number of leading probe points with all three coordinates recorded.
    pub fn number_of_points(&self) -> usize {
        for i in 0..MAX_PROBE_POINTS {
            if !self.all_coordinates_set(i) {
                return i;
            }
        }
        MAX_PROBE_POINTS
    }

    pub fn number_of_xy_points(&self) -> usize {
        for i in 0..MAX_PROBE_POINTS {
            if !self.xy_coordinates_set(i) {
                return i;
            }
        }
        MAX_PROBE_POINTS
    }

    /// Fit the compensation from the first `num_points` probe points and
    /// return the reply text.
    pub fn set_probed_bed_equation(&mut self, num_points: usize) -> Result<String, BedError> {
        match num_points {
            3 => {
                // Plane through the three points.
                let x10 = self.x_points[1] - self.x_points[0];
                let y10 = self.y_points[1] - self.y_points[0];
                let z10 = self.z_points[1] - self.z_points[0];
                let x20 = self.x_points[2] - self.x_points[0];
                let y20 = self.y_points[2] - self.y_points[0];
                let z20 = self.z_points[2] - self.z_points[0];
                let a = y10 * z20 - z10 * y20;
                let b = z10 * x20 - x10 * z20;
                let c = x10 * y20 - y10 * x20;
                let d = -(self.x_points[1] * a + self.y_points[1] * b + self.z_points[1] * c);
                self.a_x = -a / c;
                self.a_y = -b / c;
                self.a_c = -d / c;
                self.identity = false;
            }

            4 => {
                // Ruled-surface quadratic over the probed rectangle. The
                // corner points are indexed:
                //
                //   ^  [1]      [2]
                //   |
                //   Y
                //   |
                //   |  [0]      [3]
                //      -----X---->
                self.x_rectangle = 1.0 / (self.x_points[3] - self.x_points[0]);
                self.y_rectangle = 1.0 / (self.y_points[1] - self.y_points[0]);
                self.identity = false;
            }

            5 => {
                // Expand each corner away from the centre so the four
                // triangles cover the whole bed.
                for i in 0..4 {
                    let x10 = self.x_points[i] - self.x_points[4];
                    let y10 = self.y_points[i] - self.y_points[4];
                    let z10 = self.z_points[i] - self.z_points[4];
                    self.bary_x[i] = self.x_points[4] + 2.0 * x10;
                    self.bary_y[i] = self.y_points[4] + 2.0 * y10;
                    self.bary_z[i] = self.z_points[4] + 2.0 * z10;
                }
                self.bary_x[4] = self.x_points[4];
                self.bary_y[4] = self.y_points[4];
                self.bary_z[4] = self.z_points[4];
                self.identity = false;
            }

            _ => return Err(BedError::UnsupportedPointCount(num_points)),
        }

        let mut reply = String::from("Bed equation fits points");
        for point in 0..self.number_of_points() {
            reply.push_str(&format!(
                " [{:.1}, {:.1}, {:.3}]",
                self.x_points[point], self.y_points[point], self.z_points[point]
            ));
        }
        Ok(reply)
    }

    /// Add the fitted Z correction to a machine position.
    pub fn apply(&self, xyz: &mut [f64; AXES]) {
        if self.identity {
            return;
        }
        match self.number_of_points() {
            0 => {}
            3 => {
                xyz[Z_AXIS] += self.a_x * xyz[X_AXIS] + self.a_y * xyz[Y_AXIS] + self.a_c;
            }
            4 => {
                xyz[Z_AXIS] += self.second_degree_z(xyz[X_AXIS], xyz[Y_AXIS]);
            }
            5 => {
                xyz[Z_AXIS] += self.triangle_z(xyz[X_AXIS], xyz[Y_AXIS]);
            }
            n => {
                tracing::error!(points = n, "bed transform: wrong number of sample points");
            }
        }
    }

    /// Remove the fitted Z correction from a machine position.
    pub fn invert(&self, xyz: &mut [f64; AXES]) {
        if self.identity {
            return;
        }
        match self.number_of_points() {
            0 => {}
            3 => {
                xyz[Z_AXIS] -= self.a_x * xyz[X_AXIS] + self.a_y * xyz[Y_AXIS] + self.a_c;
            }
            4 => {
                xyz[Z_AXIS] -= self.second_degree_z(xyz[X_AXIS], xyz[Y_AXIS]);
            }
            5 => {
                xyz[Z_AXIS] -= self.triangle_z(xyz[X_AXIS], xyz[Y_AXIS]);
            }
            n => {
                tracing::error!(points = n, "inverse bed transform: wrong number of sample points");
            }
        }
    }

    // Bilinear interpolation over the rectangle, with x and y first scaled
    // into the unit interval.
    fn second_degree_z(&self, x: f64, y: f64) -> f64 {
        let x = (x - self.x_points[0]) * self.x_rectangle;
        let y = (y - self.y_points[0]) * self.y_rectangle;
        (1.0 - x) * (1.0 - y) * self.z_points[0]
            + x * (1.0 - y) * self.z_points[3]
            + (1.0 - x) * y * self.z_points[1]
            + x * y * self.z_points[2]
    }

    fn barycentric_coordinates(
        &self,
        p1: usize,
        p2: usize,
        p3: usize,
        x: f64,
        y: f64,
    ) -> (f64, f64, f64) {
        let y23 = self.bary_y[p2] - self.bary_y[p3];
        let x3 = x - self.bary_x[p3];
        let x32 = self.bary_x[p3] - self.bary_x[p2];
        let y3 = y - self.bary_y[p3];
        let x13 = self.bary_x[p1] - self.bary_x[p3];
        let y13 = self.bary_y[p1] - self.bary_y[p3];
        let i_det = 1.0 / (y23 * x13 + x32 * y13);
        let l1 = (y23 * x3 + x32 * y3) * i_det;
        let l2 = (-y13 * x3 + x13 * y3) * i_det;
        (l1, l2, 1.0 - l1 - l2)
    }

    /// Interpolate on the triangular grid fanned from the centre point.
    /// The triangle corners are indexed:
    ///
    ///   ^  [1]      [2]
    ///   |
    ///   Y      [4]
    ///   |
    ///   |  [0]      [3]
    ///      -----X---->
    fn triangle_z(&self, x: f64, y: f64) -> f64 {
        for i in 0..4 {
            let j = (i + 1) % 4;
            let (l1, l2, l3) = self.barycentric_coordinates(i, j, 4, x, y);
            if l1 > TRIANGLE_0 && l2 > TRIANGLE_0 && l3 > TRIANGLE_0 {
                return l1 * self.bary_z[i] + l2 * self.bary_z[j] + l3 * self.bary_z[4];
            }
        }
        tracing::error!(x, y, "triangle interpolation: point outside all triangles");
        0.0
    }
}

/// Axis skew tangents, applied before bed compensation and inverted after.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxisShear {
    pub tan_xy: f64,
    pub tan_yz: f64,
    pub tan_xz: f64,
}

impl AxisShear {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, xyz: &mut [f64; AXES]) {
        xyz[X_AXIS] += self.tan_xy * xyz[Y_AXIS] + self.tan_xz * xyz[Z_AXIS];
        xyz[Y_AXIS] += self.tan_yz * xyz[Z_AXIS];
    }

    pub fn invert(&self, xyz: &mut [f64; AXES]) {
        xyz[Y_AXIS] -= self.tan_yz * xyz[Z_AXIS];
        xyz[X_AXIS] -= self.tan_xy * xyz[Y_AXIS] + self.tan_xz * xyz[Z_AXIS];
    }

    pub fn axis_compensation(&self, axis: usize) -> f64 {
        match axis {
            X_AXIS => self.tan_xy,
            Y_AXIS => self.tan_yz,
            Z_AXIS => self.tan_xz,
            _ => {
                tracing::error!(axis, "axis compensation requested for non-existent axis");
                0.0
            }
        }
    }

    pub fn set_axis_compensation(&mut self, axis: usize, tangent: f64) {
        match axis {
            X_AXIS => self.tan_xy = tangent,
            Y_AXIS => self.tan_yz = tangent,
            Z_AXIS => self.tan_xz = tangent,
            _ => {
                tracing::error!(axis, "axis compensation set for non-existent axis");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probed(points: &[(f64, f64, f64)]) -> BedCompensation {
        let mut comp = BedCompensation::new(200.0, 200.0);
        for (i, &(x, y, z)) in points.iter().enumerate() {
            comp.set_x_probe_point(i, x).unwrap();
            comp.set_y_probe_point(i, y).unwrap();
            comp.set_z_probe_point(i, z).unwrap();
        }
        comp
    }

    #[test]
    fn identity_until_fitted() {
        let comp = probed(&[(0.0, 0.0, 1.0), (0.0, 100.0, 1.0), (100.0, 100.0, 1.0)]);
        let mut pos = [10.0, 20.0, 0.5];
        comp.apply(&mut pos);
        assert_eq!(pos, [10.0, 20.0, 0.5]);
    }

    #[test]
    fn three_point_plane_reproduces_probed_heights() {
        let mut comp = probed(&[(0.0, 0.0, 0.1), (0.0, 100.0, 0.3), (100.0, 100.0, 0.2)]);
        let reply = comp.set_probed_bed_equation(3).unwrap();
        assert!(reply.starts_with("Bed equation fits points"));

        for i in 0..3 {
            let mut pos = [comp.x_probe_point(i), comp.y_probe_point(i), 0.0];
            comp.apply(&mut pos);
            assert!((pos[Z_AXIS] - comp.z_probe_point(i)).abs() < 1e-9);
        }
    }

    #[test]
    fn four_point_bilinear_centre_is_corner_average() {
        let mut comp = probed(&[
            (0.0, 0.0, 0.10),
            (0.0, 100.0, 0.20),
            (100.0, 100.0, 0.30),
            (100.0, 0.0, 0.40),
        ]);
        comp.set_probed_bed_equation(4).unwrap();

        let mut pos = [50.0, 50.0, 1.0];
        comp.apply(&mut pos);
        assert!((pos[Z_AXIS] - 1.25).abs() < 1e-9);

        comp.invert(&mut pos);
        assert!((pos[Z_AXIS] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn five_point_triangle_interpolates_centre_and_corners() {
        let mut comp = probed(&[
            (0.0, 0.0, 0.1),
            (0.0, 100.0, 0.2),
            (100.0, 100.0, 0.3),
            (100.0, 0.0, 0.4),
            (50.0, 50.0, 0.05),
        ]);
        comp.set_probed_bed_equation(5).unwrap();

        let mut centre = [50.0, 50.0, 0.0];
        comp.apply(&mut centre);
        assert!((centre[Z_AXIS] - 0.05).abs() < 1e-9);

        // The original corners sit halfway between the centre and the
        // expanded corners, so they reproduce their probed heights.
        let mut corner = [0.0, 0.0, 0.0];
        comp.apply(&mut corner);
        assert!((corner[Z_AXIS] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn unsupported_point_counts_are_refused() {
        let mut comp = probed(&[(0.0, 0.0, 0.1), (0.0, 100.0, 0.3)]);
        assert_eq!(
            comp.set_probed_bed_equation(2),
            Err(BedError::UnsupportedPointCount(2))
        );
        assert!(comp.is_identity());
    }

    #[test]
    fn probe_point_index_is_validated() {
        let mut comp = BedCompensation::new(200.0, 200.0);
        assert_eq!(
            comp.set_x_probe_point(MAX_PROBE_POINTS, 1.0),
            Err(BedError::PointIndexOutOfRange(MAX_PROBE_POINTS))
        );
    }

    #[test]
    fn number_of_points_counts_leading_complete_entries() {
        let mut comp = BedCompensation::new(200.0, 200.0);
        assert_eq!(comp.number_of_points(), 0);
        comp.set_x_probe_point(0, 1.0).unwrap();
        comp.set_y_probe_point(0, 2.0).unwrap();
        assert_eq!(comp.number_of_points(), 0);
        assert_eq!(comp.number_of_xy_points(), 1);
        comp.set_z_probe_point(0, 0.1).unwrap();
        assert_eq!(comp.number_of_points(), 1);
    }

    #[test]
    fn shear_round_trips() {
        let mut shear = AxisShear::new();
        shear.set_axis_compensation(X_AXIS, 0.01);
        shear.set_axis_compensation(Y_AXIS, -0.005);
        shear.set_axis_compensation(Z_AXIS, 0.002);

        let original = [17.0, -4.0, 9.0];
        let mut pos = original;
        shear.apply(&mut pos);
        shear.invert(&mut pos);
        for axis in 0..AXES {
            assert!((pos[axis] - original[axis]).abs() < 1e-6);
        }
    }
}
