//! Least-squares delta calibration: build the derivative matrix over the
//! probe points, form the normal equations, and solve for the parameter
//! increments.

use thiserror::Error;

use crate::delta::DeltaParameters;
use crate::matrix::{FixedMatrix, SingularMatrix};
use crate::{A_AXIS, B_AXIS, C_AXIS};

pub const MAX_CALIBRATION_POINTS: usize = 9;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error(
        "delta calibration error: {provided} probe points provided but must be between 4 and {max}"
    )]
    BadProbeCount { provided: usize, max: usize },

    #[error("delta calibration error: {0}")]
    Singular(#[from] SingularMatrix),
}

/// A probed point: XY in machine coordinates and the height error found
/// there.
#[derive(Debug, Clone, Copy)]
pub struct ProbePoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// The solved parameter increments, ready for
/// [`DeltaParameters::adjust_four`] or [`DeltaParameters::adjust_seven`].
#[derive(Debug, Clone, Copy)]
pub struct Adjustment {
    pub values: [f64; 7],
    pub num_factors: usize,
}

impl Adjustment {
    pub fn is_seven_factor(&self) -> bool {
        self.num_factors == 7
    }
}

/// Number of factors fitted for a probe count: all seven when there are
/// enough points, else endstops plus radius.
pub fn factors_for(num_points: usize) -> usize {
    if num_points >= 7 {
        7
    } else {
        4
    }
}

/// Solve the least-squares system for the given probe points against the
/// current parameter set.
pub fn solve(
    delta: &DeltaParameters,
    points: &[ProbePoint],
) -> Result<Adjustment, CalibrationError> {
    let num_points = points.len();
    if !(4..=MAX_CALIBRATION_POINTS).contains(&num_points) {
        return Err(CalibrationError::BadProbeCount {
            provided: num_points,
            max: MAX_CALIBRATION_POINTS,
        });
    }
    let num_factors = factors_for(num_points);

    // Derivatives of the inverse-transformed height with respect to each
    // factor, evaluated at the carriage heights of each probe point.
    let mut derivative: FixedMatrix<MAX_CALIBRATION_POINTS, 7> = FixedMatrix::new();
    for (i, point) in points.iter().enumerate() {
        let machine_pos = [point.x, point.y, 0.0];
        let ha = delta.transform(&machine_pos, A_AXIS);
        let hb = delta.transform(&machine_pos, B_AXIS);
        let hc = delta.transform(&machine_pos, C_AXIS);
        for j in 0..num_factors {
            derivative[(i, j)] = delta.compute_derivative(j, ha, hb, hc);
        }
    }

    // Normal equations, augmented with D^T * (-z).
    let mut normal: FixedMatrix<7, 8> = FixedMatrix::new();
    for i in 0..num_factors {
        for j in 0..num_factors {
            let mut temp = 0.0;
            for k in 0..num_points {
                temp += derivative[(k, i)] * derivative[(k, j)];
            }
            normal[(i, j)] = temp;
        }
        let mut temp = 0.0;
        for k in 0..num_points {
            temp += derivative[(k, i)] * -points[k].z;
        }
        normal[(i, num_factors)] = temp;
    }

    let mut solution = [0.0f64; 7];
    normal.gauss_jordan(&mut solution, num_factors)?;

    let residuals = residuals_for(&derivative, points, &solution, num_factors);
    tracing::debug!(?solution, ?residuals, "delta calibration solved");

    Ok(Adjustment {
        values: solution,
        num_factors,
    })
}

/// Expected height errors after applying a solution, by linear extrapolation
/// from the derivative matrix.
fn residuals_for(
    derivative: &FixedMatrix<MAX_CALIBRATION_POINTS, 7>,
    points: &[ProbePoint],
    solution: &[f64; 7],
    num_factors: usize,
) -> Vec<f64> {
    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let mut residual = point.z;
            for j in 0..num_factors {
                residual += solution[j] * derivative[(i, j)];
            }
            residual
        })
        .collect()
}

/// Apply a solved adjustment to a parameter set.
pub fn apply(delta: &mut DeltaParameters, adjustment: &Adjustment) {
    if adjustment.is_seven_factor() {
        delta.adjust_seven(&adjustment.values);
    } else {
        let four = [
            adjustment.values[0],
            adjustment.values[1],
            adjustment.values[2],
            adjustment.values[3],
        ];
        delta.adjust_four(&four);
    }
}

/// Root-mean-square of the probed height errors.
pub fn deviation(points: &[ProbePoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let sum: f64 = points.iter().map(|p| p.z * p.z).sum();
    (sum / points.len() as f64).sqrt()
}
