//! Weighted least-squares accumulator for the 6-parameter pose update.
//!
//! Jacobian-linearized 2D reprojection residuals are folded into 6x6
//! normal equations with a fixed stabilizing prior, then solved by
//! Cholesky decomposition. The result is a tangent-space increment applied
//! through the pose exponential map.

use nalgebra::{Matrix6, Vector6};

/// Strength of the stabilizing prior added to the normal equations; guards
/// against rank deficiency when few points are found.
pub const STABILIZING_PRIOR: f64 = 100.0;

/// Accumulates weighted residual rows into normal equations.
pub struct WeightedLeastSquares {
    a: Matrix6<f64>,
    b: Vector6<f64>,
}

impl WeightedLeastSquares {
    /// Start a solve with the stabilizing prior already applied.
    pub fn with_prior(prior: f64) -> Self {
        Self {
            a: Matrix6::identity() * prior,
            b: Vector6::zeros(),
        }
    }

    /// Add one scalar residual row: `error` with Jacobian `jac` and weight
    /// `weight`. A 2D reprojection residual contributes two rows.
    pub fn add_row(&mut self, error: f64, jac: &Vector6<f64>, weight: f64) {
        self.a += weight * jac * jac.transpose();
        self.b += weight * error * jac;
    }

    /// Solve the normal equations. `None` if the system is not positive
    /// definite, which callers treat as a null update.
    pub fn solve(&self) -> Option<Vector6<f64>> {
        self.a.cholesky().map(|chol| chol.solve(&self.b))
    }
}
