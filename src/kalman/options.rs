//! Configuration of the Kalman filter engine

use crate::common::{KalmanError, KalmanResult};

/// Update strategy applied in the correction stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KFMethod {
    /// Classic EKF: one linearization, one correction
    NaiveEkf,
    /// Iterated EKF: repeats the linear correction around the updated state,
    /// covariance corrected once after the last iteration
    FullIkf,
    /// Sequential scalar EKF (Davison style): processes one observation
    /// component at a time, no matrix inversion. Requires independent
    /// (diagonal) observation noise.
    DavisonEkf,
    /// Scalar-sequential IKF. Reserved; selecting it fails with
    /// `KalmanError::NotImplemented`.
    ScalarIkf,
}

/// Options for the filter engine
#[derive(Debug, Clone)]
pub struct KFOptions {
    /// Update strategy
    pub method: KFMethod,
    /// Number of correction iterations when `method` is `FullIkf`
    pub ikf_iterations: usize,
    /// Prefer the model's analytic transition Jacobian over finite differences
    pub use_analytic_transition_jacobian: bool,
    /// Prefer the model's analytic observation Jacobians over finite differences
    pub use_analytic_observation_jacobian: bool,
    /// Cross-validate analytic Jacobians against the numeric estimate.
    /// A mismatch beyond `jacobian_verify_threshold` aborts the cycle.
    pub verify_analytic_jacobians: bool,
    /// Absolute-sum threshold for Jacobian cross-validation
    pub jacobian_verify_threshold: f64,
}

impl Default for KFOptions {
    fn default() -> Self {
        Self {
            method: KFMethod::NaiveEkf,
            ikf_iterations: 5,
            use_analytic_transition_jacobian: true,
            use_analytic_observation_jacobian: true,
            verify_analytic_jacobians: false,
            jacobian_verify_threshold: 1e-2,
        }
    }
}

impl KFOptions {
    /// Check option consistency once, at filter construction
    pub fn validate(&self) -> KalmanResult<()> {
        if self.ikf_iterations == 0 {
            return Err(KalmanError::Config(
                "IKF iterations must be >= 1".to_string(),
            ));
        }
        if self.verify_analytic_jacobians && self.jacobian_verify_threshold <= 0.0 {
            return Err(KalmanError::Config(
                "Jacobian verification threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
