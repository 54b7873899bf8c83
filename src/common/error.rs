//! Error types for rust_kalman

use std::fmt;

use nalgebra::DMatrix;

/// Main error type for the Kalman filter engine
#[derive(Debug)]
pub enum KalmanError {
    /// Invalid configuration (options, dimensions, noise structure)
    Config(String),
    /// Analytic and numeric Jacobians disagree beyond the configured threshold.
    /// Both matrices are kept for diagnosis.
    JacobianMismatch {
        /// Which Jacobian failed verification ("transition", "observation Hx", ...)
        which: &'static str,
        numeric: DMatrix<f64>,
        analytic: DMatrix<f64>,
    },
    /// Numerical computation failed (singular innovation covariance,
    /// negative variance on the covariance diagonal, etc.)
    Numerical(String),
    /// Data association produced an inconsistent result
    Association(String),
    /// A reserved update method was selected
    NotImplemented(&'static str),
}

impl fmt::Display for KalmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KalmanError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KalmanError::JacobianMismatch { which, numeric, analytic } => write!(
                f,
                "User analytic {} Jacobian is wrong.\nNumeric:\n{}\nAnalytic:\n{}\nDiff:\n{}",
                which,
                numeric,
                analytic,
                numeric - analytic
            ),
            KalmanError::Numerical(msg) => write!(f, "Numerical error: {}", msg),
            KalmanError::Association(msg) => write!(f, "Association error: {}", msg),
            KalmanError::NotImplemented(what) => write!(f, "Not implemented: {}", what),
        }
    }
}

impl std::error::Error for KalmanError {}

/// Result type alias for filter operations
pub type KalmanResult<T> = Result<T, KalmanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KalmanError::Config("IKF iterations must be >= 1".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: IKF iterations must be >= 1"
        );
    }

    #[test]
    fn test_jacobian_mismatch_carries_both_matrices() {
        let numeric = DMatrix::from_element(2, 2, 1.0);
        let analytic = DMatrix::from_element(2, 2, 0.0);
        let err = KalmanError::JacobianMismatch {
            which: "transition",
            numeric,
            analytic,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("transition"));
        assert!(msg.contains("Numeric"));
        assert!(msg.contains("Analytic"));
    }
}
