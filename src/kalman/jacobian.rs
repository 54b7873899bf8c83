//! Numeric Jacobian estimation by central finite differences
//!
//! Fallback used whenever a model does not supply an analytic Jacobian, and
//! the reference the analytic one is cross-validated against when requested.

use nalgebra::{DMatrix, DVector};

use crate::common::{KalmanError, KalmanResult};

/// Estimate the Jacobian of `f` at `x0` by central differences.
///
/// `increments[j]` is the perturbation step for component `j`; every step
/// must be positive. The output has one column per component of `x0` and
/// one row per component of `f(x0)`.
pub fn estimate_jacobian<F>(
    x0: &DVector<f64>,
    increments: &DVector<f64>,
    mut f: F,
) -> KalmanResult<DMatrix<f64>>
where
    F: FnMut(&DVector<f64>) -> DVector<f64>,
{
    if increments.len() != x0.len() {
        return Err(KalmanError::Config(format!(
            "{} finite-difference increments supplied for {} state components",
            increments.len(),
            x0.len()
        )));
    }
    for j in 0..increments.len() {
        if increments[j] <= 0.0 {
            return Err(KalmanError::Config(format!(
                "finite-difference increment {} must be positive (got {})",
                j, increments[j]
            )));
        }
    }

    let mut x = x0.clone();
    let mut jacobian = DMatrix::zeros(0, x0.len());
    for j in 0..x0.len() {
        let h = increments[j];

        x[j] = x0[j] + h;
        let f_plus = f(&x);
        x[j] = x0[j] - h;
        let f_minus = f(&x);
        x[j] = x0[j];

        if jacobian.nrows() == 0 {
            jacobian = DMatrix::zeros(f_plus.len(), x0.len());
        }
        if f_plus.len() != jacobian.nrows() || f_minus.len() != jacobian.nrows() {
            return Err(KalmanError::Numerical(
                "model output changed dimension during Jacobian estimation".to_string(),
            ));
        }
        for i in 0..jacobian.nrows() {
            jacobian[(i, j)] = (f_plus[i] - f_minus[i]) / (2.0 * h);
        }
    }
    Ok(jacobian)
}

/// Compare a numeric Jacobian against a user-supplied analytic one.
///
/// The comparison metric is the sum of absolute element differences;
/// exceeding `threshold` means the analytic derivative is wrong and the
/// cycle must abort with both matrices attached for diagnosis.
pub fn verify_jacobian(
    which: &'static str,
    numeric: &DMatrix<f64>,
    analytic: &DMatrix<f64>,
    threshold: f64,
) -> KalmanResult<()> {
    if numeric.shape() != analytic.shape() {
        return Err(KalmanError::Config(format!(
            "analytic {} Jacobian is {}x{}, numeric estimate is {}x{}",
            which,
            analytic.nrows(),
            analytic.ncols(),
            numeric.nrows(),
            numeric.ncols()
        )));
    }
    let diff_sum: f64 = (numeric - analytic).iter().map(|v| v.abs()).sum();
    if diff_sum > threshold {
        return Err(KalmanError::JacobianMismatch {
            which,
            numeric: numeric.clone(),
            analytic: analytic.clone(),
        });
    }
    Ok(())
}
