//! Joint state vector and covariance store
//!
//! Holds the filter mean and covariance as one vehicle segment followed by
//! a variable number of fixed-size landmark segments, and exposes zero-copy
//! views of the sub-blocks the engine works with.

use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView};

use crate::common::{KalmanError, KalmanResult};

/// Joint mean/covariance of a vehicle plus an open-ended set of landmarks.
///
/// State vector layout: `[vehicle (V); lm0 (F); lm1 (F); ...]`.
/// A `feat_size` of zero denotes a localization-only filter that never
/// holds landmark segments.
#[derive(Debug, Clone)]
pub struct KalmanState {
    /// Joint state mean
    pub x: DVector<f64>,
    /// Joint state covariance
    pub p: DMatrix<f64>,
    veh_size: usize,
    feat_size: usize,
}

impl KalmanState {
    /// Create an empty (vehicle-only) state with zero mean and covariance
    pub fn new(veh_size: usize, feat_size: usize) -> Self {
        Self {
            x: DVector::zeros(veh_size),
            p: DMatrix::zeros(veh_size, veh_size),
            veh_size,
            feat_size,
        }
    }

    /// Create a state from an initial mean and covariance.
    ///
    /// The mean may already contain landmark segments; its length must be
    /// segment-aligned and the covariance square of matching side.
    pub fn from_initial(
        veh_size: usize,
        feat_size: usize,
        x0: DVector<f64>,
        p0: DMatrix<f64>,
    ) -> KalmanResult<Self> {
        let state = Self {
            x: x0,
            p: p0,
            veh_size,
            feat_size,
        };
        state.check_dimensions()?;
        Ok(state)
    }

    /// Drop all landmarks and restore the given vehicle-only estimate
    pub fn reset(&mut self, x0: DVector<f64>, p0: DMatrix<f64>) -> KalmanResult<()> {
        if x0.len() != self.veh_size {
            return Err(KalmanError::Config(format!(
                "reset mean has length {}, expected vehicle size {}",
                x0.len(),
                self.veh_size
            )));
        }
        self.x = x0;
        self.p = p0;
        self.check_dimensions()
    }

    pub fn veh_size(&self) -> usize {
        self.veh_size
    }

    pub fn feat_size(&self) -> usize {
        self.feat_size
    }

    /// Total length of the joint state vector
    pub fn dim(&self) -> usize {
        self.x.len()
    }

    /// Number of landmark segments currently in the state
    pub fn num_landmarks(&self) -> usize {
        if self.feat_size == 0 {
            0
        } else {
            (self.x.len() - self.veh_size) / self.feat_size
        }
    }

    /// Offset of landmark `i` inside the state vector
    pub fn landmark_offset(&self, i: usize) -> usize {
        self.veh_size + i * self.feat_size
    }

    /// Vehicle segment of the mean
    pub fn vehicle(&self) -> DVectorView<f64> {
        self.x.rows(0, self.veh_size)
    }

    /// Mean of landmark `i`
    pub fn landmark(&self, i: usize) -> DVectorView<f64> {
        self.x.rows(self.landmark_offset(i), self.feat_size)
    }

    /// Vehicle covariance block `P_vv`
    pub fn p_vv(&self) -> DMatrixView<f64> {
        self.p.view((0, 0), (self.veh_size, self.veh_size))
    }

    /// Cross-covariance block between the vehicle and landmark `i` (V x F)
    pub fn p_vehicle_landmark(&self, i: usize) -> DMatrixView<f64> {
        self.p
            .view((0, self.landmark_offset(i)), (self.veh_size, self.feat_size))
    }

    /// Cross-covariance block between landmark `i` and the vehicle (F x V)
    pub fn p_landmark_vehicle(&self, i: usize) -> DMatrixView<f64> {
        self.p
            .view((self.landmark_offset(i), 0), (self.feat_size, self.veh_size))
    }

    /// Cross-covariance block between landmarks `i` and `j` (F x F)
    pub fn p_landmarks(&self, i: usize, j: usize) -> DMatrixView<f64> {
        self.p.view(
            (self.landmark_offset(i), self.landmark_offset(j)),
            (self.feat_size, self.feat_size),
        )
    }

    /// Verify the `(len - V) % F == 0` segment alignment invariant
    pub fn check_alignment(&self) -> KalmanResult<()> {
        if self.x.len() < self.veh_size {
            return Err(KalmanError::Config(format!(
                "state length {} shorter than vehicle size {}",
                self.x.len(),
                self.veh_size
            )));
        }
        if self.feat_size > 0 && (self.x.len() - self.veh_size) % self.feat_size != 0 {
            return Err(KalmanError::Config(format!(
                "state length {} is not aligned to landmark segments of size {}",
                self.x.len(),
                self.feat_size
            )));
        }
        if self.feat_size == 0 && self.x.len() != self.veh_size {
            return Err(KalmanError::Config(
                "localization-only filter must not hold landmark segments".to_string(),
            ));
        }
        Ok(())
    }

    fn check_dimensions(&self) -> KalmanResult<()> {
        self.check_alignment()?;
        if self.p.nrows() != self.x.len() || self.p.ncols() != self.x.len() {
            return Err(KalmanError::Config(format!(
                "covariance is {}x{}, expected side {} to match the state length",
                self.p.nrows(),
                self.p.ncols(),
                self.x.len()
            )));
        }
        Ok(())
    }

    /// Append one landmark segment with the given mean; the new covariance
    /// rows/columns are zero-filled and must be set by the caller.
    /// Returns the index of the new landmark.
    pub fn grow_one_landmark(&mut self, mean: DVectorView<f64>) -> KalmanResult<usize> {
        if self.feat_size == 0 {
            return Err(KalmanError::Config(
                "cannot insert landmarks into a localization-only filter".to_string(),
            ));
        }
        if mean.len() != self.feat_size {
            return Err(KalmanError::Config(format!(
                "new landmark mean has length {}, expected {}",
                mean.len(),
                self.feat_size
            )));
        }
        let old_len = self.x.len();
        let new_index = self.num_landmarks();

        self.x = self.x.clone().resize_vertically(old_len + self.feat_size, 0.0);
        for q in 0..self.feat_size {
            self.x[old_len + q] = mean[q];
        }
        self.p = self
            .p
            .clone()
            .resize(old_len + self.feat_size, old_len + self.feat_size, 0.0);
        Ok(new_index)
    }

    /// Largest absolute asymmetry `max |P - P^T|`
    pub fn max_asymmetry(&self) -> f64 {
        let n = self.p.nrows();
        let mut worst: f64 = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                worst = worst.max((self.p[(i, j)] - self.p[(j, i)]).abs());
            }
        }
        worst
    }

    /// Re-impose symmetry in place: P <- (P + P^T) / 2
    pub fn symmetrize(&mut self) {
        let pt = self.p.transpose();
        self.p = (&self.p + pt) * 0.5;
    }
}
