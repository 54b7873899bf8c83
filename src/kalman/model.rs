//! Hook contract between the filter engine and a concrete vehicle/sensor model
//!
//! The engine owns a value implementing [`KalmanModel`] and drives the whole
//! predict/observe/update cycle through these hooks. Dimensions are reported
//! at runtime; a `feature_size` of zero turns the engine into a plain
//! localization filter with a single system-wide observation.

use nalgebra::{DMatrix, DVector};

/// Output of the inverse observation model for one new landmark.
pub struct InverseObservation {
    /// Mean of the new landmark segment (length F)
    pub mean: DVector<f64>,
    /// Jacobian of the inverse model w.r.t. the vehicle state (F x V)
    pub jac_vehicle: DMatrix<f64>,
    /// Jacobian of the inverse model w.r.t. the raw observation (F x O)
    pub jac_observation: DMatrix<f64>,
    /// Pre-combined observation-noise contribution (F x F). When `Some`,
    /// it replaces `jac_observation * R * jac_observation^T` in the new
    /// landmark's covariance block.
    pub noise_term: Option<DMatrix<f64>>,
}

/// Vehicle transition, sensor observation, and bookkeeping hooks.
///
/// Jacobian hooks returning `None` make the engine fall back to central
/// finite differences using the increment vectors below. The state vector
/// arguments passed to `observation_model` and friends may be perturbed
/// scratch copies; models must compute from the argument, never from any
/// state cached elsewhere.
pub trait KalmanModel {
    /// Size of the vehicle segment (V)
    fn vehicle_size(&self) -> usize;
    /// Size of one observation (O)
    fn observation_size(&self) -> usize;
    /// Size of one landmark segment (F); zero for localization-only filters
    fn feature_size(&self) -> usize;
    /// Size of the control/odometry input (A)
    fn action_size(&self) -> usize;

    /// Control/odometry input for this cycle
    fn get_action(&mut self) -> DVector<f64>;

    /// Propagate the vehicle segment one step.
    ///
    /// Returns the new vehicle mean and a skip flag; when the flag is set
    /// the engine leaves mean and covariance untouched for this cycle
    /// (used to avoid double prediction on the very first cycle).
    fn transition_model(
        &self,
        action: &DVector<f64>,
        vehicle: &DVector<f64>,
    ) -> (DVector<f64>, bool);

    /// Analytic transition Jacobian w.r.t. the vehicle state (V x V)
    fn transition_jacobian(
        &self,
        _action: &DVector<f64>,
        _vehicle: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        None
    }

    /// Process noise covariance Q (V x V)
    fn transition_noise(&self) -> DMatrix<f64>;

    /// Per-component finite-difference steps for the transition Jacobian
    fn transition_increments(&self) -> DVector<f64>;

    /// Predict the observation of each listed landmark from the joint state.
    ///
    /// For localization-only filters the engine always passes `&[0]` and
    /// expects the single system-wide prediction.
    fn observation_model(&self, x: &DVector<f64>, landmark_idxs: &[usize]) -> Vec<DVector<f64>>;

    /// Analytic observation Jacobians `(Hx: O x V, Hy: O x F)` for one landmark
    fn observation_jacobians(
        &self,
        _x: &DVector<f64>,
        _landmark_idx: usize,
    ) -> Option<(DMatrix<f64>, DMatrix<f64>)> {
        None
    }

    /// Observation noise covariance R (O x O)
    fn observation_noise(&self) -> DMatrix<f64>;

    /// Finite-difference steps for the observation Jacobians:
    /// one vector for the vehicle segment, one for a landmark segment
    fn observation_increments(&self) -> (DVector<f64>, DVector<f64>);

    /// Cheap pre-filter deciding which landmarks get full Jacobian and
    /// innovation-covariance treatment this cycle. Defaults to all of them.
    fn precompute_prediction_subset(&self, predictions: &[DVector<f64>]) -> Vec<usize> {
        (0..predictions.len()).collect()
    }

    /// Innovation `a - b`; override to wrap angular components
    fn subtract_observations(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        a - b
    }

    /// Deliver this cycle's observations together with their association:
    /// `Some(idx)` maps an observation onto landmark `idx`, `None` marks a
    /// new landmark. The mapping must have one entry per observation unless
    /// the filter is localization-only and both are empty.
    fn get_observations_and_associate(
        &mut self,
        predictions: &[DVector<f64>],
        innovation_cov: &DMatrix<f64>,
        predicted_idxs: &[usize],
        observation_noise: &DMatrix<f64>,
    ) -> (Vec<DVector<f64>>, Vec<Option<usize>>);

    /// Inverse observation model for landmark initialization.
    ///
    /// Mapping filters must implement this; returning `None` while an
    /// observation is flagged as a new landmark is a configuration error.
    fn inverse_observation_model(
        &self,
        _x: &DVector<f64>,
        _observation: &DVector<f64>,
    ) -> Option<InverseObservation> {
        None
    }

    /// Notification fired once per inserted landmark, before the covariance
    /// blocks of the new segment are filled
    fn on_new_landmark_added(&mut self, _obs_idx: usize, _landmark_idx: usize) {}

    /// Normalize the state in place (e.g. wrap angles); must not touch covariance
    fn normalize_state(&self, _x: &mut DVector<f64>) {}

    /// Bookkeeping hook after a complete cycle
    fn post_iteration(&mut self) {}
}
