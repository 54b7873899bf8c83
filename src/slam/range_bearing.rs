//! 2D range-bearing SLAM model
//!
//! Differential-drive vehicle `[x, y, yaw]` observing point landmarks
//! `[x, y]` through a range/bearing sensor. Implements every hook of the
//! filter engine: velocity motion model with analytic Jacobians, bearing-
//! wrapped innovation, Mahalanobis-gated nearest-neighbour association,
//! and the inverse observation model used for landmark initialization.
//!
//! Reference:
//! - Probabilistic Robotics (Thrun, Burgard, Fox)

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};

use crate::kalman::{InverseObservation, KalmanModel};

// State dimensions
const STATE_SIZE: usize = 3; // vehicle [x, y, yaw]
const LM_SIZE: usize = 2; // landmark [x, y]
const OBS_SIZE: usize = 2; // observation [range, bearing]
const ACT_SIZE: usize = 2; // control [v, yaw_rate]

/// Normalize angle to [-pi, pi]
fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > PI {
        a -= 2.0 * PI;
    }
    while a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Configuration for the range-bearing SLAM model
#[derive(Debug, Clone)]
pub struct RangeBearingConfig {
    /// Time step [s]
    pub dt: f64,
    /// Control noise covariance (control space: v, yaw_rate)
    pub q_control: DMatrix<f64>,
    /// Observation noise covariance (range, bearing)
    pub r: DMatrix<f64>,
    /// Maximum sensor range [m]; landmarks predicted beyond it are not
    /// selected for full Jacobian/covariance treatment
    pub max_range: f64,
    /// Mahalanobis distance threshold for data association
    pub gate: f64,
}

impl Default for RangeBearingConfig {
    fn default() -> Self {
        let deg5 = (5.0_f64).to_radians();
        Self {
            dt: 0.1,
            q_control: DMatrix::from_diagonal(&DVector::from_vec(vec![0.2, deg5 * deg5])),
            r: DMatrix::from_diagonal(&DVector::from_vec(vec![0.3, deg5 * deg5])),
            max_range: 20.0,
            // chi-square 95% for 2 DOF
            gate: 4.0,
        }
    }
}

/// Range-bearing SLAM model for the Kalman filter engine.
///
/// The host pushes the control input and the raw observations for the
/// cycle, then calls `run_one_iteration` on the filter.
pub struct RangeBearingModel {
    config: RangeBearingConfig,
    control: DVector<f64>,
    pending: Vec<DVector<f64>>,
    /// Skip covariance/mean prediction on the next cycle (first cycle of a
    /// freshly initialized filter)
    pub skip_next_prediction: bool,
    inserted: Vec<(usize, usize)>,
}

impl RangeBearingModel {
    pub fn new(config: RangeBearingConfig) -> Self {
        Self {
            config,
            control: DVector::zeros(ACT_SIZE),
            pending: Vec::new(),
            skip_next_prediction: false,
            inserted: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RangeBearingConfig::default())
    }

    /// Set the control input [v, yaw_rate] for the next cycle
    pub fn set_control(&mut self, v: f64, yaw_rate: f64) {
        self.control = DVector::from_vec(vec![v, yaw_rate]);
    }

    /// Queue one raw observation [range, bearing] for the next cycle
    pub fn push_observation(&mut self, range: f64, bearing: f64) {
        self.pending.push(DVector::from_vec(vec![range, bearing]));
    }

    /// Log of `(observation index, landmark index)` insertions
    pub fn inserted_landmarks(&self) -> &[(usize, usize)] {
        &self.inserted
    }

    fn predict_one(&self, x: &DVector<f64>, lm_idx: usize) -> DVector<f64> {
        let off = STATE_SIZE + lm_idx * LM_SIZE;
        let dx = x[off] - x[0];
        let dy = x[off + 1] - x[1];
        let d = (dx * dx + dy * dy).sqrt();
        let angle = normalize_angle(dy.atan2(dx) - x[2]);
        DVector::from_vec(vec![d, angle])
    }
}

impl KalmanModel for RangeBearingModel {
    fn vehicle_size(&self) -> usize {
        STATE_SIZE
    }

    fn observation_size(&self) -> usize {
        OBS_SIZE
    }

    fn feature_size(&self) -> usize {
        LM_SIZE
    }

    fn action_size(&self) -> usize {
        ACT_SIZE
    }

    fn get_action(&mut self) -> DVector<f64> {
        self.control.clone()
    }

    fn transition_model(
        &self,
        action: &DVector<f64>,
        vehicle: &DVector<f64>,
    ) -> (DVector<f64>, bool) {
        let dt = self.config.dt;
        let new_vehicle = DVector::from_vec(vec![
            vehicle[0] + action[0] * dt * vehicle[2].cos(),
            vehicle[1] + action[0] * dt * vehicle[2].sin(),
            normalize_angle(vehicle[2] + action[1] * dt),
        ]);
        (new_vehicle, self.skip_next_prediction)
    }

    fn transition_jacobian(
        &self,
        action: &DVector<f64>,
        vehicle: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        let dt = self.config.dt;
        let yaw = vehicle[2];
        let v = action[0];
        Some(DMatrix::from_row_slice(
            3,
            3,
            &[
                1.0, 0.0, -dt * v * yaw.sin(),
                0.0, 1.0, dt * v * yaw.cos(),
                0.0, 0.0, 1.0,
            ],
        ))
    }

    /// Process noise in state space: V Q_u V^T with V the Jacobian of the
    /// motion model w.r.t. the control input
    fn transition_noise(&self) -> DMatrix<f64> {
        let dt = self.config.dt;
        // Linearization point: the noise is dominated by the yaw-independent
        // terms, so the control Jacobian at yaw = 0 is used.
        let v_mat = DMatrix::from_row_slice(3, 2, &[dt, 0.0, 0.0, 0.0, 0.0, dt]);
        &v_mat * &self.config.q_control * v_mat.transpose()
    }

    fn transition_increments(&self) -> DVector<f64> {
        DVector::from_element(STATE_SIZE, 1e-6)
    }

    fn observation_model(&self, x: &DVector<f64>, landmark_idxs: &[usize]) -> Vec<DVector<f64>> {
        landmark_idxs
            .iter()
            .map(|&idx| self.predict_one(x, idx))
            .collect()
    }

    fn observation_jacobians(
        &self,
        x: &DVector<f64>,
        landmark_idx: usize,
    ) -> Option<(DMatrix<f64>, DMatrix<f64>)> {
        let off = STATE_SIZE + landmark_idx * LM_SIZE;
        let dx = x[off] - x[0];
        let dy = x[off + 1] - x[1];
        let d2 = dx * dx + dy * dy;
        let d = d2.sqrt();

        let hx = DMatrix::from_row_slice(
            2,
            3,
            &[
                -dx / d, -dy / d, 0.0,
                dy / d2, -dx / d2, -1.0,
            ],
        );
        let hy = DMatrix::from_row_slice(
            2,
            2,
            &[
                dx / d, dy / d,
                -dy / d2, dx / d2,
            ],
        );
        Some((hx, hy))
    }

    fn observation_noise(&self) -> DMatrix<f64> {
        self.config.r.clone()
    }

    fn observation_increments(&self) -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_element(STATE_SIZE, 1e-6),
            DVector::from_element(LM_SIZE, 1e-6),
        )
    }

    /// Jacobians and covariances are only worth computing for landmarks the
    /// sensor can actually see
    fn precompute_prediction_subset(&self, predictions: &[DVector<f64>]) -> Vec<usize> {
        predictions
            .iter()
            .enumerate()
            .filter(|(_, pred)| pred[0] <= self.config.max_range)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn subtract_observations(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![a[0] - b[0], normalize_angle(a[1] - b[1])])
    }

    /// Nearest-neighbour association by Mahalanobis distance against the
    /// predicted landmarks, gated at `config.gate`. Observations that pass
    /// no gate are flagged as new landmarks.
    fn get_observations_and_associate(
        &mut self,
        predictions: &[DVector<f64>],
        innovation_cov: &DMatrix<f64>,
        predicted_idxs: &[usize],
        _observation_noise: &DMatrix<f64>,
    ) -> (Vec<DVector<f64>>, Vec<Option<usize>>) {
        let observations = self.pending.clone();
        let mut association = Vec::with_capacity(observations.len());

        for z in &observations {
            let mut min_dist = f64::MAX;
            let mut min_idx = None;

            for (i, &map_idx) in predicted_idxs.iter().enumerate() {
                let y = self.subtract_observations(z, &predictions[map_idx]);
                let sii = DMatrix::from_fn(OBS_SIZE, OBS_SIZE, |a, b| {
                    innovation_cov[(OBS_SIZE * i + a, OBS_SIZE * i + b)]
                });
                if let Some(sii_inv) = sii.try_inverse() {
                    let mahal = (y.transpose() * sii_inv * &y)[(0, 0)];
                    if mahal < min_dist {
                        min_dist = mahal;
                        min_idx = Some(map_idx);
                    }
                }
            }

            if min_dist < self.config.gate * self.config.gate {
                association.push(min_idx);
            } else {
                association.push(None);
            }
        }
        (observations, association)
    }

    fn inverse_observation_model(
        &self,
        x: &DVector<f64>,
        observation: &DVector<f64>,
    ) -> Option<InverseObservation> {
        let d = observation[0];
        let heading = x[2] + observation[1];
        let c = heading.cos();
        let s = heading.sin();

        let mean = DVector::from_vec(vec![x[0] + d * c, x[1] + d * s]);

        // Jacobian w.r.t. vehicle pose [x, y, yaw]
        let jac_vehicle = DMatrix::from_row_slice(
            2,
            3,
            &[
                1.0, 0.0, -d * s,
                0.0, 1.0, d * c,
            ],
        );
        // Jacobian w.r.t. observation [range, bearing]
        let jac_observation = DMatrix::from_row_slice(
            2,
            2,
            &[
                c, -d * s,
                s, d * c,
            ],
        );

        Some(InverseObservation {
            mean,
            jac_vehicle,
            jac_observation,
            noise_term: None,
        })
    }

    fn on_new_landmark_added(&mut self, obs_idx: usize, landmark_idx: usize) {
        self.inserted.push((obs_idx, landmark_idx));
    }

    fn normalize_state(&self, x: &mut DVector<f64>) {
        x[2] = normalize_angle(x[2]);
    }

    fn post_iteration(&mut self) {
        self.pending.clear();
        self.skip_next_prediction = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::jacobian::estimate_jacobian;
    use crate::kalman::{KFOptions, KalmanFilter};
    use nalgebra::{DMatrix, DVector};

    fn exact_config() -> RangeBearingConfig {
        RangeBearingConfig {
            dt: 0.1,
            q_control: DMatrix::zeros(2, 2),
            r: DMatrix::from_diagonal(&DVector::from_vec(vec![1e-4, 1e-4])),
            max_range: 20.0,
            gate: 4.0,
        }
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(0.0) - 0.0).abs() < 1e-10);
        assert!((normalize_angle(2.0 * PI) - 0.0).abs() < 1e-10);
        assert!((normalize_angle(-2.0 * PI) - 0.0).abs() < 1e-10);
        assert!((normalize_angle(3.0 * PI).abs() - PI).abs() < 1e-10);
    }

    #[test]
    fn test_motion_model_moves_forward() {
        let model = RangeBearingModel::with_defaults();
        let u = DVector::from_vec(vec![1.0, 0.0]);
        let x = DVector::zeros(3);
        let (new_x, skip) = model.transition_model(&u, &x);
        assert!(!skip);
        assert!(new_x[0] > 0.0);
        assert!(new_x[1].abs() < 1e-10);
        assert!(new_x[2].abs() < 1e-10);
    }

    #[test]
    fn test_transition_jacobian_matches_numeric() {
        let model = RangeBearingModel::with_defaults();
        let u = DVector::from_vec(vec![1.0, 0.1]);
        let x = DVector::from_vec(vec![0.5, -0.2, 0.3]);
        let analytic = model.transition_jacobian(&u, &x).unwrap();
        let increments = model.transition_increments();
        let numeric =
            estimate_jacobian(&x, &increments, |xv| model.transition_model(&u, xv).0).unwrap();
        let diff: f64 = (&numeric - &analytic).iter().map(|v| v.abs()).sum();
        assert!(diff < 1e-6, "transition Jacobian diff {}", diff);
    }

    #[test]
    fn test_observation_jacobians_match_numeric() {
        let model = RangeBearingModel::with_defaults();
        // vehicle at (0.5, -0.2, 0.3), one landmark at (5, 4)
        let x = DVector::from_vec(vec![0.5, -0.2, 0.3, 5.0, 4.0]);
        let (hx, hy) = model.observation_jacobians(&x, 0).unwrap();

        let x_vehicle = DVector::from_vec(vec![0.5, -0.2, 0.3]);
        let mut scratch = x.clone();
        let numeric_hx = estimate_jacobian(
            &x_vehicle,
            &DVector::from_element(3, 1e-6),
            |xv| {
                for k in 0..3 {
                    scratch[k] = xv[k];
                }
                model.observation_model(&scratch, &[0])[0].clone()
            },
        )
        .unwrap();
        let diff_hx: f64 = (&numeric_hx - &hx).iter().map(|v| v.abs()).sum();
        assert!(diff_hx < 1e-6, "Hx diff {}", diff_hx);

        let x_feat = DVector::from_vec(vec![5.0, 4.0]);
        let mut scratch = x.clone();
        let numeric_hy = estimate_jacobian(
            &x_feat,
            &DVector::from_element(2, 1e-6),
            |xf| {
                for k in 0..2 {
                    scratch[3 + k] = xf[k];
                }
                model.observation_model(&scratch, &[0])[0].clone()
            },
        )
        .unwrap();
        let diff_hy: f64 = (&numeric_hy - &hy).iter().map(|v| v.abs()).sum();
        assert!(diff_hy < 1e-6, "Hy diff {}", diff_hy);
    }

    #[test]
    fn test_inverse_observation_round_trip() {
        let model = RangeBearingModel::with_defaults();
        let x = DVector::from_vec(vec![1.0, 2.0, 0.5]);
        let z = DVector::from_vec(vec![5.0, 0.3]);
        let inv = model.inverse_observation_model(&x, &z).unwrap();

        // Re-observe the initialized landmark from the same pose
        let joint = DVector::from_vec(vec![1.0, 2.0, 0.5, inv.mean[0], inv.mean[1]]);
        let pred = model.observation_model(&joint, &[0]);
        assert!((pred[0][0] - z[0]).abs() < 1e-10);
        assert!(normalize_angle(pred[0][1] - z[1]).abs() < 1e-10);
    }

    #[test]
    fn test_slam_insert_then_reobserve() {
        let mut model = RangeBearingModel::new(exact_config());
        model.push_observation(5.0, 0.0);
        let mut filter = KalmanFilter::with_initial_state(
            model,
            KFOptions::default(),
            DVector::zeros(3),
            DMatrix::zeros(3, 3),
        )
        .unwrap();

        // First cycle: landmark 5 m ahead gets inserted
        filter.run_one_iteration().unwrap();
        assert_eq!(filter.state().num_landmarks(), 1);
        let lm = filter.state().landmark(0).clone_owned();
        assert!((lm[0] - 5.0).abs() < 1e-6);
        assert!(lm[1].abs() < 1e-6);
        assert_eq!(filter.model().inserted_landmarks(), &[(0, 0)]);

        // Second cycle: same observation, no motion -> associated, tiny change
        filter.model_mut().set_control(0.0, 0.0);
        filter.model_mut().push_observation(5.0, 0.0);
        filter.run_one_iteration().unwrap();
        assert_eq!(filter.state().num_landmarks(), 1);
        let lm = filter.state().landmark(0).clone_owned();
        assert!((lm[0] - 5.0).abs() < 1e-3);
        assert!(lm[1].abs() < 1e-3);
        assert!(filter.state().max_asymmetry() < 1e-9);
    }

    #[test]
    fn test_prediction_subset_gates_by_range() {
        let model = RangeBearingModel::with_defaults();
        let predictions = vec![
            DVector::from_vec(vec![5.0, 0.0]),
            DVector::from_vec(vec![50.0, 0.0]),
            DVector::from_vec(vec![19.0, 1.0]),
        ];
        assert_eq!(model.precompute_prediction_subset(&predictions), vec![0, 2]);
    }
}
