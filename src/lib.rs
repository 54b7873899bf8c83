//! rust_kalman - generic EKF/IKF estimation engine for SLAM
//!
//! This crate provides an Extended/Iterated Kalman Filter over a joint
//! vehicle-plus-landmarks state, driven through a model trait supplying
//! the transition, observation, and inverse-observation hooks, together
//! with a 2D range-bearing SLAM model built on top of it.

// Core modules
pub mod common;
pub mod kalman;

// Model modules
pub mod slam;

// Re-export common types for convenience
pub use common::{KalmanError, KalmanResult};
pub use kalman::{
    InverseObservation, KFMethod, KFOptions, KalmanFilter, KalmanModel, KalmanState,
};
pub use slam::{RangeBearingConfig, RangeBearingModel};
