// SLAM models built on the Kalman filter engine

pub mod range_bearing;

pub use range_bearing::{RangeBearingConfig, RangeBearingModel};
