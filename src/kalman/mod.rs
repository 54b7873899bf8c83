// Kalman filter engine module

pub mod filter;
pub mod jacobian;
pub mod model;
pub mod options;
pub mod state;

// Re-exports
pub use filter::KalmanFilter;
pub use jacobian::{estimate_jacobian, verify_jacobian};
pub use model::{InverseObservation, KalmanModel};
pub use options::{KFMethod, KFOptions};
pub use state::KalmanState;
