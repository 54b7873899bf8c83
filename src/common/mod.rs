//! Common error definitions for rust_kalman
//!
//! This module provides the foundational error types used across
//! the filter engine and the bundled models.

pub mod error;

pub use error::*;
