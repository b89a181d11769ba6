//! Capsule networks with dynamic routing.
//!
//! Layers carry explicit forward and backward passes over `ndarray` tensors.
//! [`train_data`] provides CIFAR-10 and generated symmetric forms together
//! with the training loop; [`evaluation`] holds the test report, latent
//! manipulation, layer probes and the adversarial attack driver.

pub mod cli;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod telemetry;
pub mod train_data;

pub use error::{CapsNetError, Result};
