pub mod builder;
pub mod capsule;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod decoder;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod routing;

pub use builder::ModelBuilder;
pub use checkpoint::{load_weights, save_weights};
pub use config::{AdamConfig, LossConfig, NetworkConfig, TrainingConfig};
pub use core::{BatchStats, CapsNet, CapsNetOutput, Phase};
pub use loss::{CombinedLoss, LossFunction, MarginLoss, Metrics};
pub use optimizer::{Adam, LRScheduler, Optimizer};
