//! Command-line arguments of the two entry points.
//!
//! Both argument sets serialise to `args.txt` through [`write_args`](crate::train_data::write_args),
//! so field names double as the keys written there.

use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::model::config::{AdamConfig, LossConfig, TrainingConfig};

#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about = "Capsule network on CIFAR-10")]
pub struct CifarArgs {
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Max. number of training examples to use
    #[arg(long)]
    pub max_num_samples: Option<usize>,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.001)]
    pub lr: f32,

    /// Multiplied into the learning rate after every epoch
    #[arg(long, default_value_t = 0.9)]
    pub lr_decay: f32,

    /// Coefficient of the decoder loss
    #[arg(long, default_value_t = 0.0005)]
    pub scale_reconstruction_loss: f32,

    /// Routing iterations, at least 1
    #[arg(short = 'r', long, default_value_t = 3)]
    pub num_routing: usize,

    /// Fraction of pixels to shift at most in each direction
    #[arg(long, default_value_t = 0.1)]
    pub shift_fraction: f32,

    /// Rows of the random crop
    #[arg(long, requires = "crop_y")]
    pub crop_x: Option<usize>,

    /// Columns of the random crop
    #[arg(long, requires = "crop_x")]
    pub crop_y: Option<usize>,

    /// Save an image of the first adversarial example
    #[arg(long)]
    pub debug: bool,

    #[arg(long, default_value = "./result-capsnet")]
    pub save_dir: PathBuf,

    /// Test the trained model on the test split
    #[arg(short = 't', long)]
    pub testing: bool,

    /// Run adversarial attacks on the trained model (provide weights with -w)
    #[arg(short = 'f', long, conflicts_with = "testing")]
    pub fool: bool,

    /// (Test only) Rotate test images randomly within this many degrees
    #[arg(long, default_value_t = 0.0)]
    pub rotation_range: f32,

    /// Class whose capsule is manipulated
    #[arg(long, default_value_t = 5)]
    pub manipulate: usize,

    /// Saved weights, required for meaningful testing
    #[arg(short = 'w', long)]
    pub weights: Option<PathBuf>,

    /// Directory holding the CIFAR-10 binary batches
    #[arg(long, default_value = "./data/cifar-10-batches-bin")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 500)]
    pub max_num_attacks: usize,

    /// Attack step size
    #[arg(long, default_value_t = 0.01)]
    pub epsilon: f32,
}

impl CifarArgs {
    pub fn crop(&self) -> Option<(usize, usize)> {
        self.crop_x.zip(self.crop_y)
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            batch_size: self.batch_size,
            learning_rate: self.lr,
            lr_decay: self.lr_decay,
            num_epochs: self.epochs,
            shift_fraction: self.shift_fraction,
            crop: self.crop(),
            save_best_only: true,
            loss_config: LossConfig {
                reconstruction_weight: self.scale_reconstruction_loss,
                ..LossConfig::default()
            },
            optimizer: AdamConfig::default(),
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about = "Capsule network on synthetic symmetric forms")]
pub struct SymmetricArgs {
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long)]
    pub max_num_samples: Option<usize>,

    #[arg(long, default_value_t = 0.001)]
    pub lr: f32,

    #[arg(long, default_value_t = 0.9)]
    pub lr_decay: f32,

    #[arg(long, default_value_t = 1.0)]
    pub scale_reconstruction_loss: f32,

    #[arg(short = 'r', long, default_value_t = 3)]
    pub num_routing: usize,

    #[arg(long, default_value_t = 0.1)]
    pub shift_fraction: f32,

    /// (Test only) Save the forms fed to the capsule probes as an image
    #[arg(long)]
    pub debug: bool,

    #[arg(long, default_value = "./result-capsnet")]
    pub save_dir: PathBuf,

    /// Probe the trained model instead of training
    #[arg(short = 't', long)]
    pub testing: bool,

    #[arg(long, default_value_t = 0.0)]
    pub rotation_range: f32,

    /// Form class used for latent manipulation and the probes
    #[arg(long, default_value_t = 0)]
    pub manipulate: usize,

    #[arg(short = 'w', long)]
    pub weights: Option<PathBuf>,

    #[arg(long, default_value_t = 10_000)]
    pub num_train: usize,

    #[arg(long, default_value_t = 1_000)]
    pub num_test: usize,

    /// Seed of the form generator
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl SymmetricArgs {
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            batch_size: self.batch_size,
            learning_rate: self.lr,
            lr_decay: self.lr_decay,
            num_epochs: self.epochs,
            shift_fraction: self.shift_fraction,
            crop: None,
            save_best_only: false,
            loss_config: LossConfig {
                reconstruction_weight: self.scale_reconstruction_loss,
                ..LossConfig::default()
            },
            optimizer: AdamConfig::default(),
        }
    }
}

/// The weights file to load, if one was given and exists. Anything else runs
/// on random initial weights.
pub fn existing_weights(weights: Option<&Path>) -> Option<&Path> {
    weights.filter(|path| path.exists())
}
