use serde::{Deserialize, Serialize};

use crate::error::{CapsNetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Sigmoid,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    /// Number of capsule types per spatial position.
    pub capsule_types: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

/// Architecture of the whole network: conv1, primary capsules, routed class
/// capsules and the reconstruction decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (channels, height, width)
    pub input_shape: (usize, usize, usize),
    pub conv1: ConvConfig,
    pub primary_caps: CapsuleConfig,
    pub num_classes: usize,
    pub out_dim: usize,
    pub routing_iterations: usize,
    pub decoder_hidden: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
    pub reconstruction_weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Multiplied into the learning rate once per epoch.
    pub lr_decay: f32,
    pub num_epochs: usize,
    pub shift_fraction: f32,
    /// Random crop (rows, columns) applied to every batch.
    pub crop: Option<(usize, usize)>,
    pub save_best_only: bool,
    pub loss_config: LossConfig,
    pub optimizer: AdamConfig,
}

/// Output size of a convolution along one axis, `None` when the kernel does
/// not fit into the padded input.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || kernel == 0 || kernel > padded {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl NetworkConfig {
    /// Architecture used for CIFAR-10 (32x32 RGB, 10 classes + "none of the above").
    pub fn cifar10(num_classes: usize) -> Self {
        Self {
            input_shape: (3, 32, 32),
            conv1: ConvConfig {
                filters: 256,
                kernel_size: 9,
                stride: 1,
                padding: 0,
            },
            primary_caps: CapsuleConfig {
                capsule_types: 64,
                capsule_dim: 8,
                kernel_size: 9,
                stride: 2,
                padding: 0,
            },
            num_classes,
            out_dim: 42,
            routing_iterations: 3,
            decoder_hidden: vec![512, 1024],
        }
    }

    /// Architecture used for the synthetic symmetric forms (28x28 RGB).
    pub fn symmetric_forms(num_classes: usize) -> Self {
        Self {
            input_shape: (3, 28, 28),
            conv1: ConvConfig {
                filters: 64,
                kernel_size: 9,
                stride: 1,
                padding: 0,
            },
            primary_caps: CapsuleConfig {
                capsule_types: 2,
                capsule_dim: 3,
                kernel_size: 9,
                stride: 2,
                padding: 0,
            },
            num_classes,
            out_dim: 3,
            routing_iterations: 3,
            decoder_hidden: vec![512, 1024],
        }
    }

    pub fn with_input_shape(mut self, input_shape: (usize, usize, usize)) -> Self {
        self.input_shape = input_shape;
        self
    }

    pub fn with_routing_iterations(mut self, iterations: usize) -> Self {
        self.routing_iterations = iterations;
        self
    }

    pub fn conv1_output(&self) -> Option<(usize, usize)> {
        let (_, h, w) = self.input_shape;
        let c = &self.conv1;
        Some((
            conv_output_size(h, c.kernel_size, c.stride, c.padding)?,
            conv_output_size(w, c.kernel_size, c.stride, c.padding)?,
        ))
    }

    /// Spatial grid of the primary capsule convolution.
    pub fn primary_grid(&self) -> Option<(usize, usize)> {
        let (h, w) = self.conv1_output()?;
        let p = &self.primary_caps;
        Some((
            conv_output_size(h, p.kernel_size, p.stride, p.padding)?,
            conv_output_size(w, p.kernel_size, p.stride, p.padding)?,
        ))
    }

    pub fn num_primary_capsules(&self) -> Option<usize> {
        let (h, w) = self.primary_grid()?;
        Some(h * w * self.primary_caps.capsule_types)
    }

    pub fn num_pixels(&self) -> usize {
        let (c, h, w) = self.input_shape;
        c * h * w
    }

    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.input_shape;
        if c == 0 || h == 0 || w == 0 {
            return Err(invalid(format!("input shape {:?} has an empty axis", self.input_shape)));
        }
        if self.routing_iterations == 0 {
            return Err(invalid("routing_iterations must be >= 1".to_string()));
        }
        if self.num_classes == 0 || self.out_dim == 0 {
            return Err(invalid("num_classes and out_dim must be >= 1".to_string()));
        }
        if self.conv1.filters == 0 {
            return Err(invalid("conv1 needs at least one filter".to_string()));
        }
        if self.primary_caps.capsule_types == 0 || self.primary_caps.capsule_dim == 0 {
            return Err(invalid("primary capsules need a type and a dimension".to_string()));
        }
        if self.conv1_output().is_none() {
            return Err(invalid(format!(
                "conv1 kernel {} (stride {}) does not fit input {}x{}",
                self.conv1.kernel_size, self.conv1.stride, h, w
            )));
        }
        if self.primary_grid().is_none() {
            return Err(invalid(format!(
                "primary capsule kernel {} (stride {}) does not fit conv1 output {:?}",
                self.primary_caps.kernel_size,
                self.primary_caps.stride,
                self.conv1_output()
            )));
        }
        if self.decoder_hidden.iter().any(|&units| units == 0) {
            return Err(invalid("decoder layers need at least one unit".to_string()));
        }
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be >= 1".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(invalid(format!("learning rate {} must be positive", self.learning_rate)));
        }
        if !(self.lr_decay > 0.0) {
            return Err(invalid(format!("lr_decay {} must be positive", self.lr_decay)));
        }
        if !(0.0..1.0).contains(&self.shift_fraction) {
            return Err(invalid(format!(
                "shift_fraction {} must lie in [0, 1)",
                self.shift_fraction
            )));
        }
        if let Some((rows, cols)) = self.crop {
            if rows == 0 || cols == 0 {
                return Err(invalid("crop size must be non-empty".to_string()));
            }
        }
        let loss = &self.loss_config;
        if loss.negative_margin > loss.positive_margin {
            return Err(invalid(format!(
                "negative margin {} exceeds positive margin {}",
                loss.negative_margin, loss.positive_margin
            )));
        }
        if loss.reconstruction_weight < 0.0 {
            return Err(invalid("reconstruction weight must not be negative".to_string()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> CapsNetError {
    CapsNetError::InvalidConfig(msg)
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::symmetric_forms(2)
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            learning_rate: 0.001,
            lr_decay: 0.9,
            num_epochs: 100,
            shift_fraction: 0.1,
            crop: None,
            save_best_only: true,
            loss_config: LossConfig::default(),
            optimizer: AdamConfig::default(),
        }
    }
}
