use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};
use rand::Rng;
use tracing::trace;

use super::capsule::{argmax, length, length_backward, CapsuleLayer, Mask, PrimaryCapsLayer};
use super::config::{Activation, LossConfig, NetworkConfig};
use super::decoder::Decoder;
use super::layers::{ConvLayer, Layer, Param, ParamMut};
use super::loss::{categorical_accuracy, CombinedLoss, LossBreakdown, LossFunction};
use super::optimizer::Optimizer;
use crate::error::{CapsNetError, Result};

/// Selects how the decoder input is masked.
#[derive(Debug, Clone, Copy)]
pub enum Phase<'a> {
    /// Mask with the true one-hot labels.
    Training { labels: ArrayView2<'a, f32> },
    /// Mask with the longest capsule.
    Inference,
}

pub struct CapsNetOutput {
    /// (batch, num_classes)
    pub lengths: Array2<f32>,
    /// (batch, num_classes, out_dim)
    pub capsules: Array3<f32>,
    /// (batch, channels, height, width)
    pub reconstruction: Array4<f32>,
}

/// Intermediate capsule activations for inspection.
pub struct ProbeOutput {
    /// (batch, primary_capsules, capsule_dim)
    pub primary_capsules: Array3<f32>,
    /// (batch, num_classes, out_dim)
    pub class_capsules: Array3<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub loss: LossBreakdown,
    pub accuracy: f32,
}

/// Capsule network: conv1 -> primary capsules -> routed class capsules,
/// with a reconstruction decoder on the masked class capsules.
pub struct CapsNet {
    pub config: NetworkConfig,
    pub conv1: ConvLayer,
    pub primary_caps: PrimaryCapsLayer,
    pub capsnet: CapsuleLayer,
    pub decoder: Decoder,
    pub loss_fn: CombinedLoss,

    capsules_cache: Option<Array3<f32>>,
    mask_cache: Option<Mask>,
}

impl CapsNet {
    /// Expects a validated configuration; `ModelBuilder::build` takes care of that.
    pub fn new<R: Rng>(config: NetworkConfig, loss_config: &LossConfig, rng: &mut R) -> Result<Self> {
        let (channels, _, _) = config.input_shape;
        let num_primary = config.num_primary_capsules().ok_or_else(|| {
            CapsNetError::InvalidConfig("primary capsule grid does not fit the input".to_string())
        })?;

        let conv1 = ConvLayer::new(
            "conv1",
            channels,
            config.conv1.filters,
            config.conv1.kernel_size,
            config.conv1.stride,
            config.conv1.padding,
            Activation::ReLU,
            rng,
        );
        let p = &config.primary_caps;
        let primary_caps = PrimaryCapsLayer::new(
            "primary_caps",
            config.conv1.filters,
            p.capsule_types,
            p.capsule_dim,
            p.kernel_size,
            p.stride,
            p.padding,
            rng,
        );
        let capsnet = CapsuleLayer::new(
            "capsnet",
            num_primary,
            p.capsule_dim,
            config.num_classes,
            config.out_dim,
            config.routing_iterations,
            rng,
        );
        let decoder = Decoder::new(&config, rng);

        Ok(Self {
            config,
            conv1,
            primary_caps,
            capsnet,
            decoder,
            loss_fn: CombinedLoss::new(loss_config),
            capsules_cache: None,
            mask_cache: None,
        })
    }

    fn check_input(&self, input: &ArrayView4<f32>) -> Result<()> {
        let (batch_size, c, h, w) = input.dim();
        if (c, h, w) != self.config.input_shape {
            let (ec, eh, ew) = self.config.input_shape;
            return Err(CapsNetError::ShapeMismatch {
                name: "input".to_string(),
                expected: vec![batch_size, ec, eh, ew],
                found: input.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn encode(&mut self, input: &ArrayView4<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        self.check_input(input)?;
        let features = self.conv1.forward(input)?;
        let primary = self.primary_caps.forward(&features.view())?;
        let capsules = self.capsnet.forward(&primary.view())?;
        self.capsules_cache = Some(capsules.clone());
        self.mask_cache = None;
        Ok((primary, capsules))
    }

    pub fn forward(&mut self, input: &ArrayView4<f32>, phase: Phase<'_>) -> Result<CapsNetOutput> {
        let (_, capsules) = self.encode(input)?;
        let lengths = length(&capsules.view());

        let mask = match phase {
            Phase::Training { labels } => {
                if labels.dim() != lengths.dim() {
                    return Err(CapsNetError::ShapeMismatch {
                        name: "labels".to_string(),
                        expected: lengths.shape().to_vec(),
                        found: labels.shape().to_vec(),
                    });
                }
                Mask::from_labels(&labels)
            }
            Phase::Inference => Mask::from_lengths(&capsules.view()),
        };
        let masked = mask.apply(&capsules.view())?;
        let reconstruction = self.decoder.forward(&masked.view())?;
        self.mask_cache = Some(mask);

        Ok(CapsNetOutput {
            lengths,
            capsules,
            reconstruction,
        })
    }

    /// Capsule lengths only, without running the decoder.
    pub fn classify(&mut self, input: &ArrayView4<f32>) -> Result<Array2<f32>> {
        let (_, capsules) = self.encode(input)?;
        Ok(length(&capsules.view()))
    }

    pub fn predict(&mut self, input: &ArrayView4<f32>) -> Result<Vec<usize>> {
        let lengths = self.classify(input)?;
        Ok(predicted_classes(&lengths.view()))
    }

    /// Backpropagates from the capsule lengths and, when given, from the
    /// reconstruction. Parameter gradients accumulate; returns the input gradient.
    pub fn backward(
        &mut self,
        grad_lengths: &ArrayView2<f32>,
        grad_reconstruction: Option<&ArrayView4<f32>>,
    ) -> Result<Array4<f32>> {
        let capsules = self
            .capsules_cache
            .as_ref()
            .ok_or_else(|| CapsNetError::NoForwardCache("capsnet".to_string()))?;
        let mut grad_capsules = length_backward(&capsules.view(), grad_lengths);

        if let Some(grad_reconstruction) = grad_reconstruction {
            let mask = self
                .mask_cache
                .as_ref()
                .ok_or_else(|| CapsNetError::NoForwardCache("mask".to_string()))?;
            let grad_masked = self.decoder.backward(grad_reconstruction)?;
            grad_capsules += &mask.backward(&grad_masked.view(), self.config.out_dim);
        }

        let grad_primary = self.capsnet.backward(&grad_capsules.view())?;
        let grad_features = self.primary_caps.backward(&grad_primary.view())?;
        self.conv1.backward(&grad_features.view())
    }

    /// One optimisation step on a batch, masking the decoder input with `labels`.
    pub fn train_step(
        &mut self,
        input: &ArrayView4<f32>,
        labels: &ArrayView2<f32>,
        optimizer: &mut dyn Optimizer,
    ) -> Result<BatchStats> {
        self.zero_grad();
        let output = self.forward(input, Phase::Training { labels: labels.view() })?;

        let loss = self
            .loss_fn
            .compute(&output.lengths.view(), labels, &output.reconstruction.view(), input);
        let grad_lengths = self.loss_fn.margin_loss.gradient(&output.lengths.view(), labels);
        let grad_reconstruction = self
            .loss_fn
            .reconstruction_loss
            .gradient(&output.reconstruction.view(), input);

        self.backward(&grad_lengths.view(), Some(&grad_reconstruction.view()))?;
        for param in self.parameters_mut() {
            optimizer.step(param);
        }

        let accuracy = categorical_accuracy(&output.lengths.view(), labels);
        trace!(margin = loss.margin, reconstruction = loss.reconstruction, accuracy, "train step");
        Ok(BatchStats { loss, accuracy })
    }

    /// Loss and accuracy on a batch, decoder masked with the true labels.
    pub fn evaluate(&mut self, input: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<BatchStats> {
        let output = self.forward(input, Phase::Training { labels: labels.view() })?;
        let loss = self
            .loss_fn
            .compute(&output.lengths.view(), labels, &output.reconstruction.view(), input);
        Ok(BatchStats {
            loss,
            accuracy: categorical_accuracy(&output.lengths.view(), labels),
        })
    }

    /// Gradient of the margin loss w.r.t. the input. Parameter gradients are cleared.
    pub fn input_gradient(&mut self, input: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<Array4<f32>> {
        self.zero_grad();
        let lengths = self.classify(input)?;
        let grad_lengths = self.loss_fn.margin_loss.gradient(&lengths.view(), labels);
        let grad_input = self.backward(&grad_lengths.view(), None)?;
        self.zero_grad();
        Ok(grad_input)
    }

    /// Reconstruction after adding `noise` (num_classes, out_dim) to every
    /// sample's class capsules, masked with the true labels.
    pub fn decode_with_noise(
        &mut self,
        input: &ArrayView4<f32>,
        labels: &ArrayView2<f32>,
        noise: &ArrayView2<f32>,
    ) -> Result<Array4<f32>> {
        let (_, mut capsules) = self.encode(input)?;
        let expected = (self.config.num_classes, self.config.out_dim);
        if noise.dim() != expected {
            return Err(CapsNetError::ShapeMismatch {
                name: "noise".to_string(),
                expected: vec![expected.0, expected.1],
                found: noise.shape().to_vec(),
            });
        }
        for mut sample in capsules.outer_iter_mut() {
            sample += noise;
        }
        let masked = Mask::from_labels(labels).apply(&capsules.view())?;
        self.decoder.forward(&masked.view())
    }

    pub fn probe(&mut self, input: &ArrayView4<f32>) -> Result<ProbeOutput> {
        let (primary_capsules, class_capsules) = self.encode(input)?;
        Ok(ProbeOutput {
            primary_capsules,
            class_capsules,
        })
    }

    pub fn parameters(&self) -> Vec<Param<'_>> {
        let mut params = self.conv1.parameters();
        params.extend(self.primary_caps.parameters());
        params.extend(self.capsnet.parameters());
        params.extend(self.decoder.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.primary_caps.parameters_mut());
        params.extend(self.capsnet.parameters_mut());
        params.extend(self.decoder.parameters_mut());
        params
    }

    pub fn zero_grad(&mut self) {
        self.conv1.zero_grad();
        self.primary_caps.zero_grad();
        self.capsnet.zero_grad();
        self.decoder.zero_grad();
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }

    /// Layer table with output shapes and parameter counts.
    pub fn summary(&self) -> String {
        let c = &self.config;
        let (conv_h, conv_w) = c.conv1_output().unwrap_or((0, 0));
        let num_primary = c.num_primary_capsules().unwrap_or(0);
        let (in_c, in_h, in_w) = c.input_shape;

        let mut rows: Vec<(String, String, usize)> = vec![
            ("input".to_string(), format!("({}, {}, {})", in_c, in_h, in_w), 0),
            (
                "conv1 (Conv2D)".to_string(),
                format!("({}, {}, {})", c.conv1.filters, conv_h, conv_w),
                self.conv1.num_parameters(),
            ),
            (
                "primary_caps (PrimaryCap)".to_string(),
                format!("({}, {})", num_primary, c.primary_caps.capsule_dim),
                self.primary_caps.num_parameters(),
            ),
            (
                "capsnet (CapsuleLayer)".to_string(),
                format!("({}, {})", c.num_classes, c.out_dim),
                self.capsnet.num_parameters(),
            ),
            ("capsnet_length (Length)".to_string(), format!("({})", c.num_classes), 0),
            ("mask (Mask)".to_string(), format!("({})", c.num_classes * c.out_dim), 0),
        ];
        for layer in &self.decoder.layers {
            rows.push((
                format!("{} (Dense)", layer.name()),
                format!("({})", layer.units()),
                layer.num_parameters(),
            ));
        }
        rows.push(("decoder_out (Reshape)".to_string(), format!("({}, {}, {})", in_c, in_h, in_w), 0));

        let mut out = format!("{:<32}{:<20}{:>12}\n", "Layer (type)", "Output shape", "Param #");
        out.push_str(&"=".repeat(64));
        out.push('\n');
        for (name, shape, params) in rows {
            out.push_str(&format!("{:<32}{:<20}{:>12}\n", name, shape, params));
        }
        out.push_str(&"=".repeat(64));
        out.push_str(&format!("\nTotal params: {}\n", self.num_parameters()));
        out
    }
}

/// Index of the longest capsule per sample, first index on ties.
pub fn predicted_classes(lengths: &ArrayView2<f32>) -> Vec<usize> {
    lengths.outer_iter().map(|row| argmax(&row)).collect()
}

/// Converts one-hot rows back to class indices.
pub fn label_indices(labels: &ArrayView2<f32>) -> Vec<usize> {
    labels.axis_iter(Axis(0)).map(|row| argmax(&row)).collect()
}
