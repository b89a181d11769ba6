use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use rand::Rng;

use super::config::Activation;
use super::layers::{squash, squash_backward, ConvLayer, Layer, Param, ParamMut, EPSILON};
use super::routing::{DynamicRouting, RoutingOutput};
use crate::error::{CapsNetError, Result};

/// Convolution whose feature maps are regrouped into squashed capsule vectors.
///
/// Capsule `n = (h * grid_width + w) * capsule_types + t` takes its components
/// from channels `t * capsule_dim .. (t + 1) * capsule_dim` at position `(h, w)`.
pub struct PrimaryCapsLayer {
    pub conv: ConvLayer,
    pub capsule_types: usize,
    pub capsule_dim: usize,

    grid_cache: Option<(usize, usize)>,
    pre_squash_cache: Option<Array3<f32>>,
}

impl PrimaryCapsLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        capsule_types: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let conv = ConvLayer::new(
            name,
            in_channels,
            capsule_types * capsule_dim,
            kernel_size,
            stride,
            padding,
            Activation::None,
            rng,
        );

        Self {
            conv,
            capsule_types,
            capsule_dim,
            grid_cache: None,
            pre_squash_cache: None,
        }
    }

    pub fn capsule_index(&self, h: usize, w: usize, capsule_type: usize, grid_width: usize) -> usize {
        (h * grid_width + w) * self.capsule_types + capsule_type
    }

    /// (batch, channels, height, width) -> (batch, capsules, capsule_dim)
    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let maps = self.conv.forward(input)?;
        let (batch_size, _, grid_h, grid_w) = maps.dim();
        let (types, dim) = (self.capsule_types, self.capsule_dim);

        let capsules = Array3::from_shape_fn((batch_size, grid_h * grid_w * types, dim), |(b, n, d)| {
            let position = n / types;
            let t = n % types;
            maps[[b, t * dim + d, position / grid_w, position % grid_w]]
        });

        let output = squash(&capsules.view());
        self.grid_cache = Some((grid_h, grid_w));
        self.pre_squash_cache = Some(capsules);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (pre_squash, (grid_h, grid_w)) = match (&self.pre_squash_cache, self.grid_cache) {
            (Some(pre), Some(grid)) => (pre, grid),
            _ => return Err(CapsNetError::NoForwardCache(self.conv.name().to_string())),
        };
        if grad_output.dim() != pre_squash.dim() {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.grad_output", self.conv.name()),
                expected: pre_squash.shape().to_vec(),
                found: grad_output.shape().to_vec(),
            });
        }

        let grad_pre = squash_backward(&pre_squash.view(), grad_output);
        let (types, dim) = (self.capsule_types, self.capsule_dim);
        let batch_size = grad_pre.dim().0;

        let grad_maps = Array4::from_shape_fn((batch_size, types * dim, grid_h, grid_w), |(b, ch, h, w)| {
            let (t, d) = (ch / dim, ch % dim);
            grad_pre[[b, (h * grid_w + w) * types + t, d]]
        });

        self.conv.backward(&grad_maps.view())
    }
}

impl Layer for PrimaryCapsLayer {
    fn name(&self) -> &str {
        self.conv.name()
    }

    fn parameters(&self) -> Vec<Param<'_>> {
        self.conv.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        self.conv.parameters_mut()
    }

    fn zero_grad(&mut self) {
        self.conv.zero_grad();
    }
}

/// Fully connected capsule layer: one transformation matrix per
/// (input capsule, output capsule) pair, combined by dynamic routing.
pub struct CapsuleLayer {
    name: String,
    /// (input_capsules, num_capsules, capsule_dim, input_dim)
    pub weights: Array4<f32>,
    pub routing: DynamicRouting,

    weight_grad: Array4<f32>,
    input_cache: Option<Array3<f32>>,
    routing_cache: Option<RoutingOutput>,
}

impl CapsuleLayer {
    pub fn new<R: Rng>(
        name: &str,
        input_capsules: usize,
        input_dim: usize,
        num_capsules: usize,
        capsule_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (input_dim + capsule_dim) as f32).sqrt();
        let shape = (input_capsules, num_capsules, capsule_dim, input_dim);
        let weights = Array4::from_shape_simple_fn(shape, || rng.random_range(-limit..limit));

        Self {
            name: name.to_string(),
            weights,
            routing: DynamicRouting::new(routing_iterations),
            weight_grad: Array4::zeros(shape),
            input_cache: None,
            routing_cache: None,
        }
    }

    pub fn num_capsules(&self) -> usize {
        self.weights.dim().1
    }

    pub fn capsule_dim(&self) -> usize {
        self.weights.dim().2
    }

    /// Prediction vectors `u_hat[b, i, j] = W[i, j] . u[b, i]`.
    pub fn predictions(&self, input: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (batch_size, input_capsules, input_dim) = input.dim();
        let (expected_capsules, num_capsules, capsule_dim, expected_dim) = self.weights.dim();
        if (input_capsules, input_dim) != (expected_capsules, expected_dim) {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.input", self.name),
                expected: vec![batch_size, expected_capsules, expected_dim],
                found: input.shape().to_vec(),
            });
        }

        let weights = &self.weights;
        let mut u_hat = Array4::<f32>::zeros((batch_size, input_capsules, num_capsules, capsule_dim));
        Zip::from(u_hat.outer_iter_mut())
            .and(input.outer_iter())
            .par_for_each(|mut u_hat_b, u_b| {
                for (i, u_i) in u_b.outer_iter().enumerate() {
                    for j in 0..num_capsules {
                        let w_ij = weights.slice(s![i, j, .., ..]);
                        u_hat_b.slice_mut(s![i, j, ..]).assign(&w_ij.dot(&u_i));
                    }
                }
            });
        Ok(u_hat)
    }

    pub fn forward(&mut self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let u_hat = self.predictions(input)?;
        let routed = self.routing.route(&u_hat.view());
        let output = routed.outputs.clone();
        self.input_cache = Some(input.to_owned());
        self.routing_cache = Some(routed);
        Ok(output)
    }

    /// Backward pass with the coupling coefficients held constant: the agreement
    /// updates are not differentiated, the final weighted sum and squash are.
    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (input, routed) = match (&self.input_cache, &self.routing_cache) {
            (Some(input), Some(routed)) => (input, routed),
            _ => return Err(CapsNetError::NoForwardCache(self.name.clone())),
        };
        if grad_output.dim() != routed.pre_activation.dim() {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.grad_output", self.name),
                expected: routed.pre_activation.shape().to_vec(),
                found: grad_output.shape().to_vec(),
            });
        }

        // dL/ds_j, then dL/du_hat_ij = c_ij * dL/ds_j
        let grad_s = squash_backward(&routed.pre_activation.view(), grad_output);
        let coupling = &routed.coupling;
        let weights = &self.weights;
        let batch_size = input.dim().0;

        Zip::indexed(self.weight_grad.outer_iter_mut()).par_for_each(|i, mut grad_w_i| {
            for b in 0..batch_size {
                let u_i = input.slice(s![b, i, ..]);
                for (j, mut grad_w_ij) in grad_w_i.outer_iter_mut().enumerate() {
                    let c = coupling[[b, i, j]];
                    for (o, mut row) in grad_w_ij.outer_iter_mut().enumerate() {
                        row.scaled_add(c * grad_s[[b, j, o]], &u_i);
                    }
                }
            }
        });

        let mut grad_input = Array3::<f32>::zeros(input.dim());
        Zip::indexed(grad_input.outer_iter_mut()).par_for_each(|b, mut grad_u_b| {
            for (i, mut grad_u_i) in grad_u_b.outer_iter_mut().enumerate() {
                for j in 0..weights.dim().1 {
                    let w_ij = weights.slice(s![i, j, .., ..]);
                    let g = w_ij.t().dot(&grad_s.slice(s![b, j, ..]));
                    grad_u_i.scaled_add(coupling[[b, i, j]], &g);
                }
            }
        });

        Ok(grad_input)
    }
}

impl Layer for CapsuleLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<Param<'_>> {
        vec![Param {
            name: format!("{}.transform", self.name),
            value: self.weights.view().into_dyn(),
        }]
    }

    fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![ParamMut {
            name: format!("{}.transform", self.name),
            value: self.weights.view_mut().into_dyn(),
            grad: self.weight_grad.view().into_dyn(),
        }]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
    }
}

/// Capsule lengths, (batch, capsules, dim) -> (batch, capsules).
pub fn length(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules.map_axis(Axis(2), |v| v.dot(&v).sqrt())
}

pub fn length_backward(capsules: &ArrayView3<f32>, grad_lengths: &ArrayView2<f32>) -> Array3<f32> {
    let mut grad = capsules.to_owned();
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(grad_lengths)
        .for_each(|mut v, &g| {
            let norm = v.dot(&v).sqrt();
            let factor = g / (norm + EPSILON);
            v.mapv_inplace(|x| x * factor);
        });
    grad
}

/// Selects one capsule per sample and flattens the batch for the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    /// (batch, capsules), one-hot
    selection: Array2<f32>,
}

impl Mask {
    /// Masks with the true (one-hot) labels.
    pub fn from_labels(labels: &ArrayView2<f32>) -> Self {
        Self {
            selection: labels.to_owned(),
        }
    }

    /// Masks with the longest capsule; ties go to the lowest index.
    pub fn from_lengths(capsules: &ArrayView3<f32>) -> Self {
        let lengths = length(capsules);
        let mut selection = Array2::zeros(lengths.dim());
        for (b, row) in lengths.outer_iter().enumerate() {
            selection[[b, argmax(&row.view())]] = 1.0;
        }
        Self { selection }
    }

    pub fn selection(&self) -> &Array2<f32> {
        &self.selection
    }

    /// (batch, capsules, dim) -> (batch, capsules * dim)
    pub fn apply(&self, capsules: &ArrayView3<f32>) -> Result<Array2<f32>> {
        let (batch_size, num_capsules, dim) = capsules.dim();
        if self.selection.dim() != (batch_size, num_capsules) {
            return Err(CapsNetError::ShapeMismatch {
                name: "mask".to_string(),
                expected: vec![batch_size, num_capsules],
                found: self.selection.shape().to_vec(),
            });
        }
        Ok(Array2::from_shape_fn((batch_size, num_capsules * dim), |(b, k)| {
            capsules[[b, k / dim, k % dim]] * self.selection[[b, k / dim]]
        }))
    }

    pub fn backward(&self, grad_output: &ArrayView2<f32>, dim: usize) -> Array3<f32> {
        let (batch_size, num_capsules) = self.selection.dim();
        Array3::from_shape_fn((batch_size, num_capsules, dim), |(b, j, d)| {
            grad_output[[b, j * dim + d]] * self.selection[[b, j]]
        })
    }
}

/// Index of the largest value, first index on ties.
pub fn argmax(values: &ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
