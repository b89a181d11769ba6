use ndarray::{
    Array, Array1, Array2, Array3, Array4, ArrayView, ArrayView2, ArrayView3, ArrayView4,
    ArrayViewD, ArrayViewMutD, Axis, Dimension, Zip,
};
use rand::Rng;
use rayon::prelude::*;

use crate::error::{CapsNetError, Result};
use crate::model::config::{conv_output_size, Activation};

/// Guards every division by a vector's own length.
pub const EPSILON: f32 = 1e-7;

/// Read-only view of a named parameter tensor.
pub struct Param<'a> {
    pub name: String,
    pub value: ArrayViewD<'a, f32>,
}

/// Mutable parameter together with its accumulated gradient.
pub struct ParamMut<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// Trait shared by every layer owning trainable weights.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;
    fn parameters(&self) -> Vec<Param<'_>>;
    fn parameters_mut(&mut self) -> Vec<ParamMut<'_>>;
    fn zero_grad(&mut self);

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }
}

/// 2D convolution (channels first) evaluated through im2col and a matrix product.
pub struct ConvLayer {
    name: String,
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,

    input_cache: Option<Array4<f32>>,
    pre_activation_cache: Option<Array4<f32>>,
    weight_grad: Array4<f32>,
    bias_grad: Array1<f32>,
}

impl ConvLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        // He uniform
        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let weights = Array4::from_shape_simple_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            || rng.random_range(-scale..scale),
        );
        let biases = Array1::zeros(out_channels);
        let weight_grad = Array4::zeros(weights.dim());
        let bias_grad = Array1::zeros(out_channels);

        Self {
            name: name.to_string(),
            weights,
            biases,
            stride,
            padding,
            activation,
            input_cache: None,
            pre_activation_cache: None,
            weight_grad,
            bias_grad,
        }
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().2
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    pub fn output_dims(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let k = self.kernel_size();
        Some((
            conv_output_size(height, k, self.stride, self.padding)?,
            conv_output_size(width, k, self.stride, self.padding)?,
        ))
    }

    fn geometry(&self, input_dim: (usize, usize, usize, usize)) -> Result<ConvGeometry> {
        let (_, in_channels, height, width) = input_dim;
        let (out_channels, expected_channels, kernel, _) = self.weights.dim();
        if in_channels != expected_channels {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.input", self.name),
                expected: vec![expected_channels, height, width],
                found: vec![in_channels, height, width],
            });
        }
        let (out_height, out_width) = self.output_dims(height, width).ok_or_else(|| {
            CapsNetError::InvalidConfig(format!(
                "kernel {} does not fit {}x{} input of layer '{}'",
                kernel, height, width, self.name
            ))
        })?;
        Ok(ConvGeometry {
            in_channels,
            height,
            width,
            out_channels,
            kernel,
            stride: self.stride,
            padding: self.padding,
            out_height,
            out_width,
        })
    }

    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let geo = self.geometry(input.dim())?;
        let kernel = self
            .weights
            .view()
            .into_shape_with_order((geo.out_channels, geo.patch_len()))?;
        let biases = &self.biases;

        let mut pre_activation =
            Array4::<f32>::zeros((input.dim().0, geo.out_channels, geo.out_height, geo.out_width));

        Zip::from(pre_activation.outer_iter_mut())
            .and(input.outer_iter())
            .par_for_each(|mut out, sample| {
                let cols = im2col(&sample, &geo);
                let product = kernel.dot(&cols);
                for ((oc, p), &v) in product.indexed_iter() {
                    out[[oc, p / geo.out_width, p % geo.out_width]] = v + biases[oc];
                }
            });

        let output = apply_activation(self.activation, &pre_activation);
        self.input_cache = Some(input.to_owned());
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    /// Accumulates weight gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (input, pre_activation) = match (&self.input_cache, &self.pre_activation_cache) {
            (Some(input), Some(pre)) => (input, pre),
            _ => return Err(CapsNetError::NoForwardCache(self.name.clone())),
        };
        if grad_output.dim() != pre_activation.dim() {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.grad_output", self.name),
                expected: pre_activation.shape().to_vec(),
                found: grad_output.shape().to_vec(),
            });
        }

        let geo = self.geometry(input.dim())?;
        let grad = activation_derivative(self.activation, pre_activation) * grad_output;
        let kernel = self
            .weights
            .view()
            .into_shape_with_order((geo.out_channels, geo.patch_len()))?;

        let batch_size = input.dim().0;
        let per_sample: Vec<(Array2<f32>, Array1<f32>, Array3<f32>)> = (0..batch_size)
            .into_par_iter()
            .map(|b| {
                let sample = input.index_axis(Axis(0), b);
                let g = grad.index_axis(Axis(0), b);
                let positions = geo.out_height * geo.out_width;
                let g2 = Array2::from_shape_fn((geo.out_channels, positions), |(oc, p)| {
                    g[[oc, p / geo.out_width, p % geo.out_width]]
                });
                let cols = im2col(&sample, &geo);
                let weight_grad = g2.dot(&cols.t());
                let bias_grad = g2.sum_axis(Axis(1));
                let col_grad = kernel.t().dot(&g2);
                (weight_grad, bias_grad, col2im(&col_grad.view(), &geo))
            })
            .collect();

        let mut grad_input = Array4::zeros(input.dim());
        let mut weight_grad = self
            .weight_grad
            .view_mut()
            .into_shape_with_order((geo.out_channels, geo.patch_len()))?;
        for (b, (dw, db, dx)) in per_sample.into_iter().enumerate() {
            weight_grad += &dw;
            self.bias_grad += &db;
            grad_input.index_axis_mut(Axis(0), b).assign(&dx);
        }

        Ok(grad_input)
    }
}

impl Layer for ConvLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: format!("{}.kernel", self.name),
                value: self.weights.view().into_dyn(),
            },
            Param {
                name: format!("{}.bias", self.name),
                value: self.biases.view().into_dyn(),
            },
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut {
                name: format!("{}.kernel", self.name),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            ParamMut {
                name: format!("{}.bias", self.name),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    in_channels: usize,
    height: usize,
    width: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    out_height: usize,
    out_width: usize,
}

impl ConvGeometry {
    fn patch_len(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    /// Input coordinate read by output row/column `o` at kernel offset `k`.
    fn source(&self, o: usize, k: usize, limit: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < limit)
    }
}

/// Unfolds one sample (C, H, W) into a (C*K*K, OH*OW) patch matrix; padded cells stay zero.
fn im2col(sample: &ArrayView3<f32>, geo: &ConvGeometry) -> Array2<f32> {
    let k = geo.kernel;
    let mut cols = Array2::zeros((geo.patch_len(), geo.out_height * geo.out_width));
    for c in 0..geo.in_channels {
        for kh in 0..k {
            for kw in 0..k {
                let row = (c * k + kh) * k + kw;
                for oh in 0..geo.out_height {
                    let Some(ih) = geo.source(oh, kh, geo.height) else {
                        continue;
                    };
                    for ow in 0..geo.out_width {
                        if let Some(iw) = geo.source(ow, kw, geo.width) {
                            cols[[row, oh * geo.out_width + ow]] = sample[[c, ih, iw]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Adjoint of `im2col`: scatters patch gradients back onto the (C, H, W) input.
fn col2im(cols: &ArrayView2<f32>, geo: &ConvGeometry) -> Array3<f32> {
    let k = geo.kernel;
    let mut image = Array3::zeros((geo.in_channels, geo.height, geo.width));
    for c in 0..geo.in_channels {
        for kh in 0..k {
            for kw in 0..k {
                let row = (c * k + kh) * k + kw;
                for oh in 0..geo.out_height {
                    let Some(ih) = geo.source(oh, kh, geo.height) else {
                        continue;
                    };
                    for ow in 0..geo.out_width {
                        if let Some(iw) = geo.source(ow, kw, geo.width) {
                            image[[c, ih, iw]] += cols[[row, oh * geo.out_width + ow]];
                        }
                    }
                }
            }
        }
    }
    image
}

/// Fully connected layer on (batch, features) inputs.
pub struct DenseLayer {
    name: String,
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,

    input_cache: Option<Array2<f32>>,
    pre_activation_cache: Option<Array2<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl DenseLayer {
    pub fn new<R: Rng>(
        name: &str,
        inputs: usize,
        units: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        // Glorot uniform
        let limit = (6.0 / (inputs + units) as f32).sqrt();
        let weights = Array2::from_shape_simple_fn((inputs, units), || rng.random_range(-limit..limit));

        Self {
            name: name.to_string(),
            weights,
            biases: Array1::zeros(units),
            activation,
            input_cache: None,
            pre_activation_cache: None,
            weight_grad: Array2::zeros((inputs, units)),
            bias_grad: Array1::zeros(units),
        }
    }

    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.weights.nrows() {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.input", self.name),
                expected: vec![input.nrows(), self.weights.nrows()],
                found: input.shape().to_vec(),
            });
        }
        let pre_activation: Array2<f32> = input.dot(&self.weights) + &self.biases;
        let output = apply_activation(self.activation, &pre_activation);
        self.input_cache = Some(input.to_owned());
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let (input, pre_activation) = match (&self.input_cache, &self.pre_activation_cache) {
            (Some(input), Some(pre)) => (input, pre),
            _ => return Err(CapsNetError::NoForwardCache(self.name.clone())),
        };
        if grad_output.dim() != pre_activation.dim() {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("{}.grad_output", self.name),
                expected: pre_activation.shape().to_vec(),
                found: grad_output.shape().to_vec(),
            });
        }

        let grad = activation_derivative(self.activation, pre_activation) * grad_output;
        self.weight_grad += &input.t().dot(&grad);
        self.bias_grad += &grad.sum_axis(Axis(0));
        Ok(grad.dot(&self.weights.t()))
    }
}

impl Layer for DenseLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: format!("{}.kernel", self.name),
                value: self.weights.view().into_dyn(),
            },
            Param {
                name: format!("{}.bias", self.name),
                value: self.biases.view().into_dyn(),
            },
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut {
                name: format!("{}.kernel", self.name),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            ParamMut {
                name: format!("{}.bias", self.name),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

pub fn apply_activation<D: Dimension>(activation: Activation, x: &Array<f32, D>) -> Array<f32, D> {
    match activation {
        Activation::ReLU => x.mapv(|v| v.max(0.0)),
        Activation::Sigmoid => x.mapv(sigmoid),
        Activation::None => x.clone(),
    }
}

/// Derivative of the activation evaluated at the pre-activation values.
pub fn activation_derivative<D: Dimension>(
    activation: Activation,
    pre_activation: &Array<f32, D>,
) -> Array<f32, D> {
    match activation {
        Activation::ReLU => pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        Activation::Sigmoid => pre_activation.mapv(|v| {
            let s = sigmoid(v);
            s * (1.0 - s)
        }),
        Activation::None => Array::ones(pre_activation.raw_dim()),
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Squash along the last axis: `(|v|^2 / (1 + |v|^2)) * v / sqrt(|v|^2 + eps)`.
pub fn squash<D: Dimension>(vectors: &ArrayView<f32, D>) -> Array<f32, D> {
    let mut result = vectors.to_owned();
    let last = Axis(result.ndim() - 1);
    Zip::from(result.lanes_mut(last)).par_for_each(|mut lane| {
        let norm_squared = lane.dot(&lane);
        let factor = squash_factor(norm_squared);
        lane.mapv_inplace(|x| x * factor);
    });
    result
}

fn squash_factor(norm_squared: f32) -> f32 {
    norm_squared / ((1.0 + norm_squared) * (norm_squared + EPSILON).sqrt())
}

/// Vector-Jacobian product of `squash`, evaluated at the pre-squash vectors `s`.
pub fn squash_backward<D: Dimension>(
    s: &ArrayView<f32, D>,
    grad_output: &ArrayView<f32, D>,
) -> Array<f32, D> {
    let mut grad_input = Array::zeros(s.raw_dim());
    let last = Axis(s.ndim() - 1);
    Zip::from(grad_input.lanes_mut(last))
        .and(s.lanes(last))
        .and(grad_output.lanes(last))
        .par_for_each(|mut gi, s, go| {
            let q = s.dot(&s);
            let shifted = q + EPSILON;
            let factor = squash_factor(q);
            // d factor / d q
            let factor_prime =
                (shifted - 0.5 * q * (1.0 + q)) / ((1.0 + q).powi(2) * shifted * shifted.sqrt());
            let projection = s.dot(&go);
            Zip::from(&mut gi)
                .and(&s)
                .and(&go)
                .for_each(|out, &si, &g| *out = factor * g + 2.0 * factor_prime * projection * si);
        });
    grad_input
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn random_array<D: Dimension, Sh: ndarray::ShapeBuilder<Dim = D>>(
        shape: Sh,
        rng: &mut StdRng,
    ) -> Array<f32, D> {
        Array::from_shape_simple_fn(shape, || rng.random_range(-1.0..1.0))
    }

    #[test]
    fn test_squash_length_below_one() {
        let mut rng = StdRng::seed_from_u64(7);
        let vectors: Array3<f32> = random_array((4, 6, 8), &mut rng) * 20.0;
        let squashed = squash(&vectors.view());

        for lane in squashed.lanes(Axis(2)) {
            let len = lane.dot(&lane).sqrt();
            assert!(len < 1.0, "length {} not below 1", len);
            assert!(len > 0.0);
        }
    }

    #[test]
    fn test_squash_keeps_direction() {
        let v = Array3::from_shape_vec((1, 1, 2), vec![3.0, 4.0]).unwrap();
        let squashed = squash(&v.view());
        let expected_len = 25.0 / 26.0;
        assert_abs_diff_eq!(squashed[[0, 0, 0]], expected_len * 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(squashed[[0, 0, 1]], expected_len * 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_squash_zero_vector_is_zero() {
        let zeros = Array3::<f32>::zeros((2, 3, 4));
        let squashed = squash(&zeros.view());
        assert!(squashed.iter().all(|v| *v == 0.0));

        let grad = squash_backward(&zeros.view(), &Array3::ones((2, 3, 4)).view());
        assert!(grad.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_squash_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        let s: Array3<f32> = random_array((2, 3, 4), &mut rng);
        let weights: Array3<f32> = random_array((2, 3, 4), &mut rng);

        let objective = |x: &Array3<f32>| -> f64 {
            squash(&x.view())
                .iter()
                .zip(weights.iter())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum()
        };

        let analytic = squash_backward(&s.view(), &weights.view());
        let h = 1e-2;
        for idx in 0..s.len() {
            let mut plus = s.clone();
            let mut minus = s.clone();
            plus.as_slice_mut().unwrap()[idx] += h;
            minus.as_slice_mut().unwrap()[idx] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h as f64);
            assert_abs_diff_eq!(analytic.as_slice().unwrap()[idx] as f64, numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn test_dense_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = DenseLayer::new("dense", 5, 4, Activation::Sigmoid, &mut rng);
        let input: Array2<f32> = random_array((3, 5), &mut rng);
        let weights: Array2<f32> = random_array((3, 4), &mut rng);

        layer.forward(&input.view()).unwrap();
        let grad_input = layer.backward(&weights.view()).unwrap();

        let h = 1e-2;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus.as_slice_mut().unwrap()[idx] += h;
            minus.as_slice_mut().unwrap()[idx] -= h;
            let f_plus: f32 = (layer.forward(&plus.view()).unwrap() * &weights).sum();
            let f_minus: f32 = (layer.forward(&minus.view()).unwrap() * &weights).sum();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert_abs_diff_eq!(grad_input.as_slice().unwrap()[idx], numeric, epsilon = 2e-3);
        }

        let kernel_grad = layer.parameters_mut()[0].grad.to_owned();
        let (i, j) = (2, 1);
        let base = layer.weights[[i, j]];
        layer.weights[[i, j]] = base + h;
        let f_plus: f32 = (layer.forward(&input.view()).unwrap() * &weights).sum();
        layer.weights[[i, j]] = base - h;
        let f_minus: f32 = (layer.forward(&input.view()).unwrap() * &weights).sum();
        let numeric = (f_plus - f_minus) / (2.0 * h);
        assert_abs_diff_eq!(kernel_grad[IxDyn(&[i, j])], numeric, epsilon = 2e-3);
    }

    #[test]
    fn test_conv_output_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = ConvLayer::new("conv", 3, 4, 3, 2, 1, Activation::ReLU, &mut rng);
        let input = Array4::<f32>::ones((2, 3, 7, 7));
        let output = layer.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 4, 4, 4));
    }

    #[test]
    fn test_conv_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = ConvLayer::new("conv", 2, 3, 3, 2, 1, Activation::None, &mut rng);
        let input: Array4<f32> = random_array((2, 2, 5, 5), &mut rng);
        let out_dim = layer.forward(&input.view()).unwrap().dim();
        let weights: Array4<f32> = random_array(out_dim, &mut rng);

        let grad_input = layer.backward(&weights.view()).unwrap();

        // The layer is linear, so a single finite difference is exact up to rounding.
        let h = 1e-1;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus.as_slice_mut().unwrap()[idx] += h;
            minus.as_slice_mut().unwrap()[idx] -= h;
            let f_plus: f32 = (layer.forward(&plus.view()).unwrap() * &weights).sum();
            let f_minus: f32 = (layer.forward(&minus.view()).unwrap() * &weights).sum();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert_abs_diff_eq!(grad_input.as_slice().unwrap()[idx], numeric, epsilon = 1e-3);
        }

        let kernel_grad = layer.parameters_mut()[0].grad.to_owned();
        let at = [1, 0, 2, 1];
        let base = layer.weights[at];
        layer.weights[at] = base + h;
        let f_plus: f32 = (layer.forward(&input.view()).unwrap() * &weights).sum();
        layer.weights[at] = base - h;
        let f_minus: f32 = (layer.forward(&input.view()).unwrap() * &weights).sum();
        let numeric = (f_plus - f_minus) / (2.0 * h);
        assert_abs_diff_eq!(kernel_grad[IxDyn(&at)], numeric, epsilon = 1e-3);
    }

    #[test]
    fn test_backward_before_forward_fails() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = DenseLayer::new("dense", 2, 2, Activation::ReLU, &mut rng);
        let grad = Array2::<f32>::ones((1, 2));
        assert!(matches!(
            layer.backward(&grad.view()),
            Err(CapsNetError::NoForwardCache(_))
        ));
    }
}
