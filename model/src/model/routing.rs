use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::squash;

/// Dynamic routing-by-agreement between two capsule layers.
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    pub num_iterations: usize,
}

/// Result of routing one batch.
#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// Squashed higher capsules `v`, (batch, outputs, dim).
    pub outputs: Array3<f32>,
    /// Coupling-weighted sums `s` before squashing, (batch, outputs, dim).
    pub pre_activation: Array3<f32>,
    /// Coupling coefficients used in the last iteration, (batch, inputs, outputs).
    pub coupling: Array3<f32>,
}

/// Routing output plus the coupling coefficients of every iteration.
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    pub output: RoutingOutput,
    pub couplings: Vec<Array3<f32>>,
}

struct SampleRouting {
    outputs: Array2<f32>,
    pre_activation: Array2<f32>,
    coupling: Array2<f32>,
    history: Vec<Array2<f32>>,
}

impl DynamicRouting {
    /// `num_iterations` must be at least 1; `NetworkConfig::validate` enforces it.
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    /// Routes prediction vectors `u_hat` of shape (batch, inputs, outputs, dim).
    pub fn route(&self, predictions: &ArrayView4<f32>) -> RoutingOutput {
        self.route_batch(predictions, false).output
    }

    pub fn route_traced(&self, predictions: &ArrayView4<f32>) -> RoutingTrace {
        self.route_batch(predictions, true)
    }

    fn route_batch(&self, predictions: &ArrayView4<f32>, trace: bool) -> RoutingTrace {
        let (batch_size, inputs, outputs, dim) = predictions.dim();

        let samples: Vec<SampleRouting> = (0..batch_size)
            .into_par_iter()
            .map(|b| self.route_sample(&predictions.index_axis(Axis(0), b), trace))
            .collect();

        let mut result = RoutingOutput {
            outputs: Array3::zeros((batch_size, outputs, dim)),
            pre_activation: Array3::zeros((batch_size, outputs, dim)),
            coupling: Array3::zeros((batch_size, inputs, outputs)),
        };
        let iterations = if trace { self.num_iterations } else { 0 };
        let mut couplings = vec![Array3::zeros((batch_size, inputs, outputs)); iterations];

        for (b, sample) in samples.into_iter().enumerate() {
            result.outputs.index_axis_mut(Axis(0), b).assign(&sample.outputs);
            result
                .pre_activation
                .index_axis_mut(Axis(0), b)
                .assign(&sample.pre_activation);
            result.coupling.index_axis_mut(Axis(0), b).assign(&sample.coupling);
            for (snapshot, coupling) in couplings.iter_mut().zip(&sample.history) {
                snapshot.index_axis_mut(Axis(0), b).assign(coupling);
            }
        }

        RoutingTrace {
            output: result,
            couplings,
        }
    }

    fn route_sample(&self, predictions: &ArrayView3<f32>, trace: bool) -> SampleRouting {
        let (inputs, outputs, dim) = predictions.dim();

        // b_ij, scoped to this call
        let mut logits = Array2::<f32>::zeros((inputs, outputs));
        let mut coupling = Array2::<f32>::zeros((inputs, outputs));
        let mut pre_activation = Array2::<f32>::zeros((outputs, dim));
        let mut squashed = Array2::<f32>::zeros((outputs, dim));
        let mut history = Vec::new();

        for iteration in 0..self.num_iterations {
            // c_ij = softmax_j(b_ij)
            coupling = softmax_rows(&logits.view());
            if trace {
                history.push(coupling.clone());
            }

            // s_j = sum_i c_ij * u_hat_j|i
            pre_activation.fill(0.0);
            for (i, u_i) in predictions.outer_iter().enumerate() {
                for (j, mut s_j) in pre_activation.outer_iter_mut().enumerate() {
                    s_j.scaled_add(coupling[[i, j]], &u_i.row(j));
                }
            }

            squashed = squash(&pre_activation.view());

            // The last update could not influence the output any more.
            if iteration + 1 < self.num_iterations {
                for (i, u_i) in predictions.outer_iter().enumerate() {
                    for (j, v_j) in squashed.outer_iter().enumerate() {
                        logits[[i, j]] += u_i.row(j).dot(&v_j);
                    }
                }
            }
        }

        SampleRouting {
            outputs: squashed,
            pre_activation,
            coupling,
            history,
        }
    }
}

/// Softmax over the last axis of an (inputs, outputs) logit matrix.
pub fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();
    for mut row in result.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max_val).exp());
        // The max term contributes exp(0) = 1, so the sum is at least 1.
        let exp_sum = row.sum();
        row.mapv_inplace(|x| x / exp_sum);
    }
    result
}
