use ndarray::{Array, Array2, ArrayView, ArrayView2, Dimension, Ix2, Ix4, Zip};

use super::capsule::argmax;
use super::config::LossConfig;
use crate::error::{CapsNetError, Result};

/// Loss with an exact gradient w.r.t. its predictions.
pub trait LossFunction: Send + Sync {
    type Dim: Dimension;

    fn compute(&self, predictions: &ArrayView<f32, Self::Dim>, targets: &ArrayView<f32, Self::Dim>) -> f32;
    fn gradient(
        &self,
        predictions: &ArrayView<f32, Self::Dim>,
        targets: &ArrayView<f32, Self::Dim>,
    ) -> Array<f32, Self::Dim>;
}

/// Margin loss on capsule lengths (Sabour et al., 2017), summed over classes
/// and averaged over the batch.
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// Per sample and class: `T * max(0, m+ - len)^2 + lambda * (1 - T) * max(0, len - m-)^2`.
    fn elementwise(&self, length: f32, target: f32) -> f32 {
        let present = (self.positive_margin - length).max(0.0);
        let absent = (length - self.negative_margin).max(0.0);
        target * present * present + self.down_weighting * (1.0 - target) * absent * absent
    }
}

impl LossFunction for MarginLoss {
    type Dim = Ix2;

    fn compute(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> f32 {
        let batch_size = lengths.nrows().max(1);
        let mut total = 0.0;
        Zip::from(lengths).and(targets).for_each(|&len, &t| {
            total += self.elementwise(len, t);
        });
        total / batch_size as f32
    }

    fn gradient(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Array2<f32> {
        let batch_size = lengths.nrows().max(1) as f32;
        Zip::from(lengths).and(targets).map_collect(|&len, &t| {
            let present = (self.positive_margin - len).max(0.0);
            let absent = (len - self.negative_margin).max(0.0);
            (-2.0 * t * present + 2.0 * self.down_weighting * (1.0 - t) * absent) / batch_size
        })
    }
}

/// Weighted mean squared error between reconstruction and input.
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    pub weight: f32,
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }
}

impl LossFunction for ReconstructionLoss {
    type Dim = Ix4;

    fn compute(&self, predictions: &ArrayView<f32, Ix4>, targets: &ArrayView<f32, Ix4>) -> f32 {
        self.weight * mean_squared_error(predictions, targets)
    }

    fn gradient(&self, predictions: &ArrayView<f32, Ix4>, targets: &ArrayView<f32, Ix4>) -> Array<f32, Ix4> {
        let diff = predictions - targets;
        let n = diff.len().max(1) as f32;
        diff * (2.0 * self.weight / n)
    }
}

pub fn mean_squared_error(predictions: &ArrayView<f32, Ix4>, targets: &ArrayView<f32, Ix4>) -> f32 {
    let diff = predictions - targets;
    diff.mapv(|x| x * x).mean().unwrap_or(0.0)
}

/// Loss values of one batch; `reconstruction` is the unweighted mean squared error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    pub margin: f32,
    pub reconstruction: f32,
    pub reconstruction_weight: f32,
}

impl LossBreakdown {
    pub fn total(&self) -> f32 {
        self.margin + self.reconstruction_weight * self.reconstruction
    }
}

/// Margin loss on the class capsules plus weighted reconstruction loss.
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    pub margin_loss: MarginLoss,
    pub reconstruction_loss: ReconstructionLoss,
}

impl CombinedLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            margin_loss: MarginLoss::new(
                config.positive_margin,
                config.negative_margin,
                config.down_weighting,
            ),
            reconstruction_loss: ReconstructionLoss::new(config.reconstruction_weight),
        }
    }

    pub fn compute(
        &self,
        lengths: &ArrayView2<f32>,
        labels: &ArrayView2<f32>,
        reconstruction: &ArrayView<f32, Ix4>,
        images: &ArrayView<f32, Ix4>,
    ) -> LossBreakdown {
        LossBreakdown {
            margin: self.margin_loss.compute(lengths, labels),
            reconstruction: mean_squared_error(reconstruction, images),
            reconstruction_weight: self.reconstruction_loss.weight,
        }
    }
}

/// Fraction of rows whose longest capsule matches the one-hot label.
pub fn categorical_accuracy(lengths: &ArrayView2<f32>, labels: &ArrayView2<f32>) -> f32 {
    if lengths.nrows() == 0 {
        return 0.0;
    }
    let correct = lengths
        .outer_iter()
        .zip(labels.outer_iter())
        .filter(|(l, t)| argmax(l) == argmax(t))
        .count();
    correct as f32 / lengths.nrows() as f32
}

/// Classification report over a whole test split.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub support: Vec<usize>,
    /// `confusion_matrix[true][predicted]`
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    /// Fails when the two slices differ in length or an index is not below `num_classes`.
    pub fn compute(predicted: &[usize], truth: &[usize], num_classes: usize) -> Result<Self> {
        if predicted.len() != truth.len() {
            return Err(CapsNetError::Data(format!(
                "{} predictions for {} labels",
                predicted.len(),
                truth.len()
            )));
        }
        let mut confusion = vec![vec![0usize; num_classes]; num_classes];
        for (&p, &t) in predicted.iter().zip(truth) {
            if p >= num_classes || t >= num_classes {
                return Err(CapsNetError::Data(format!(
                    "class index (predicted {}, true {}) outside {} classes",
                    p, t, num_classes
                )));
            }
            confusion[t][p] += 1;
        }
        let total = predicted.len();
        let correct: usize = (0..num_classes).map(|c| confusion[c][c]).sum();
        let accuracy = if total > 0 { correct as f32 / total as f32 } else { 0.0 };

        let mut precision = Vec::with_capacity(num_classes);
        let mut recall = Vec::with_capacity(num_classes);
        let mut f1_score = Vec::with_capacity(num_classes);
        let mut support = Vec::with_capacity(num_classes);

        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let predicted_c: usize = (0..num_classes).map(|i| confusion[i][c]).sum();
            let actual_c: usize = confusion[c].iter().sum();

            let prec = if predicted_c > 0 { tp / predicted_c as f32 } else { 0.0 };
            let rec = if actual_c > 0 { tp / actual_c as f32 } else { 0.0 };
            let f1 = if prec + rec > 0.0 { 2.0 * prec * rec / (prec + rec) } else { 0.0 };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
            support.push(actual_c);
        }

        Ok(Self {
            accuracy,
            precision,
            recall,
            f1_score,
            support,
            confusion_matrix: confusion,
        })
    }

    fn weighted(&self, values: &[f32]) -> f32 {
        let total: usize = self.support.iter().sum();
        if total == 0 {
            return 0.0;
        }
        values
            .iter()
            .zip(&self.support)
            .map(|(v, &s)| v * s as f32)
            .sum::<f32>()
            / total as f32
    }

    pub fn weighted_precision(&self) -> f32 {
        self.weighted(&self.precision)
    }

    pub fn weighted_recall(&self) -> f32 {
        self.weighted(&self.recall)
    }

    pub fn weighted_f1(&self) -> f32 {
        self.weighted(&self.f1_score)
    }

    pub fn print(&self) {
        println!("Confusion matrix (rows: true class, columns: predicted class):");
        for row in &self.confusion_matrix {
            let cells: Vec<String> = row.iter().map(|v| format!("{:5}", v)).collect();
            println!("  {}", cells.join(""));
        }
        println!();
        println!("Test acc: {:.4}", self.accuracy);
        println!("Recall:    {:.4}", self.weighted_recall());
        println!("Precision: {:.4}", self.weighted_precision());
        println!("F1-Score:  {:.4}", self.weighted_f1());
    }
}
