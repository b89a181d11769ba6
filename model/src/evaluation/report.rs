use ndarray::{concatenate, s, Array4, ArrayView2, ArrayView4, Axis};
use std::path::Path;
use tracing::{debug, info};

use super::images::{resize, save_image, stack_images_two_arrays, to_rgb_image};
use crate::error::{CapsNetError, Result};
use crate::model::core::{label_indices, predicted_classes, CapsNet, Phase};
use crate::model::loss::Metrics;
use crate::train_data::augmentation::{Augmentation, BatchGenerator};

/// Predictions over the test split together with the inputs the model saw.
pub struct TestReport {
    pub metrics: Metrics,
    pub predicted: Vec<usize>,
    pub truth: Vec<usize>,
    /// Augmented test inputs, in test-split order.
    pub inputs: Array4<f32>,
    pub reconstructions: Array4<f32>,
}

/// Predicts the test split in full batches of `batch_size`; a trailing
/// partial batch is left out. Inputs go through `augmentation` in order.
pub fn run_test(
    model: &mut CapsNet,
    images: &ArrayView4<f32>,
    labels: &ArrayView2<f32>,
    batch_size: usize,
    augmentation: Augmentation,
    seed: u64,
) -> Result<TestReport> {
    let steps = images.len_of(Axis(0)) / batch_size.max(1);
    if steps == 0 {
        return Err(CapsNetError::Data(format!(
            "test split holds fewer than {} samples",
            batch_size
        )));
    }
    let generator = BatchGenerator::new(images.view(), labels.view(), batch_size, augmentation, false, seed)?;

    let mut inputs = Vec::with_capacity(steps);
    let mut reconstructions = Vec::with_capacity(steps);
    let mut predicted = Vec::with_capacity(steps * batch_size);
    let mut truth = Vec::with_capacity(steps * batch_size);
    for batch in generator.take(steps) {
        let batch = batch?;
        let output = model.forward(&batch.images.view(), Phase::Inference)?;
        predicted.extend(predicted_classes(&output.lengths.view()));
        truth.extend(label_indices(&batch.labels.view()));
        inputs.push(batch.images);
        reconstructions.push(output.reconstruction);
    }
    debug!(batches = steps, "test predictions done");

    let stack = |parts: &[Array4<f32>]| -> Result<Array4<f32>> {
        let views: Vec<ArrayView4<f32>> = parts.iter().map(|a| a.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    };
    let metrics = Metrics::compute(&predicted, &truth, labels.ncols())?;
    info!(samples = predicted.len(), accuracy = metrics.accuracy, "test finished");

    Ok(TestReport {
        metrics,
        predicted,
        truth,
        inputs: stack(&inputs)?,
        reconstructions: stack(&reconstructions)?,
    })
}

impl TestReport {
    pub fn misclassified(&self) -> Vec<usize> {
        self.predicted
            .iter()
            .zip(&self.truth)
            .enumerate()
            .filter(|(_, (p, t))| p != t)
            .map(|(i, _)| i)
            .collect()
    }

    /// Writes `real_and_recon.png` and one `wrongly_classified_{i}.png` per miss.
    pub fn save_artifacts(&self, save_dir: &Path) -> Result<()> {
        let grid = stack_images_two_arrays(&self.inputs.view(), &self.reconstructions.view(), 10, 10)?;
        save_image(&resize(&grid, 700, 700), &save_dir.join("real_and_recon.png"))?;

        let missed = self.misclassified();
        for &i in &missed {
            let image = to_rgb_image(&self.inputs.slice(s![i, .., .., ..]))?;
            save_image(&image, &save_dir.join(format!("wrongly_classified_{}.png", i)))?;
        }
        info!(misclassified = missed.len(), dir = %save_dir.display(), "test images saved");
        Ok(())
    }
}
