use ndarray::{s, Array2, Array3, ArrayView2, ArrayView4, Axis};
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::info;

use super::images::{save_image, stack_images};
use crate::error::{CapsNetError, Result};
use crate::model::core::{label_indices, CapsNet};
use crate::train_data::augmentation::random_crop;

pub const LATENT_STEPS: usize = 11;
const LATENT_RANGE: f32 = 0.25;

/// -0.25, -0.20, ..., 0.25
pub fn latent_steps() -> Vec<f32> {
    let step = 2.0 * LATENT_RANGE / (LATENT_STEPS - 1) as f32;
    (0..LATENT_STEPS).map(|i| -LATENT_RANGE + step * i as f32).collect()
}

/// Reconstructions of one sample while one capsule dimension at a time is
/// shifted by every value of `latent_steps`. Rows follow the dimensions.
pub fn latent_sweep(model: &mut CapsNet, input: &ArrayView4<f32>, label: &ArrayView2<f32>) -> Result<Vec<Array3<f32>>> {
    let (num_classes, out_dim) = (model.config.num_classes, model.config.out_dim);
    let mut reconstructions = Vec::with_capacity(out_dim * LATENT_STEPS);
    for dim in 0..out_dim {
        for r in latent_steps() {
            let mut noise = Array2::<f32>::zeros((num_classes, out_dim));
            noise.column_mut(dim).fill(r);
            let recon = model.decode_with_noise(input, label, &noise.view())?;
            reconstructions.push(recon.index_axis_move(Axis(0), 0));
        }
    }
    Ok(reconstructions)
}

/// Sweeps a random test sample of `class` and saves `manipulate-{class}.png`.
pub fn manipulate_latent<R: Rng>(
    model: &mut CapsNet,
    images: &ArrayView4<f32>,
    labels: &ArrayView2<f32>,
    class: usize,
    crop: Option<(usize, usize)>,
    rng: &mut R,
    save_dir: &Path,
) -> Result<PathBuf> {
    let candidates: Vec<usize> = label_indices(labels)
        .into_iter()
        .enumerate()
        .filter(|&(_, c)| c == class)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return Err(CapsNetError::Data(format!("no test sample of class {}", class)));
    }
    let index = candidates[rng.random_range(0..candidates.len())];

    let mut input = images.slice(s![index..index + 1, .., .., ..]).to_owned();
    if let Some((rows, cols)) = crop {
        input = random_crop(&input.view(), rows, cols, rng)?;
    }
    let label = labels.slice(s![index..index + 1, ..]);

    let reconstructions = latent_sweep(model, &input.view(), &label)?;
    let views: Vec<_> = reconstructions.iter().map(|r| r.view()).collect();
    let grid = stack_images(&views, LATENT_STEPS)?;

    let path = save_dir.join(format!("manipulate-{}.png", class));
    save_image(&grid, &path)?;
    info!(class, sample = index, path = %path.display(), "latent manipulation saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::core::tests::tiny_model;
    use crate::model::layers::tests::random_array;
    use crate::train_data::data_loader::one_hot;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_latent_steps() {
        let steps = latent_steps();
        assert_eq!(steps.len(), 11);
        assert_abs_diff_eq!(steps[0], -0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(steps[5], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(steps[10], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(steps[1] - steps[0], 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_sweep_covers_every_dimension() {
        let mut model = tiny_model(1);
        let mut rng = StdRng::seed_from_u64(0);
        let input = random_array((1, 1, 8, 8), &mut rng).mapv(f32::abs);
        let label = one_hot(&[1], 3).unwrap();

        let recons = latent_sweep(&mut model, &input.view(), &label.view()).unwrap();

        assert_eq!(recons.len(), 4 * LATENT_STEPS);
        assert_eq!(recons[0].dim(), (1, 8, 8));
        assert_ne!(recons[0], recons[LATENT_STEPS - 1]);
    }

    #[test]
    fn test_manipulate_writes_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model(1);
        let mut rng = StdRng::seed_from_u64(0);
        let images = random_array((4, 1, 8, 8), &mut rng).mapv(f32::abs);
        let labels = one_hot(&[0, 2, 2, 1], 3).unwrap();

        let path = manipulate_latent(&mut model, &images.view(), &labels.view(), 2, None, &mut rng, dir.path()).unwrap();

        assert_eq!(path, dir.path().join("manipulate-2.png"));
        let grid = image::open(&path).unwrap();
        assert_eq!((grid.width(), grid.height()), (8 * 11, 8 * 4));
    }

    #[test]
    fn test_missing_class_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model(1);
        let mut rng = StdRng::seed_from_u64(0);
        let images = Array4::<f32>::zeros((2, 1, 8, 8));
        let labels = one_hot(&[0, 0], 3).unwrap();

        let result = manipulate_latent(&mut model, &images.view(), &labels.view(), 1, None, &mut rng, dir.path());
        assert!(matches!(result, Err(CapsNetError::Data(_))));
    }
}
