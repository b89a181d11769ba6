use ndarray::{s, Array3, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::images::{resize, save_image, stack_images};
use crate::error::Result;
use crate::model::capsule::argmax;
use crate::model::core::CapsNet;

/// Produces an adversarial version of one correctly classified sample.
pub trait Attack {
    /// `None` when no adversarial input was found.
    fn perturb(&self, model: &mut CapsNet, image: &ArrayView3<f32>, label: &ArrayView2<f32>) -> Result<Option<Array3<f32>>>;
}

/// Fast gradient sign method: one step of size `epsilon` along the sign of
/// the margin-loss gradient, clipped to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct Fgsm {
    pub epsilon: f32,
}

impl Attack for Fgsm {
    fn perturb(&self, model: &mut CapsNet, image: &ArrayView3<f32>, label: &ArrayView2<f32>) -> Result<Option<Array3<f32>>> {
        let input = image.insert_axis(Axis(0));
        let grad = model.input_gradient(&input, label)?;
        let grad = grad.index_axis(Axis(0), 0);
        if grad.iter().all(|&g| g == 0.0) {
            return Ok(None);
        }
        let mut adversarial = image.to_owned();
        Zip::from(&mut adversarial)
            .and(&grad)
            .for_each(|x, &g| *x = (*x + self.epsilon * sign(g)).clamp(0.0, 1.0));
        Ok(Some(adversarial))
    }
}

fn sign(g: f32) -> f32 {
    if g > 0.0 {
        1.0
    } else if g < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Outcome counts; `examined = skipped + attempted`, `attempted = succeeded + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttackReport {
    pub examined: usize,
    /// Already misclassified before the attack.
    pub skipped: usize,
    pub attempted: usize,
    pub succeeded: usize,
    /// Includes attacks that found no adversarial input.
    pub failed: usize,
}

impl AttackReport {
    /// Percentage of attempted attacks that changed the prediction.
    pub fn success_rate(&self) -> Option<f32> {
        if self.attempted == 0 {
            None
        } else {
            Some(self.succeeded as f32 / self.attempted as f32 * 100.0)
        }
    }

    pub fn print(&self) {
        match self.success_rate() {
            None => println!("(Warning) No attack executed. Possible all predictions where wrong."),
            Some(rate) => {
                println!("{}", "_".repeat(47));
                println!("Num attacks: {}", self.attempted);
                println!("Num successfull attacks: {}", self.succeeded);
                println!("Successrate [%]: {}", rate);
            }
        }
    }
}

/// Runs `attack` over the first `max_num_attacks` test samples.
pub struct AttackDriver<'a, A: Attack> {
    pub attack: &'a A,
    pub max_num_attacks: usize,
    /// When set, the first adversarial example is saved as an image triple here.
    pub debug_dir: Option<PathBuf>,
}

impl<'a, A: Attack> AttackDriver<'a, A> {
    pub fn new(attack: &'a A, max_num_attacks: usize) -> Self {
        Self {
            attack,
            max_num_attacks,
            debug_dir: None,
        }
    }

    pub fn with_debug_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.debug_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn run(&self, model: &mut CapsNet, images: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<AttackReport> {
        let total = self.max_num_attacks.min(images.len_of(Axis(0)));
        let mut report = AttackReport::default();
        let mut debug_pending = self.debug_dir.is_some();

        for i in 0..total {
            report.examined += 1;
            let image = images.index_axis(Axis(0), i);
            let label = labels.slice(s![i..i + 1, ..]);
            let truth = argmax(&label.row(0));

            if predict_one(model, &image)? != truth {
                report.skipped += 1;
                continue;
            }

            report.attempted += 1;
            let Some(adversarial) = self.attack.perturb(model, &image, &label)? else {
                report.failed += 1;
                continue;
            };
            if predict_one(model, &adversarial.view())? != truth {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            if debug_pending {
                if let Some(dir) = &self.debug_dir {
                    save_attack_image(&image, &adversarial.view(), &dir.join("attack.png"))?;
                }
                debug_pending = false;
            }
            if (i + 1) % 50 == 0 {
                debug!(progress = i + 1, total, "running attack");
            }
        }

        if report.attempted == 0 {
            warn!("no attack executed, every examined sample was already misclassified");
        } else {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                rate = report.success_rate(),
                "attack finished"
            );
        }
        Ok(report)
    }
}

fn predict_one(model: &mut CapsNet, image: &ArrayView3<f32>) -> Result<usize> {
    let predicted = model.predict(&image.insert_axis(Axis(0)))?;
    Ok(predicted[0])
}

/// Saves original, adversarial and the difference (scaled to +-0.2 around
/// grey) side by side, enlarged five times.
fn save_attack_image(original: &ArrayView3<f32>, adversarial: &ArrayView3<f32>, path: &Path) -> Result<()> {
    let diff = adversarial - original;
    let max = diff.iter().fold(0.0f32, |m, &d| m.max(d.abs()));
    let scale = if max > 0.0 { 0.2 / max } else { 0.0 };
    let diff = diff.mapv(|d| d * scale + 0.5);

    let grid = stack_images(&[original.view(), adversarial.view(), diff.view()], 3)?;
    let (w, h) = grid.dimensions();
    save_image(&resize(&grid, w * 5, h * 5), path)?;
    info!(path = %path.display(), "attack image saved");
    Ok(())
}
