use ndarray::{Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::info;

use super::data_loader::{one_hot, Dataset};
use crate::error::{CapsNetError, Result};

pub const NUM_FORM_CLASSES: usize = 2;
pub const RECTANGLE: usize = 0;
pub const TRIANGLE: usize = 1;

/// Parameters of one rendered form. Offsets and sizes are fractions of the
/// image size, the rotation is in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormSettings {
    /// 0: rectangle, 1: isosceles triangle
    pub class: usize,
    /// Shift of the form centre from the image centre, (x, y).
    pub offset: (f32, f32),
    pub phi: f32,
    /// Rectangle: (width, height). Triangle: (base, height).
    pub size: (f32, f32),
}

impl FormSettings {
    pub fn new(class: usize, offset: (f32, f32), phi: f32, size: (f32, f32)) -> Self {
        Self {
            class,
            offset,
            phi,
            size,
        }
    }

    /// Whether the point (u, v), relative to the form centre and in image
    /// fractions, lies inside the form.
    fn contains(&self, u: f32, v: f32) -> bool {
        let (sin, cos) = self.phi.sin_cos();
        // rotate the point into the form frame
        let x = u * cos + v * sin;
        let y = -u * sin + v * cos;
        let (a, b) = self.size;
        match self.class {
            RECTANGLE => x.abs() <= a / 2.0 && y.abs() <= b / 2.0,
            _ => {
                // apex at y = -b/2, base of width a at y = +b/2
                if y < -b / 2.0 || y > b / 2.0 || b <= 0.0 {
                    return false;
                }
                let half_width = a / 2.0 * (y + b / 2.0) / b;
                x.abs() <= half_width
            }
        }
    }
}

/// Renders a white form on a black RGB background, (3, height, width) in [0, 1].
pub fn generate_image(width: usize, height: usize, settings: &FormSettings) -> Result<(Array3<f32>, usize)> {
    if settings.class >= NUM_FORM_CLASSES {
        return Err(CapsNetError::Data(format!("unknown form class {}", settings.class)));
    }
    let (cx, cy) = (0.5 + settings.offset.0, 0.5 + settings.offset.1);
    let mut image = Array3::zeros((3, height, width));
    for py in 0..height {
        for px in 0..width {
            let u = (px as f32 + 0.5) / width as f32 - cx;
            let v = (py as f32 + 0.5) / height as f32 - cy;
            if settings.contains(u, v) {
                for c in 0..3 {
                    image[[c, py, px]] = 1.0;
                }
            }
        }
    }
    Ok((image, settings.class))
}

/// Seeded source of random form images.
pub struct SymmetricFormsGenerator {
    pub width: usize,
    pub height: usize,
    rng: StdRng,
}

impl SymmetricFormsGenerator {
    pub fn new(width: usize, height: usize, seed: u64) -> Self {
        Self {
            width,
            height,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random_settings(&mut self) -> FormSettings {
        let rng = &mut self.rng;
        FormSettings {
            class: rng.random_range(0..NUM_FORM_CLASSES),
            offset: (rng.random_range(-0.15..0.15), rng.random_range(-0.15..0.15)),
            phi: rng.random_range(-PI..PI),
            size: (rng.random_range(0.25..0.5), rng.random_range(0.2..0.45)),
        }
    }

    fn split(&mut self, count: usize) -> Result<(Array4<f32>, Vec<usize>)> {
        let mut images = Array4::zeros((count, 3, self.height, self.width));
        let mut classes = Vec::with_capacity(count);
        for mut slot in images.axis_iter_mut(Axis(0)) {
            let settings = self.random_settings();
            let (image, class) = generate_image(self.width, self.height, &settings)?;
            slot.assign(&image);
            classes.push(class);
        }
        Ok((images, classes))
    }

    /// Draws the train and test splits.
    pub fn load_data(&mut self, num_train: usize, num_test: usize) -> Result<Dataset> {
        let (train_images, train_classes) = self.split(num_train)?;
        let (test_images, test_classes) = self.split(num_test)?;
        info!(train = num_train, test = num_test, "symmetric forms generated");
        Ok(Dataset {
            train_images,
            train_labels: one_hot(&train_classes, NUM_FORM_CLASSES)?,
            test_images,
            test_labels: one_hot(&test_classes, NUM_FORM_CLASSES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(image: &Array3<f32>) -> f32 {
        image.index_axis(Axis(0), 0).sum()
    }

    #[test]
    fn test_centred_rectangle() {
        let settings = FormSettings::new(RECTANGLE, (0.0, 0.0), 0.0, (0.5, 0.27));
        let (image, class) = generate_image(28, 28, &settings).unwrap();

        assert_eq!(class, RECTANGLE);
        assert_eq!(image.dim(), (3, 28, 28));
        assert_eq!(image[[0, 14, 14]], 1.0);
        assert_eq!(image[[2, 0, 0]], 0.0);
        // 14 x 8 pixels
        assert_eq!(area(&image), 112.0);
    }

    #[test]
    fn test_triangle_points_up() {
        let settings = FormSettings::new(TRIANGLE, (0.0, 0.0), 0.0, (0.5, 0.5));
        let (image, _) = generate_image(40, 40, &settings).unwrap();

        let top_row: f32 = image.slice(ndarray::s![0, 11, ..]).sum();
        let bottom_row: f32 = image.slice(ndarray::s![0, 28, ..]).sum();
        assert!(top_row < bottom_row);
        let rect = generate_image(40, 40, &FormSettings::new(RECTANGLE, (0.0, 0.0), 0.0, (0.5, 0.5)))
            .unwrap()
            .0;
        assert!(area(&image) < area(&rect));
    }

    #[test]
    fn test_offset_moves_form() {
        let settings = FormSettings::new(RECTANGLE, (0.25, 0.0), 0.0, (0.2, 0.2));
        let (image, _) = generate_image(20, 20, &settings).unwrap();
        assert_eq!(image[[0, 10, 15]], 1.0);
        assert_eq!(image[[0, 10, 5]], 0.0);
    }

    #[test]
    fn test_half_turn_keeps_rectangle() {
        let base = FormSettings::new(RECTANGLE, (0.0, 0.0), 0.0, (0.5, 0.27));
        let turned = FormSettings { phi: PI, ..base };
        let (a, _) = generate_image(28, 28, &base).unwrap();
        let (b, _) = generate_image(28, 28, &turned).unwrap();
        let differing = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
        // only boundary pixels may flip through rounding
        assert!(differing < 3 * 28);
    }

    #[test]
    fn test_unknown_class_rejected() {
        let settings = FormSettings::new(2, (0.0, 0.0), 0.0, (0.5, 0.5));
        assert!(generate_image(8, 8, &settings).is_err());
    }

    #[test]
    fn test_load_data_is_seeded() {
        let a = SymmetricFormsGenerator::new(16, 16, 3).load_data(6, 4).unwrap();
        let b = SymmetricFormsGenerator::new(16, 16, 3).load_data(6, 4).unwrap();

        assert_eq!(a.train_images.dim(), (6, 3, 16, 16));
        assert_eq!(a.test_labels.dim(), (4, 2));
        assert_eq!(a.train_images, b.train_images);
        assert_eq!(a.train_labels, b.train_labels);
        for row in a.train_labels.rows() {
            assert_eq!(row.sum(), 1.0);
        }
    }
}
