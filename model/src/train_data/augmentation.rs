use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{CapsNetError, Result};

/// Random transformations applied to every batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Augmentation {
    /// Maximum shift as a fraction of width/height, in each direction.
    pub shift_fraction: f32,
    /// Maximum rotation in degrees, in each direction.
    pub rotation_range: f32,
    /// Random crop to (rows, columns).
    pub crop: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct Warp {
    angle: f32,
    dx: f32,
    dy: f32,
}

impl Augmentation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.shift_fraction == 0.0 && self.rotation_range == 0.0 && self.crop.is_none()
    }

    pub fn apply<R: Rng>(&self, images: &ArrayView4<f32>, rng: &mut R) -> Result<Array4<f32>> {
        let (_, _, height, width) = images.dim();
        let warps: Vec<Warp> = (0..images.dim().0)
            .map(|_| Warp {
                angle: symmetric(rng, self.rotation_range).to_radians(),
                dx: symmetric(rng, self.shift_fraction) * width as f32,
                dy: symmetric(rng, self.shift_fraction) * height as f32,
            })
            .collect();

        let mut warped = images.to_owned();
        if self.shift_fraction > 0.0 || self.rotation_range > 0.0 {
            Zip::from(warped.outer_iter_mut())
                .and(images.outer_iter())
                .and(warps.as_slice())
                .par_for_each(|mut out, image, warp| {
                    out.assign(&warp_image(&image, warp.angle, warp.dx, warp.dy));
                });
        }

        match self.crop {
            Some((rows, cols)) => random_crop(&warped.view(), rows, cols, rng),
            None => Ok(warped),
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.random_range(-range..=range)
    } else {
        0.0
    }
}

/// Bilinear resampling of a (C, H, W) image under rotation plus translation.
fn warp_image(image: &ArrayView3<f32>, angle: f32, dx: f32, dy: f32) -> Array3<f32> {
    let (channels, height, width) = image.dim();
    if height == 0 || width == 0 {
        return image.to_owned();
    }
    let (sin, cos) = angle.sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    let mut out = Array3::zeros((channels, height, width));
    for y in 0..height {
        for x in 0..width {
            let xr = x as f32 - cx - dx;
            let yr = y as f32 - cy - dy;
            let sx = (cos * xr + sin * yr + cx).clamp(0.0, max_x);
            let sy = (-sin * xr + cos * yr + cy).clamp(0.0, max_y);

            let (x0, y0) = (sx.floor() as usize, sy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
            let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
            for c in 0..channels {
                let top = image[[c, y0, x0]] * (1.0 - fx) + image[[c, y0, x1]] * fx;
                let bottom = image[[c, y1, x0]] * (1.0 - fx) + image[[c, y1, x1]] * fx;
                out[[c, y, x]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

/// Crops every image of the batch to (rows, cols) at an independent random position.
pub fn random_crop<R: Rng>(images: &ArrayView4<f32>, rows: usize, cols: usize, rng: &mut R) -> Result<Array4<f32>> {
    let (batch_size, channels, height, width) = images.dim();
    if rows == 0 || cols == 0 || rows > height || cols > width {
        return Err(CapsNetError::InvalidConfig(format!(
            "crop {}x{} does not fit {}x{} images",
            rows, cols, height, width
        )));
    }
    let mut cropped = Array4::zeros((batch_size, channels, rows, cols));
    for (mut out, image) in cropped.outer_iter_mut().zip(images.outer_iter()) {
        let top = rng.random_range(0..=height - rows);
        let left = rng.random_range(0..=width - cols);
        out.assign(&image.slice(ndarray::s![.., top..top + rows, left..left + cols]));
    }
    Ok(cropped)
}

/// One batch of augmented images with their labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array2<f32>,
}

/// Endless source of augmented batches. A pass covers every sample once; the
/// last batch of a pass may be smaller. With `shuffle` the order is redrawn
/// at the start of every pass, otherwise samples come in dataset order.
pub struct BatchGenerator<'a> {
    images: ArrayView4<'a, f32>,
    labels: ArrayView2<'a, f32>,
    batch_size: usize,
    augmentation: Augmentation,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> BatchGenerator<'a> {
    pub fn new(
        images: ArrayView4<'a, f32>,
        labels: ArrayView2<'a, f32>,
        batch_size: usize,
        augmentation: Augmentation,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let n = images.len_of(Axis(0));
        if labels.nrows() != n {
            return Err(CapsNetError::ShapeMismatch {
                name: "labels".to_string(),
                expected: vec![n, labels.ncols()],
                found: labels.shape().to_vec(),
            });
        }
        if batch_size == 0 {
            return Err(CapsNetError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if let Some((rows, cols)) = augmentation.crop {
            let (_, _, h, w) = images.dim();
            if rows == 0 || cols == 0 || rows > h || cols > w {
                return Err(CapsNetError::InvalidConfig(format!(
                    "crop {}x{} does not fit {}x{} images",
                    rows, cols, h, w
                )));
            }
        }

        let mut generator = Self {
            images,
            labels,
            batch_size,
            augmentation,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            order: (0..n).collect(),
            cursor: 0,
        };
        generator.start_pass();
        Ok(generator)
    }

    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    fn start_pass(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

impl Iterator for BatchGenerator<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.start_pass();
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let images = self.images.select(Axis(0), indices);
        let labels = self.labels.select(Axis(0), indices);
        let images = if self.augmentation.is_identity() {
            Ok(images)
        } else {
            self.augmentation.apply(&images.view(), &mut self.rng)
        };
        Some(images.map(|images| Batch { images, labels }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn ramp() -> Array3<f32> {
        Array::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32)
    }

    fn shift(image: &ArrayView3<f32>, dx: f32, dy: f32) -> Array3<f32> {
        warp_image(image, 0.0, dx, dy)
    }

    fn rotate(image: &ArrayView3<f32>, degrees: f32) -> Array3<f32> {
        warp_image(image, degrees.to_radians(), 0.0, 0.0)
    }

    #[test]
    fn test_integer_shift_with_nearest_fill() {
        let shifted = shift(&ramp().view(), 1.0, 0.0);
        // column 0 repeats the original edge, the rest moves right by one
        assert_eq!(shifted.slice(ndarray::s![0, 1, ..]).to_vec(), vec![4.0, 4.0, 5.0, 6.0]);
        let shifted = shift(&ramp().view(), 0.0, -1.0);
        assert_eq!(shifted.slice(ndarray::s![0, 3, ..]).to_vec(), vec![12.0, 13.0, 14.0, 15.0]);
        assert_eq!(shifted.slice(ndarray::s![0, 0, ..]).to_vec(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let image = ramp();
        let rotated = rotate(&image.view(), 0.0);
        for (a, b) in image.iter().zip(rotated.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_half_turn_reverses_image() {
        let image = ramp();
        let rotated = rotate(&image.view(), 180.0);
        assert_abs_diff_eq!(rotated[[0, 0, 0]], 15.0, epsilon = 1e-4);
        assert_abs_diff_eq!(rotated[[0, 3, 3]], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(rotated[[0, 1, 2]], 9.0, epsilon = 1e-4);
    }

    #[test]
    fn test_random_crop_size_and_content() {
        let mut rng = StdRng::seed_from_u64(1);
        let images = ramp().insert_axis(Axis(0));
        let cropped = random_crop(&images.view(), 2, 3, &mut rng).unwrap();
        assert_eq!(cropped.dim(), (1, 1, 2, 3));
        // consecutive row entries of the ramp differ by 1, columns by 4
        assert_eq!(cropped[[0, 0, 0, 1]] - cropped[[0, 0, 0, 0]], 1.0);
        assert_eq!(cropped[[0, 0, 1, 0]] - cropped[[0, 0, 0, 0]], 4.0);

        assert!(random_crop(&images.view(), 5, 2, &mut rng).is_err());
    }

    #[test]
    fn test_generator_covers_every_sample_each_pass() {
        let images = Array4::from_shape_fn((5, 1, 2, 2), |(n, _, _, _)| n as f32);
        let labels = Array2::from_shape_fn((5, 1), |(n, _)| n as f32);
        let mut generator =
            BatchGenerator::new(images.view(), labels.view(), 2, Augmentation::none(), true, 3).unwrap();

        let mut seen: Vec<f32> = Vec::new();
        let sizes: Vec<usize> = (0..3)
            .map(|_| {
                let batch = generator.next().unwrap().unwrap();
                seen.extend(batch.labels.iter());
                for (img, label) in batch.images.outer_iter().zip(batch.labels.iter()) {
                    assert_eq!(img[[0, 0, 0]], *label);
                }
                batch.labels.nrows()
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        seen.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        // the generator never runs dry
        assert_eq!(generator.next().unwrap().unwrap().labels.nrows(), 2);
    }

    #[test]
    fn test_unshuffled_generator_keeps_order() {
        let images = Array4::<f32>::zeros((4, 1, 3, 3));
        let labels = array![[0.0], [1.0], [2.0], [3.0]];
        let augmentation = Augmentation {
            shift_fraction: 0.1,
            rotation_range: 10.0,
            crop: Some((2, 2)),
        };
        let mut generator = BatchGenerator::new(images.view(), labels.view(), 3, augmentation, false, 0).unwrap();

        let first = generator.next().unwrap().unwrap();
        let second = generator.next().unwrap().unwrap();

        assert_eq!(first.labels, array![[0.0], [1.0], [2.0]]);
        assert_eq!(second.labels, array![[3.0]]);
        assert_eq!(first.images.dim(), (3, 1, 2, 2));
    }

    #[test]
    fn test_generator_rejects_oversized_crop() {
        let images = Array4::<f32>::zeros((2, 1, 3, 3));
        let labels = Array2::<f32>::zeros((2, 2));
        let augmentation = Augmentation {
            crop: Some((4, 2)),
            ..Augmentation::none()
        };
        assert!(BatchGenerator::new(images.view(), labels.view(), 1, augmentation, false, 0).is_err());
    }
}
