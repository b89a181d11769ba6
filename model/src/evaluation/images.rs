use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{ArrayView3, ArrayView4, Axis};
use std::path::Path;

use crate::error::{CapsNetError, Result};

/// Converts a (channels, height, width) image in [0, 1] to 8-bit RGB.
/// Single-channel images are rendered as grey.
pub fn to_rgb_image(image: &ArrayView3<f32>) -> Result<RgbImage> {
    let (channels, height, width) = image.dim();
    if channels != 1 && channels != 3 {
        return Err(CapsNetError::ShapeMismatch {
            name: "image".to_string(),
            expected: vec![3, height, width],
            found: image.shape().to_vec(),
        });
    }
    let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        if channels == 1 {
            let v = to_byte(image[[0, y, x]]);
            Rgb([v, v, v])
        } else {
            Rgb([
                to_byte(image[[0, y, x]]),
                to_byte(image[[1, y, x]]),
                to_byte(image[[2, y, x]]),
            ])
        }
    }))
}

/// Tiles images row-major, `per_row` images per row. Unfilled cells stay black.
pub fn stack_images(images: &[ArrayView3<f32>], per_row: usize) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| CapsNetError::Data("no images to stack".to_string()))?;
    let (_, height, width) = first.dim();
    let per_row = per_row.max(1);
    let rows = images.len().div_ceil(per_row);
    let mut canvas = RgbImage::new((per_row * width) as u32, (rows * height) as u32);

    for (i, image) in images.iter().enumerate() {
        if image.dim().1 != height || image.dim().2 != width {
            return Err(CapsNetError::ShapeMismatch {
                name: format!("image {}", i),
                expected: vec![image.dim().0, height, width],
                found: image.shape().to_vec(),
            });
        }
        let tile = to_rgb_image(image)?;
        let (col, row) = (i % per_row, i / per_row);
        imageops::replace(&mut canvas, &tile, (col * width) as i64, (row * height) as i64);
    }
    Ok(canvas)
}

/// A `rows` x `cols` grid alternating `first[i]` and `second[i]`.
pub fn stack_images_two_arrays(
    first: &ArrayView4<f32>,
    second: &ArrayView4<f32>,
    rows: usize,
    cols: usize,
) -> Result<RgbImage> {
    let pairs = (rows * cols / 2)
        .min(first.len_of(Axis(0)))
        .min(second.len_of(Axis(0)));
    let mut tiles = Vec::with_capacity(2 * pairs);
    for i in 0..pairs {
        tiles.push(first.index_axis(Axis(0), i));
        tiles.push(second.index_axis(Axis(0), i));
    }
    stack_images(&tiles, cols)
}

pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    imageops::resize(image, width, height, FilterType::Triangle)
}

pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    #[test]
    fn test_to_rgb_scales_and_clamps() {
        let mut image = Array3::<f32>::zeros((3, 2, 2));
        image[[0, 0, 1]] = 1.0;
        image[[1, 1, 0]] = 0.5;
        image[[2, 1, 1]] = 7.0;

        let rgb = to_rgb_image(&image.view()).unwrap();

        assert_eq!(rgb.dimensions(), (2, 2));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([255, 0, 0]));
        assert_eq!(rgb.get_pixel(0, 1), &Rgb([0, 128, 0]));
        assert_eq!(rgb.get_pixel(1, 1), &Rgb([0, 0, 255]));
    }

    #[test]
    fn test_grey_images_are_replicated() {
        let image = Array3::<f32>::from_elem((1, 1, 1), 1.0);
        let rgb = to_rgb_image(&image.view()).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert!(to_rgb_image(&Array3::<f32>::zeros((2, 1, 1)).view()).is_err());
    }

    #[test]
    fn test_stack_images_layout() {
        let white = Array3::<f32>::ones((3, 2, 3));
        let black = Array3::<f32>::zeros((3, 2, 3));
        let views = vec![white.view(), black.view(), white.view()];

        let grid = stack_images(&views, 2).unwrap();

        assert_eq!(grid.dimensions(), (6, 4));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(3, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(0, 2), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(5, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_two_arrays_alternate() {
        let first = Array4::<f32>::ones((3, 3, 1, 1));
        let second = Array4::<f32>::zeros((3, 3, 1, 1));

        let grid = stack_images_two_arrays(&first.view(), &second.view(), 2, 2).unwrap();

        assert_eq!(grid.dimensions(), (2, 2));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(0, 1), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_save_and_resize() {
        let dir = tempfile::tempdir().unwrap();
        let image = Array3::<f32>::ones((3, 4, 4));
        let rgb = resize(&to_rgb_image(&image.view()).unwrap(), 8, 8);
        let path = dir.path().join("out.png");

        save_image(&rgb, &path).unwrap();

        assert_eq!(image::open(&path).unwrap().width(), 8);
    }

    #[test]
    fn test_empty_stack_rejected() {
        assert!(stack_images(&[], 3).is_err());
    }
}
