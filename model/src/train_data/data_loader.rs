use ndarray::{s, Array2, Array4, ArrayView3, Axis, Zip};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{CapsNetError, Result};

/// Train and test splits; images are (N, C, H, W) in [0, 1], labels one-hot (N, classes).
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train_images: Array4<f32>,
    pub train_labels: Array2<f32>,
    pub test_images: Array4<f32>,
    pub test_labels: Array2<f32>,
}

impl Dataset {
    pub fn num_classes(&self) -> usize {
        self.train_labels.ncols()
    }

    /// (channels, height, width) of one image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.train_images.dim();
        (c, h, w)
    }

    /// Keeps only the first `max_samples` training samples.
    pub fn truncate_train(&mut self, max_samples: usize) {
        let n = max_samples.min(self.train_images.len_of(Axis(0)));
        self.train_images = self.train_images.slice(s![..n, .., .., ..]).to_owned();
        self.train_labels = self.train_labels.slice(s![..n, ..]).to_owned();
        info!(samples = n, "training split truncated");
    }
}

/// One-hot encoding of class indices.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(CapsNetError::Data(format!(
                "label {} out of range for {} classes",
                label, num_classes
            )));
        }
        encoded[[i, label]] = 1.0;
    }
    Ok(encoded)
}

pub const CIFAR_SIDE: usize = 32;
pub const CIFAR_CLASSES: usize = 10;
const CIFAR_RECORD: usize = 1 + 3 * CIFAR_SIDE * CIFAR_SIDE;

/// Reader for the CIFAR-10 binary distribution (`data_batch_1..5.bin`, `test_batch.bin`).
pub struct Cifar10Loader {
    data_dir: PathBuf,
}

impl Cifar10Loader {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Loads both splits. `extra_classes` widens the one-hot labels (e.g. 1 for a
    /// "none of the above" class that is never a target).
    pub fn load(&self, extra_classes: usize) -> Result<Dataset> {
        let start = Instant::now();
        let train_files: Vec<PathBuf> = (1..=5)
            .map(|i| self.data_dir.join(format!("data_batch_{}.bin", i)))
            .collect();
        let (train_images, train_classes) = self.read_files(&train_files)?;
        let (test_images, test_classes) = self.read_files(&[self.data_dir.join("test_batch.bin")])?;

        let num_classes = CIFAR_CLASSES + extra_classes;
        let dataset = Dataset {
            train_images,
            train_labels: one_hot(&train_classes, num_classes)?,
            test_images,
            test_labels: one_hot(&test_classes, num_classes)?,
        };
        info!(
            train = dataset.train_images.dim().0,
            test = dataset.test_images.dim().0,
            classes = num_classes,
            elapsed = ?start.elapsed(),
            "CIFAR-10 loaded"
        );
        Ok(dataset)
    }

    fn read_files(&self, paths: &[PathBuf]) -> Result<(Array4<f32>, Vec<usize>)> {
        let mut bytes = Vec::new();
        for path in paths {
            let content = fs::read(path).map_err(|e| {
                CapsNetError::Data(format!("cannot read {}: {}", path.display(), e))
            })?;
            debug!(path = %path.display(), bytes = content.len(), "read CIFAR-10 batch");
            bytes.extend(content);
        }
        parse_cifar_records(&bytes)
    }
}

/// Parses records of 1 label byte followed by the R, G and B planes (32x32, row-major).
pub fn parse_cifar_records(bytes: &[u8]) -> Result<(Array4<f32>, Vec<usize>)> {
    if bytes.len() % CIFAR_RECORD != 0 {
        return Err(CapsNetError::Data(format!(
            "{} bytes is not a whole number of {}-byte CIFAR-10 records",
            bytes.len(),
            CIFAR_RECORD
        )));
    }
    let count = bytes.len() / CIFAR_RECORD;
    let mut images = Array4::zeros((count, 3, CIFAR_SIDE, CIFAR_SIDE));
    let mut labels = Vec::with_capacity(count);

    for (record, mut image) in bytes.chunks_exact(CIFAR_RECORD).zip(images.outer_iter_mut()) {
        let label = record[0] as usize;
        if label >= CIFAR_CLASSES {
            return Err(CapsNetError::Data(format!("invalid CIFAR-10 label {}", label)));
        }
        labels.push(label);
        let pixels = ArrayView3::from_shape((3, CIFAR_SIDE, CIFAR_SIDE), &record[1..])?;
        Zip::from(&mut image)
            .and(&pixels)
            .for_each(|dst, &src| *dst = src as f32 / 255.0);
    }
    Ok((images, labels))
}
