use ndarray::{s, ArrayView2, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use super::augmentation::{random_crop, Augmentation, BatchGenerator};
use super::data_loader::Dataset;
use crate::error::{CapsNetError, Result};
use crate::model::checkpoint::save_weights;
use crate::model::config::TrainingConfig;
use crate::model::core::{BatchStats, CapsNet};
use crate::model::loss::LossBreakdown;
use crate::model::optimizer::{Adam, LRScheduler};

pub const LOG_HEADER: &str = "epoch,capsnet_acc,capsnet_loss,decoder_loss,loss,val_capsnet_acc,val_capsnet_loss,val_decoder_loss,val_loss";

/// Averaged statistics of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLog {
    pub epoch: usize,
    pub train: BatchStats,
    pub val: BatchStats,
}

impl EpochLog {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.epoch,
            self.train.accuracy,
            self.train.loss.margin,
            self.train.loss.reconstruction,
            self.train.loss.total(),
            self.val.accuracy,
            self.val.loss.margin,
            self.val.loss.reconstruction,
            self.val.loss.total(),
        )
    }

    /// Console progress line printed after every epoch.
    pub fn progress_line(&self, num_epochs: usize) -> String {
        format!(
            "📅 Epoch {}/{} | 📊 Loss: {:.4} (train) {:.4} (val) | Acc: {:.2}% (train) {:.2}% (val)",
            self.epoch + 1,
            num_epochs,
            self.train.loss.total(),
            self.val.loss.total(),
            self.train.accuracy * 100.0,
            self.val.accuracy * 100.0,
        )
    }
}

/// Sample-weighted running mean of batch statistics.
#[derive(Debug, Default)]
struct StatsAccumulator {
    margin: f64,
    reconstruction: f64,
    accuracy: f64,
    samples: usize,
    reconstruction_weight: f32,
}

impl StatsAccumulator {
    fn add(&mut self, stats: &BatchStats, samples: usize) {
        let n = samples as f64;
        self.margin += stats.loss.margin as f64 * n;
        self.reconstruction += stats.loss.reconstruction as f64 * n;
        self.accuracy += stats.accuracy as f64 * n;
        self.samples += samples;
        self.reconstruction_weight = stats.loss.reconstruction_weight;
    }

    fn mean(&self) -> BatchStats {
        let n = self.samples.max(1) as f64;
        BatchStats {
            loss: LossBreakdown {
                margin: (self.margin / n) as f32,
                reconstruction: (self.reconstruction / n) as f32,
                reconstruction_weight: self.reconstruction_weight,
            },
            accuracy: (self.accuracy / n) as f32,
        }
    }
}

/// Appends one row per epoch to `log.csv`.
pub struct CsvLog {
    writer: BufWriter<File>,
}

impl CsvLog {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", LOG_HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, row: &EpochLog) -> Result<()> {
        writeln!(self.writer, "{}", row.csv_row())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes the run arguments as sorted `key = value` lines.
pub fn write_args(path: &Path, args: &impl Serialize) -> Result<()> {
    let value = serde_json::to_value(args)?;
    let object = value
        .as_object()
        .ok_or_else(|| CapsNetError::Serialization("run arguments must serialise to a map".to_string()))?;
    let mut keys: Vec<&String> = object.keys().collect();
    keys.sort();
    let lines: Vec<String> = keys
        .into_iter()
        .map(|key| {
            let rendered = match &object[key] {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => "None".to_string(),
                other => other.to_string(),
            };
            format!("{} = {}", key, rendered)
        })
        .collect();
    fs::write(path, lines.join("\n"))?;
    Ok(())
}

/// Epoch loop: augmented batches, validation, CSV log and checkpoints.
pub struct Trainer {
    pub config: TrainingConfig,
    pub save_dir: PathBuf,
    pub seed: u64,
}

impl Trainer {
    pub fn new(config: TrainingConfig, save_dir: impl AsRef<Path>, seed: u64) -> Result<Self> {
        config.validate()?;
        let save_dir = save_dir.as_ref().to_path_buf();
        fs::create_dir_all(&save_dir)?;
        Ok(Self {
            config,
            save_dir,
            seed,
        })
    }

    pub fn fit(&self, model: &mut CapsNet, dataset: &Dataset) -> Result<Vec<EpochLog>> {
        let cfg = &self.config;
        let augmentation = Augmentation {
            shift_fraction: cfg.shift_fraction,
            rotation_range: 0.0,
            crop: cfg.crop,
        };
        let mut generator = BatchGenerator::new(
            dataset.train_images.view(),
            dataset.train_labels.view(),
            cfg.batch_size,
            augmentation,
            true,
            self.seed,
        )?;

        // The validation split is cropped once, up front.
        let val_images = match cfg.crop {
            Some((rows, cols)) => {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
                random_crop(&dataset.test_images.view(), rows, cols, &mut rng)?
            }
            None => dataset.test_images.clone(),
        };

        let num_samples = generator.num_samples();
        let steps_per_epoch = (num_samples / cfg.batch_size).max(1);
        if num_samples < cfg.batch_size {
            warn!(num_samples, batch_size = cfg.batch_size, "fewer samples than one batch");
        }

        let mut optimizer = Adam::new(cfg.learning_rate, &cfg.optimizer);
        let scheduler = LRScheduler::exponential(cfg.learning_rate, cfg.lr_decay);
        let mut csv = CsvLog::create(&self.save_dir.join("log.csv"))?;
        let mut history = Vec::with_capacity(cfg.num_epochs);
        let mut best_val_acc = f32::NEG_INFINITY;

        info!(
            epochs = cfg.num_epochs,
            steps_per_epoch,
            batch_size = cfg.batch_size,
            "training started"
        );

        for epoch in 0..cfg.num_epochs {
            let start = Instant::now();
            scheduler.step_epoch(&mut optimizer, epoch);

            let mut train = StatsAccumulator::default();
            for _ in 0..steps_per_epoch {
                let batch = generator
                    .next()
                    .ok_or_else(|| CapsNetError::Data("training split is empty".to_string()))??;
                let stats = model.train_step(&batch.images.view(), &batch.labels.view(), &mut optimizer)?;
                train.add(&stats, batch.labels.nrows());
            }

            let val = self.validate(model, &val_images.view(), &dataset.test_labels.view())?;
            let row = EpochLog {
                epoch,
                train: train.mean(),
                val,
            };
            csv.append(&row)?;
            println!("{}", row.progress_line(cfg.num_epochs));
            info!(
                epoch = epoch + 1,
                loss = row.train.loss.total(),
                acc = row.train.accuracy,
                val_loss = row.val.loss.total(),
                val_acc = row.val.accuracy,
                elapsed = ?start.elapsed(),
                "epoch finished"
            );

            if !cfg.save_best_only || row.val.accuracy > best_val_acc {
                let path = self.save_dir.join(format!("weights-{:02}.bin", epoch + 1));
                if cfg.save_best_only {
                    info!(
                        from = best_val_acc,
                        to = row.val.accuracy,
                        "val_capsnet_acc improved"
                    );
                }
                save_weights(model, &path)?;
            }
            best_val_acc = best_val_acc.max(row.val.accuracy);
            history.push(row);
        }

        let final_path = self.save_dir.join("trained_model.bin");
        save_weights(model, &final_path)?;
        info!(path = %final_path.display(), "trained model saved");
        Ok(history)
    }

    /// Validation in batches of `batch_size`, decoder masked with the true labels.
    fn validate(&self, model: &mut CapsNet, images: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<BatchStats> {
        let mut acc = StatsAccumulator::default();
        let n = images.len_of(Axis(0));
        let mut start = 0;
        while start < n {
            let end = (start + self.config.batch_size).min(n);
            let stats = model.evaluate(
                &images.slice(s![start..end, .., .., ..]),
                &labels.slice(s![start..end, ..]),
            )?;
            acc.add(&stats, end - start);
            start = end;
        }
        Ok(acc.mean())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::core::tests::{tiny_config, tiny_model};
    use crate::train_data::data_loader::one_hot;
    use ndarray::Array4;
    use rand::Rng;
    use serde::Serialize;

    fn tiny_dataset() -> Dataset {
        let mut rng = StdRng::seed_from_u64(5);
        let (c, h, w) = tiny_config().input_shape;
        let train_images = Array4::from_shape_simple_fn((6, c, h, w), || rng.random_range(0.0..1.0));
        let test_images = Array4::from_shape_simple_fn((4, c, h, w), || rng.random_range(0.0..1.0));
        Dataset {
            train_images,
            train_labels: one_hot(&[0, 1, 2, 0, 1, 2], 3).unwrap(),
            test_images,
            test_labels: one_hot(&[2, 1, 0, 0], 3).unwrap(),
        }
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            batch_size: 3,
            num_epochs: 2,
            shift_fraction: 0.1,
            save_best_only: false,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_fit_writes_log_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = Trainer::new(small_config(), dir.path(), 0).unwrap();
        let mut model = tiny_model(1);

        let history = trainer.fit(&mut model, &tiny_dataset()).unwrap();

        assert_eq!(history.len(), 2);
        let log = fs::read_to_string(dir.path().join("log.csv")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], LOG_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,"));
        assert_eq!(lines[2].split(',').count(), 9);
        assert!(dir.path().join("weights-01.bin").exists());
        assert!(dir.path().join("weights-02.bin").exists());
        assert!(dir.path().join("trained_model.bin").exists());
    }

    #[test]
    fn test_fit_with_crop_uses_cropped_model_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            crop: Some((7, 7)),
            num_epochs: 1,
            ..small_config()
        };
        let trainer = Trainer::new(config, dir.path(), 0).unwrap();
        let network = tiny_config().with_input_shape((1, 7, 7));
        let mut rng = StdRng::seed_from_u64(0);
        let mut model =
            CapsNet::new(network, &crate::model::config::LossConfig::default(), &mut rng).unwrap();

        let history = trainer.fit(&mut model, &tiny_dataset()).unwrap();

        assert_eq!(history.len(), 1);
        assert!(history[0].val.accuracy >= 0.0 && history[0].val.accuracy <= 1.0);
    }

    #[test]
    fn test_save_best_only_skips_non_improving_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            save_best_only: true,
            learning_rate: 1e-9,
            lr_decay: 1.0,
            num_epochs: 3,
            ..small_config()
        };
        let trainer = Trainer::new(config, dir.path(), 0).unwrap();
        let mut model = tiny_model(1);

        let history = trainer.fit(&mut model, &tiny_dataset()).unwrap();

        let mut best = f32::NEG_INFINITY;
        for (i, row) in history.iter().enumerate() {
            let path = dir.path().join(format!("weights-{:02}.bin", i + 1));
            assert_eq!(path.exists(), row.val.accuracy > best);
            best = best.max(row.val.accuracy);
        }
        assert!(dir.path().join("weights-01.bin").exists());
    }

    #[derive(Serialize)]
    struct Args {
        lr: f32,
        epochs: usize,
        weights: Option<String>,
        save_dir: String,
    }

    #[test]
    fn test_write_args_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("args.txt");
        let args = Args {
            lr: 0.5,
            epochs: 3,
            weights: None,
            save_dir: "./result-capsnet".to_string(),
        };

        write_args(&path, &args).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "epochs = 3\nlr = 0.5\nsave_dir = ./result-capsnet\nweights = None"
        );
    }

    #[test]
    fn test_csv_row_columns() {
        let row = EpochLog {
            epoch: 4,
            train: BatchStats {
                loss: LossBreakdown {
                    margin: 0.5,
                    reconstruction: 0.25,
                    reconstruction_weight: 2.0,
                },
                accuracy: 0.75,
            },
            val: BatchStats::default(),
        };
        assert_eq!(row.csv_row(), "4,0.75,0.5,0.25,1,0,0,0,0");
    }

    #[test]
    fn test_progress_line_is_one_based_with_percentages() {
        let row = EpochLog {
            epoch: 0,
            train: BatchStats {
                loss: LossBreakdown {
                    margin: 0.5,
                    reconstruction: 0.0,
                    reconstruction_weight: 1.0,
                },
                accuracy: 0.5,
            },
            val: BatchStats::default(),
        };
        assert_eq!(
            row.progress_line(10),
            "📅 Epoch 1/10 | 📊 Loss: 0.5000 (train) 0.0000 (val) | Acc: 50.00% (train) 0.00% (val)"
        );
    }
}
