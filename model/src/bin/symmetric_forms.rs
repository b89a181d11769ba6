use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use tracing::info;

use capsnet::cli::{existing_weights, SymmetricArgs};
use capsnet::evaluation::{manipulate_latent, run_all_probes, run_test, save_probe_forms};
use capsnet::model::{load_weights, ModelBuilder, NetworkConfig};
use capsnet::telemetry::init_tracing;
use capsnet::train_data::{write_args, Augmentation, SymmetricFormsGenerator, Trainer};

const WIDTH: usize = 28;
const HEIGHT: usize = 28;
const TEST_BATCH_SIZE: usize = 32;

fn banner(title: &str) {
    println!("\n{}{}{}", "=".repeat(40), title, "=".repeat(40));
}

fn main() -> Result<()> {
    init_tracing()?;
    let args = SymmetricArgs::parse();

    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("cannot create {}", args.save_dir.display()))?;
    if !args.testing {
        write_args(&args.save_dir.join("args.txt"), &args)?;
    }

    let mut dataset = SymmetricFormsGenerator::new(WIDTH, HEIGHT, args.seed)
        .load_data(args.num_train, args.num_test)
        .context("generating symmetric forms")?;
    if let Some(max) = args.max_num_samples {
        dataset.truncate_train(max);
        println!("\nUsing only {} training samples.\n", dataset.train_images.dim().0);
    }

    let training = args.training_config();
    let network = NetworkConfig::symmetric_forms(dataset.num_classes())
        .with_input_shape(dataset.image_shape())
        .with_routing_iterations(args.num_routing);
    let mut model = ModelBuilder::new()
        .with_network_config(network)
        .with_training_config(training.clone())
        .build()?;
    println!("{}", model.summary());

    let weights = existing_weights(args.weights.as_deref());
    if let Some(path) = weights {
        load_weights(&mut model, path)?;
        println!("Successfully loaded weights file {}", path.display());
    }

    if !args.testing {
        banner(" TRAIN ");
        let trainer = Trainer::new(training, &args.save_dir, args.seed)?;
        let history = trainer.fit(&mut model, &dataset)?;
        if let Some(last) = history.last() {
            info!(val_acc = last.val.accuracy, epochs = history.len(), "training complete");
        }
    } else {
        banner(" TEST =");
        if weights.is_none() {
            println!("(Warning) No weights are provided, using random initialized weights.");
        }

        let augmentation = Augmentation {
            shift_fraction: args.shift_fraction,
            rotation_range: args.rotation_range,
            crop: None,
        };
        let report = run_test(
            &mut model,
            &dataset.test_images.view(),
            &dataset.test_labels.view(),
            TEST_BATCH_SIZE,
            augmentation,
            args.seed,
        )?;
        report.metrics.print();
        report.save_artifacts(&args.save_dir)?;

        let mut rng = StdRng::seed_from_u64(args.seed);
        manipulate_latent(
            &mut model,
            &dataset.test_images.view(),
            &dataset.test_labels.view(),
            args.manipulate,
            None,
            &mut rng,
            &args.save_dir,
        )?;
        run_all_probes(&mut model, args.manipulate, &args.save_dir)?;
        if args.debug {
            let path = save_probe_forms(&model, args.manipulate, &args.save_dir)?;
            println!("Probe forms saved to {}", path.display());
        }
    }

    println!("{}", "=".repeat(87));
    Ok(())
}
