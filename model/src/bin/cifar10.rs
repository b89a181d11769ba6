use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use tracing::info;

use capsnet::cli::{existing_weights, CifarArgs};
use capsnet::evaluation::{manipulate_latent, run_test, AttackDriver, Fgsm};
use capsnet::model::{load_weights, ModelBuilder, NetworkConfig};
use capsnet::telemetry::init_tracing;
use capsnet::train_data::{write_args, Augmentation, Cifar10Loader, Trainer};

/// Extra output class that is never a target.
const NONE_OF_THE_ABOVE_CLASSES: usize = 1;
const TEST_BATCH_SIZE: usize = 100;

fn banner(title: &str) {
    println!("\n{}{}{}", "=".repeat(40), title, "=".repeat(40));
}

fn main() -> Result<()> {
    init_tracing()?;
    let args = CifarArgs::parse();

    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("cannot create {}", args.save_dir.display()))?;
    if !args.testing {
        write_args(&args.save_dir.join("args.txt"), &args)?;
    }

    let mut dataset = Cifar10Loader::new(&args.data_dir)
        .load(NONE_OF_THE_ABOVE_CLASSES)
        .context("loading CIFAR-10")?;
    println!("\nNum training samples: {}", dataset.train_images.dim().0);
    println!("Num testing samples: {}\n", dataset.test_images.dim().0);
    if let Some(max) = args.max_num_samples {
        dataset.truncate_train(max);
        println!("\nUsing only {} training samples.\n", dataset.train_images.dim().0);
    }

    let (channels, height, width) = dataset.image_shape();
    let input_shape = match args.crop() {
        Some((rows, cols)) => (channels, rows, cols),
        None => (channels, height, width),
    };
    let training = args.training_config();
    let network = NetworkConfig::cifar10(dataset.num_classes())
        .with_input_shape(input_shape)
        .with_routing_iterations(args.num_routing);
    let mut model = ModelBuilder::new()
        .with_network_config(network)
        .with_training_config(training.clone())
        .build()?;
    println!("{}", model.summary());

    match existing_weights(args.weights.as_deref()) {
        Some(path) => {
            load_weights(&mut model, path)?;
            println!("Successfully loaded weights file {}", path.display());
        }
        None => println!("(Warning) No weights are provided, using random initialized weights."),
    }

    if args.testing {
        banner(" TEST =");
        let augmentation = Augmentation {
            shift_fraction: args.shift_fraction,
            rotation_range: args.rotation_range,
            crop: args.crop(),
        };
        let report = run_test(
            &mut model,
            &dataset.test_images.view(),
            &dataset.test_labels.view(),
            TEST_BATCH_SIZE,
            augmentation,
            0,
        )?;
        report.metrics.print();
        report.save_artifacts(&args.save_dir)?;

        let mut rng = StdRng::from_os_rng();
        manipulate_latent(
            &mut model,
            &dataset.test_images.view(),
            &dataset.test_labels.view(),
            args.manipulate,
            args.crop(),
            &mut rng,
            &args.save_dir,
        )?;
    } else if args.fool {
        banner(" FOOL =");
        println!("Run attack for epsilon = {}", args.epsilon);
        let fgsm = Fgsm { epsilon: args.epsilon };
        let mut driver = AttackDriver::new(&fgsm, args.max_num_attacks);
        if args.debug {
            driver = driver.with_debug_dir(&args.save_dir);
        }
        let report = driver.run(&mut model, &dataset.test_images.view(), &dataset.test_labels.view())?;
        report.print();
    } else {
        banner(" TRAIN ");
        let trainer = Trainer::new(training, &args.save_dir, rand::random())?;
        let history = trainer.fit(&mut model, &dataset)?;
        if let Some(last) = history.last() {
            info!(val_acc = last.val.accuracy, epochs = history.len(), "training complete");
        }
    }

    println!("{}", "=".repeat(87));
    Ok(())
}
