pub mod augmentation;
pub mod data_loader;
pub mod symmetric_forms;
pub mod training_strategy;

pub use augmentation::{Augmentation, Batch, BatchGenerator};
pub use data_loader::{one_hot, Cifar10Loader, Dataset};
pub use symmetric_forms::{generate_image, FormSettings, SymmetricFormsGenerator};
pub use training_strategy::{write_args, EpochLog, Trainer};
