pub mod attack;
pub mod images;
pub mod manipulate;
pub mod probe;
pub mod report;

pub use attack::{Attack, AttackDriver, AttackReport, Fgsm};
pub use manipulate::manipulate_latent;
pub use probe::{run_all_probes, save_probe_forms};
pub use report::{run_test, TestReport};
