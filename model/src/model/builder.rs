use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::config::{NetworkConfig, TrainingConfig};
use super::core::CapsNet;
use crate::error::{CapsNetError, Result};

/// Validates the configuration and constructs a `CapsNet`.
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    training_config: Option<TrainingConfig>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            training_config: None,
            seed: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = Some(config);
        self
    }

    /// Fixes weight initialisation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CapsNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsNetError::InvalidConfig("network configuration required".to_string()))?;
        let training_config = self.training_config.unwrap_or_default();

        network_config.validate()?;
        training_config.validate()?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let model = CapsNet::new(network_config, &training_config.loss_config, &mut rng)?;
        info!(
            parameters = model.num_parameters(),
            routing = model.config.routing_iterations,
            "model built"
        );
        Ok(model)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::core::tests::tiny_config;

    #[test]
    fn test_build_requires_network_config() {
        assert!(matches!(
            ModelBuilder::new().build(),
            Err(CapsNetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_routing_rejected_before_construction() {
        let config = tiny_config().with_routing_iterations(0);
        let result = ModelBuilder::new().with_network_config(config).build();
        assert!(matches!(result, Err(CapsNetError::InvalidConfig(_))));
    }

    #[test]
    fn test_seed_makes_weights_reproducible() {
        let a = ModelBuilder::new()
            .with_network_config(tiny_config())
            .with_seed(42)
            .build()
            .unwrap();
        let b = ModelBuilder::new()
            .with_network_config(tiny_config())
            .with_seed(42)
            .build()
            .unwrap();
        assert_eq!(a.capsnet.weights, b.capsnet.weights);
        assert_eq!(a.conv1.weights, b.conv1.weights);
    }

    #[test]
    fn test_training_config_is_validated() {
        let mut training = TrainingConfig::default();
        training.batch_size = 0;
        let result = ModelBuilder::new()
            .with_network_config(tiny_config())
            .with_training_config(training)
            .build();
        assert!(result.is_err());
    }
}
