use ndarray::{ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

use super::core::CapsNet;
use crate::error::{CapsNetError, Result};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    tensors: BTreeMap<String, StoredTensor>,
}

/// Writes every named parameter of the model to `path`.
pub fn save_weights(model: &CapsNet, path: &Path) -> Result<()> {
    let tensors = model
        .parameters()
        .into_iter()
        .map(|p| {
            let stored = StoredTensor {
                shape: p.value.shape().to_vec(),
                data: p.value.iter().copied().collect(),
            };
            (p.name, stored)
        })
        .collect();
    let checkpoint = Checkpoint {
        version: FORMAT_VERSION,
        tensors,
    };

    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &checkpoint)?;
    info!(path = %path.display(), "weights saved");
    Ok(())
}

/// Loads weights saved by `save_weights`. The stored names and shapes must
/// match the model exactly; nothing is modified when they do not.
pub fn load_weights(model: &mut CapsNet, path: &Path) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    let checkpoint: Checkpoint = bincode::deserialize_from(reader)?;
    if checkpoint.version != FORMAT_VERSION {
        return Err(CapsNetError::Serialization(format!(
            "unsupported checkpoint version {} (expected {})",
            checkpoint.version, FORMAT_VERSION
        )));
    }

    let params = model.parameters();
    for param in &params {
        let stored = checkpoint
            .tensors
            .get(&param.name)
            .ok_or_else(|| CapsNetError::MissingTensor(param.name.clone()))?;
        if stored.shape != param.value.shape() || stored.data.len() != param.value.len() {
            return Err(CapsNetError::ShapeMismatch {
                name: param.name.clone(),
                expected: param.value.shape().to_vec(),
                found: stored.shape.clone(),
            });
        }
    }
    if let Some(extra) = checkpoint
        .tensors
        .keys()
        .find(|name| !params.iter().any(|p| &p.name == *name))
    {
        return Err(CapsNetError::UnexpectedTensor(extra.clone()));
    }
    drop(params);

    for mut param in model.parameters_mut() {
        if let Some(stored) = checkpoint.tensors.get(&param.name) {
            let source = ArrayViewD::from_shape(IxDyn(&stored.shape), stored.data.as_slice())?;
            param.value.assign(&source);
        }
    }
    info!(path = %path.display(), tensors = checkpoint.tensors.len(), "weights loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::LossConfig;
    use crate::model::core::tests::{tiny_config, tiny_model};
    use crate::model::layers::tests::random_array;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip_reproduces_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trained_model.bin");
        let mut rng = StdRng::seed_from_u64(12);
        let input: Array4<f32> = random_array((4, 1, 8, 8), &mut rng).mapv(f32::abs);

        let mut original = tiny_model(1);
        save_weights(&original, &path).unwrap();
        let mut restored = tiny_model(2);
        assert_ne!(original.capsnet.weights, restored.capsnet.weights);
        load_weights(&mut restored, &path).unwrap();

        let expected = original.classify(&input.view()).unwrap();
        let found = restored.classify(&input.view()).unwrap();
        assert_eq!(expected, found);
        assert_eq!(original.decoder.layers[2].weights, restored.decoder.layers[2].weights);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights-01.bin");
        save_weights(&tiny_model(1), &path).unwrap();

        let mut config = tiny_config();
        config.out_dim = 5;
        let mut rng = StdRng::seed_from_u64(0);
        let mut other = CapsNet::new(config, &LossConfig::default(), &mut rng).unwrap();
        let before = other.conv1.weights.clone();

        let err = load_weights(&mut other, &path).unwrap_err();
        assert!(matches!(err, CapsNetError::ShapeMismatch { ref name, .. } if name == "capsnet.transform"));
        assert_eq!(other.conv1.weights, before);
    }

    #[test]
    fn test_missing_tensor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights-02.bin");
        save_weights(&tiny_model(1), &path).unwrap();

        let mut config = tiny_config();
        config.decoder_hidden = vec![16, 32, 8];
        let mut rng = StdRng::seed_from_u64(0);
        let mut deeper = CapsNet::new(config, &LossConfig::default(), &mut rng).unwrap();

        assert!(load_weights(&mut deeper, &path).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model(1);
        let err = load_weights(&mut model, &dir.path().join("absent.bin")).unwrap_err();
        assert!(matches!(err, CapsNetError::Io(_)));
    }
}
