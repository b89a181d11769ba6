use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use rand::Rng;

use super::config::{Activation, NetworkConfig};
use super::layers::{DenseLayer, Layer, Param, ParamMut};
use crate::error::Result;

/// Fully connected decoder reconstructing the input image from the masked
/// class capsules.
pub struct Decoder {
    pub layers: Vec<DenseLayer>,
    /// (channels, height, width)
    image_shape: (usize, usize, usize),
}

impl Decoder {
    pub fn new<R: Rng>(config: &NetworkConfig, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(config.decoder_hidden.len() + 1);
        let mut inputs = config.num_classes * config.out_dim;
        for (i, &units) in config.decoder_hidden.iter().enumerate() {
            let name = format!("decoder.dense_{}", i + 1);
            layers.push(DenseLayer::new(&name, inputs, units, Activation::ReLU, rng));
            inputs = units;
        }
        let name = format!("decoder.dense_{}", config.decoder_hidden.len() + 1);
        layers.push(DenseLayer::new(&name, inputs, config.num_pixels(), Activation::Sigmoid, rng));

        Self {
            layers,
            image_shape: config.input_shape,
        }
    }

    pub fn image_shape(&self) -> (usize, usize, usize) {
        self.image_shape
    }

    /// (batch, num_classes * out_dim) -> (batch, channels, height, width)
    pub fn forward(&mut self, masked: &ArrayView2<f32>) -> Result<Array4<f32>> {
        let mut x = masked.to_owned();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x.view())?;
        }
        let (c, h, w) = self.image_shape;
        let batch_size = x.nrows();
        Ok(x.into_shape_with_order((batch_size, c, h, w))?)
    }

    pub fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array2<f32>> {
        let batch_size = grad_output.dim().0;
        let flat = grad_output.len() / batch_size.max(1);
        let mut grad = grad_output
            .to_owned()
            .into_shape_with_order((batch_size, flat))?;
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }
        Ok(grad)
    }

    pub fn parameters(&self) -> Vec<Param<'_>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<ParamMut<'_>> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }

    pub fn zero_grad(&mut self) {
        self.layers.iter_mut().for_each(|l| l.zero_grad());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layers::tests::random_array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> NetworkConfig {
        let mut config = NetworkConfig::symmetric_forms(2).with_input_shape((3, 4, 5));
        config.decoder_hidden = vec![8, 6];
        config
    }

    #[test]
    fn test_decoder_output_shape_and_range() {
        let mut rng = StdRng::seed_from_u64(4);
        let config = small_config();
        let mut decoder = Decoder::new(&config, &mut rng);
        let masked: Array2<f32> = random_array((3, 2 * 3), &mut rng);

        let images = decoder.forward(&masked.view()).unwrap();

        assert_eq!(images.dim(), (3, 3, 4, 5));
        assert!(images.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_decoder_parameter_names() {
        let mut rng = StdRng::seed_from_u64(4);
        let decoder = Decoder::new(&small_config(), &mut rng);
        let names: Vec<String> = decoder.parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "decoder.dense_1.kernel",
                "decoder.dense_1.bias",
                "decoder.dense_2.kernel",
                "decoder.dense_2.bias",
                "decoder.dense_3.kernel",
                "decoder.dense_3.bias",
            ]
        );
    }

    #[test]
    fn test_decoder_backward_shape() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut decoder = Decoder::new(&small_config(), &mut rng);
        let masked: Array2<f32> = random_array((2, 6), &mut rng);
        let images = decoder.forward(&masked.view()).unwrap();

        let grad = decoder.backward(&images.view()).unwrap();

        assert_eq!(grad.dim(), (2, 6));
    }
}
