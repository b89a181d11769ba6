use ndarray::ArrayD;
use std::collections::HashMap;
use tracing::debug;

use super::config::AdamConfig;
use super::layers::ParamMut;

/// One update of a named parameter from its accumulated gradient.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, param: ParamMut<'_>);
    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, lr: f32);
}

struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    timestep: i32,
}

/// Adam with bias-corrected step size and per-parameter timestep.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<String, Moments>,
}

impl Adam {
    pub fn new(learning_rate: f32, config: &AdamConfig) -> Self {
        Self {
            learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            state: HashMap::new(),
        }
    }

    pub fn timestep(&self, name: &str) -> Option<i32> {
        self.state.get(name).map(|s| s.timestep)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param: ParamMut<'_>) {
        let ParamMut { name, mut value, grad } = param;
        let moments = self.state.entry(name).or_insert_with(|| Moments {
            m: ArrayD::zeros(value.raw_dim()),
            v: ArrayD::zeros(value.raw_dim()),
            timestep: 0,
        });
        moments.timestep += 1;

        let (beta1, beta2) = (self.beta1, self.beta2);
        // lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)
        let t = moments.timestep;
        let lr_t = self.learning_rate * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));
        let epsilon = self.epsilon;

        ndarray::Zip::from(&mut value)
            .and(&grad)
            .and(&mut moments.m)
            .and(&mut moments.v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + epsilon);
            });
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

/// Learning-rate schedule applied at the start of every epoch.
#[derive(Debug, Clone, Copy)]
pub enum LRScheduler {
    /// `initial_lr * decay^epoch`
    ExponentialDecay { initial_lr: f32, decay: f32 },
}

impl LRScheduler {
    pub fn exponential(initial_lr: f32, decay: f32) -> Self {
        LRScheduler::ExponentialDecay { initial_lr, decay }
    }

    pub fn learning_rate(&self, epoch: usize) -> f32 {
        match *self {
            LRScheduler::ExponentialDecay { initial_lr, decay } => {
                initial_lr * decay.powi(epoch as i32)
            }
        }
    }

    pub fn step_epoch(&self, optimizer: &mut dyn Optimizer, epoch: usize) {
        let lr = self.learning_rate(epoch);
        optimizer.set_learning_rate(lr);
        debug!(epoch, lr, "learning rate set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, ArrayD, IxDyn};

    fn param<'a>(name: &str, value: &'a mut ArrayD<f32>, grad: &'a ArrayD<f32>) -> ParamMut<'a> {
        ParamMut {
            name: name.to_string(),
            value: value.view_mut(),
            grad: grad.view(),
        }
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut optimizer = Adam::new(0.001, &AdamConfig::default());
        let mut value = ArrayD::ones(IxDyn(&[2, 2]));
        let grad = ArrayD::from_elem(IxDyn(&[2, 2]), 0.5);

        optimizer.step(param("w", &mut value, &grad));

        // The first bias-corrected step is lr * sign(g).
        for &v in value.iter() {
            assert_abs_diff_eq!(v, 1.0 - 0.001, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_adam_timestep_is_per_parameter() {
        let mut optimizer = Adam::new(0.01, &AdamConfig::default());
        let mut a = Array2::<f32>::zeros((1, 1)).into_dyn();
        let mut b = Array2::<f32>::zeros((1, 1)).into_dyn();
        let grad = Array2::<f32>::ones((1, 1)).into_dyn();

        optimizer.step(param("a", &mut a, &grad));
        optimizer.step(param("a", &mut a, &grad));
        optimizer.step(param("b", &mut b, &grad));

        assert_eq!(optimizer.timestep("a"), Some(2));
        assert_eq!(optimizer.timestep("b"), Some(1));
        assert_eq!(optimizer.timestep("c"), None);
    }

    #[test]
    fn test_zero_gradient_leaves_parameter() {
        let mut optimizer = Adam::new(0.01, &AdamConfig::default());
        let mut value = ArrayD::from_elem(IxDyn(&[3]), 0.3);
        let grad = ArrayD::zeros(IxDyn(&[3]));

        optimizer.step(param("w", &mut value, &grad));

        assert!(value.iter().all(|&v| v == 0.3));
    }

    #[test]
    fn test_exponential_decay() {
        let scheduler = LRScheduler::exponential(0.001, 0.9);
        assert_abs_diff_eq!(scheduler.learning_rate(0), 0.001);
        assert_abs_diff_eq!(scheduler.learning_rate(2), 0.001 * 0.81, epsilon = 1e-8);

        let mut optimizer = Adam::new(0.001, &AdamConfig::default());
        scheduler.step_epoch(&mut optimizer, 3);
        assert_abs_diff_eq!(optimizer.learning_rate(), 0.001 * 0.729, epsilon = 1e-8);
    }
}
