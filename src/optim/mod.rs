use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    neural_net::{Gradients, NeuralNetwork},
};

/// Adam configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// Decay rate of the first moment estimate.
    pub beta_1: f32,
    /// Decay rate of the second moment estimate.
    pub beta_2: f32,
    /// A value required for numerical stability.
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

#[cfg(test)]
impl AdamConfig {
    pub fn with_beta_1(mut self, beta_1: f32) -> Self {
        self.beta_1 = beta_1;
        self
    }

    pub fn with_beta_2(mut self, beta_2: f32) -> Self {
        self.beta_2 = beta_2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl AdamConfig {
    pub fn init(&self) -> Adam {
        Adam {
            momentum: AdaptiveMomentum {
                beta_1: self.beta_1,
                beta_2: self.beta_2,
                epsilon: self.epsilon,
            },
            states: Vec::new(),
        }
    }
}

/// Adam optimizer as described in the paper [Adam: A Method for Stochastic Optimization](https://arxiv.org/pdf/1412.6980.pdf).
///
/// Keeps one [`AdaptiveMomentumState`] per parameter tensor, indexed in layer
/// order (weights then bias).
#[derive(Debug, Clone)]
pub struct Adam {
    momentum: AdaptiveMomentum,
    states: Vec<Option<AdaptiveMomentumState>>,
}

impl Adam {
    /// Applies one update to every parameter of `network`.
    pub fn step(&mut self, lr: f32, network: &mut NeuralNetwork, grads: &Gradients) -> Result<()> {
        if grads.layers.len() != network.layers().len() {
            return Err(Error::shape(format!(
                "{} layer gradients for {} layers",
                grads.layers.len(),
                network.layers().len()
            )));
        }

        for (index, (layer, grad)) in network.layers_mut().iter_mut().zip(&grads.layers).enumerate() {
            self.update(2 * index, lr, layer.weights.as_mut_slice(), grad.weights.as_slice())?;
            self.update(2 * index + 1, lr, layer.bias.as_mut_slice(), grad.bias.as_slice())?;
        }

        Ok(())
    }

    fn update(&mut self, id: usize, lr: f32, param: &mut [f32], grad: &[f32]) -> Result<()> {
        if param.len() != grad.len() {
            return Err(Error::shape(format!(
                "parameter {id} has {} values but gradient has {}",
                param.len(),
                grad.len()
            )));
        }
        if self.states.len() <= id {
            self.states.resize_with(id + 1, || None);
        }

        let state = match self.states[id].take() {
            Some(state) if state.moment_1.len() != param.len() => {
                return Err(Error::shape(format!("optimizer state of parameter {id} changed size")));
            }
            Some(state) => state,
            None => AdaptiveMomentumState::new(param.len()),
        };
        self.states[id] = Some(self.momentum.transform(lr, param, grad, state));

        Ok(())
    }

    /// Number of updates applied so far.
    pub fn time(&self) -> usize {
        self.states
            .iter()
            .flatten()
            .map(|state| state.time)
            .max()
            .unwrap_or(0)
    }
}

/// Adaptive momentum state.
#[derive(Debug, Clone)]
pub struct AdaptiveMomentumState {
    /// The number of iterations aggregated.
    pub time: usize,
    /// The first order momentum.
    pub moment_1: Vec<f32>,
    /// The second order momentum.
    pub moment_2: Vec<f32>,
}

impl AdaptiveMomentumState {
    fn new(len: usize) -> Self {
        Self {
            time: 0,
            moment_1: vec![0.0; len],
            moment_2: vec![0.0; len],
        }
    }
}

#[derive(Debug, Clone)]
struct AdaptiveMomentum {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

impl AdaptiveMomentum {
    fn transform(&self, lr: f32, param: &mut [f32], grad: &[f32], mut state: AdaptiveMomentumState) -> AdaptiveMomentumState {
        state.time += 1;

        // bias correction folded into the step size
        let time = state.time as i32;
        let alpha = lr * (1.0 - self.beta_2.powi(time)).sqrt() / (1.0 - self.beta_1.powi(time));

        let moments = state.moment_1.iter_mut().zip(state.moment_2.iter_mut());
        for ((p, &g), (m, v)) in param.iter_mut().zip(grad).zip(moments) {
            *m = self.beta_1 * *m + (1.0 - self.beta_1) * g;
            *v = self.beta_2 * *v + (1.0 - self.beta_2) * g * g;
            *p -= alpha * *m / (v.sqrt() + self.epsilon);
        }

        state
    }
}
