use std::{fs, path::Path};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    data::{NUM_CLASSES, NUM_PIXELS},
    error::Result,
    neural_net::{Activation, Initializer, Layer, NeuralNetwork},
    optim::AdamConfig,
};

/// Topology of the classifier: input → dense_1 → dense_2 → output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_1: usize,
    pub hidden_2: usize,
    pub num_classes: usize,
    pub initializer: Initializer,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            input_dim: NUM_PIXELS,
            hidden_1: 10,
            hidden_2: 64,
            num_classes: NUM_CLASSES,
            initializer: Initializer::GlorotUniform,
        }
    }
}

#[cfg(test)]
impl MlpConfig {
    pub fn with_hidden_1(mut self, hidden_1: usize) -> Self {
        self.hidden_1 = hidden_1;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }
}

impl MlpConfig {
    /// Builds the untrained network.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<NeuralNetwork> {
        let layers = vec![
            Layer::init("dense_1", self.input_dim, self.hidden_1, Activation::Relu, self.initializer, rng)?,
            Layer::init("dense_2", self.hidden_1, self.hidden_2, Activation::Relu, self.initializer, rng)?,
            Layer::init("output", self.hidden_2, self.num_classes, Activation::Softmax, self.initializer, rng)?,
        ];
        NeuralNetwork::new(layers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub learning_rate: f32,
    /// Write parameter histograms every `histogram_freq` epochs; 0 disables them.
    pub histogram_freq: usize,
    pub optimizer: AdamConfig,
    pub model: MlpConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            seed: 42,
            learning_rate: 0.001,
            histogram_freq: 1,
            optimizer: AdamConfig::default(),
            model: MlpConfig::default(),
        }
    }
}

#[cfg(test)]
impl TrainingConfig {
    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_histogram_freq(mut self, histogram_freq: usize) -> Self {
        self.histogram_freq = histogram_freq;
        self
    }

    pub fn with_model(mut self, model: MlpConfig) -> Self {
        self.model = model;
        self
    }
}

impl TrainingConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(ron::from_str(&content)?)
    }
}
