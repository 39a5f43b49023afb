use std::cmp::Ordering;

use nalgebra::{DMatrix, RowDVector};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Predicted probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking the log.
pub const PROBABILITY_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Softmax,
}

impl Activation {
    pub fn apply(self, z: &mut DMatrix<f32>) {
        match self {
            Activation::Relu => z.apply(|x| *x = x.max(0.0)),
            Activation::Softmax => softmax_rows(z),
        }
    }
}

/// Replaces every row by its softmax, shifted by the row max for stability.
pub fn softmax_rows(z: &mut DMatrix<f32>) {
    for mut row in z.row_iter_mut() {
        let max = row.max();
        row.apply(|x| *x = (*x - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

/// Weight initialization scheme; biases always start at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Initializer {
    #[default]
    GlorotUniform,
    HeNormal,
}

impl Initializer {
    fn weights<R: Rng + ?Sized>(self, inputs: usize, units: usize, rng: &mut R) -> Result<DMatrix<f32>> {
        let weights = match self {
            Initializer::GlorotUniform => {
                let limit = (6.0 / (inputs + units) as f32).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit);
                DMatrix::from_fn(inputs, units, |_, _| dist.sample(&mut *rng))
            }
            Initializer::HeNormal => {
                let std_dev = (2.0 / inputs as f32).sqrt();
                let dist = Normal::new(0.0, std_dev)
                    .map_err(|err| Error::shape(format!("invalid initializer: {err}")))?;
                DMatrix::from_fn(inputs, units, |_, _| dist.sample(&mut *rng))
            }
        };
        Ok(weights)
    }
}

/// Dense layer: `activation(input * weights + bias)`.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub weights: DMatrix<f32>,
    pub bias: RowDVector<f32>,
    pub activation: Activation,
}

impl Layer {
    pub fn new(name: impl Into<String>, weights: DMatrix<f32>, bias: RowDVector<f32>, activation: Activation) -> Result<Self> {
        let name = name.into();
        if weights.ncols() != bias.ncols() {
            return Err(Error::shape(format!(
                "layer {name}: {} weight columns but {} biases",
                weights.ncols(),
                bias.ncols()
            )));
        }
        if weights.nrows() == 0 || weights.ncols() == 0 {
            return Err(Error::shape(format!("layer {name} has zero width")));
        }

        Ok(Self {
            name,
            weights,
            bias,
            activation,
        })
    }

    pub fn init<R: Rng + ?Sized>(
        name: impl Into<String>,
        inputs: usize,
        units: usize,
        activation: Activation,
        initializer: Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        let name = name.into();
        if inputs == 0 || units == 0 {
            return Err(Error::shape(format!("layer {name} has zero width")));
        }
        let weights = initializer.weights(inputs, units, rng)?;
        Self::new(name, weights, RowDVector::zeros(units), activation)
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    pub fn num_params(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    pub fn forward(&self, input: &DMatrix<f32>) -> DMatrix<f32> {
        let mut z = input * &self.weights;
        for (mut column, &bias) in z.column_iter_mut().zip(self.bias.iter()) {
            column.add_scalar_mut(bias);
        }
        self.activation.apply(&mut z);
        z
    }
}

#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub weights: DMatrix<f32>,
    pub bias: RowDVector<f32>,
}

/// Gradients of the mean batch loss, one entry per layer.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub layers: Vec<LayerGradients>,
}

/// Loss and hit count of a batch of predicted probability rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationOutput {
    pub loss: f32,
    pub correct: usize,
    pub count: usize,
}

impl ClassificationOutput {
    /// Sparse categorical cross-entropy averaged over the rows of `probabilities`.
    pub fn new(probabilities: &DMatrix<f32>, labels: &[usize]) -> Result<Self> {
        check_labels(probabilities, labels)?;

        let mut loss = 0.0;
        let mut correct = 0;
        for (row, &label) in probabilities.row_iter().zip(labels) {
            let p = row[(0, label)].clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
            loss -= p.ln();
            if argmax(row.iter().copied()) == label {
                correct += 1;
            }
        }

        let count = labels.len();
        if count > 0 {
            loss /= count as f32;
        }

        Ok(Self { loss, correct, count })
    }

    pub fn accuracy(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.correct as f32 / self.count as f32
    }
}

fn check_labels(probabilities: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
    if probabilities.nrows() != labels.len() {
        return Err(Error::shape(format!(
            "{} predictions but {} labels",
            probabilities.nrows(),
            labels.len()
        )));
    }
    if let Some(&label) = labels.iter().find(|&&label| label >= probabilities.ncols()) {
        return Err(Error::shape(format!(
            "label {label} out of range for {} classes",
            probabilities.ncols()
        )));
    }
    Ok(())
}

fn argmax(values: impl Iterator<Item = f32>) -> usize {
    values
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Feed-forward classifier: relu hidden layers followed by a softmax output layer.
#[derive(Debug, Clone)]
pub struct NeuralNetwork {
    layers: Vec<Layer>,
}

impl NeuralNetwork {
    pub fn new(layers: Vec<Layer>) -> Result<Self> {
        let Some(output) = layers.last() else {
            return Err(Error::shape("a network needs at least one layer"));
        };
        if output.activation != Activation::Softmax {
            return Err(Error::shape(format!("output layer {} must use softmax", output.name)));
        }
        if let Some(hidden) = layers[..layers.len() - 1]
            .iter()
            .find(|layer| layer.activation != Activation::Relu)
        {
            return Err(Error::shape(format!("hidden layer {} must use relu", hidden.name)));
        }
        for (prev, next) in layers.iter().zip(layers.iter().skip(1)) {
            if prev.units() != next.inputs() {
                return Err(Error::shape(format!(
                    "layer {} outputs {} values but {} expects {}",
                    prev.name,
                    prev.units(),
                    next.name,
                    next.inputs()
                )));
            }
        }

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].inputs()
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].units()
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(Layer::num_params).sum()
    }

    /// Class probabilities for every input row.
    pub fn forward(&self, input: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let mut trace = self.forward_trace(input)?;
        Ok(trace.pop().unwrap_or_else(|| input.clone()))
    }

    /// The input followed by the output of every layer, as needed by [`Self::backward`].
    pub fn forward_trace(&self, input: &DMatrix<f32>) -> Result<Vec<DMatrix<f32>>> {
        if input.ncols() != self.input_dim() {
            return Err(Error::shape(format!(
                "expected {} input features, got {}",
                self.input_dim(),
                input.ncols()
            )));
        }

        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.clone());
        for layer in &self.layers {
            let next = layer.forward(&activations[activations.len() - 1]);
            activations.push(next);
        }
        Ok(activations)
    }

    pub fn predict(&self, input: &DMatrix<f32>) -> Result<Vec<usize>> {
        let probabilities = self.forward(input)?;
        Ok(probabilities
            .row_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect())
    }

    /// Back-propagates the mean cross-entropy of a batch through the layers.
    ///
    /// With a softmax output the gradient w.r.t. the output logits is
    /// `(p - onehot(label)) / batch_len`; relu layers pass the upstream gradient
    /// only where their output was positive.
    pub fn backward(&self, activations: &[DMatrix<f32>], labels: &[usize]) -> Result<Gradients> {
        if activations.len() != self.layers.len() + 1 {
            return Err(Error::shape(format!(
                "expected {} activations, got {}",
                self.layers.len() + 1,
                activations.len()
            )));
        }
        let probabilities = &activations[self.layers.len()];
        check_labels(probabilities, labels)?;

        let mut delta = probabilities.clone();
        for (row, &label) in labels.iter().enumerate() {
            delta[(row, label)] -= 1.0;
        }
        delta /= labels.len().max(1) as f32;

        let mut layers = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate().rev() {
            let input = &activations[index];
            let weights = input.tr_mul(&delta);
            let bias = delta.row_sum();

            if index > 0 {
                let upstream = &delta * layer.weights.transpose();
                delta = upstream.zip_map(input, |grad, a| if a > 0.0 { grad } else { 0.0 });
            }

            layers.push(LayerGradients { weights, bias });
        }
        layers.reverse();

        Ok(Gradients { layers })
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn tiny_network(seed: u64) -> NeuralNetwork {
        let mut rng = StdRng::seed_from_u64(seed);
        NeuralNetwork::new(vec![
            Layer::init("dense_1", 4, 5, Activation::Relu, Initializer::GlorotUniform, &mut rng).unwrap(),
            Layer::init("output", 5, 3, Activation::Softmax, Initializer::GlorotUniform, &mut rng).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn softmax_rows_are_probabilities() {
        let mut z = DMatrix::from_row_slice(3, 4, &[
            1.0, 2.0, 3.0, 4.0,
            -50.0, 0.0, 50.0, 100.0,
            0.0, 0.0, 0.0, 0.0,
        ]);

        softmax_rows(&mut z);

        for row in z.row_iter() {
            assert!(row.iter().all(|&p| p >= 0.0));
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((z[(2, 1)] - 0.25).abs() < 1e-6);
        assert!(!z.iter().any(|p| p.is_nan()));
    }

    #[test]
    fn forward_outputs_probability_rows() {
        let network = tiny_network(7);
        let input = DMatrix::from_fn(6, 4, |r, c| (r * 4 + c) as f32 / 24.0);

        let output = network.forward(&input).unwrap();

        assert_eq!(output.shape(), (6, 3));
        for row in output.row_iter() {
            assert!(row.iter().all(|&p| p >= 0.0));
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn forward_rejects_wrong_input_width() {
        let network = tiny_network(7);

        assert!(matches!(network.forward(&DMatrix::zeros(2, 5)), Err(Error::Shape(_))));
    }

    #[test]
    fn relu_clamps_negatives() {
        let layer = Layer::new(
            "dense",
            DMatrix::from_row_slice(1, 2, &[1.0, -1.0]),
            RowDVector::from_row_slice(&[0.5, 0.0]),
            Activation::Relu,
        )
        .unwrap();

        let output = layer.forward(&DMatrix::from_row_slice(1, 1, &[2.0]));

        assert_eq!(output, DMatrix::from_row_slice(1, 2, &[2.5, 0.0]));
    }

    #[test]
    fn network_validates_topology() {
        let mut rng = StdRng::seed_from_u64(1);
        let hidden = Layer::init("dense_1", 4, 5, Activation::Relu, Initializer::GlorotUniform, &mut rng).unwrap();
        let mismatched = Layer::init("output", 6, 3, Activation::Softmax, Initializer::GlorotUniform, &mut rng).unwrap();
        let relu_output = Layer::init("output", 5, 3, Activation::Relu, Initializer::HeNormal, &mut rng).unwrap();

        assert!(NeuralNetwork::new(vec![]).is_err());
        assert!(NeuralNetwork::new(vec![hidden.clone(), mismatched]).is_err());
        assert!(NeuralNetwork::new(vec![hidden, relu_output]).is_err());
        assert!(Layer::init("empty", 0, 3, Activation::Relu, Initializer::GlorotUniform, &mut rng).is_err());
    }

    #[test]
    fn glorot_weights_stay_within_limit() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Layer::init("dense", 784, 10, Activation::Relu, Initializer::GlorotUniform, &mut rng).unwrap();
        let limit = (6.0f32 / 794.0).sqrt();

        assert!(layer.weights.iter().all(|w| w.abs() <= limit));
        assert!(layer.bias.iter().all(|&b| b == 0.0));
        assert_eq!(layer.num_params(), 784 * 10 + 10);
    }

    #[test]
    fn classification_output_loss_and_accuracy() {
        let probabilities = DMatrix::from_row_slice(2, 3, &[
            0.7, 0.2, 0.1,
            0.0, 0.5, 0.5,
        ]);

        let output = ClassificationOutput::new(&probabilities, &[0, 0]).unwrap();

        let expected = (-(0.7f32).ln() - PROBABILITY_EPSILON.ln()) / 2.0;
        assert!((output.loss - expected).abs() < 1e-4);
        assert_eq!(output.correct, 1);
        assert_eq!(output.accuracy(), 0.5);
        assert!(ClassificationOutput::new(&probabilities, &[0, 3]).is_err());
    }

    #[test]
    fn backward_matches_finite_differences_on_output_bias() {
        let network = tiny_network(11);
        let input = DMatrix::from_fn(4, 4, |r, c| ((r + 1) * (c + 2)) as f32 / 10.0);
        let labels = [0, 2, 1, 2];

        let trace = network.forward_trace(&input).unwrap();
        let grads = network.backward(&trace, &labels).unwrap();

        // the output bias enters the loss smoothly, so central differences are exact enough
        let h = 1e-2;
        for unit in 0..3 {
            let mut plus = network.clone();
            plus.layers_mut()[1].bias[unit] += h;
            let mut minus = network.clone();
            minus.layers_mut()[1].bias[unit] -= h;
            let loss_plus = ClassificationOutput::new(&plus.forward(&input).unwrap(), &labels).unwrap().loss;
            let loss_minus = ClassificationOutput::new(&minus.forward(&input).unwrap(), &labels).unwrap().loss;
            let numeric = (loss_plus - loss_minus) / (2.0 * h);

            assert!((grads.layers[1].bias[unit] - numeric).abs() < 1e-3);
        }
        assert_eq!(grads.layers[0].weights.shape(), (4, 5));
        assert_eq!(grads.layers[0].bias.len(), 5);
    }
}
