use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::TrainingConfig,
    data::{shuffled_batches, Dataset},
    error::Result,
    logger::{MetricLogger, Split},
    neural_net::{ClassificationOutput, NeuralNetwork},
    optim::Adam,
    util::{histogram, Histogram},
};

const HISTOGRAM_BUCKETS: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: Evaluation,
    pub valid: Evaluation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerHistogram {
    pub layer: String,
    pub weights: Option<Histogram>,
    pub bias: Option<Histogram>,
}

/// Running sample-weighted loss and hit count.
#[derive(Debug, Default)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    count: usize,
}

impl Accumulator {
    fn update(&mut self, output: &ClassificationOutput) {
        self.loss_sum += output.loss as f64 * output.count as f64;
        self.correct += output.correct;
        self.count += output.count;
    }

    fn evaluation(&self) -> Evaluation {
        if self.count == 0 {
            return Evaluation::default();
        }
        Evaluation {
            loss: (self.loss_sum / self.count as f64) as f32,
            accuracy: self.correct as f32 / self.count as f32,
        }
    }
}

/// Loss and accuracy over the whole split, evaluated `batch_size` rows at a time.
pub fn evaluate(model: &NeuralNetwork, dataset: &Dataset, batch_size: usize) -> Result<Evaluation> {
    if dataset.is_empty() {
        return Ok(Evaluation::default());
    }
    let mut accumulator = Accumulator::default();
    let batch_size = batch_size.max(1);

    for start in (0..dataset.len()).step_by(batch_size) {
        let batch = dataset.slice(start..(start + batch_size).min(dataset.len()));
        let probabilities = model.forward(&batch.features)?;
        accumulator.update(&ClassificationOutput::new(&probabilities, &batch.labels)?);
    }

    Ok(accumulator.evaluation())
}

pub fn layer_histograms(model: &NeuralNetwork) -> Vec<LayerHistogram> {
    model
        .layers()
        .iter()
        .map(|layer| LayerHistogram {
            layer: layer.name.clone(),
            weights: histogram(layer.weights.as_slice(), HISTOGRAM_BUCKETS),
            bias: histogram(layer.bias.as_slice(), HISTOGRAM_BUCKETS),
        })
        .collect()
}

/// Mini-batch trainer: Adam on the sparse categorical cross-entropy.
pub struct Trainer {
    config: TrainingConfig,
    optimizer: Adam,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        let optimizer = config.optimizer.init();
        // shuffling gets its own stream so it does not depend on model initialization
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        Self { config, optimizer, rng }
    }

    /// Runs every epoch over `train`, validating on `valid` after each one.
    /// Validation is only reported; it never changes the returned model.
    pub fn fit<L: MetricLogger + ?Sized>(
        &mut self,
        model: &mut NeuralNetwork,
        train: &Dataset,
        valid: &Dataset,
        logger: &mut L,
    ) -> Result<TrainingHistory> {
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.num_epochs {
            logger.epoch(epoch)?;
            let train_eval = self.train_epoch(model, train, logger)?;
            let valid_eval = evaluate(model, valid, self.config.batch_size)?;

            logger.log(Split::Valid, "Loss", valid_eval.loss)?;
            logger.log(Split::Valid, "Accuracy", valid_eval.accuracy)?;
            if self.config.histogram_freq > 0 && epoch % self.config.histogram_freq == 0 {
                logger.histograms(epoch, &layer_histograms(model))?;
            }

            log::info!(
                "Epoch {epoch}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
                self.config.num_epochs,
                train_eval.loss,
                train_eval.accuracy,
                valid_eval.loss,
                valid_eval.accuracy,
            );

            history.epochs.push(EpochSummary {
                epoch,
                train: train_eval,
                valid: valid_eval,
            });
        }

        log::info!("Training finished after {} optimizer steps", self.optimizer.time());
        logger.end(&history)?;
        Ok(history)
    }

    fn train_epoch<L: MetricLogger + ?Sized>(
        &mut self,
        model: &mut NeuralNetwork,
        train: &Dataset,
        logger: &mut L,
    ) -> Result<Evaluation> {
        let mut accumulator = Accumulator::default();
        let batches = shuffled_batches(train.len(), self.config.batch_size, &mut self.rng);

        for (iteration, indices) in batches.iter().enumerate() {
            let batch = train.batch(indices);
            let activations = model.forward_trace(&batch.features)?;
            let output = ClassificationOutput::new(&activations[activations.len() - 1], &batch.labels)?;
            let grads = model.backward(&activations, &batch.labels)?;
            self.optimizer.step(self.config.learning_rate, model, &grads)?;

            logger.log(Split::Train, "Loss", output.loss)?;
            logger.log(Split::Train, "Accuracy", output.accuracy())?;
            accumulator.update(&output);

            if (iteration + 1) % 500 == 0 {
                log::debug!("iteration {} of {}: loss {:.4}", iteration + 1, batches.len(), output.loss);
            }
        }

        Ok(accumulator.evaluation())
    }
}
