use std::{fs, path::{Path, PathBuf}};

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::TrainingConfig,
    data::{preprocess, Dataset, MnistDataset},
    error::{Error, Result},
    export,
    logger::{self, FileMetricLogger},
    neural_net::NeuralNetwork,
    train::{evaluate, Evaluation, Trainer, TrainingHistory},
};

/// Fixed locations of the run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub log_root: PathBuf,
    pub export_dir: PathBuf,
    pub training: TrainingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/mnist"),
            log_root: PathBuf::from("logs/fit"),
            export_dir: PathBuf::from("mnist_model/1"),
            training: TrainingConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub history: TrainingHistory,
    pub test: Evaluation,
    pub log_dir: PathBuf,
    pub export_dir: PathBuf,
}

/// load → preprocess → build → fit → evaluate → export, logging under a fresh
/// timestamped directory.
pub fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    let log_dir = config
        .log_root
        .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&log_dir)?;
    logger::install_file_logger(&log_dir.join("experiment.log"))?;
    let config_path = log_dir.join("config.ron");
    config.training.save(&config_path)?;
    // train from exactly what config.ron records
    let training = TrainingConfig::load(&config_path)?;

    let train = MnistDataset::train(&config.data_dir)?;
    let test = MnistDataset::test(&config.data_dir)?;
    if train.is_empty() {
        return Err(Error::format(format!("no training images in {}", config.data_dir.display())));
    }
    log::info!("Loaded {} training and {} test images", train.len(), test.len());

    let train = preprocess(train.items());
    let test = preprocess(test.items());

    let (history, test_eval, _) = train_and_export(&training, &train, &test, &log_dir, &config.export_dir)?;

    Ok(PipelineReport {
        history,
        test: test_eval,
        log_dir,
        export_dir: config.export_dir.clone(),
    })
}

/// The stages after preprocessing; the test split doubles as validation data.
pub fn train_and_export(
    config: &TrainingConfig,
    train: &Dataset,
    test: &Dataset,
    log_dir: &Path,
    export_dir: &Path,
) -> Result<(TrainingHistory, Evaluation, NeuralNetwork)> {
    let mut model = config.model.init(&mut StdRng::seed_from_u64(config.seed))?;
    log::info!(
        "Built model with {} parameters: {}",
        model.num_params(),
        model
            .layers()
            .iter()
            .map(|layer| format!("{}({})", layer.name, layer.units()))
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut metrics = FileMetricLogger::new(log_dir);
    let history = Trainer::new(config.clone()).fit(&mut model, train, test, &mut metrics)?;

    let test_eval = evaluate(&model, test, config.batch_size)?;
    log::info!("Test loss: {:.4} - test accuracy: {:.4}", test_eval.loss, test_eval.accuracy);

    export::export(&model, export_dir)?;
    let restored = export::load(export_dir)?;
    if restored.predict(&test.features)? != model.predict(&test.features)? {
        return Err(Error::format(format!(
            "model exported to {} does not reproduce the trained predictions",
            export_dir.display()
        )));
    }

    Ok((history, test_eval, model))
}
