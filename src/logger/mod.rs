use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing_subscriber::{filter::LevelFilter, prelude::*, registry};

use crate::{
    error::{Error, Result},
    train::{LayerHistogram, TrainingHistory},
};

/// If a global tracing subscriber is not already configured, set up logging to
/// `file_path` and stdout, and add our custom panic hook.
pub fn install_file_logger(file_path: &Path) -> Result<()> {
    let directory = file_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = file_path
        .file_name()
        .ok_or_else(|| Error::Log(format!("'{}' does not point to a file", file_path.display())))?;
    fs::create_dir_all(directory)?;

    let writer = tracing_appender::rolling::never(directory, file_name);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::INFO);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    if registry().with(file_layer).with(stdout_layer).try_init().is_ok() {
        update_panic_hook(file_path);
    }

    Ok(())
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {}", info);
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    fn directory(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "validation",
        }
    }
}

/// Sink for training-progress records.
pub trait MetricLogger {
    /// Logs one value of the metric `name`.
    fn log(&mut self, split: Split, name: &str, value: f32) -> Result<()>;

    /// Logs the parameter histograms of an epoch.
    fn histograms(&mut self, epoch: usize, histograms: &[LayerHistogram]) -> Result<()>;

    /// Starts a new epoch, flushing what belongs to the previous one.
    fn epoch(&mut self, epoch: usize) -> Result<()>;

    /// Records the summary of the whole run.
    fn end(&mut self, history: &TrainingHistory) -> Result<()>;
}

/// Writes `<split>/epoch-<n>/<metric>.log` files, one value per line.
pub struct FileMetricLogger {
    loggers: HashMap<(Split, String), BufWriter<File>>,
    directory: PathBuf,
    epoch: usize,
}

impl FileMetricLogger {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            loggers: HashMap::new(),
            directory: directory.into(),
            epoch: 1,
        }
    }

    fn epoch_directory(&self, split: Split) -> PathBuf {
        self.directory
            .join(split.directory())
            .join(format!("epoch-{}", self.epoch))
    }

    fn flush(&mut self) -> Result<()> {
        for logger in self.loggers.values_mut() {
            logger.flush()?;
        }
        self.loggers.clear();
        Ok(())
    }
}

fn write_ron<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())?;
    fs::write(path, content)?;
    Ok(())
}

impl MetricLogger for FileMetricLogger {
    fn log(&mut self, split: Split, name: &str, value: f32) -> Result<()> {
        let key = (split, name.to_string());
        if !self.loggers.contains_key(&key) {
            let directory = self.epoch_directory(split);
            fs::create_dir_all(&directory)?;
            let file = File::create(directory.join(format!("{name}.log")))?;
            self.loggers.insert(key.clone(), BufWriter::new(file));
        }

        if let Some(logger) = self.loggers.get_mut(&key) {
            writeln!(logger, "{value}")?;
        }
        Ok(())
    }

    fn histograms(&mut self, epoch: usize, histograms: &[LayerHistogram]) -> Result<()> {
        let directory = self
            .directory
            .join(Split::Train.directory())
            .join(format!("epoch-{epoch}"));
        fs::create_dir_all(&directory)?;
        write_ron(&directory.join("histograms.ron"), histograms)
    }

    fn epoch(&mut self, epoch: usize) -> Result<()> {
        self.flush()?;
        self.epoch = epoch;
        Ok(())
    }

    fn end(&mut self, history: &TrainingHistory) -> Result<()> {
        self.flush()?;
        fs::create_dir_all(&self.directory)?;
        write_ron(&self.directory.join("epochs.ron"), history)
    }
}

/// Discards every record.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct NoopMetricLogger;

#[cfg(test)]
impl MetricLogger for NoopMetricLogger {
    fn log(&mut self, _split: Split, _name: &str, _value: f32) -> Result<()> {
        Ok(())
    }

    fn histograms(&mut self, _epoch: usize, _histograms: &[LayerHistogram]) -> Result<()> {
        Ok(())
    }

    fn epoch(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn end(&mut self, _history: &TrainingHistory) -> Result<()> {
        Ok(())
    }
}
