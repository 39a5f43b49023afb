use crate::pipeline::PipelineConfig;

mod config;
mod data;
mod error;
mod export;
mod logger;
mod neural_net;
mod optim;
mod pipeline;
mod train;
mod util;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::default();
    let report = pipeline::run(&config)?;

    if let Some(last) = report.history.epochs.last() {
        println!("\nTrained {} epochs, final loss: {:.4}", last.epoch, last.train.loss);
    }
    println!("Test accuracy: {}", report.test.accuracy);
    println!("Model exported at {}", report.export_dir.display());
    println!("Training logs written to {}", report.log_dir.display());

    Ok(())
}
