use anyhow::{Context, Result};
use cxr_dl::inference::{Detection, PredictorInit};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf};
use structopt::StructOpt;
use tracing::error;
use train::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Predict findings and boxes on chest X-ray images
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// checkpoint file saved by the training program
    pub checkpoint: PathBuf,
    /// input PNG images
    pub images: Vec<PathBuf>,
}

/// One output line per image.
#[derive(Debug, Serialize)]
struct Output<'a> {
    image: &'a PathBuf,
    probabilities: BTreeMap<&'static str, f64>,
    detections: Vec<Detection>,
}

pub fn main() -> Result<()> {
    train::logging::init_tracing();

    let Args {
        config_file,
        checkpoint,
        images,
    } = Args::from_args();
    let config = Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;

    let mut predictor = PredictorInit {
        model: config.model.clone(),
        checkpoint,
        device: config.training.device,
        image_size: config.dataset.image_size.map(|size| {
            let size = size.get() as i64;
            (size, size)
        }),
        normalize: Some(config.preprocessor.normalize()?),
    }
    .build()?;

    let mut num_failures = 0;
    for image in &images {
        match predictor.predict_file(image) {
            Ok(prediction) => {
                let output = Output {
                    image,
                    probabilities: prediction.named_probabilities().into_iter().collect(),
                    detections: prediction.detections,
                };
                println!("{}", serde_json::to_string(&output)?);
            }
            Err(err) => {
                error!("{:#}", err);
                num_failures += 1;
            }
        }
    }

    anyhow::ensure!(
        num_failures == 0,
        "failed to predict {} of {} images",
        num_failures,
        images.len()
    );
    Ok(())
}
