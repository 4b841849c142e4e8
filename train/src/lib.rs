//! The training program for chest X-ray multi-task models.

pub mod common;
pub mod config;
pub mod data;
pub mod logging;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    data::BatchLoader,
    train::{training_worker, TrainingWorkerInit},
};

/// The entry of training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();
    let logging_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };
    let checkpoint_dir: Arc<Path> = logging_dir.join("checkpoints").into_boxed_path().into();

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        tokio::fs::create_dir_all(&*checkpoint_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }
    info!("logging to '{}'", logging_dir.display());

    // load dataset
    info!("loading dataset");
    let (train_set, val_set) = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || data::load_datasets(&config)).await??
    };
    info!(
        "use {} training images and {} validation images",
        train_set.len(),
        val_set.len()
    );

    let batch_size = config.training.batch_size.get();
    let train_loader = BatchLoader::new(Arc::new(train_set), batch_size, &config.preprocessor)?;
    let val_loader = BatchLoader::new(Arc::new(val_set), batch_size, &config.preprocessor)?;

    // start logger
    let (logging_tx, logging_rx) = broadcast::channel(8);
    let logging_future = logging::logging_worker(logging_dir.clone(), logging_rx).await?;

    // training worker
    let training_worker_future = {
        let init = TrainingWorkerInit {
            config: config.clone(),
            checkpoint_dir,
            train_loader,
            val_loader,
            logging_tx,
            handle: tokio::runtime::Handle::current(),
        };
        tokio::task::spawn_blocking(move || training_worker(init))
            .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(training_worker_future, logging_future)?;

    Ok(())
}
