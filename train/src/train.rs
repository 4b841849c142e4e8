//! The training worker.

use crate::{
    common::*,
    config::{Config, TrainingConfig},
    data::{blocking_batches, BatchLoader},
    logging::{EpochSummary, LoggingMessage},
    utils::{save_checkpoint, try_load_checkpoint, LrScheduler, RateCounter},
};
use cxr_dl::{
    dataset::Batch,
    engine::{evaluate_with, train_one_epoch},
    loss::BceWithLogitsLossInit,
    metrics::DetectionMapCalculatorInit,
};

/// Everything the training worker needs besides the configuration.
#[derive(Debug)]
pub struct TrainingWorkerInit {
    pub config: Arc<Config>,
    pub checkpoint_dir: Arc<Path>,
    pub train_loader: BatchLoader,
    pub val_loader: BatchLoader,
    pub logging_tx: broadcast::Sender<LoggingMessage>,
    /// The runtime the batch loaders are spawned on.
    pub handle: tokio::runtime::Handle,
}

/// Runs the epoch loop. It blocks and must run on a blocking thread.
///
/// Each epoch trains on shuffled batches, evaluates the validation set,
/// feeds the validation loss to the learning rate scheduler and saves a
/// checkpoint whenever the validation loss improves.
pub fn training_worker(init: TrainingWorkerInit) -> Result<()> {
    let TrainingWorkerInit {
        config,
        checkpoint_dir,
        train_loader,
        val_loader,
        logging_tx,
        handle,
    } = init;
    let TrainingConfig {
        epochs,
        ref lr_schedule,
        weight_decay,
        ref load_checkpoint,
        device,
        det_iou_threshold,
        ..
    } = config.training;

    // build model and optimizer
    let mut vs = nn::VarStore::new(device);
    let mut model = config.model.clone().build(&vs.root())?;
    try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;

    let mut lr_scheduler = LrScheduler::new(lr_schedule)?;
    let mut optimizer = nn::Adam {
        wd: weight_decay.raw(),
        ..Default::default()
    }
    .build(&vs, lr_scheduler.lr())?;

    let criterion = BceWithLogitsLossInit::default().build()?;
    let map_calculator = DetectionMapCalculatorInit {
        iou_threshold: det_iou_threshold,
        ..Default::default()
    }
    .build()?;

    let mut best_val_loss = f64::INFINITY;

    for epoch in 1..=epochs.get() {
        let lr = lr_scheduler.lr();
        optimizer.set_lr(lr);
        info!("epoch {}/{}\tlr {:e}", epoch, epochs, lr);

        let train_losses = {
            let mut rate_counter = RateCounter::with_second_interval();
            let num_batches = train_loader.num_batches();
            let batches = blocking_batches(train_loader.spawn(&handle, true))
                .enumerate()
                .map(|(step, batch)| -> Result<Batch> {
                    let batch = batch?.to_device(device);
                    rate_counter.add(batch.len() as f64);
                    if let Some(rate) = rate_counter.rate() {
                        debug!("batch {}/{}\t{:.2} images/s", step + 1, num_batches, rate);
                    }
                    Ok(batch)
                });
            train_one_epoch(&mut model, &criterion, batches, &mut optimizer)
                .with_context(|| format!("training failed at epoch {}", epoch))?
        };

        let val_output = {
            let batches = blocking_batches(val_loader.spawn(&handle, false))
                .map(|batch| Fallible::Ok(batch?.to_device(device)));
            evaluate_with(&mut model, &criterion, batches, &map_calculator)
                .with_context(|| format!("evaluation failed at epoch {}", epoch))?
        };
        let val_loss = val_output.classification_loss;
        lr_scheduler.step(val_loss);

        let summary = EpochSummary {
            epoch,
            lr,
            train: train_losses,
            val: val_output,
        };
        info!("{}", summary.console_line());

        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            let path = save_checkpoint(&vs, &checkpoint_dir, epoch, val_loss)?;
            info!(
                "validation loss improved to {:.5}, saved '{}'",
                val_loss,
                path.display()
            );
        }

        if logging_tx
            .send(LoggingMessage::EpochSummary(summary))
            .is_err()
        {
            warn!("logging worker is not running, the epoch summary is dropped");
        }
    }

    info!("training finished, best validation loss {:.5}", best_val_loss);
    Ok(())
}
