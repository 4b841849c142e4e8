//! Data logging toolkit.

use crate::common::*;
use async_std::{fs::File, io::BufWriter};
use cxr_dl::{
    engine::{EpochLosses, EvaluationOutput},
    vocabulary::ClassVocabulary,
};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

pub use logging_message::*;
pub use logging_worker::*;

/// Installs the console subscriber. Records of the `log` facade are
/// forwarded to it. The level defaults to INFO if `RUST_LOG` is unset.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

mod logging_worker {
    use super::*;

    /// The data logging worker writing TensorBoard events.
    pub struct LoggingWorker {
        event_writer: EventWriter<BufWriter<File>>,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        async fn new(logging_dir: &Path, rx: broadcast::Receiver<LoggingMessage>) -> Result<Self> {
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("cxr-dl")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 logging path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self { event_writer, rx })
        }

        async fn start(mut self) -> Result<()> {
            loop {
                let msg = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("logging worker skipped {} messages", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match msg {
                    LoggingMessage::EpochSummary(summary) => {
                        self.log_epoch_summary(&summary).await?;
                    }
                }
            }

            Ok(())
        }

        async fn log_epoch_summary(&mut self, summary: &EpochSummary) -> Result<()> {
            let step = summary.epoch as i64;
            for (tag, value) in summary.scalars() {
                self.event_writer
                    .write_scalar_async(tag, step, value as f32)
                    .await?;
            }
            Ok(())
        }
    }

    /// Spawns the logging worker and returns its join future.
    pub async fn logging_worker(
        logging_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(&logging_dir, rx).await?;
        let future = tokio::task::spawn(worker.start().instrument(info_span!("logging_worker")))
            .map(|result| Fallible::Ok(result??));
        Ok(future)
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub enum LoggingMessage {
        EpochSummary(EpochSummary),
    }

    /// Losses and metrics of a finished epoch.
    #[derive(Debug, Clone)]
    pub struct EpochSummary {
        pub epoch: usize,
        /// The learning rate used in this epoch.
        pub lr: f64,
        pub train: EpochLosses,
        pub val: EvaluationOutput,
    }

    impl EpochSummary {
        /// Scalar events of this epoch. Undefined per-class AUCs are
        /// skipped.
        pub fn scalars(&self) -> Vec<(String, f64)> {
            let Self { lr, train, val, .. } = self;

            let mut scalars = vec![
                ("loss/train".to_string(), train.total_loss),
                ("loss/validation".to_string(), val.classification_loss),
                (
                    "loss/train_classification".to_string(),
                    train.classification_loss,
                ),
                ("loss/train_rpn".to_string(), train.rpn_loss),
                ("loss/train_roi".to_string(), train.roi_loss),
                ("val/mean_auc".to_string(), val.mean_auc),
                ("val/mean_ap_classification".to_string(), val.mean_ap_cls),
                ("val/mean_ap_detection".to_string(), val.mean_ap_det),
                ("params/learning_rate".to_string(), *lr),
            ];

            let vocab = ClassVocabulary::get();
            scalars.extend(
                vocab
                    .names()
                    .zip(val.aucs.iter().copied())
                    .filter(|(_, auc)| auc.is_finite())
                    .map(|(name, auc)| (format!("val/auc/{}", name), auc)),
            );

            scalars
        }

        /// The one-line console summary.
        pub fn console_line(&self) -> String {
            let Self {
                epoch, train, val, ..
            } = self;
            format!(
                "epoch {} | Train Loss: {:.4} | Val Loss: {:.4} | Val AUC: {:.4} | Val mAP (Cls): {:.4} | Val mAP (Det): {:.4}",
                epoch,
                train.total_loss,
                val.classification_loss,
                val.mean_auc,
                val.mean_ap_cls,
                val.mean_ap_det
            )
        }
    }
}
