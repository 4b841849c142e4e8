//! Training program configuration format.

use crate::common::*;
use cxr_dl::{dataset::Normalize, model::BaselineModelInit};

pub use dataset::*;
pub use preprocessor::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub preprocessor: PreprocessorConfig,
    #[serde(default)]
    pub model: BaselineModelInit,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory searched for `images/*.png` files.
        pub image_dir: PathBuf,
        /// The CSV table with `Image Index` and `Finding Labels` columns.
        pub label_file: PathBuf,
        /// Optional bounding box table in CSV or JSON format.
        pub bbox_file: Option<PathBuf>,
        pub split: DatasetSplit,
        /// Images are resized to a square of this size if set.
        pub image_size: Option<NonZeroUsize>,
    }

    /// Train/validation split methods.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DatasetSplit {
        /// Use image list files, one image name per line.
        ListFiles {
            train_list: PathBuf,
            val_list: PathBuf,
        },
        /// Draw a seeded random validation subset.
        Random { val_ratio: R64, seed: u64 },
    }
}

mod preprocessor {
    use super::*;

    /// Data preprocessing options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PreprocessorConfig {
        /// The probability to apply horizontal flip on training images.
        pub horizontal_flip_prob: Option<R64>,
        /// Per-channel mean. ImageNet statistics are used if unset.
        pub mean: Option<Vec<f64>>,
        /// Per-channel standard deviation. ImageNet statistics are used if unset.
        pub std: Option<Vec<f64>>,
        /// The maximum number of images decoded concurrently.
        pub num_workers: NonZeroUsize,
        /// The maximum number of batches waiting for the training worker.
        pub prefetch_batches: NonZeroUsize,
    }

    impl PreprocessorConfig {
        pub fn normalize(&self) -> Result<Normalize> {
            let imagenet = Normalize::imagenet();
            let normalize = Normalize {
                mean: self.mean.clone().unwrap_or(imagenet.mean),
                std: self.std.clone().unwrap_or(imagenet.std),
            };
            ensure!(
                normalize.mean.len() == 3 && normalize.std.len() == 3,
                "mean and std must have 3 channels"
            );
            ensure!(
                normalize.std.iter().all(|&std| std > 0.0),
                "std must be positive"
            );
            Ok(normalize)
        }
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub epochs: NonZeroUsize,
        pub batch_size: NonZeroUsize,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The weight decay parameter for optimizer.
        pub weight_decay: R64,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
        /// The IoU threshold to match a predicted box to a ground truth box
        /// in validation.
        #[serde(default = "default_det_iou_threshold")]
        pub det_iou_threshold: R64,
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Scale the learning rate down when the validation loss stops
        /// improving.
        ReduceOnPlateau {
            lr: R64,
            #[serde(default = "default_plateau_factor")]
            factor: R64,
            #[serde(default = "default_plateau_patience")]
            patience: usize,
            #[serde(default = "default_min_lr")]
            min_lr: R64,
        },
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    fn default_det_iou_threshold() -> R64 {
        r64(0.5)
    }

    fn default_plateau_factor() -> R64 {
        r64(0.1)
    }

    fn default_plateau_patience() -> usize {
        10
    }

    fn default_min_lr() -> R64 {
        r64(0.0)
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}
