//! Dataset construction and parallel batch loading.

use crate::{
    common::*,
    config::{Config, DatasetSplit, PreprocessorConfig},
};
use cxr_dl::{
    dataset::{
        load_image_list, AnnotationTable, Batch, BoundingBoxTable, ChestXrayDataset,
        ChestXrayDatasetInit, Compose, HorizontalFlip, Resize,
    },
    model::TaskMode,
};

/// Loads the annotation tables and builds the `(train, validation)`
/// datasets.
pub fn load_datasets(config: &Config) -> Result<(ChestXrayDataset, ChestXrayDataset)> {
    let dataset_config = &config.dataset;
    let preprocessor = &config.preprocessor;

    let annotations = AnnotationTable::load(&dataset_config.label_file)?;
    let bboxes = dataset_config
        .bbox_file
        .as_ref()
        .map(BoundingBoxTable::load)
        .transpose()?;
    if let Some(bboxes) = &bboxes {
        info!("loaded boxes of {} images", bboxes.num_images());
    }

    let (train_annotations, val_annotations) = match &dataset_config.split {
        DatasetSplit::ListFiles {
            train_list,
            val_list,
        } => (
            annotations.select_images(&load_image_list(train_list)?),
            annotations.select_images(&load_image_list(val_list)?),
        ),
        DatasetSplit::Random { val_ratio, seed } => {
            annotations.random_split(val_ratio.raw(), *seed)?
        }
    };

    let normalize = preprocessor.normalize()?;
    let resize = dataset_config.image_size.map(|size| {
        let size = size.get() as i64;
        Resize {
            height: size,
            width: size,
        }
    });

    let train_transform = {
        let mut transform = Compose::default();
        if let Some(resize) = resize.clone() {
            transform.push(resize);
        }
        if let Some(prob) = preprocessor.horizontal_flip_prob {
            transform.push(HorizontalFlip::new(prob.raw())?);
        }
        transform.push(normalize.clone());
        transform
    };
    let val_transform = {
        let mut transform = Compose::default();
        if let Some(resize) = resize {
            transform.push(resize);
        }
        transform.push(normalize);
        transform
    };

    let build = |annotations: AnnotationTable, transform: Compose| {
        ChestXrayDatasetInit {
            image_dir: dataset_config.image_dir.clone(),
            annotations,
            bboxes: bboxes.clone(),
            transform: Some(Box::new(transform)),
            mode: TaskMode::Both,
        }
        .build()
    };
    let train_set = build(train_annotations, train_transform)?;
    let val_set = build(val_annotations, val_transform)?;

    ensure!(!train_set.is_empty(), "the training set is empty");
    ensure!(!val_set.is_empty(), "the validation set is empty");

    Ok((train_set, val_set))
}

/// Loads batches of a dataset on the tokio runtime.
///
/// Samples are decoded on the blocking thread pool. Finished batches wait
/// in a bounded channel until the consumer takes them.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<ChestXrayDataset>,
    batch_size: usize,
    num_workers: usize,
    prefetch_batches: usize,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<ChestXrayDataset>,
        batch_size: usize,
        preprocessor: &PreprocessorConfig,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");
        Ok(Self {
            dataset,
            batch_size,
            num_workers: preprocessor.num_workers.get(),
            prefetch_batches: preprocessor.prefetch_batches.get(),
        })
    }

    pub fn dataset(&self) -> &ChestXrayDataset {
        &self.dataset
    }

    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Spawns a task loading one pass over the dataset.
    ///
    /// Loading stops after the first failed batch, which is delivered to
    /// the receiver, or when the receiver is dropped.
    pub fn spawn(
        &self,
        handle: &tokio::runtime::Handle,
        shuffle: bool,
    ) -> mpsc::Receiver<Result<Batch>> {
        let mut indexes: Vec<usize> = (0..self.dataset.len()).collect();
        if shuffle {
            indexes.shuffle(&mut rand::thread_rng());
        }

        let (tx, rx) = mpsc::channel(self.prefetch_batches);
        let Self {
            dataset,
            batch_size,
            num_workers,
            ..
        } = self.clone();

        handle.spawn(
            async move {
                let chunks: Vec<Vec<usize>> = indexes
                    .chunks(batch_size)
                    .map(|chunk| chunk.to_vec())
                    .collect();

                for chunk in chunks {
                    let result = load_batch(dataset.clone(), chunk, num_workers).await;
                    let is_err = result.is_err();

                    if tx.send(result).await.is_err() {
                        debug!("batch receiver is dropped, stop loading");
                        break;
                    }
                    if is_err {
                        break;
                    }
                }
            }
            .instrument(trace_span!("batch_loader")),
        );

        rx
    }
}

async fn load_batch(
    dataset: Arc<ChestXrayDataset>,
    indexes: Vec<usize>,
    num_workers: usize,
) -> Result<Batch> {
    let samples: Vec<_> = stream::iter(indexes)
        .map(|index| {
            let dataset = dataset.clone();
            tokio::task::spawn_blocking(move || {
                dataset
                    .get(index)
                    .with_context(|| format!("failed to load sample {}", index))
            })
            .map(|result| Fallible::Ok(result??))
        })
        .buffered(num_workers)
        .try_collect()
        .await?;

    Batch::collate(samples)
}

/// Blocks on the receiver and yields batches until the loader finishes.
///
/// Must not be called from an async context.
pub fn blocking_batches(
    mut rx: mpsc::Receiver<Result<Batch>>,
) -> impl Iterator<Item = Result<Batch>> {
    std::iter::from_fn(move || rx.blocking_recv())
}
