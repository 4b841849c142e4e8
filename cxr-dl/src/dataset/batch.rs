//! Batch collation and the split into detection and classification subsets.

use super::{DetectionTarget, Sample};
use crate::common::*;

/// A collated batch of samples carrying both kinds of targets.
#[derive(Debug, TensorLike)]
pub struct Batch {
    /// Images with shape `[B, C, H, W]`.
    pub images: Tensor,
    /// Classification targets with shape `[B, NUM_CLASSES]`.
    pub classification: Tensor,
    /// Detection targets in batch order.
    pub detection: Vec<DetectionTarget>,
    #[tensor_like(clone)]
    pub image_names: Vec<String>,
}

impl Batch {
    /// Stacks samples into a batch.
    ///
    /// Every sample must carry both targets and all images must have the
    /// same shape.
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        ensure!(!samples.is_empty(), "cannot collate an empty batch");

        let image_size = samples[0].image.size();
        let (images, classification, detection, image_names) = samples
            .into_iter()
            .map(|sample| -> Result<_> {
                let Sample {
                    image,
                    classification,
                    detection,
                    image_name,
                } = sample;

                ensure!(
                    image.size() == image_size,
                    "image '{}' has shape {:?}, but the batch expects {:?}",
                    image_name,
                    image.size(),
                    image_size
                );
                let classification = classification.ok_or_else(|| {
                    format_err!("sample '{}' has no classification target", image_name)
                })?;
                let detection = detection.ok_or_else(|| {
                    format_err!("sample '{}' has no detection target", image_name)
                })?;

                Ok((image, classification, detection, image_name))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip_n_vec();

        Ok(Self {
            images: Tensor::stack(&images, 0),
            classification: Tensor::stack(&classification, 0),
            detection,
            image_names,
        })
    }

    pub fn len(&self) -> usize {
        self.detection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detection.is_empty()
    }

    /// Gathers the samples at `indexes`, in the given order.
    pub fn select(&self, indexes: &[usize]) -> Result<Self> {
        let len = self.len();
        ensure!(
            indexes.iter().all(|&index| index < len),
            "indexes {:?} out of range for a batch of {} samples",
            indexes,
            len
        );

        let index_tensor = Tensor::of_slice(
            &indexes
                .iter()
                .map(|&index| index as i64)
                .collect_vec(),
        )
        .to_device(self.images.device());

        Ok(Self {
            images: self.images.index_select(0, &index_tensor),
            classification: self.classification.index_select(0, &index_tensor),
            detection: indexes
                .iter()
                .map(|&index| self.detection[index].clone())
                .collect(),
            image_names: indexes
                .iter()
                .map(|&index| self.image_names[index].clone())
                .collect(),
        })
    }
}

/// Partition of a batch into samples with boxes and samples without.
///
/// Both index lists keep batch order, are disjoint and together cover the
/// batch.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct BatchSplit {
    /// Samples with at least one box.
    #[getset(get = "pub")]
    detection: Vec<usize>,
    /// Samples trained on the classification task only.
    #[getset(get = "pub")]
    classification: Vec<usize>,
}

impl BatchSplit {
    pub fn new(targets: &[DetectionTarget]) -> Self {
        let (detection, classification) =
            (0..targets.len()).partition(|&index| targets[index].has_bbox());
        Self {
            detection,
            classification,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.detection.len() + self.classification.len()
    }
}
