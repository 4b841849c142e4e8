//! The multi-task model contract and the baseline network.

mod baseline;
pub use baseline::*;

use crate::{common::*, dataset::DetectionTarget};

/// Selects which heads a forward pass or a sample provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskMode {
    Classification,
    Detection,
    Both,
}

impl TaskMode {
    pub fn has_classification(&self) -> bool {
        matches!(self, Self::Classification | Self::Both)
    }

    pub fn has_detection(&self) -> bool {
        matches!(self, Self::Detection | Self::Both)
    }
}

impl Default for TaskMode {
    fn default() -> Self {
        Self::Both
    }
}

/// Detection loss terms, each a scalar tensor.
#[derive(Debug, TensorLike)]
pub struct DetectionLosses {
    /// Proposal objectness loss.
    pub objectness: Tensor,
    /// Proposal box regression loss.
    pub rpn_box_reg: Tensor,
    /// Box classification loss of the second stage.
    pub classifier: Tensor,
    /// Box regression loss of the second stage.
    pub box_reg: Tensor,
}

impl DetectionLosses {
    pub fn rpn_loss(&self) -> Tensor {
        &self.objectness + &self.rpn_box_reg
    }

    pub fn roi_loss(&self) -> Tensor {
        &self.classifier + &self.box_reg
    }

    pub fn total_loss(&self) -> Tensor {
        self.rpn_loss() + self.roi_loss()
    }
}

/// Detections of one image.
#[derive(Debug, TensorLike)]
pub struct DetectionPrediction {
    /// Boxes in `[x1, y1, x2, y2]` pixel coordinates with shape `[K, 4]`.
    pub boxes: Tensor,
    /// Scores with shape `[K]`.
    pub scores: Tensor,
    /// 1-based detection labels with shape `[K]`.
    pub labels: Tensor,
}

impl DetectionPrediction {
    pub fn empty(device: Device) -> Self {
        Self {
            boxes: Tensor::zeros(&[0, 4], (Kind::Float, device)),
            scores: Tensor::zeros(&[0], (Kind::Float, device)),
            labels: Tensor::zeros(&[0], (Kind::Int64, device)),
        }
    }

    pub fn len(&self) -> i64 {
        self.scores.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The detection part of a forward pass.
#[derive(Debug)]
pub enum DetectionOutput {
    Losses(DetectionLosses),
    Predictions(Vec<DetectionPrediction>),
}

#[derive(Debug, Default)]
pub struct ModelOutput {
    /// Classification logits with shape `[B, num_classes]`.
    pub classification: Option<Tensor>,
    pub detection: Option<DetectionOutput>,
}

impl ModelOutput {
    pub fn classification_logits(&self) -> Result<&Tensor> {
        self.classification
            .as_ref()
            .ok_or_else(|| format_err!("the model did not produce classification logits"))
    }

    pub fn detection_losses(&self) -> Result<&DetectionLosses> {
        match &self.detection {
            Some(DetectionOutput::Losses(losses)) => Ok(losses),
            _ => bail!("the model did not produce detection losses"),
        }
    }

    pub fn detection_predictions(&self) -> Result<&[DetectionPrediction]> {
        match &self.detection {
            Some(DetectionOutput::Predictions(predictions)) => Ok(predictions),
            _ => bail!("the model did not produce detection predictions"),
        }
    }
}

/// A network with a classification head and a detection head sharing one
/// backbone.
///
/// The classification part of the output is present iff the mode has the
/// classification capability. The detection part is present iff the mode
/// has the detection capability, carrying losses when `train` is set and
/// targets are given, and per-image predictions otherwise.
pub trait MultiTaskModel
where
    Self: Debug + Send,
{
    fn forward_t(
        &mut self,
        images: &Tensor,
        targets: Option<&[DetectionTarget]>,
        mode: TaskMode,
        train: bool,
    ) -> Result<ModelOutput>;
}

impl<M> MultiTaskModel for Box<M>
where
    M: MultiTaskModel + ?Sized,
{
    fn forward_t(
        &mut self,
        images: &Tensor,
        targets: Option<&[DetectionTarget]>,
        mode: TaskMode,
        train: bool,
    ) -> Result<ModelOutput> {
        (**self).forward_t(images, targets, mode, train)
    }
}
