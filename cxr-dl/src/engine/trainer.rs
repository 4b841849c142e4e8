use crate::{
    common::*,
    dataset::{Batch, BatchSplit},
    loss::BceWithLogitsLoss,
    model::{MultiTaskModel, TaskMode},
    utils::mean_or_zero,
};

/// The parameter update interface the training step drives.
pub trait Optimize {
    fn zero_grad(&mut self);
    fn step(&mut self);
}

impl Optimize for nn::Optimizer {
    fn zero_grad(&mut self) {
        nn::Optimizer::zero_grad(self)
    }

    fn step(&mut self) {
        nn::Optimizer::step(self)
    }
}

/// Losses of the samples with boxes, trained on both tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionSubsetLosses {
    pub classification_loss: f64,
    pub rpn_loss: f64,
    pub roi_loss: f64,
    pub total_loss: f64,
}

/// Losses reported by one training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    /// Present when the batch contains samples with boxes.
    pub detection_subset: Option<DetectionSubsetLosses>,
    /// Classification loss of the samples without boxes, if any.
    pub classification_subset_loss: Option<f64>,
    /// Sum of the total loss of both subsets.
    pub total_loss: f64,
}

/// Mean losses of a training epoch. Empty loss lists average to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub classification_loss: f64,
    pub rpn_loss: f64,
    pub roi_loss: f64,
    pub total_loss: f64,
    pub num_batches: usize,
}

/// Runs one optimization step over a mixed batch.
///
/// Samples with boxes are forwarded in [TaskMode::Both] with their targets,
/// the rest in [TaskMode::Classification]. Gradients of both subsets are
/// accumulated before a single optimizer step.
pub fn train_step<M, O>(
    model: &mut M,
    criterion: &BceWithLogitsLoss,
    batch: &Batch,
    optimizer: &mut O,
) -> Result<StepLosses>
where
    M: MultiTaskModel + ?Sized,
    O: Optimize + ?Sized,
{
    ensure!(!batch.is_empty(), "cannot train on an empty batch");
    let split = BatchSplit::new(&batch.detection);

    optimizer.zero_grad();

    let detection_subset = if !split.detection().is_empty() {
        let subset = batch.select(split.detection())?;
        let output = model.forward_t(
            &subset.images,
            Some(subset.detection.as_slice()),
            TaskMode::Both,
            true,
        )?;

        let cls_loss = criterion.forward(output.classification_logits()?, &subset.classification)?;
        let det_losses = output.detection_losses()?;
        let rpn_loss = det_losses.rpn_loss();
        let roi_loss = det_losses.roi_loss();
        let total_loss = &cls_loss + &rpn_loss + &roi_loss;
        total_loss.backward();

        Some(DetectionSubsetLosses {
            classification_loss: f64::from(&cls_loss),
            rpn_loss: f64::from(&rpn_loss),
            roi_loss: f64::from(&roi_loss),
            total_loss: f64::from(&total_loss),
        })
    } else {
        None
    };

    let classification_subset_loss = if !split.classification().is_empty() {
        let subset = batch.select(split.classification())?;
        let output = model.forward_t(&subset.images, None, TaskMode::Classification, true)?;

        let cls_loss = criterion.forward(output.classification_logits()?, &subset.classification)?;
        cls_loss.backward();

        Some(f64::from(&cls_loss))
    } else {
        None
    };

    optimizer.step();

    let total_loss = detection_subset
        .map(|losses| losses.total_loss)
        .unwrap_or(0.0)
        + classification_subset_loss.unwrap_or(0.0);

    Ok(StepLosses {
        detection_subset,
        classification_subset_loss,
        total_loss,
    })
}

/// Trains over a sequence of batches and averages the step losses.
///
/// A failed batch aborts the epoch.
pub fn train_one_epoch<M, O, I>(
    model: &mut M,
    criterion: &BceWithLogitsLoss,
    batches: I,
    optimizer: &mut O,
) -> Result<EpochLosses>
where
    M: MultiTaskModel + ?Sized,
    O: Optimize + ?Sized,
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut cls_losses = vec![];
    let mut rpn_losses = vec![];
    let mut roi_losses = vec![];
    let mut total_losses = vec![];

    for (step, batch) in batches.into_iter().enumerate() {
        let batch = batch.with_context(|| format!("failed to load batch {}", step))?;
        let losses = train_step(model, criterion, &batch, optimizer)
            .with_context(|| format!("training step {} failed", step))?;

        if let Some(subset) = &losses.detection_subset {
            cls_losses.push(subset.classification_loss);
            rpn_losses.push(subset.rpn_loss);
            roi_losses.push(subset.roi_loss);
        }
        if let Some(loss) = losses.classification_subset_loss {
            cls_losses.push(loss);
        }
        total_losses.push(losses.total_loss);

        debug!(
            "step {}\tbatch size {}\ttotal loss {:.5}",
            step,
            batch.len(),
            losses.total_loss
        );
    }

    Ok(EpochLosses {
        classification_loss: mean_or_zero(cls_losses),
        rpn_loss: mean_or_zero(rpn_losses),
        roi_loss: mean_or_zero(roi_losses),
        total_loss: mean_or_zero(total_losses.iter().copied()),
        num_batches: total_losses.len(),
    })
}
