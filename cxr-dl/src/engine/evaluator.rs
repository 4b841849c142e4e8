use crate::{
    common::*,
    dataset::Batch,
    loss::BceWithLogitsLoss,
    metrics::{
        classification_metrics, DetectionMapCalculator, DetectionMapCalculatorInit,
        ImageGroundTruth, ImagePrediction,
    },
    model::{MultiTaskModel, TaskMode},
    utils::mean_or_zero,
};

/// Validation losses and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutput {
    pub classification_loss: f64,
    pub mean_auc: f64,
    pub mean_ap_cls: f64,
    /// Detection mAP, or 0 if no validation image has boxes.
    pub mean_ap_det: f64,
    /// ROC AUC per class, NaN for classes without positives.
    pub aucs: Vec<f64>,
    /// Classification AP per class, NaN for classes without positives.
    pub aps_cls: Vec<f64>,
    /// Detection AP keyed by detection label.
    pub aps_det: BTreeMap<i64, f64>,
}

/// Evaluates a model with the default detection matching settings.
pub fn evaluate<M, I>(
    model: &mut M,
    criterion: &BceWithLogitsLoss,
    batches: I,
) -> Result<EvaluationOutput>
where
    M: MultiTaskModel + ?Sized,
    I: IntoIterator<Item = Result<Batch>>,
{
    let map_calculator = DetectionMapCalculatorInit::default().build()?;
    evaluate_with(model, criterion, batches, &map_calculator)
}

/// Runs the model in inference mode over every batch and computes the
/// classification and detection metrics.
///
/// Only images with boxes take part in the detection metrics.
pub fn evaluate_with<M, I>(
    model: &mut M,
    criterion: &BceWithLogitsLoss,
    batches: I,
    map_calculator: &DetectionMapCalculator,
) -> Result<EvaluationOutput>
where
    M: MultiTaskModel + ?Sized,
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut cls_losses = vec![];
    let mut cls_targets = vec![];
    let mut cls_probs = vec![];
    let mut det_targets = vec![];
    let mut det_preds = vec![];

    tch::no_grad(|| -> Result<()> {
        for (step, batch) in batches.into_iter().enumerate() {
            let batch = batch.with_context(|| format!("failed to load batch {}", step))?;
            let output = model.forward_t(&batch.images, None, TaskMode::Both, false)?;

            let logits = output.classification_logits()?;
            let loss = criterion.forward(logits, &batch.classification)?;
            cls_losses.push(f64::from(&loss));
            cls_targets.push(batch.classification.to_device(Device::Cpu));
            cls_probs.push(logits.sigmoid().to_device(Device::Cpu));

            let predictions = output.detection_predictions()?;
            ensure!(
                predictions.len() == batch.len(),
                "expect {} detection predictions, but get {}",
                batch.len(),
                predictions.len()
            );
            for (target, prediction) in izip!(&batch.detection, predictions) {
                if !target.has_bbox() {
                    continue;
                }
                det_targets.push(ImageGroundTruth::from_target(target)?);
                det_preds.push(ImagePrediction::from_prediction(prediction)?);
            }
        }
        Ok(())
    })?;

    ensure!(!cls_losses.is_empty(), "no batch to evaluate");

    let cls_metrics = classification_metrics(
        &Tensor::cat(&cls_targets, 0),
        &Tensor::cat(&cls_probs, 0),
    )?;
    if cls_metrics.mean_auc.is_nan() {
        warn!("no class has positive validation samples, the mean AUC is undefined");
    }
    let det_metrics = map_calculator.compute(&det_targets, &det_preds)?;

    Ok(EvaluationOutput {
        classification_loss: mean_or_zero(cls_losses),
        mean_auc: cls_metrics.mean_auc,
        mean_ap_cls: cls_metrics.mean_ap,
        mean_ap_det: det_metrics.mean_ap,
        aucs: cls_metrics.aucs,
        aps_cls: cls_metrics.aps,
        aps_det: det_metrics.aps,
    })
}
