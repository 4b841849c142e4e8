use super::{ApCalculator, IntegralMethod};
use crate::{
    common::*,
    dataset::DetectionTarget,
    model::DetectionPrediction,
    vocabulary::NUM_CLASSES,
};

/// Ground truth boxes of one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageGroundTruth {
    pub boxes: Vec<TLBR<f64>>,
    /// 1-based detection labels aligned with `boxes`.
    pub labels: Vec<i64>,
}

impl ImageGroundTruth {
    pub fn from_target(target: &DetectionTarget) -> Result<Self> {
        let boxes: Vec<_> = target
            .boxes_xyxy()
            .into_iter()
            .map(|[x1, y1, x2, y2]| {
                TLBR::try_from_xyxy([x1 as f64, y1 as f64, x2 as f64, y2 as f64])
            })
            .try_collect()?;
        Ok(Self {
            boxes,
            labels: target.labels_vec(),
        })
    }
}

/// Detections of one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImagePrediction {
    pub boxes: Vec<TLBR<f64>>,
    pub scores: Vec<f64>,
    pub labels: Vec<i64>,
}

impl ImagePrediction {
    pub fn from_prediction(prediction: &DetectionPrediction) -> Result<Self> {
        let boxes = prediction
            .boxes
            .to_device(Device::Cpu)
            .to_kind(Kind::Double)
            .reshape(&[-1]);
        let boxes: Vec<_> = Vec::<f64>::from(&boxes)
            .chunks_exact(4)
            .map(|xyxy| TLBR::try_from_xyxy([xyxy[0], xyxy[1], xyxy[2], xyxy[3]]))
            .try_collect()?;
        let scores =
            Vec::<f64>::from(&prediction.scores.to_device(Device::Cpu).to_kind(Kind::Double));
        let labels =
            Vec::<i64>::from(&prediction.labels.to_device(Device::Cpu).to_kind(Kind::Int64));

        ensure!(
            boxes.len() == scores.len() && boxes.len() == labels.len(),
            "inconsistent prediction sizes: {} boxes, {} scores, {} labels",
            boxes.len(),
            scores.len(),
            labels.len()
        );

        Ok(Self {
            boxes,
            scores,
            labels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMapOutput {
    /// AP per detection label. Labels without ground truth are absent.
    pub aps: BTreeMap<i64, f64>,
    /// Mean AP over present labels, or 0 if none is present.
    pub mean_ap: f64,
}

#[derive(Debug, Clone)]
pub struct DetectionMapCalculatorInit {
    pub iou_threshold: R64,
    pub num_classes: usize,
    pub integral_method: IntegralMethod,
}

impl Default for DetectionMapCalculatorInit {
    fn default() -> Self {
        Self {
            iou_threshold: r64(0.5),
            num_classes: NUM_CLASSES,
            integral_method: IntegralMethod::Interpolation(11),
        }
    }
}

impl DetectionMapCalculatorInit {
    pub fn build(self) -> Result<DetectionMapCalculator> {
        let Self {
            iou_threshold,
            num_classes,
            integral_method,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&iou_threshold.raw()),
            "iou_threshold must be in range [0, 1]"
        );
        ensure!(num_classes > 0, "num_classes must be positive");

        Ok(DetectionMapCalculator {
            iou_threshold,
            num_classes,
            ap_calculator: ApCalculator::new(integral_method)?,
        })
    }
}

/// Per-class detection AP with greedy matching.
///
/// Boxes of a class are pooled over all images before matching, so a
/// prediction may be matched to a ground truth box of another image.
#[derive(Debug, Clone)]
pub struct DetectionMapCalculator {
    iou_threshold: R64,
    num_classes: usize,
    ap_calculator: ApCalculator,
}

impl DetectionMapCalculator {
    pub fn compute(
        &self,
        targets: &[ImageGroundTruth],
        predictions: &[ImagePrediction],
    ) -> Result<DetectionMapOutput> {
        ensure!(
            targets.len() == predictions.len(),
            "the number of targets ({}) and predictions ({}) differ",
            targets.len(),
            predictions.len()
        );

        let gt_pools = targets
            .iter()
            .flat_map(|target| izip!(&target.labels, &target.boxes))
            .map(|(&label, rect)| (label, rect))
            .into_group_map();
        let det_pools = predictions
            .iter()
            .flat_map(|prediction| {
                izip!(&prediction.labels, &prediction.boxes, &prediction.scores)
            })
            .map(|(&label, rect, &score)| (label, (rect, score)))
            .into_group_map();

        let aps: BTreeMap<i64, f64> = (1..=self.num_classes as i64)
            .filter_map(|label| {
                let gt_boxes = gt_pools.get(&label)?;
                let ap = match det_pools.get(&label) {
                    Some(dets) => self.class_ap(gt_boxes, dets),
                    None => 0.0,
                };
                Some((label, ap))
            })
            .collect();

        let mean_ap = if aps.is_empty() {
            0.0
        } else {
            aps.values().sum::<f64>() / aps.len() as f64
        };

        Ok(DetectionMapOutput { aps, mean_ap })
    }

    fn class_ap(&self, gt_boxes: &[&TLBR<f64>], dets: &[(&TLBR<f64>, f64)]) -> f64 {
        let iou_threshold = self.iou_threshold.raw();

        // stable sort keeps the input order of equally scored detections
        let mut dets = dets.to_vec();
        dets.sort_by(|(_, lhs), (_, rhs)| rhs.partial_cmp(lhs).unwrap_or(Ordering::Equal));

        let mut used = vec![false; gt_boxes.len()];
        let is_tp = dets.iter().map(|(det_rect, _)| {
            let best = gt_boxes
                .iter()
                .enumerate()
                .map(|(index, gt_rect)| (index, det_rect.iou_with(*gt_rect)))
                .fold(None, |best: Option<(usize, f64)>, (index, iou)| match best {
                    Some((_, best_iou)) if best_iou >= iou => best,
                    _ => Some((index, iou)),
                });

            match best {
                Some((index, iou)) if iou >= iou_threshold && !used[index] => {
                    used[index] = true;
                    true
                }
                _ => false,
            }
        });

        self.ap_calculator
            .compute_by_detections(is_tp, gt_boxes.len())
            .raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(xyxy: [f64; 4]) -> TLBR<f64> {
        TLBR::try_from_xyxy(xyxy).unwrap()
    }

    fn calculator() -> DetectionMapCalculator {
        DetectionMapCalculatorInit::default().build().unwrap()
    }

    #[test]
    fn identical_prediction_has_unit_ap() -> Result<()> {
        let targets = vec![ImageGroundTruth {
            boxes: vec![rect([10.0, 10.0, 50.0, 60.0])],
            labels: vec![3],
        }];
        let predictions = vec![ImagePrediction {
            boxes: vec![rect([10.0, 10.0, 50.0, 60.0])],
            scores: vec![1.0],
            labels: vec![3],
        }];

        let output = calculator().compute(&targets, &predictions)?;
        assert_eq!(output.aps.len(), 1);
        assert_abs_diff_eq!(output.aps[&3], 1.0);
        assert_abs_diff_eq!(output.mean_ap, 1.0);
        Ok(())
    }

    #[test]
    fn ground_truth_without_predictions_has_zero_ap() -> Result<()> {
        let targets = vec![ImageGroundTruth {
            boxes: vec![rect([10.0, 10.0, 50.0, 60.0])],
            labels: vec![2],
        }];
        let predictions = vec![ImagePrediction {
            boxes: vec![rect([10.0, 10.0, 50.0, 60.0])],
            scores: vec![0.9],
            labels: vec![5],
        }];

        let output = calculator().compute(&targets, &predictions)?;
        assert_eq!(output.aps.keys().copied().collect_vec(), vec![2]);
        assert_eq!(output.aps[&2], 0.0);
        assert_eq!(output.mean_ap, 0.0);
        Ok(())
    }

    #[test]
    fn no_ground_truth_gives_no_entry() -> Result<()> {
        let output = calculator().compute(
            &[ImageGroundTruth::default()],
            &[ImagePrediction::default()],
        )?;
        assert!(output.aps.is_empty());
        assert_eq!(output.mean_ap, 0.0);
        Ok(())
    }

    #[test]
    fn ground_truth_is_claimed_once() -> Result<()> {
        // the duplicate detection becomes a false positive
        let targets = vec![ImageGroundTruth {
            boxes: vec![rect([0.0, 0.0, 10.0, 10.0])],
            labels: vec![1],
        }];
        let predictions = vec![ImagePrediction {
            boxes: vec![rect([0.0, 0.0, 10.0, 10.0]), rect([0.0, 0.0, 10.0, 10.0])],
            scores: vec![0.9, 0.8],
            labels: vec![1, 1],
        }];

        let output = calculator().compute(&targets, &predictions)?;
        assert_abs_diff_eq!(output.aps[&1], 1.0);

        // a low overlap match is rejected
        let predictions = vec![ImagePrediction {
            boxes: vec![rect([5.0, 0.0, 15.0, 10.0])],
            scores: vec![0.9],
            labels: vec![1],
        }];
        let output = calculator().compute(&targets, &predictions)?;
        assert_eq!(output.aps[&1], 0.0);
        Ok(())
    }

    #[test]
    fn equal_scores_keep_input_order() -> Result<()> {
        let targets = vec![ImageGroundTruth {
            boxes: vec![rect([0.0, 0.0, 10.0, 10.0])],
            labels: vec![4],
        }];
        let hit = rect([0.0, 0.0, 10.0, 10.0]);
        let miss = rect([50.0, 50.0, 60.0, 60.0]);

        // hit ranks first: TP then FP
        let predictions = vec![ImagePrediction {
            boxes: vec![hit, miss],
            scores: vec![0.7, 0.7],
            labels: vec![4, 4],
        }];
        let output = calculator().compute(&targets, &predictions)?;
        assert_abs_diff_eq!(output.aps[&4], 1.0);

        // miss ranks first: FP then TP, precision 0.5 at full recall
        let predictions = vec![ImagePrediction {
            boxes: vec![miss, hit],
            scores: vec![0.7, 0.7],
            labels: vec![4, 4],
        }];
        let output = calculator().compute(&targets, &predictions)?;
        assert_abs_diff_eq!(output.aps[&4], 0.5);
        Ok(())
    }

    #[test]
    fn claimed_best_match_is_false_positive() -> Result<()> {
        // the second detection overlaps the claimed box by 0.9 and the free
        // box by about 0.74, but only its best match counts
        let targets = vec![ImageGroundTruth {
            boxes: vec![rect([0.0, 0.0, 10.0, 10.0]), rect([1.0, 0.0, 11.0, 10.0])],
            labels: vec![2, 2],
        }];
        let predictions = vec![ImagePrediction {
            boxes: vec![rect([0.0, 0.0, 10.0, 10.0]), rect([0.0, 0.0, 10.0, 9.0])],
            scores: vec![0.9, 0.8],
            labels: vec![2, 2],
        }];

        let output = calculator().compute(&targets, &predictions)?;
        // precision 1 up to recall 0.5, nothing beyond
        assert_abs_diff_eq!(output.aps[&2], 6.0 / 11.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let result = calculator().compute(&[ImageGroundTruth::default()], &[]);
        assert!(result.is_err());
    }

    #[test]
    fn conversion_from_tensors() -> Result<()> {
        let prediction = DetectionPrediction {
            boxes: Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0]).view([1, 4]),
            scores: Tensor::of_slice(&[0.5f32]),
            labels: Tensor::of_slice(&[7i64]),
        };
        let converted = ImagePrediction::from_prediction(&prediction)?;
        assert_eq!(converted.boxes, vec![rect([1.0, 2.0, 3.0, 4.0])]);
        assert_eq!(converted.labels, vec![7]);
        assert_abs_diff_eq!(converted.scores[0], 0.5);
        Ok(())
    }
}
