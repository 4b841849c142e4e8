use super::{
    DetectionLosses, DetectionOutput, DetectionPrediction, ModelOutput, MultiTaskModel, TaskMode,
};
use crate::{
    common::*,
    dataset::DetectionTarget,
    utils::{NonMaxSuppression, NonMaxSuppressionInit, ScoredBox},
    vocabulary::NUM_CLASSES,
};

/// Upper bound of the predicted log box scale before exponentiation.
const MAX_LOG_SCALE: f64 = 8.0;
/// Channels before the class logits: objectness and 4 box parameters.
const NUM_BOX_CHANNELS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModelInit {
    pub num_classes: usize,
    pub in_channels: usize,
    /// Output channels of the stride-2 backbone stages.
    pub channels: Vec<usize>,
    pub hidden_dim: usize,
    pub dropout: f64,
    pub score_threshold: f64,
    pub nms_iou_threshold: f64,
    pub max_detections: usize,
}

impl Default for BaselineModelInit {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            in_channels: 3,
            channels: vec![32, 64, 128, 256],
            hidden_dim: 512,
            dropout: 0.3,
            score_threshold: 0.05,
            nms_iou_threshold: 0.5,
            max_detections: 100,
        }
    }
}

impl BaselineModelInit {
    pub fn build<'p, P>(self, path: P) -> Result<BaselineModel>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            num_classes,
            in_channels,
            channels,
            hidden_dim,
            dropout,
            score_threshold,
            nms_iou_threshold,
            max_detections,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(in_channels > 0, "in_channels must be positive");
        ensure!(
            channels.iter().all(|&c| c > 0),
            "every backbone stage must have positive channels"
        );
        ensure!(hidden_dim > 0, "hidden_dim must be positive");
        ensure!(
            (0.0..1.0).contains(&dropout),
            "dropout must be in range [0, 1), but get {}",
            dropout
        );

        let nms = NonMaxSuppressionInit {
            iou_threshold: R64::try_new(nms_iou_threshold)
                .ok_or_else(|| format_err!("nms_iou_threshold must be finite"))?,
            confidence_threshold: R64::try_new(score_threshold)
                .ok_or_else(|| format_err!("score_threshold must be finite"))?,
            max_detections: Some(max_detections),
        }
        .build()?;

        let backbone: Vec<_> = iter::once(in_channels)
            .chain(channels.iter().copied())
            .tuple_windows()
            .enumerate()
            .map(|(index, (in_c, out_c))| {
                ConvBnInit {
                    in_c,
                    out_c,
                    k: 3,
                    s: 2,
                }
                .build(path / format!("backbone_{}", index))
            })
            .collect();
        let feature_c = match channels.last() {
            Some(&c) => c as i64,
            None => bail!("channels must be non-empty"),
        };

        let cls_hidden = nn::linear(
            path / "cls_hidden",
            feature_c,
            hidden_dim as i64,
            Default::default(),
        );
        let cls_output = nn::linear(
            path / "cls_output",
            hidden_dim as i64,
            num_classes as i64,
            Default::default(),
        );

        let det_hidden = ConvBnInit {
            in_c: feature_c as usize,
            out_c: feature_c as usize,
            k: 3,
            s: 1,
        }
        .build(path / "det_hidden");
        let det_output = nn::conv2d(
            path / "det_output",
            feature_c,
            NUM_BOX_CHANNELS + num_classes as i64 + 1,
            1,
            Default::default(),
        );

        Ok(BaselineModel {
            num_classes: num_classes as i64,
            dropout,
            score_threshold,
            backbone,
            cls_hidden,
            cls_output,
            det_hidden,
            det_output,
            nms,
        })
    }
}

/// A single-scale dense multi-task network.
///
/// The detection head predicts, for every cell of the stride-`2^stages`
/// feature map, an objectness logit, a box relative to the cell and
/// `num_classes + 1` class logits where index 0 is background. A box is
/// assigned to the cell containing its center.
#[derive(Debug)]
pub struct BaselineModel {
    num_classes: i64,
    dropout: f64,
    score_threshold: f64,
    backbone: Vec<ConvBn>,
    cls_hidden: nn::Linear,
    cls_output: nn::Linear,
    det_hidden: ConvBn,
    det_output: nn::Conv2D,
    nms: NonMaxSuppression,
}

impl BaselineModel {
    pub fn num_classes(&self) -> usize {
        self.num_classes as usize
    }

    fn features(&self, images: &Tensor, train: bool) -> Tensor {
        self.backbone
            .iter()
            .fold(images.shallow_clone(), |xs, block| block.forward_t(&xs, train))
    }

    fn classify(&self, features: &Tensor, train: bool) -> Tensor {
        features
            .adaptive_avg_pool2d(&[1, 1])
            .flatten(1, -1)
            .apply(&self.cls_hidden)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.cls_output)
    }

    fn detect(&self, features: &Tensor, train: bool) -> Tensor {
        self.det_hidden
            .forward_t(features, train)
            .apply(&self.det_output)
    }

    fn detection_losses(
        &self,
        head: &Tensor,
        targets: &[DetectionTarget],
        image_hw: [i64; 2],
    ) -> Result<DetectionLosses> {
        let (batch_size, num_channels, grid_h, grid_w) = head.size4()?;
        ensure!(
            targets.len() as i64 == batch_size,
            "expect {} detection targets, but get {}",
            batch_size,
            targets.len()
        );
        let device = head.device();
        let [image_h, image_w] = image_hw;
        let stride_y = image_h as f64 / grid_h as f64;
        let stride_x = image_w as f64 / grid_w as f64;

        // assign each box to the cell containing its center; a later box
        // replaces an earlier one in the same cell
        let mut assigned: BTreeMap<i64, CellTarget> = BTreeMap::new();
        for (batch_index, target) in targets.iter().enumerate() {
            for (xyxy, label) in izip!(target.boxes_xyxy(), target.labels_vec()) {
                ensure!(
                    (1..=self.num_classes).contains(&label),
                    "detection label {} is out of range",
                    label
                );
                let [x1, y1, x2, y2] = xyxy.map(f64::from);
                let (w, h) = (x2 - x1, y2 - y1);
                if w <= 0.0 || h <= 0.0 {
                    continue;
                }

                let cx = (x1 + x2) / 2.0;
                let cy = (y1 + y2) / 2.0;
                let col = ((cx / stride_x).floor() as i64).clamp(0, grid_w - 1);
                let row = ((cy / stride_y).floor() as i64).clamp(0, grid_h - 1);
                let cell = (batch_index as i64 * grid_h + row) * grid_w + col;

                assigned.insert(
                    cell,
                    CellTarget {
                        row,
                        col,
                        offset: [
                            (cx / stride_x - col as f64).clamp(0.0, 1.0),
                            (cy / stride_y - row as f64).clamp(0.0, 1.0),
                        ],
                        log_scale: [(w / stride_x).ln(), (h / stride_y).ln()],
                        xyxy: [x1, y1, x2, y2],
                        label,
                    },
                );
            }
        }

        let flat = head.permute(&[0, 2, 3, 1]).reshape(&[-1, num_channels]);

        let objectness = {
            let mut obj_target = vec![0f32; (batch_size * grid_h * grid_w) as usize];
            assigned
                .keys()
                .for_each(|&cell| obj_target[cell as usize] = 1.0);
            let obj_target = Tensor::of_slice(&obj_target).to_device(device);
            flat.select(1, 0).binary_cross_entropy_with_logits(
                &obj_target,
                None::<&Tensor>,
                None::<&Tensor>,
                Reduction::Mean,
            )
        };

        if assigned.is_empty() {
            let zero = || Tensor::zeros(&[], (Kind::Float, device));
            return Ok(DetectionLosses {
                objectness,
                rpn_box_reg: zero(),
                classifier: zero(),
                box_reg: zero(),
            });
        }

        let (cells, cell_targets): (Vec<i64>, Vec<CellTarget>) = assigned.into_iter().unzip();
        let to_tensor = |values: Vec<f32>, cols: i64| {
            Tensor::of_slice(&values).view([-1, cols]).to_device(device)
        };

        let positive = flat.index_select(0, &Tensor::of_slice(&cells).to_device(device));
        let pred_offset = positive.narrow(1, 1, 2).sigmoid();
        let pred_log_scale = positive.narrow(1, 3, 2);
        let class_logits = positive.narrow(1, NUM_BOX_CHANNELS, self.num_classes + 1);

        let target_offset = to_tensor(
            cell_targets
                .iter()
                .flat_map(|target| target.offset.map(|v| v as f32))
                .collect(),
            2,
        );
        let target_log_scale = to_tensor(
            cell_targets
                .iter()
                .flat_map(|target| target.log_scale.map(|v| v as f32))
                .collect(),
            2,
        );
        let target_xyxy = to_tensor(
            cell_targets
                .iter()
                .flat_map(|target| target.xyxy.map(|v| v as f32))
                .collect(),
            4,
        );
        let target_labels = Tensor::of_slice(
            &cell_targets
                .iter()
                .map(|target| target.label)
                .collect_vec(),
        )
        .to_device(device);
        let grid_xy = to_tensor(
            cell_targets
                .iter()
                .flat_map(|target| [target.col as f32, target.row as f32])
                .collect(),
            2,
        );

        let rpn_box_reg = Tensor::cat(&[&pred_offset, &pred_log_scale], 1).smooth_l1_loss(
            &Tensor::cat(&[&target_offset, &target_log_scale], 1),
            Reduction::Mean,
            1.0 / 9.0,
        );

        let classifier = class_logits.cross_entropy_for_logits(&target_labels);

        let box_reg = {
            let pred_cx = (grid_xy.select(1, 0) + pred_offset.select(1, 0)) * stride_x;
            let pred_cy = (grid_xy.select(1, 1) + pred_offset.select(1, 1)) * stride_y;
            let pred_w = pred_log_scale.select(1, 0).clamp_max(MAX_LOG_SCALE).exp() * stride_x;
            let pred_h = pred_log_scale.select(1, 1).clamp_max(MAX_LOG_SCALE).exp() * stride_y;
            let pred_x1 = &pred_cx - &pred_w / 2.0;
            let pred_x2 = &pred_cx + &pred_w / 2.0;
            let pred_y1 = &pred_cy - &pred_h / 2.0;
            let pred_y2 = &pred_cy + &pred_h / 2.0;

            let tgt_x1 = target_xyxy.select(1, 0);
            let tgt_y1 = target_xyxy.select(1, 1);
            let tgt_x2 = target_xyxy.select(1, 2);
            let tgt_y2 = target_xyxy.select(1, 3);

            let inter_w = (pred_x2.minimum(&tgt_x2) - pred_x1.maximum(&tgt_x1)).clamp_min(0.0);
            let inter_h = (pred_y2.minimum(&tgt_y2) - pred_y1.maximum(&tgt_y1)).clamp_min(0.0);
            let inter_area = inter_w * inter_h;
            let tgt_area = (&tgt_x2 - &tgt_x1) * (&tgt_y2 - &tgt_y1);
            let union_area = &pred_w * &pred_h + tgt_area - &inter_area;
            let iou = inter_area / union_area.clamp_min(1e-6);

            (-iou + 1.0).mean(Kind::Float)
        };

        Ok(DetectionLosses {
            objectness,
            rpn_box_reg,
            classifier,
            box_reg,
        })
    }

    fn predict(&self, head: &Tensor, image_hw: [i64; 2]) -> Result<Vec<DetectionPrediction>> {
        let (batch_size, num_channels, grid_h, grid_w) = head.size4()?;
        let device = head.device();
        let [image_h, image_w] = image_hw;
        let stride_y = image_h as f64 / grid_h as f64;
        let stride_x = image_w as f64 / grid_w as f64;
        let num_cells = grid_h * grid_w;
        let num_labels = self.num_classes + 1;

        let flat = head
            .permute(&[0, 2, 3, 1])
            .reshape(&[batch_size, num_cells, num_channels])
            .to_device(Device::Cpu)
            .to_kind(Kind::Float);
        let objectness = flat.select(2, 0).sigmoid();
        let offsets = flat.narrow(2, 1, 2).sigmoid();
        let log_scales = flat.narrow(2, 3, 2).clamp_max(MAX_LOG_SCALE);
        let class_probs = flat
            .narrow(2, NUM_BOX_CHANNELS, num_labels)
            .softmax(-1, Kind::Float);

        let to_vec = |tensor: &Tensor, batch_index: i64| -> Vec<f32> {
            Vec::<f32>::from(&tensor.select(0, batch_index).reshape(&[-1]))
        };

        (0..batch_size)
            .map(|batch_index| -> Result<_> {
                let objectness = to_vec(&objectness, batch_index);
                let offsets = to_vec(&offsets, batch_index);
                let log_scales = to_vec(&log_scales, batch_index);
                let class_probs = to_vec(&class_probs, batch_index);

                let mut candidates = vec![];
                for cell in 0..num_cells as usize {
                    let begin = cell * num_labels as usize;
                    let probs = &class_probs[begin..begin + num_labels as usize];
                    let (label, prob) = match probs
                        .iter()
                        .enumerate()
                        .skip(1)
                        .max_by(|(_, lhs), (_, rhs)| {
                            lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal)
                        }) {
                        Some((label, &prob)) => (label as i64, prob),
                        None => continue,
                    };
                    let score = (objectness[cell] * prob) as f64;
                    if score < self.score_threshold {
                        continue;
                    }

                    let row = (cell as i64 / grid_w) as f64;
                    let col = (cell as i64 % grid_w) as f64;
                    let cx = (col + offsets[cell * 2] as f64) * stride_x;
                    let cy = (row + offsets[cell * 2 + 1] as f64) * stride_y;
                    let w = (log_scales[cell * 2] as f64).exp() * stride_x;
                    let h = (log_scales[cell * 2 + 1] as f64).exp() * stride_y;

                    let x1 = (cx - w / 2.0).clamp(0.0, image_w as f64);
                    let x2 = (cx + w / 2.0).clamp(0.0, image_w as f64);
                    let y1 = (cy - h / 2.0).clamp(0.0, image_h as f64);
                    let y2 = (cy + h / 2.0).clamp(0.0, image_h as f64);
                    if x2 <= x1 || y2 <= y1 {
                        continue;
                    }

                    candidates.push(ScoredBox {
                        rect: TLBR::try_from_xyxy([x1, y1, x2, y2])?,
                        score,
                        label,
                    });
                }

                let kept = self.nms.forward(&candidates);
                if kept.is_empty() {
                    return Ok(DetectionPrediction::empty(device));
                }

                let boxes: Vec<f32> = kept
                    .iter()
                    .flat_map(|&index| candidates[index].rect.xyxy().map(|v| v as f32))
                    .collect();
                let scores: Vec<f32> = kept
                    .iter()
                    .map(|&index| candidates[index].score as f32)
                    .collect();
                let labels: Vec<i64> = kept
                    .iter()
                    .map(|&index| candidates[index].label)
                    .collect();

                Ok(DetectionPrediction {
                    boxes: Tensor::of_slice(&boxes).view([-1, 4]).to_device(device),
                    scores: Tensor::of_slice(&scores).to_device(device),
                    labels: Tensor::of_slice(&labels).to_device(device),
                })
            })
            .try_collect()
    }
}

impl MultiTaskModel for BaselineModel {
    fn forward_t(
        &mut self,
        images: &Tensor,
        targets: Option<&[DetectionTarget]>,
        mode: TaskMode,
        train: bool,
    ) -> Result<ModelOutput> {
        let (_batch_size, _channels, image_h, image_w) = images.size4()?;
        ensure!(
            images.kind() == Kind::Float,
            "expect float images, but get {:?}",
            images.kind()
        );

        let features = self.features(images, train);
        let classification = mode
            .has_classification()
            .then(|| self.classify(&features, train));
        let detection = if mode.has_detection() {
            let head = self.detect(&features, train);
            let output = match (train, targets) {
                (true, Some(targets)) => DetectionOutput::Losses(self.detection_losses(
                    &head,
                    targets,
                    [image_h, image_w],
                )?),
                _ => DetectionOutput::Predictions(tch::no_grad(|| {
                    self.predict(&head, [image_h, image_w])
                })?),
            };
            Some(output)
        } else {
            None
        };

        Ok(ModelOutput {
            classification,
            detection,
        })
    }
}

#[derive(Debug, Clone)]
struct CellTarget {
    row: i64,
    col: i64,
    offset: [f64; 2],
    log_scale: [f64; 2],
    xyxy: [f64; 4],
    label: i64,
}

#[derive(Debug, Clone)]
struct ConvBnInit {
    in_c: usize,
    out_c: usize,
    k: usize,
    s: usize,
}

impl ConvBnInit {
    fn build<'p, P>(self, path: P) -> ConvBn
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_c, out_c, k, s } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c as i64,
            k as i64,
            nn::ConvConfig {
                stride: s as i64,
                padding: k as i64 / 2,
                bias: false,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(path / "bn", out_c as i64, Default::default());

        ConvBn { conv, bn }
    }
}

/// Convolution, batch normalization and leaky ReLU.
#[derive(Debug)]
struct ConvBn {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBn {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        input
            .apply(&self.conv)
            .apply_t(&self.bn, train)
            .leaky_relu()
    }
}
