//! Classification and detection target construction.

use super::BoxAnnotation;
use crate::{
    common::*,
    vocabulary::{to_detection_label, ClassVocabulary, NUM_CLASSES},
};

/// Parses a pipe-delimited label string into class indexes, in string
/// order. Unknown names such as `No Finding` are skipped.
pub fn parse_finding_labels(finding_labels: &str) -> Vec<usize> {
    let vocab = ClassVocabulary::get();
    finding_labels
        .split('|')
        .filter_map(|name| vocab.index_of(name.trim()))
        .collect()
}

/// Builds the multi-hot classification vector of a label string.
pub fn classification_vector(finding_labels: &str) -> [f32; NUM_CLASSES] {
    let mut vector = [0f32; NUM_CLASSES];
    parse_finding_labels(finding_labels)
        .into_iter()
        .for_each(|index| vector[index] = 1.0);
    vector
}

/// Builds the classification target tensor with shape `[NUM_CLASSES]`.
pub fn classification_target(finding_labels: &str) -> Tensor {
    Tensor::of_slice(&classification_vector(finding_labels))
}

/// Boxes in pixel units with their class indexes, before any transform.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceBoxes {
    pub boxes: Vec<TLBR<f64>>,
    /// 0-based class indexes aligned with `boxes`.
    pub classes: Vec<usize>,
}

impl SourceBoxes {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Converts `[x, y, w, h]` annotations into corner boxes. Annotations with an
/// unknown label are dropped.
pub fn source_boxes(annotations: &[BoxAnnotation]) -> Result<SourceBoxes> {
    let vocab = ClassVocabulary::get();
    let mut output = SourceBoxes::default();

    for annotation in annotations {
        let index = match vocab.index_of(&annotation.label) {
            Some(index) => index,
            None => continue,
        };
        let rect = TLBR::try_from_xywh(annotation.bbox).with_context(|| {
            format!(
                "invalid box {:?} for label '{}'",
                annotation.bbox, annotation.label
            )
        })?;
        output.boxes.push(rect);
        output.classes.push(index);
    }

    Ok(output)
}

/// Detection target of one image.
///
/// Box coordinates are `[x1, y1, x2, y2]` in the pixel scale of the final
/// image. Images without boxes carry zero-length tensors.
#[derive(Debug, TensorLike, Getters, CopyGetters)]
pub struct DetectionTarget {
    /// Boxes with shape `[N, 4]`.
    #[getset(get = "pub")]
    boxes: Tensor,
    /// 1-based detection labels with shape `[N]`.
    #[getset(get = "pub")]
    labels: Tensor,
    /// Box areas with shape `[N]`.
    #[getset(get = "pub")]
    area: Tensor,
    /// Crowd flags with shape `[N]`, always zero.
    #[getset(get = "pub")]
    iscrowd: Tensor,
    #[tensor_like(clone)]
    #[getset(get_copy = "pub")]
    image_id: i64,
    #[tensor_like(clone)]
    #[getset(get_copy = "pub")]
    has_bbox: bool,
}

impl Clone for DetectionTarget {
    fn clone(&self) -> Self {
        self.shallow_clone()
    }
}

impl DetectionTarget {
    /// The target of an image without boxes.
    pub fn empty(image_id: i64) -> Self {
        Self {
            boxes: Tensor::zeros(&[0, 4], FLOAT_CPU),
            labels: Tensor::zeros(&[0], INT64_CPU),
            area: Tensor::zeros(&[0], FLOAT_CPU),
            iscrowd: Tensor::zeros(&[0], INT64_CPU),
            image_id,
            has_bbox: false,
        }
    }

    /// Number of boxes.
    pub fn num_boxes(&self) -> i64 {
        self.boxes.size()[0]
    }

    /// Boxes as `[x1, y1, x2, y2]` rows, copied to host memory.
    pub fn boxes_xyxy(&self) -> Vec<[f32; 4]> {
        let flat = Vec::<f32>::from(&self.boxes.to_device(Device::Cpu).reshape(&[-1]));
        flat.chunks_exact(4)
            .map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
            .collect()
    }

    pub fn labels_vec(&self) -> Vec<i64> {
        Vec::<i64>::from(&self.labels.to_device(Device::Cpu))
    }
}

/// Builds the detection target from final boxes and 0-based class indexes.
///
/// Areas are computed from the given boxes, so they reflect any transform
/// applied beforehand. Labels are shifted by one to leave 0 for background.
pub fn detection_target(
    image_id: i64,
    boxes: &[TLBR<f64>],
    classes: &[usize],
) -> Result<DetectionTarget> {
    ensure!(
        boxes.len() == classes.len(),
        "the number of boxes ({}) and labels ({}) differ",
        boxes.len(),
        classes.len()
    );
    if boxes.is_empty() {
        return Ok(DetectionTarget::empty(image_id));
    }
    ensure!(
        classes.iter().all(|&index| index < NUM_CLASSES),
        "class index out of range in {:?}",
        classes
    );

    let num_boxes = boxes.len() as i64;
    let (coords, areas): (Vec<[f32; 4]>, Vec<f32>) = boxes
        .iter()
        .map(|rect| {
            let [x1, y1, x2, y2] = rect.xyxy();
            let coords = [x1 as f32, y1 as f32, x2 as f32, y2 as f32];
            let area = ((x2 - x1) * (y2 - y1)) as f32;
            (coords, area)
        })
        .unzip();
    let flat: Vec<f32> = coords.iter().flatten().copied().collect();
    let labels: Vec<i64> = classes
        .iter()
        .map(|&index| to_detection_label(index))
        .collect();

    Ok(DetectionTarget {
        boxes: Tensor::of_slice(&flat).view([num_boxes, 4]),
        labels: Tensor::of_slice(&labels),
        area: Tensor::of_slice(&areas),
        iscrowd: Tensor::zeros(&[num_boxes], INT64_CPU),
        image_id,
        has_bbox: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_hot_from_label_string() {
        let vector = classification_vector("Cardiomegaly|Effusion");
        let set = vector
            .iter()
            .enumerate()
            .filter(|(_, &value)| value == 1.0)
            .map(|(index, _)| index)
            .collect_vec();
        assert_eq!(set, vec![1, 4]);
        assert_eq!(vector.iter().sum::<f32>(), 2.0);
    }

    #[test]
    fn no_finding_is_all_zeros() {
        assert_eq!(classification_vector("No Finding"), [0.0; NUM_CLASSES]);
        assert_eq!(classification_vector(""), [0.0; NUM_CLASSES]);
    }

    #[test]
    fn unknown_box_labels_are_dropped() -> Result<()> {
        let annotations = vec![
            BoxAnnotation {
                label: "Infiltrate".into(),
                bbox: [1.0, 2.0, 3.0, 4.0],
            },
            BoxAnnotation {
                label: "Mass".into(),
                bbox: [10.0, 20.0, 30.0, 40.0],
            },
        ];
        let source = source_boxes(&annotations)?;
        assert_eq!(source.classes, vec![9]);
        assert_eq!(source.boxes[0].xyxy(), [10.0, 20.0, 40.0, 60.0]);
        Ok(())
    }

    #[test]
    fn empty_target_has_zero_length_tensors() {
        let target = DetectionTarget::empty(3);
        assert!(!target.has_bbox());
        assert_eq!(target.boxes().size(), vec![0, 4]);
        assert_eq!(target.labels().size(), vec![0]);
        assert_eq!(target.area().size(), vec![0]);
        assert_eq!(target.iscrowd().size(), vec![0]);
        assert_eq!(target.image_id(), 3);
    }

    #[test]
    fn detection_target_shifts_labels_and_computes_area() -> Result<()> {
        let boxes = vec![
            TLBR::try_from_xywh([10.0, 20.0, 30.0, 40.0])?,
            TLBR::try_from_xywh([0.0, 0.0, 5.0, 5.0])?,
        ];
        let target = detection_target(7, &boxes, &[0, 13])?;
        assert!(target.has_bbox());
        assert_eq!(target.labels_vec(), vec![1, 14]);
        assert_eq!(
            target.boxes_xyxy(),
            vec![[10.0, 20.0, 40.0, 60.0], [0.0, 0.0, 5.0, 5.0]]
        );
        assert_eq!(Vec::<f32>::from(target.area()), vec![1200.0, 25.0]);
        assert_eq!(Vec::<i64>::from(target.iscrowd()), vec![0, 0]);
        Ok(())
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let boxes = vec![TLBR::from_tlbr([0.0, 0.0, 1.0, 1.0])];
        assert!(detection_target(0, &boxes, &[]).is_err());
        assert!(detection_target(0, &boxes, &[NUM_CLASSES]).is_err());
    }
}
