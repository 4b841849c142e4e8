//! Random access to chest X-ray samples with their targets.

use super::{
    classification_target, detection_target, source_boxes, to_unit_float, AnnotationRow,
    AnnotationTable, BoundingBoxTable, DetectionTarget, ImageIndex, JointTransform,
    TransformSample,
};
use crate::{common::*, model::TaskMode};

/// One image with the targets selected by the task mode.
#[derive(Debug, TensorLike)]
pub struct Sample {
    /// Float image with shape `[C, H, W]`.
    pub image: Tensor,
    /// Multi-hot target with shape `[NUM_CLASSES]`.
    pub classification: Option<Tensor>,
    pub detection: Option<DetectionTarget>,
    #[tensor_like(clone)]
    pub image_name: String,
}

#[derive(Debug)]
pub struct ChestXrayDatasetInit {
    /// The dataset root, scanned for `**/images/*.png`.
    pub image_dir: PathBuf,
    pub annotations: AnnotationTable,
    pub bboxes: Option<BoundingBoxTable>,
    pub transform: Option<Box<dyn JointTransform>>,
    pub mode: TaskMode,
}

impl ChestXrayDatasetInit {
    pub fn build(self) -> Result<ChestXrayDataset> {
        let Self {
            image_dir,
            annotations,
            bboxes,
            transform,
            mode,
        } = self;

        let index = ImageIndex::scan(&image_dir)?;
        info!(
            "found {} images under '{}'",
            index.len(),
            image_dir.display()
        );

        let (rows, dropped_rows) = index.filter_rows(annotations.rows);
        if dropped_rows > 0 {
            warn!(
                "dropped {} annotation rows whose image is missing under '{}'",
                dropped_rows,
                image_dir.display()
            );
        }

        Ok(ChestXrayDataset {
            index,
            rows,
            bboxes: bboxes.unwrap_or_default(),
            transform,
            mode,
            dropped_rows,
        })
    }
}

/// A chest X-ray dataset over the annotation rows whose image exists.
///
/// Samples are decoded on every [get](ChestXrayDataset::get) call and no
/// state is shared between calls, so the dataset can be read from several
/// threads at once.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ChestXrayDataset {
    index: ImageIndex,
    #[derivative(Debug = "ignore")]
    rows: Vec<AnnotationRow>,
    #[derivative(Debug = "ignore")]
    bboxes: BoundingBoxTable,
    transform: Option<Box<dyn JointTransform>>,
    mode: TaskMode,
    dropped_rows: usize,
}

impl ChestXrayDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Number of annotation rows dropped because their image was not found.
    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    pub fn image_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(|row| row.image_index.as_str())
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        let row = self.rows.get(index).ok_or_else(|| {
            format_err!(
                "sample index {} out of range for a dataset of {} samples",
                index,
                self.len()
            )
        })?;
        let AnnotationRow {
            image_index: image_name,
            finding_labels,
        } = row;

        let path = self
            .index
            .resolve(image_name)
            .ok_or_else(|| format_err!("image '{}' is not indexed", image_name))?;
        let image = load_rgb_image(path)?;

        let cls_target = classification_target(finding_labels);
        let source = match self.bboxes.get(image_name) {
            Some(annotations) => source_boxes(annotations)
                .with_context(|| format!("invalid boxes of image '{}'", image_name))?,
            None => Default::default(),
        };

        let TransformSample {
            image,
            boxes,
            classes,
        } = match &self.transform {
            Some(transform) => {
                let mut sample = transform.apply(TransformSample {
                    image,
                    boxes: source.boxes,
                    classes: source.classes,
                })?;
                sample.retain_valid_boxes()?;
                sample.image = to_unit_float(&sample.image)?;
                sample
            }
            None => TransformSample {
                image: to_unit_float(&image)?,
                boxes: source.boxes,
                classes: source.classes,
            },
        };

        let det_target = detection_target(index as i64, &boxes, &classes)?;

        Ok(Sample {
            image,
            classification: self.mode.has_classification().then(|| cls_target),
            detection: self.mode.has_detection().then(|| det_target),
            image_name: image_name.clone(),
        })
    }
}

/// Decodes an image file into a `Uint8` tensor with shape `[3, H, W]`.
pub fn load_rgb_image(path: &Path) -> Result<Tensor> {
    let image = vision::image::load(path)
        .with_context(|| format!("failed to decode image '{}'", path.display()))?;
    let (channels, _height, _width) = image.size3()?;

    let image = match channels {
        3 => image,
        1 => image.repeat(&[3, 1, 1]),
        4 => image.narrow(0, 0, 3),
        _ => bail!(
            "unsupported number of channels {} in image '{}'",
            channels,
            path.display()
        ),
    };
    Ok(image)
}
