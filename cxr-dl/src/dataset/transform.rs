//! Transforms applied jointly to an image and its boxes.

use crate::common::*;

/// An image with its boxes, passed through a [JointTransform].
///
/// The image is a `[C, H, W]` tensor, either `Uint8` straight from the
/// decoder or `Float` after normalization. Boxes are in pixel units of the
/// image and aligned with `classes`.
#[derive(Debug)]
pub struct TransformSample {
    pub image: Tensor,
    pub boxes: Vec<TLBR<f64>>,
    pub classes: Vec<usize>,
}

impl TransformSample {
    /// Image size in `(height, width)`.
    pub fn image_hw(&self) -> Result<(i64, i64)> {
        image_hw(&self.image)
    }

    /// Clips boxes to the image extent and removes the ones with zero
    /// height or width, together with their labels.
    pub fn retain_valid_boxes(&mut self) -> Result<()> {
        let (height, width) = self.image_hw()?;
        let extent = TLBR::from_tlbr([0.0, 0.0, height as f64, width as f64]);

        let (boxes, classes) = self
            .boxes
            .iter()
            .zip(&self.classes)
            .filter_map(|(rect, &class)| {
                let clipped = rect.intersect_with(&extent)?;
                (clipped.h() > 0.0 && clipped.w() > 0.0).then(|| (clipped, class))
            })
            .unzip();
        self.boxes = boxes;
        self.classes = classes;
        Ok(())
    }
}

pub(crate) fn image_hw(image: &Tensor) -> Result<(i64, i64)> {
    match *image.size().as_slice() {
        [_c, h, w] => Ok((h, w)),
        _ => bail!(
            "expect a [channels, height, width] image, but get shape {:?}",
            image.size()
        ),
    }
}

/// Augmentation or preprocessing step that keeps an image and its boxes
/// consistent.
pub trait JointTransform
where
    Self: Debug + Send + Sync,
{
    fn apply(&self, sample: TransformSample) -> Result<TransformSample>;
}

/// Stretches the image to a fixed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resize {
    pub height: i64,
    pub width: i64,
}

impl JointTransform for Resize {
    fn apply(&self, sample: TransformSample) -> Result<TransformSample> {
        let Self { height, width } = *self;
        ensure!(
            height > 0 && width > 0,
            "resize target must be positive, but get {}x{}",
            height,
            width
        );
        let TransformSample {
            image,
            boxes,
            classes,
        } = sample;
        let (orig_h, orig_w) = image_hw(&image)?;
        if (orig_h, orig_w) == (height, width) {
            return Ok(TransformSample {
                image,
                boxes,
                classes,
            });
        }

        let image = tch::no_grad(|| -> Result<_> {
            let resized = match image.kind() {
                Kind::Uint8 => vision::image::resize(&image, width, height)?,
                Kind::Float => image
                    .unsqueeze(0)
                    .upsample_bilinear2d(&[height, width], false, None, None)
                    .squeeze_dim(0),
                kind => bail!("unsupported image kind {:?}", kind),
            };
            Ok(resized)
        })?;

        let transform = Transform::from_sizes_exact(
            &HW::from_hw([orig_h as f64, orig_w as f64]),
            &HW::from_hw([height as f64, width as f64]),
        );
        let boxes = boxes.iter().map(|rect| &transform * rect).collect();

        Ok(TransformSample {
            image,
            boxes,
            classes,
        })
    }
}

/// Mirrors the image horizontally with probability `prob`.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizontalFlip {
    prob: f64,
}

impl HorizontalFlip {
    pub fn new(prob: f64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&prob),
            "flip probability must be in range [0, 1], but get {}",
            prob
        );
        Ok(Self { prob })
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }
}

impl JointTransform for HorizontalFlip {
    fn apply(&self, sample: TransformSample) -> Result<TransformSample> {
        if !rand::thread_rng().gen_bool(self.prob) {
            return Ok(sample);
        }

        let TransformSample {
            image,
            boxes,
            classes,
        } = sample;
        let (_h, width) = image_hw(&image)?;
        let image = image.flip(&[2]);
        let transform = Transform::horizontal_flip(width as f64);
        let boxes = boxes.iter().map(|rect| &transform * rect).collect();

        Ok(TransformSample {
            image,
            boxes,
            classes,
        })
    }
}

/// Converts the image to float in `[0, 1]` and standardizes each channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Normalize {
    /// ImageNet channel statistics.
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }
}

impl JointTransform for Normalize {
    fn apply(&self, sample: TransformSample) -> Result<TransformSample> {
        let Self { mean, std } = self;
        let num_channels = sample.image.size()[0];
        ensure!(
            mean.len() as i64 == num_channels && std.len() as i64 == num_channels,
            "expect {} channel statistics, but get {} means and {} stds",
            num_channels,
            mean.len(),
            std.len()
        );
        ensure!(
            std.iter().all(|&value| value > 0.0),
            "standard deviations must be positive"
        );

        let image = to_unit_float(&sample.image)?;
        let device = sample.image.device();
        let to_tensor = |values: &[f64]| {
            let values = values.iter().map(|&v| v as f32).collect_vec();
            Tensor::of_slice(&values).view([-1, 1, 1]).to_device(device)
        };
        let image = (image - to_tensor(mean.as_slice())) / to_tensor(std.as_slice());

        Ok(TransformSample { image, ..sample })
    }
}

/// Runs transforms in order.
#[derive(Debug, Default)]
pub struct Compose {
    transforms: Vec<Box<dyn JointTransform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn JointTransform>>) -> Self {
        Self { transforms }
    }

    pub fn push<T>(&mut self, transform: T)
    where
        T: 'static + JointTransform,
    {
        self.transforms.push(Box::new(transform));
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl JointTransform for Compose {
    fn apply(&self, sample: TransformSample) -> Result<TransformSample> {
        self.transforms
            .iter()
            .try_fold(sample, |sample, transform| transform.apply(sample))
    }
}

/// Converts a decoded image to float in `[0, 1]`. Float images pass through.
pub fn to_unit_float(image: &Tensor) -> Result<Tensor> {
    let output = match image.kind() {
        Kind::Uint8 => image.to_kind(Kind::Float) / 255.0,
        Kind::Float => image.shallow_clone(),
        kind => bail!("unsupported image kind {:?}", kind),
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(height: i64, width: i64, boxes: Vec<[f64; 4]>) -> TransformSample {
        let classes = (0..boxes.len()).collect();
        TransformSample {
            image: Tensor::zeros(&[3, height, width], (Kind::Uint8, Device::Cpu)),
            boxes: boxes.into_iter().map(TLBR::from_tlbr).collect(),
            classes,
        }
    }

    #[test]
    fn resize_scales_boxes() -> Result<()> {
        let input = sample(100, 200, vec![[10.0, 20.0, 50.0, 100.0]]);
        let output = Resize {
            height: 50,
            width: 50,
        }
        .apply(input)?;

        assert_eq!(output.image.size(), vec![3, 50, 50]);
        assert_eq!(output.image.kind(), Kind::Uint8);
        assert_eq!(output.boxes[0].tlbr(), [5.0, 5.0, 25.0, 25.0]);
        Ok(())
    }

    #[test]
    fn resize_float_image() -> Result<()> {
        let input = TransformSample {
            image: Tensor::ones(&[3, 8, 8], FLOAT_CPU),
            boxes: vec![],
            classes: vec![],
        };
        let output = Resize {
            height: 4,
            width: 6,
        }
        .apply(input)?;
        assert_eq!(output.image.size(), vec![3, 4, 6]);
        assert_abs_diff_eq!(
            f64::from(&output.image.mean(Kind::Float)),
            1.0,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn flip_mirrors_pixels_and_boxes() -> Result<()> {
        let input = sample(4, 10, vec![[0.0, 1.0, 2.0, 3.0]]);
        let _ = input.image.i((.., .., 0)).fill_(255);

        let output = HorizontalFlip::new(1.0)?.apply(input)?;
        assert_eq!(output.boxes[0].xyxy(), [7.0, 0.0, 9.0, 2.0]);
        assert_eq!(output.image.int64_value(&[0, 0, 9]), 255);
        assert_eq!(output.image.int64_value(&[0, 0, 0]), 0);
        Ok(())
    }

    #[test]
    fn flip_with_zero_prob_is_identity() -> Result<()> {
        let input = sample(4, 10, vec![[0.0, 1.0, 2.0, 3.0]]);
        let output = HorizontalFlip::new(0.0)?.apply(input)?;
        assert_eq!(output.boxes[0].tlbr(), [0.0, 1.0, 2.0, 3.0]);
        assert!(HorizontalFlip::new(1.5).is_err());
        Ok(())
    }

    #[test]
    fn normalize_standardizes_channels() -> Result<()> {
        let input = TransformSample {
            image: Tensor::full(&[3, 2, 2], 255, (Kind::Uint8, Device::Cpu)),
            boxes: vec![],
            classes: vec![],
        };
        let output = Normalize {
            mean: vec![0.5, 0.0, 1.0],
            std: vec![0.5, 1.0, 2.0],
        }
        .apply(input)?;

        assert_eq!(output.image.kind(), Kind::Float);
        let values = Vec::<f32>::from(&output.image.mean_dim(&[1, 2], false, Kind::Float));
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[2], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn compose_runs_in_order() -> Result<()> {
        let mut compose = Compose::default();
        compose.push(Resize {
            height: 20,
            width: 20,
        });
        compose.push(HorizontalFlip::new(1.0)?);
        let output = compose.apply(sample(10, 10, vec![[0.0, 0.0, 5.0, 5.0]]))?;

        assert_eq!(output.image.size(), vec![3, 20, 20]);
        assert_eq!(output.boxes[0].xyxy(), [10.0, 0.0, 20.0, 10.0]);
        Ok(())
    }

    #[test]
    fn degenerate_and_outside_boxes_are_removed() -> Result<()> {
        let mut input = sample(
            10,
            10,
            vec![
                [0.0, 0.0, 0.0, 5.0],
                [2.0, 2.0, 12.0, 8.0],
                [20.0, 20.0, 30.0, 30.0],
            ],
        );
        input.retain_valid_boxes()?;
        assert_eq!(input.classes, vec![1]);
        assert_eq!(input.boxes[0].tlbr(), [2.0, 2.0, 10.0, 8.0]);
        Ok(())
    }
}
