//! A load-once inference handle for single images.

use crate::{
    common::*,
    dataset::{
        load_rgb_image, to_unit_float, Compose, JointTransform, Normalize, Resize, TransformSample,
    },
    model::{BaselineModel, BaselineModelInit, MultiTaskModel, TaskMode},
    vocabulary::{from_detection_label, ClassVocabulary, NUM_CLASSES},
};

#[derive(Debug)]
pub struct PredictorInit {
    pub model: BaselineModelInit,
    /// Parameter file saved from a [nn::VarStore].
    pub checkpoint: PathBuf,
    pub device: Device,
    /// Input size in `(height, width)`. Images are fed at their own size
    /// if unset.
    pub image_size: Option<(i64, i64)>,
    pub normalize: Option<Normalize>,
}

impl PredictorInit {
    pub fn build(self) -> Result<Predictor> {
        let Self {
            model,
            checkpoint,
            device,
            image_size,
            normalize,
        } = self;

        let mut vs = nn::VarStore::new(device);
        let model = model.build(&vs.root())?;
        ensure!(
            model.num_classes() == NUM_CLASSES,
            "the model predicts {} classes, but the vocabulary has {}",
            model.num_classes(),
            NUM_CLASSES
        );
        vs.load(&checkpoint)
            .with_context(|| format!("failed to load checkpoint '{}'", checkpoint.display()))?;
        vs.freeze();
        info!("loaded model parameters from '{}'", checkpoint.display());

        let mut transform = Compose::default();
        if let Some((height, width)) = image_size {
            transform.push(Resize { height, width });
        }
        if let Some(normalize) = normalize {
            transform.push(normalize);
        }

        Ok(Predictor {
            vs,
            model,
            transform,
        })
    }
}

/// One detected box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_index: usize,
    pub class_name: String,
    pub score: f64,
    /// Corners in `[x1, y1, x2, y2]` pixel units of the model input.
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Class probabilities in vocabulary order.
    pub probabilities: Vec<f64>,
    pub detections: Vec<Detection>,
}

impl Prediction {
    /// Probabilities keyed by class name.
    pub fn named_probabilities(&self) -> Vec<(&'static str, f64)> {
        ClassVocabulary::get()
            .names()
            .zip(self.probabilities.iter().copied())
            .collect()
    }

    /// Probability of a class. An out-of-range index falls back to class 0.
    pub fn probability_of(&self, class_index: i64) -> f64 {
        let index = Predictor::class_index_or_default(class_index);
        self.probabilities.get(index).copied().unwrap_or(f64::NAN)
    }
}

/// A model loaded once and shared by the callers that run predictions.
#[derive(Debug)]
pub struct Predictor {
    vs: nn::VarStore,
    model: BaselineModel,
    transform: Compose,
}

impl Predictor {
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Clamps a requested class index into the vocabulary. Out-of-range
    /// indexes map to 0 with a warning.
    pub fn class_index_or_default(class_index: i64) -> usize {
        if (0..NUM_CLASSES as i64).contains(&class_index) {
            class_index as usize
        } else {
            warn!(
                "invalid class index {}, use class 0 instead",
                class_index
            );
            0
        }
    }

    pub fn predict_file(&mut self, path: impl AsRef<Path>) -> Result<Prediction> {
        let path = path.as_ref();
        let image = load_rgb_image(path)?;
        self.predict(&image)
            .with_context(|| format!("prediction failed on '{}'", path.display()))
    }

    /// Predicts a decoded `Uint8` image with shape `[3, H, W]`.
    pub fn predict(&mut self, image: &Tensor) -> Result<Prediction> {
        let TransformSample { image, .. } = self.transform.apply(TransformSample {
            image: image.shallow_clone(),
            boxes: vec![],
            classes: vec![],
        })?;
        let image = to_unit_float(&image)?;
        let images = image.unsqueeze(0).to_device(self.device());

        let output = tch::no_grad(|| self.model.forward_t(&images, None, TaskMode::Both, false))?;

        let probabilities = Vec::<f64>::from(
            &output
                .classification_logits()?
                .sigmoid()
                .to_device(Device::Cpu)
                .to_kind(Kind::Double)
                .view([-1]),
        );

        let vocab = ClassVocabulary::get();
        let detections = match output.detection_predictions()? {
            [prediction] => {
                let boxes = Vec::<f64>::from(
                    &prediction
                        .boxes
                        .to_device(Device::Cpu)
                        .to_kind(Kind::Double)
                        .view([-1]),
                );
                let scores = Vec::<f64>::from(
                    &prediction.scores.to_device(Device::Cpu).to_kind(Kind::Double),
                );
                let labels = Vec::<i64>::from(&prediction.labels.to_device(Device::Cpu));

                izip!(boxes.chunks_exact(4), scores, labels)
                    .filter_map(|(xyxy, score, label)| {
                        let class_index = from_detection_label(label)?;
                        Some(Detection {
                            class_index,
                            class_name: vocab.name_of(class_index)?.to_owned(),
                            score,
                            bbox: [xyxy[0], xyxy[1], xyxy[2], xyxy[3]],
                        })
                    })
                    .collect()
            }
            predictions => bail!(
                "expect detections of 1 image, but get {}",
                predictions.len()
            ),
        };

        Ok(Prediction {
            probabilities,
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_index_is_clamped() {
        assert_eq!(Predictor::class_index_or_default(4), 4);
        assert_eq!(Predictor::class_index_or_default(13), 13);
        assert_eq!(Predictor::class_index_or_default(14), 0);
        assert_eq!(Predictor::class_index_or_default(-1), 0);
    }

    #[test]
    fn predictor_loads_saved_parameters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoint = dir.path().join("model.ckpt");
        let model_init = BaselineModelInit {
            channels: vec![8, 16],
            hidden_dim: 16,
            ..Default::default()
        };

        let vs = nn::VarStore::new(Device::Cpu);
        let _model = model_init.clone().build(&vs.root())?;
        vs.save(&checkpoint)?;

        let mut predictor = PredictorInit {
            model: model_init,
            checkpoint,
            device: Device::Cpu,
            image_size: Some((32, 32)),
            normalize: Some(Normalize::imagenet()),
        }
        .build()?;

        let image = Tensor::full(&[3, 40, 48], 128i64, (Kind::Uint8, Device::Cpu));
        let prediction = predictor.predict(&image)?;
        assert_eq!(prediction.probabilities.len(), NUM_CLASSES);
        assert!(prediction
            .probabilities
            .iter()
            .all(|&prob| (0.0..=1.0).contains(&prob)));
        assert!(prediction
            .detections
            .iter()
            .all(|det| det.class_index < NUM_CLASSES));
        assert_eq!(prediction.named_probabilities()[1].0, "Cardiomegaly");
        assert_abs_diff_eq!(prediction.probability_of(99), prediction.probabilities[0]);
        Ok(())
    }

    #[test]
    fn model_with_other_class_count_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoint = dir.path().join("model.ckpt");
        let model_init = BaselineModelInit {
            num_classes: 5,
            channels: vec![8],
            hidden_dim: 8,
            ..Default::default()
        };

        let vs = nn::VarStore::new(Device::Cpu);
        let _model = model_init.clone().build(&vs.root())?;
        vs.save(&checkpoint)?;

        let result = PredictorInit {
            model: model_init,
            checkpoint,
            device: Device::Cpu,
            image_size: None,
            normalize: None,
        }
        .build();
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn probability_of_short_vector_does_not_panic() {
        let prediction = Prediction {
            probabilities: vec![0.25, 0.5],
            detections: vec![],
        };
        assert_eq!(prediction.probability_of(1), 0.5);
        assert!(prediction.probability_of(10).is_nan());
        assert_eq!(prediction.probability_of(-3), 0.25);
    }
}
