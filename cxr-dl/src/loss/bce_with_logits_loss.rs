use crate::common::*;

/// Builds a [BceWithLogitsLoss].
#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    /// Per-class rescaling weight with shape `[num_classes]`.
    pub weight: Option<Tensor>,
    /// Weight of positive examples per class with shape `[num_classes]`.
    pub pos_weight: Option<Tensor>,
    pub reduction: Reduction,
}

impl Default for BceWithLogitsLossInit {
    fn default() -> Self {
        Self {
            weight: None,
            pos_weight: None,
            reduction: Reduction::Mean,
        }
    }
}

impl BceWithLogitsLossInit {
    pub fn build(self) -> Result<BceWithLogitsLoss> {
        let Self {
            weight,
            pos_weight,
            reduction,
        } = self;

        if let Some(pos_weight) = &pos_weight {
            ensure!(
                pos_weight.dim() == 1,
                "pos_weight must be a 1D tensor, but get shape {:?}",
                pos_weight.size()
            );
        }
        if let Some(weight) = &weight {
            ensure!(
                weight.dim() == 1,
                "weight must be a 1D tensor, but get shape {:?}",
                weight.size()
            );
        }

        Ok(BceWithLogitsLoss {
            weight,
            pos_weight,
            reduction,
        })
    }
}

/// Binary cross entropy on logits for multi-label classification.
#[derive(Debug)]
pub struct BceWithLogitsLoss {
    weight: Option<Tensor>,
    pos_weight: Option<Tensor>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    /// Computes the loss of `[batch_size, num_classes]` logits against
    /// targets of the same shape with values in `[0, 1]`.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target tensors must have equal shape, but get {:?} and {:?}",
            input.size(),
            target.size()
        );
        debug_assert!(
            target.numel() == 0 || bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        // the mean of nothing is taken as zero
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())));
        }

        let device = input.device();
        let weight = self.weight.as_ref().map(|weight| weight.to_device(device));
        let pos_weight = self
            .pos_weight
            .as_ref()
            .map(|weight| weight.to_device(device));

        Ok(input.binary_cross_entropy_with_logits(
            &target.to_kind(input.kind()),
            weight.as_ref(),
            pos_weight.as_ref(),
            self.reduction,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_logits_give_ln2() -> Result<()> {
        let loss_fn = BceWithLogitsLossInit::default().build()?;
        let input = Tensor::zeros(&[4, 14], FLOAT_CPU);
        let target = Tensor::ones(&[4, 14], FLOAT_CPU);
        let loss = f64::from(&loss_fn.forward(&input, &target)?);
        assert_abs_diff_eq!(loss, 2f64.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn confident_correct_logits_give_small_loss() -> Result<()> {
        let loss_fn = BceWithLogitsLossInit::default().build()?;
        let input = Tensor::of_slice(&[20f32, -20.0, -20.0, 20.0]).view([2, 2]);
        let target = Tensor::of_slice(&[1f32, 0.0, 0.0, 1.0]).view([2, 2]);
        let loss = f64::from(&loss_fn.forward(&input, &target)?);
        assert!(loss < 1e-6);
        Ok(())
    }

    #[test]
    fn empty_input_gives_zero() -> Result<()> {
        let loss_fn = BceWithLogitsLossInit::default().build()?;
        let input = Tensor::zeros(&[0, 14], FLOAT_CPU);
        let loss = loss_fn.forward(&input, &input)?;
        assert_eq!(f64::from(&loss), 0.0);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_an_error() -> Result<()> {
        let loss_fn = BceWithLogitsLossInit::default().build()?;
        let input = Tensor::zeros(&[2, 14], FLOAT_CPU);
        let target = Tensor::zeros(&[2, 13], FLOAT_CPU);
        assert!(loss_fn.forward(&input, &target).is_err());
        Ok(())
    }
}
