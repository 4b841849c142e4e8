use crate::{common::*, config::LearningRateSchedule};

/// Relative improvement a validation loss must make to count as better.
const PLATEAU_THRESHOLD: f64 = 1e-4;
const MIN_LR_CHANGE: f64 = 1e-8;

/// Per-epoch learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    lr: f64,
    kind: SchedulerKind,
}

#[derive(Debug, Clone)]
enum SchedulerKind {
    Constant,
    ReduceOnPlateau {
        factor: f64,
        patience: usize,
        min_lr: f64,
        best: f64,
        num_bad_epochs: usize,
    },
}

impl LrScheduler {
    pub fn new(schedule: &LearningRateSchedule) -> Result<Self> {
        let scheduler = match *schedule {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr > 0.0, "learning rate must be positive");
                Self {
                    lr: lr.raw(),
                    kind: SchedulerKind::Constant,
                }
            }
            LearningRateSchedule::ReduceOnPlateau {
                lr,
                factor,
                patience,
                min_lr,
            } => {
                ensure!(lr > 0.0, "learning rate must be positive");
                ensure!(
                    factor > 0.0 && factor < 1.0,
                    "factor must be in range (0, 1), but get {}",
                    factor
                );
                ensure!(
                    min_lr >= 0.0 && min_lr <= lr,
                    "min_lr must be in range [0, lr], but get {}",
                    min_lr
                );
                Self {
                    lr: lr.raw(),
                    kind: SchedulerKind::ReduceOnPlateau {
                        factor: factor.raw(),
                        patience,
                        min_lr: min_lr.raw(),
                        best: f64::INFINITY,
                        num_bad_epochs: 0,
                    },
                }
            }
        };
        Ok(scheduler)
    }

    /// The current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feeds the validation loss of a finished epoch and returns the learning
    /// rate for the next epoch.
    ///
    /// A NaN loss counts as no improvement.
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if let SchedulerKind::ReduceOnPlateau {
            factor,
            patience,
            min_lr,
            best,
            num_bad_epochs,
        } = &mut self.kind
        {
            if val_loss < *best * (1.0 - PLATEAU_THRESHOLD) {
                *best = val_loss;
                *num_bad_epochs = 0;
            } else {
                *num_bad_epochs += 1;
            }

            if *num_bad_epochs > *patience {
                let new_lr = (self.lr * *factor).max(*min_lr);
                if self.lr - new_lr > MIN_LR_CHANGE {
                    info!("reduce learning rate from {} to {}", self.lr, new_lr);
                    self.lr = new_lr;
                }
                *num_bad_epochs = 0;
            }
        }

        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn plateau(patience: usize, min_lr: f64) -> Result<LrScheduler> {
        LrScheduler::new(&LearningRateSchedule::ReduceOnPlateau {
            lr: r64(1e-2),
            factor: r64(0.1),
            patience,
            min_lr: r64(min_lr),
        })
    }

    #[test]
    fn constant_schedule_ignores_loss() -> Result<()> {
        let mut scheduler = LrScheduler::new(&LearningRateSchedule::Constant { lr: r64(0.5) })?;
        assert_eq!(scheduler.step(1.0), 0.5);
        assert_eq!(scheduler.step(2.0), 0.5);
        assert_eq!(scheduler.lr(), 0.5);
        Ok(())
    }

    #[test]
    fn plateau_reduces_after_patience() -> Result<()> {
        let mut scheduler = plateau(2, 0.0)?;
        assert_eq!(scheduler.step(1.0), 1e-2);
        // two bad epochs are tolerated
        assert_eq!(scheduler.step(1.0), 1e-2);
        assert_eq!(scheduler.step(1.5), 1e-2);
        // the third one triggers a reduction
        assert_abs_diff_eq!(scheduler.step(1.2), 1e-3, epsilon = 1e-12);
        // the counter restarts after a reduction
        assert_abs_diff_eq!(scheduler.step(1.2), 1e-3, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn improvement_resets_patience() -> Result<()> {
        let mut scheduler = plateau(1, 0.0)?;
        scheduler.step(1.0);
        scheduler.step(1.0);
        scheduler.step(0.5);
        assert_eq!(scheduler.step(0.6), 1e-2);
        assert_abs_diff_eq!(scheduler.step(f64::NAN), 1e-3, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn plateau_respects_min_lr() -> Result<()> {
        let mut scheduler = plateau(0, 5e-3)?;
        scheduler.step(1.0);
        assert_abs_diff_eq!(scheduler.step(1.0), 5e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(scheduler.step(1.0), 5e-3, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn invalid_factor_is_rejected() {
        let result = LrScheduler::new(&LearningRateSchedule::ReduceOnPlateau {
            lr: r64(1e-2),
            factor: r64(1.5),
            patience: 1,
            min_lr: r64(0.0),
        });
        assert!(result.is_err());
    }
}
