use crate::common::*;

/// A point on a precision/recall curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecRec<T>
where
    T: Copy,
{
    pub precision: T,
    pub recall: T,
}

/// How the area under a precision/recall curve is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegralMethod {
    /// Exact area under the precision envelope.
    Continuous,
    /// Mean of the enveloped precision sampled at `n` evenly spaced recall
    /// levels from 0 to 1.
    Interpolation(usize),
}

#[derive(Debug, Clone)]
pub struct ApCalculator {
    integral_method: IntegralMethod,
}

impl ApCalculator {
    /// The 11-point interpolated AP of PASCAL VOC 2007.
    pub fn new_voc() -> Self {
        Self {
            integral_method: IntegralMethod::Interpolation(11),
        }
    }

    pub fn new(integral_method: IntegralMethod) -> Result<Self> {
        if let IntegralMethod::Interpolation(n_points) = integral_method {
            ensure!(
                n_points >= 2,
                "invalid number of interpolated points {}",
                n_points
            );
        }

        Ok(Self { integral_method })
    }

    pub fn integral_method(&self) -> IntegralMethod {
        self.integral_method
    }

    /// Computes average precision from precision/recall points in any order.
    /// An empty curve has zero AP.
    pub fn compute_by_prec_rec(&self, prec_rec: &[PrecRec<R64>]) -> R64 {
        if prec_rec.is_empty() {
            return r64(0.0);
        }

        match self.integral_method {
            IntegralMethod::Interpolation(n_points) => {
                let sum: R64 = (0..n_points)
                    .map(|index| index as f64 / (n_points - 1) as f64)
                    .map(|level| {
                        prec_rec
                            .iter()
                            .filter(|point| point.recall >= level)
                            .map(|point| point.precision)
                            .max()
                            .unwrap_or_else(|| r64(0.0))
                    })
                    .sum();
                sum / n_points as f64
            }
            IntegralMethod::Continuous => {
                let mut sorted = prec_rec.to_vec();
                sorted.sort_by_key(|point| point.recall);

                // sentinels at both ends of the recall axis
                let recalls = iter::once(r64(0.0))
                    .chain(sorted.iter().map(|point| point.recall))
                    .chain(iter::once(r64(1.0)))
                    .collect_vec();
                let mut precisions = iter::once(r64(0.0))
                    .chain(sorted.iter().map(|point| point.precision))
                    .chain(iter::once(r64(0.0)))
                    .collect_vec();

                // precision envelope, non-increasing in recall
                for index in (0..precisions.len() - 1).rev() {
                    precisions[index] = precisions[index].max(precisions[index + 1]);
                }

                izip!(recalls.iter().tuple_windows(), precisions.iter().skip(1))
                    .filter(|((prev, next), _)| prev != next)
                    .map(|((&prev, &next), &precision)| (next - prev) * precision)
                    .sum()
            }
        }
    }

    /// Computes average precision from detections sorted by decreasing
    /// confidence, each flagged as a true or false positive.
    pub fn compute_by_detections<I>(&self, is_true_positive: I, num_ground_truth: usize) -> R64
    where
        I: IntoIterator<Item = bool>,
    {
        if num_ground_truth == 0 {
            return r64(0.0);
        }

        let prec_rec: Vec<_> = is_true_positive
            .into_iter()
            .scan((0usize, 0usize), |(acc_tp, acc_fp), is_tp| {
                if is_tp {
                    *acc_tp += 1;
                } else {
                    *acc_fp += 1;
                }
                let tp = r64(*acc_tp as f64);
                let fp = r64(*acc_fp as f64);
                Some(PrecRec {
                    precision: tp / (tp + fp),
                    recall: tp / num_ground_truth as f64,
                })
            })
            .collect();

        self.compute_by_prec_rec(&prec_rec)
    }
}
