use crate::{common::*, utils::nanmean};

/// Per-class and mean classification metrics.
///
/// Classes without positive examples report NaN and are ignored by the
/// means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub aucs: Vec<f64>,
    pub aps: Vec<f64>,
    pub mean_auc: f64,
    pub mean_ap: f64,
}

/// Computes ROC AUC and average precision of every class.
///
/// `targets` holds `[num_samples, num_classes]` binary labels and `scores`
/// the predicted probabilities of the same shape.
pub fn classification_metrics(targets: &Tensor, scores: &Tensor) -> Result<ClassificationMetrics> {
    ensure!(
        targets.size() == scores.size(),
        "targets and scores must have equal shape, but get {:?} and {:?}",
        targets.size(),
        scores.size()
    );
    let (_num_samples, num_classes) = targets.size2()?;

    let to_columns = |tensor: &Tensor| -> Vec<Vec<f64>> {
        let tensor = tensor.to_device(Device::Cpu).to_kind(Kind::Double);
        (0..num_classes)
            .map(|class| Vec::<f64>::from(&tensor.select(1, class).contiguous()))
            .collect()
    };
    let target_columns = to_columns(targets);
    let score_columns = to_columns(scores);

    let (aucs, aps): (Vec<f64>, Vec<f64>) = izip!(&target_columns, &score_columns)
        .map(|(targets, scores)| {
            let labels = targets.iter().map(|&value| value > 0.5).collect_vec();
            if !labels.iter().any(|&label| label) {
                return (f64::NAN, f64::NAN);
            }
            let auc = roc_auc(&labels, scores).unwrap_or(f64::NAN);
            let ap = average_precision(&labels, scores).unwrap_or(f64::NAN);
            (auc, ap)
        })
        .unzip();

    let mean_auc = nanmean(aucs.iter().copied());
    let mean_ap = nanmean(aps.iter().copied());

    Ok(ClassificationMetrics {
        aucs,
        aps,
        mean_auc,
        mean_ap,
    })
}

/// Area under the ROC curve, or `None` when either class is absent.
///
/// Tied scores share one threshold, which makes the result equal to the
/// Mann-Whitney statistic with half credit for ties.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> Option<f64> {
    debug_assert_eq!(labels.len(), scores.len());

    let num_pos = labels.iter().filter(|&&label| label).count();
    let num_neg = labels.len() - num_pos;
    if num_pos == 0 || num_neg == 0 {
        return None;
    }

    // average 1-based ranks over groups of equal scores
    let order = sort_indexes_by_score(scores, false);
    let mut rank_sum_pos = 0.0;
    let mut begin = 0;
    while begin < order.len() {
        let score = scores[order[begin]];
        let end = order[begin..]
            .iter()
            .position(|&index| scores[index] != score)
            .map(|offset| begin + offset)
            .unwrap_or(order.len());
        let mean_rank = (begin + 1 + end) as f64 / 2.0;
        let num_pos_in_group = order[begin..end]
            .iter()
            .filter(|&&index| labels[index])
            .count();
        rank_sum_pos += mean_rank * num_pos_in_group as f64;
        begin = end;
    }

    let num_pos = num_pos as f64;
    let num_neg = num_neg as f64;
    Some((rank_sum_pos - num_pos * (num_pos + 1.0) / 2.0) / (num_pos * num_neg))
}

/// Average precision `sum_n (R_n - R_{n-1}) P_n` over decreasing score
/// thresholds, or `None` when there is no positive label.
pub fn average_precision(labels: &[bool], scores: &[f64]) -> Option<f64> {
    debug_assert_eq!(labels.len(), scores.len());

    let num_pos = labels.iter().filter(|&&label| label).count();
    if num_pos == 0 {
        return None;
    }

    let order = sort_indexes_by_score(scores, true);
    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    let mut tp = 0usize;
    let mut fp = 0usize;

    for (position, &index) in order.iter().enumerate() {
        if labels[index] {
            tp += 1;
        } else {
            fp += 1;
        }

        // evaluate only at the last sample of a group of equal scores
        let is_threshold_end = order
            .get(position + 1)
            .map(|&next| scores[next] != scores[index])
            .unwrap_or(true);
        if !is_threshold_end {
            continue;
        }

        let precision = tp as f64 / (tp + fp) as f64;
        let recall = tp as f64 / num_pos as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }

    Some(ap)
}

fn sort_indexes_by_score(scores: &[f64], descending: bool) -> Vec<usize> {
    let mut order = (0..scores.len()).collect_vec();
    order.sort_by(|&lhs, &rhs| {
        let ordering = scores[lhs]
            .partial_cmp(&scores[rhs])
            .unwrap_or(Ordering::Equal);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_ranking() {
        let labels = [false, false, true, true];
        let scores = [0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(roc_auc(&labels, &scores).unwrap(), 1.0);
        assert_abs_diff_eq!(average_precision(&labels, &scores).unwrap(), 1.0);
    }

    #[test]
    fn partially_ordered_scores() {
        let labels = [false, false, true, true];
        let scores = [0.1, 0.4, 0.35, 0.8];
        assert_abs_diff_eq!(roc_auc(&labels, &scores).unwrap(), 0.75);
        // thresholds 0.8, 0.4, 0.35: (0.5 - 0) * 1 + 0 + (1 - 0.5) * 2/3
        assert_abs_diff_eq!(
            average_precision(&labels, &scores).unwrap(),
            0.5 + 0.5 * 2.0 / 3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn tied_scores_share_a_threshold() {
        let labels = [true, false];
        let scores = [0.5, 0.5];
        assert_abs_diff_eq!(roc_auc(&labels, &scores).unwrap(), 0.5);
        assert_abs_diff_eq!(average_precision(&labels, &scores).unwrap(), 0.5);
    }

    #[test]
    fn undefined_metrics() {
        assert!(roc_auc(&[false, false], &[0.1, 0.2]).is_none());
        assert!(roc_auc(&[true, true], &[0.1, 0.2]).is_none());
        assert!(average_precision(&[false, false], &[0.1, 0.2]).is_none());
        assert_abs_diff_eq!(average_precision(&[true, true], &[0.1, 0.2]).unwrap(), 1.0);
    }

    #[test]
    fn classes_without_positives_are_excluded_from_means() -> Result<()> {
        // class 0 is perfectly ranked, class 1 has no positives
        let targets = Tensor::of_slice(&[1f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).view([4, 2]);
        let scores = Tensor::of_slice(&[0.9f32, 0.3, 0.2, 0.6, 0.8, 0.1, 0.1, 0.2]).view([4, 2]);

        let metrics = classification_metrics(&targets, &scores)?;
        assert_abs_diff_eq!(metrics.aucs[0], 1.0);
        assert!(metrics.aucs[1].is_nan());
        assert!(metrics.aps[1].is_nan());
        assert_abs_diff_eq!(metrics.mean_auc, 1.0);
        assert_abs_diff_eq!(metrics.mean_ap, 1.0);
        Ok(())
    }
}
