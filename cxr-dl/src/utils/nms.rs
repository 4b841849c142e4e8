use crate::common::*;

/// A scored and labeled box, a candidate for non-maximum suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBox {
    pub rect: TLBR<f64>,
    pub score: f64,
    pub label: i64,
}

#[derive(Debug)]
pub struct NonMaxSuppressionInit {
    pub iou_threshold: R64,
    pub confidence_threshold: R64,
    pub max_detections: Option<usize>,
}

impl Default for NonMaxSuppressionInit {
    fn default() -> Self {
        Self {
            iou_threshold: r64(0.5),
            confidence_threshold: r64(0.05),
            max_detections: Some(100),
        }
    }
}

impl NonMaxSuppressionInit {
    pub fn build(self) -> Result<NonMaxSuppression> {
        let Self {
            iou_threshold,
            confidence_threshold,
            max_detections,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&iou_threshold.raw()),
            "iou_threshold must be in range [0, 1]"
        );
        ensure!(
            confidence_threshold >= 0.0,
            "confidence_threshold must be non-negative"
        );

        Ok(NonMaxSuppression {
            iou_threshold,
            confidence_threshold,
            max_detections,
        })
    }
}

/// Greedy class-wise non-maximum suppression.
#[derive(Debug)]
pub struct NonMaxSuppression {
    iou_threshold: R64,
    confidence_threshold: R64,
    max_detections: Option<usize>,
}

impl NonMaxSuppression {
    /// Returns the indexes of the kept candidates ordered by decreasing
    /// score.
    ///
    /// Candidates below the confidence threshold are discarded. Within each
    /// label, a candidate is suppressed when its IoU with a higher-scored kept
    /// candidate exceeds the IoU threshold.
    pub fn forward(&self, candidates: &[ScoredBox]) -> Vec<usize> {
        let iou_threshold = self.iou_threshold.raw();
        let confidence_threshold = self.confidence_threshold.raw();

        let groups = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.score >= confidence_threshold)
            .map(|(index, candidate)| (candidate.label, index))
            .into_group_map();

        let mut kept: Vec<usize> = groups
            .into_iter()
            .flat_map(|(_label, mut indexes)| {
                indexes.sort_by(|&lhs, &rhs| by_score_desc(candidates, lhs, rhs));

                let mut group_kept: Vec<usize> = vec![];
                for index in indexes {
                    let rect = &candidates[index].rect;
                    let suppressed = group_kept
                        .iter()
                        .any(|&other| rect.iou_with(&candidates[other].rect) > iou_threshold);
                    if !suppressed {
                        group_kept.push(index);
                    }
                }
                group_kept
            })
            .collect();

        kept.sort_by(|&lhs, &rhs| by_score_desc(candidates, lhs, rhs));
        if let Some(max_detections) = self.max_detections {
            kept.truncate(max_detections);
        }
        kept
    }
}

fn by_score_desc(candidates: &[ScoredBox], lhs: usize, rhs: usize) -> Ordering {
    candidates[rhs]
        .score
        .partial_cmp(&candidates[lhs].score)
        .unwrap_or(Ordering::Equal)
        .then(lhs.cmp(&rhs))
}
