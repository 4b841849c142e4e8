//! The fixed pathology vocabulary.

use crate::common::*;

/// Number of pathology classes.
pub const NUM_CLASSES: usize = 14;

/// Pathology names in classification index order.
pub const CLASSES: [&str; NUM_CLASSES] = [
    "Atelectasis",
    "Cardiomegaly",
    "Consolidation",
    "Edema",
    "Effusion",
    "Emphysema",
    "Fibrosis",
    "Hernia",
    "Infiltration",
    "Mass",
    "Nodule",
    "Pleural_Thickening",
    "Pneumonia",
    "Pneumothorax",
];

/// The detection label reserved for background.
pub const BACKGROUND_LABEL: i64 = 0;

static VOCABULARY: Lazy<ClassVocabulary> = Lazy::new(|| ClassVocabulary {
    classes: CLASSES.iter().copied().collect(),
});

/// Bidirectional mapping between pathology names and class indexes.
///
/// Classification targets use the index directly. Detection labels are
/// shifted by one so that label 0 stays reserved for background.
#[derive(Debug)]
pub struct ClassVocabulary {
    classes: IndexSet<&'static str>,
}

impl ClassVocabulary {
    /// The process-wide vocabulary.
    pub fn get() -> &'static Self {
        &VOCABULARY
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.get_index_of(name)
    }

    pub fn name_of(&self, index: usize) -> Option<&'static str> {
        self.classes.get_index(index).copied()
    }

    /// Detection label of a pathology name, if the name is known.
    pub fn detection_label_of(&self, name: &str) -> Option<i64> {
        self.index_of(name).map(to_detection_label)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.iter().copied()
    }
}

/// Converts a classification index to a 1-indexed detection label.
pub fn to_detection_label(index: usize) -> i64 {
    index as i64 + 1
}

/// Converts a detection label back to a classification index. Background and
/// out-of-range labels map to `None`.
pub fn from_detection_label(label: i64) -> Option<usize> {
    (1..=NUM_CLASSES as i64)
        .contains(&label)
        .then(|| (label - 1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_round_trip() {
        let vocab = ClassVocabulary::get();
        assert_eq!(vocab.len(), NUM_CLASSES);

        for (index, name) in CLASSES.iter().enumerate() {
            assert_eq!(vocab.index_of(name), Some(index));
            assert_eq!(vocab.name_of(index), Some(*name));
        }
        assert_eq!(vocab.index_of("Infiltrate"), None);
        assert_eq!(vocab.name_of(NUM_CLASSES), None);
    }

    #[test]
    fn detection_labels_skip_background() {
        let vocab = ClassVocabulary::get();
        assert_eq!(vocab.detection_label_of("Atelectasis"), Some(1));
        assert_eq!(vocab.detection_label_of("Pneumothorax"), Some(14));
        assert_eq!(from_detection_label(BACKGROUND_LABEL), None);
        assert_eq!(from_detection_label(15), None);
        assert_eq!(from_detection_label(5), Some(4));
    }
}
