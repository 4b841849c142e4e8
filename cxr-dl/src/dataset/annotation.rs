use crate::common::*;

/// One row of the image label table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationRow {
    #[serde(rename = "Image Index")]
    pub image_index: String,
    /// Pipe-delimited pathology names, e.g. `Cardiomegaly|Effusion`.
    #[serde(rename = "Finding Labels")]
    pub finding_labels: String,
}

/// The image label table, in file order.
#[derive(Debug, Clone, Default)]
pub struct AnnotationTable {
    pub rows: Vec<AnnotationRow>,
}

impl AnnotationTable {
    /// Loads a CSV table with `Image Index` and `Finding Labels` columns.
    /// Additional columns are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let rows: Vec<AnnotationRow> = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open label file '{}'", path.display()))?
            .deserialize()
            .enumerate()
            .map(|(index, row)| {
                row.with_context(|| {
                    format!(
                        "malformed row {} in label file '{}'",
                        index + 1,
                        path.display()
                    )
                })
            })
            .try_collect()?;

        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keeps the rows whose image is listed in `images`, preserving table
    /// order.
    pub fn select_images(&self, images: &HashSet<String>) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|row| images.contains(&row.image_index))
            .cloned()
            .collect();
        Self { rows }
    }

    /// Splits the table into `(train, validation)` parts. The validation part
    /// receives `round(len * val_ratio)` rows chosen by a seeded shuffle.
    pub fn random_split(&self, val_ratio: f64, seed: u64) -> Result<(Self, Self)> {
        ensure!(
            (0.0..=1.0).contains(&val_ratio),
            "val_ratio must be in range [0, 1], but get {}",
            val_ratio
        );

        let mut rng = StdRng::seed_from_u64(seed);
        let mut indexes = (0..self.rows.len()).collect_vec();
        indexes.shuffle(&mut rng);

        let num_val = (self.rows.len() as f64 * val_ratio).round() as usize;
        let val_indexes: HashSet<usize> = indexes.into_iter().take(num_val).collect();

        let (val_rows, train_rows): (Vec<_>, Vec<_>) = self
            .rows
            .iter()
            .cloned()
            .enumerate()
            .partition(|(index, _)| val_indexes.contains(index));
        let strip = |rows: Vec<(usize, AnnotationRow)>| Self {
            rows: rows.into_iter().map(|(_, row)| row).collect(),
        };

        Ok((strip(train_rows), strip(val_rows)))
    }
}

/// Reads an image list file with one image name per line. Blank lines are
/// skipped.
pub fn load_image_list(path: impl AsRef<Path>) -> Result<HashSet<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read image list '{}'", path.display()))?;
    let images: HashSet<_> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    Ok(images)
}

/// A labeled box in the `[x, y, w, h]` convention of the annotation files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxAnnotation {
    pub label: String,
    pub bbox: [f64; 4],
}

/// Bounding-box annotations keyed by image name.
#[derive(Debug, Clone, Default)]
pub struct BoundingBoxTable {
    boxes: HashMap<String, Vec<BoxAnnotation>>,
}

impl BoundingBoxTable {
    /// Loads a table from a `.json` mapping or a CSV list, picked by file
    /// extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::load_json(path)
        } else {
            Self::load_csv(path)
        }
    }

    /// Loads `{ "<image>": [{"label": "...", "bbox": [x, y, w, h]}] }`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bbox file '{}'", path.display()))?;
        let boxes: HashMap<String, Vec<BoxAnnotation>> = serde_json::from_str(&text)
            .with_context(|| format!("malformed bbox file '{}'", path.display()))?;
        Ok(Self { boxes })
    }

    /// Loads a CSV list laid out as `image, label, x, y, w, h[, ...]`.
    ///
    /// The columns are read by position since the header of the public box
    /// list splits `Bbox [x,y,w,h]` over four cells.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open bbox file '{}'", path.display()))?;
        let mut table = Self::default();

        for (index, record) in reader.records().enumerate() {
            let line = index + 2;
            let record = record.with_context(|| {
                format!("malformed line {} in bbox file '{}'", line, path.display())
            })?;
            ensure!(
                record.len() >= 6,
                "expect at least 6 columns at line {} in '{}', but get {}",
                line,
                path.display(),
                record.len()
            );

            let image = record[0].trim().to_owned();
            let label = record[1].trim().to_owned();
            let mut bbox = [0.0; 4];
            for (value, field) in bbox.iter_mut().zip(record.iter().skip(2)) {
                *value = field.trim().parse().with_context(|| {
                    format!(
                        "invalid coordinate '{}' at line {} in '{}'",
                        field,
                        line,
                        path.display()
                    )
                })?;
            }

            table.insert(image, BoxAnnotation { label, bbox });
        }

        Ok(table)
    }

    pub fn insert(&mut self, image: impl Into<String>, annotation: BoxAnnotation) {
        self.boxes.entry(image.into()).or_default().push(annotation);
    }

    pub fn get(&self, image: &str) -> Option<&[BoxAnnotation]> {
        self.boxes.get(image).map(Vec::as_slice)
    }

    /// Number of images with at least one box.
    pub fn num_images(&self) -> usize {
        self.boxes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_label_table_ignores_extra_columns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            dir.path(),
            "labels.csv",
            "Image Index,Finding Labels,Follow-up #,Patient ID\n\
             00000001_000.png,Cardiomegaly,0,1\n\
             00000001_001.png,Cardiomegaly|Emphysema,1,1\n\
             00000002_000.png,No Finding,0,2\n",
        );

        let table = AnnotationTable::load(&path)?;
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[1].image_index, "00000001_001.png");
        assert_eq!(table.rows[1].finding_labels, "Cardiomegaly|Emphysema");
        Ok(())
    }

    #[test]
    fn load_bbox_csv_by_position() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            dir.path(),
            "bbox.csv",
            "Image Index,Finding Label,Bbox [x,y,w,h],,,\n\
             00013118_008.png,Atelectasis,225.0,547.0,86.0,79.0,,,\n\
             00013118_008.png,Effusion,10.5,20.0,30.0,40.0,,,\n\
             00014716_007.png,Infiltrate,1.0,2.0,3.0,4.0,,,\n",
        );

        let table = BoundingBoxTable::load(&path)?;
        assert_eq!(table.num_images(), 2);
        let boxes = table.get("00013118_008.png").unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].label, "Atelectasis");
        assert_eq!(boxes[0].bbox, [225.0, 547.0, 86.0, 79.0]);
        assert_eq!(boxes[1].bbox, [10.5, 20.0, 30.0, 40.0]);
        assert!(table.get("missing.png").is_none());
        Ok(())
    }

    #[test]
    fn malformed_bbox_row_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            dir.path(),
            "bbox.csv",
            "Image Index,Finding Label,Bbox [x,y,w,h],,,\n\
             a.png,Mass,1.0,two,3.0,4.0\n",
        );
        assert!(BoundingBoxTable::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn load_bbox_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(
            dir.path(),
            "bbox.json",
            r#"{"a.png": [{"label": "Mass", "bbox": [1.0, 2.0, 3.0, 4.0]}]}"#,
        );
        let table = BoundingBoxTable::load(&path)?;
        assert_eq!(
            table.get("a.png").unwrap(),
            &[BoxAnnotation {
                label: "Mass".into(),
                bbox: [1.0, 2.0, 3.0, 4.0]
            }]
        );
        Ok(())
    }

    #[test]
    fn random_split_is_seeded_and_exhaustive() -> Result<()> {
        let table = AnnotationTable {
            rows: (0..10)
                .map(|index| AnnotationRow {
                    image_index: format!("{}.png", index),
                    finding_labels: "No Finding".into(),
                })
                .collect(),
        };

        let (train, val) = table.random_split(0.3, 7)?;
        assert_eq!(train.len(), 7);
        assert_eq!(val.len(), 3);

        let (train2, val2) = table.random_split(0.3, 7)?;
        assert_eq!(train.rows, train2.rows);
        assert_eq!(val.rows, val2.rows);

        let names: HashSet<_> = chain_names(&train, &val);
        assert_eq!(names.len(), 10);
        assert!(table.random_split(1.5, 0).is_err());
        Ok(())
    }

    #[test]
    fn select_images_keeps_table_order() {
        let table = AnnotationTable {
            rows: ["c.png", "a.png", "b.png"]
                .iter()
                .map(|name| AnnotationRow {
                    image_index: name.to_string(),
                    finding_labels: String::new(),
                })
                .collect(),
        };
        let wanted: HashSet<String> = ["b.png", "c.png"].iter().map(|s| s.to_string()).collect();
        let selected = table.select_images(&wanted);
        let names = selected
            .rows
            .iter()
            .map(|row| row.image_index.as_str())
            .collect_vec();
        assert_eq!(names, vec!["c.png", "b.png"]);
    }

    fn chain_names(lhs: &AnnotationTable, rhs: &AnnotationTable) -> HashSet<String> {
        lhs.rows
            .iter()
            .chain(&rhs.rows)
            .map(|row| row.image_index.clone())
            .collect()
    }
}
