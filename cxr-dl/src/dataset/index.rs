use super::AnnotationRow;
use crate::common::*;

/// The file pattern of images under a dataset root, relative to the root.
pub const DEFAULT_IMAGE_PATTERN: &str = "**/images/*.png";

/// Maps image file names to their locations under a dataset root.
///
/// The directory tree is scanned once. Paths are visited in lexicographic
/// order and a later path replaces an earlier one with the same file name.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    paths: HashMap<String, PathBuf>,
    num_collisions: usize,
}

impl ImageIndex {
    /// Scans `root` with [DEFAULT_IMAGE_PATTERN].
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        Self::scan_with_pattern(root, DEFAULT_IMAGE_PATTERN)
    }

    pub fn scan_with_pattern(root: impl AsRef<Path>, pattern: &str) -> Result<Self> {
        let root = root.as_ref();
        ensure!(
            root.is_dir(),
            "the image directory '{}' does not exist",
            root.display()
        );

        info!("caching image paths under '{}'", root.display());

        let full_pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&root.to_string_lossy()),
            pattern
        );
        let mut found: Vec<PathBuf> = glob::glob(&full_pattern)
            .with_context(|| format!("invalid image pattern '{}'", full_pattern))?
            .try_collect()?;
        found.sort();

        let mut paths = HashMap::with_capacity(found.len());
        let mut num_collisions = 0;

        for path in found {
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_owned(),
                None => continue,
            };
            if let Some(prev) = paths.insert(name, path) {
                debug!("'{}' is shadowed by a later file", prev.display());
                num_collisions += 1;
            }
        }

        if num_collisions > 0 {
            warn!(
                "{} image file names occur more than once, the lexicographically last path is used",
                num_collisions
            );
        }
        info!("found {} images in the directory structure", paths.len());

        Ok(Self {
            paths,
            num_collisions,
        })
    }

    pub fn resolve(&self, name: &str) -> Option<&Path> {
        self.paths.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Number of file names seen more than once during the scan.
    pub fn num_collisions(&self) -> usize {
        self.num_collisions
    }

    /// Keeps the rows whose image resolves and returns them with the number
    /// of dropped rows.
    pub fn filter_rows<I>(&self, rows: I) -> (Vec<AnnotationRow>, usize)
    where
        I: IntoIterator<Item = AnnotationRow>,
    {
        let mut dropped = 0;
        let kept = rows
            .into_iter()
            .filter(|row| {
                let found = self.paths.contains_key(&row.image_index);
                if !found {
                    dropped += 1;
                }
                found
            })
            .collect();
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn row(name: &str) -> AnnotationRow {
        AnnotationRow {
            image_index: name.into(),
            finding_labels: "No Finding".into(),
        }
    }

    #[test]
    fn scan_nested_image_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        touch(&root.join("images_001/images/a.png"));
        touch(&root.join("images_002/images/b.png"));
        touch(&root.join("images/c.png"));
        touch(&root.join("images_002/other/d.png"));
        touch(&root.join("images_002/images/e.jpg"));

        let index = ImageIndex::scan(root)?;
        assert_eq!(index.len(), 3);
        assert_eq!(
            index.resolve("a.png"),
            Some(root.join("images_001/images/a.png").as_path())
        );
        assert!(index.resolve("c.png").is_some());
        assert!(index.resolve("d.png").is_none());
        assert!(index.resolve("e.jpg").is_none());
        Ok(())
    }

    #[test]
    fn colliding_names_resolve_to_last_sorted_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        touch(&root.join("b/images/x.png"));
        touch(&root.join("a/images/x.png"));

        let index = ImageIndex::scan(root)?;
        assert_eq!(index.num_collisions(), 1);
        assert_eq!(
            index.resolve("x.png"),
            Some(root.join("b/images/x.png").as_path())
        );
        Ok(())
    }

    #[test]
    fn unresolved_rows_are_dropped_and_counted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        touch(&root.join("images/a.png"));
        touch(&root.join("images/b.png"));

        let index = ImageIndex::scan(root)?;
        let (kept, dropped) = index.filter_rows(vec![row("a.png"), row("z.png"), row("b.png")]);
        assert_eq!(dropped, 1);
        assert_eq!(
            kept.iter().map(|row| row.image_index.as_str()).collect_vec(),
            vec!["a.png", "b.png"]
        );
        Ok(())
    }

    #[test]
    fn missing_root_is_an_error() {
        assert!(ImageIndex::scan("/nonexistent/dataset/root").is_err());
    }
}
