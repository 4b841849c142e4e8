use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

const CHECKPOINT_FILE_PATTERN: &str =
    r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{6}_\d+\.\d+\.ckpt$";

/// The checkpoint file name `<timestamp>_<epoch>_<loss>.ckpt`.
pub fn checkpoint_file_name(time: &DateTime<Local>, epoch: usize, loss: f64) -> String {
    format!("{}_{:06}_{:08.5}.ckpt", time.format(FILE_STRFTIME), epoch, loss)
}

/// Save parameters to a checkpoint file and return its path.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    epoch: usize,
    loss: f64,
) -> Result<PathBuf> {
    let path = checkpoint_dir.join(checkpoint_file_name(&Local::now(), epoch, loss));
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint '{}'", path.display()))?;
    Ok(path)
}

/// Load parameters with specified checkpoint loading method.
///
/// `FromRecent` searches `<logging_dir>/*/checkpoints/` and picks the file
/// with the latest timestamp in its name. Returns the loaded file if any.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = most_recent_checkpoint(logging_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found in '{}'", logging_dir.display());
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "'{}' is not a file", file.display());
            Some(file.to_owned())
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file '{}'", path.display());
        vs.load_partial(path)
            .with_context(|| format!("failed to load checkpoint '{}'", path.display()))?;
    }

    Ok(path)
}

fn most_recent_checkpoint(logging_dir: &Path) -> Result<Option<PathBuf>> {
    let regex = Regex::new(CHECKPOINT_FILE_PATTERN)?;
    let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
    let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;

    let checkpoint_file = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = regex.captures(file_name)?;
            let datetime_str = captures.get(1)?.as_str();
            let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);

    Ok(checkpoint_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save_value(dir: &Path, time: &DateTime<Local>, value: f64) -> Result<PathBuf> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _weight = vs.root().var("weight", &[1], nn::Init::Const(value));
        let path = dir.join(checkpoint_file_name(time, 1, 0.5));
        vs.save(&path)?;
        Ok(path)
    }

    fn load_value(
        logging_dir: &Path,
        load_checkpoint: &LoadCheckpoint,
    ) -> Result<(Option<PathBuf>, f64)> {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().var("weight", &[1], nn::Init::Const(0.0));
        let path = try_load_checkpoint(&mut vs, logging_dir, load_checkpoint)?;
        Ok((path, f64::from(&weight.view([-1]).get(0))))
    }

    #[test]
    fn file_name_matches_pattern() -> Result<()> {
        let name = checkpoint_file_name(&Local::now(), 3, 0.25);
        assert!(Regex::new(CHECKPOINT_FILE_PATTERN)?.is_match(&name));
        assert!(name.ends_with("_000003_00.25000.ckpt"));
        Ok(())
    }

    #[test]
    fn most_recent_checkpoint_is_loaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let older_dir = dir.path().join("run-a/checkpoints");
        let newer_dir = dir.path().join("run-b/checkpoints");
        std::fs::create_dir_all(&older_dir)?;
        std::fs::create_dir_all(&newer_dir)?;

        let now = Local::now();
        save_value(&older_dir, &now, 1.0)?;
        let newer = save_value(&newer_dir, &(now + chrono::Duration::seconds(5)), 2.0)?;
        std::fs::write(newer_dir.join("unrelated.ckpt"), b"")?;

        let (path, value) = load_value(dir.path(), &LoadCheckpoint::FromRecent)?;
        assert_eq!(path, Some(newer));
        assert_eq!(value, 2.0);
        Ok(())
    }

    #[test]
    fn disabled_loading_keeps_parameters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path, value) = load_value(dir.path(), &LoadCheckpoint::Disabled)?;
        assert!(path.is_none());
        assert_eq!(value, 0.0);

        let (path, _) = load_value(dir.path(), &LoadCheckpoint::FromRecent)?;
        assert!(path.is_none());
        Ok(())
    }

    #[test]
    fn missing_checkpoint_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("missing.ckpt");
        assert!(load_value(dir.path(), &LoadCheckpoint::FromFile { file }).is_err());
        Ok(())
    }
}
