#![allow(dead_code)]

use anyhow::Result;
use std::path::Path;
use tch::{vision, Device, Kind, Tensor};

/// Writes a gray PNG with shape `[3, height, width]`.
pub fn write_png(path: &Path, height: i64, width: i64) -> Result<()> {
    std::fs::create_dir_all(path.parent().unwrap())?;
    let image = Tensor::full(&[3, height, width], 100i64, (Kind::Uint8, Device::Cpu));
    vision::image::save(&image, path)?;
    Ok(())
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(path, text)?;
    Ok(())
}
