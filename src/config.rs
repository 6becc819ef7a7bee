use std::{env, path::PathBuf, str::FromStr};

use crate::{
    error::{Error, Result},
    model::{Arch, BackboneLayout},
    predict::LabelMapping,
    preprocess::CropMode,
};

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub upload_dir: PathBuf,
    pub labels_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub backbone_path: PathBuf,
    pub backbone_url: Option<String>,
    pub backbone_input: String,
    pub backbone_output: String,
    pub backbone_layout: BackboneLayout,
    /// `None` defers to the architecture recorded in the checkpoint.
    pub arch: Option<Arch>,
    pub top_k: usize,
    pub crop_mode: CropMode,
    pub label_mapping: LabelMapping,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let body_limit_mb: usize = parse(&lookup, "BODY_LIMIT_MB", 5)?;
        let top_k: usize = parse(&lookup, "TOP_K", 5)?;
        if top_k == 0 {
            return Err(Error::Config("TOP_K must be at least 1".into()));
        }

        let arch = match lookup("MODEL_ARCH") {
            Some(raw) => Some(raw.parse::<Arch>().map_err(|e| config_err("MODEL_ARCH", e))?),
            None => None,
        };

        Ok(Config {
            port: parse(&lookup, "PORT", 8080)?,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            upload_dir: string("UPLOAD_DIR", "uploads").into(),
            labels_path: string("LABELS_PATH", "cat_to_name.json").into(),
            checkpoint_path: string("CHECKPOINT_PATH", "model_data/save_checkpoint.safetensors")
                .into(),
            backbone_path: string("BACKBONE_PATH", "model_data/backbone.pb").into(),
            backbone_url: lookup("BACKBONE_URL").filter(|url| !url.is_empty()),
            backbone_input: string("BACKBONE_INPUT", "x"),
            backbone_output: string("BACKBONE_OUTPUT", "Identity"),
            backbone_layout: parse(&lookup, "BACKBONE_LAYOUT", BackboneLayout::Nchw)?,
            arch,
            top_k,
            crop_mode: parse(&lookup, "CROP_MODE", CropMode::Center)?,
            label_mapping: parse(&lookup, "LABEL_MAPPING", LabelMapping::Offset)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| config_err(key, e)),
        None => Ok(default),
    }
}

fn config_err(key: &str, err: impl std::fmt::Display) -> Error {
    Error::Config(format!("{key}: {err}"))
}
