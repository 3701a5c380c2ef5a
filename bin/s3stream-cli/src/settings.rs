//! Configuration loading: TOML file, then `S3STREAM__` environment
//! overrides, then command line flags

use anyhow::{Context, Result};
use s3stream_common::Config;
use std::path::{Path, PathBuf};

/// Environment prefix; `S3STREAM__WAL__MAX_SIZE` sets `wal.max_size`
pub const ENV_PREFIX: &str = "S3STREAM";

pub fn load(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut config: Config = builder
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(data_dir) = data_dir {
        config.broker.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}
