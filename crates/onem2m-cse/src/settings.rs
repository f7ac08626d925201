//! Configuration loading: a TOML file (`config.toml` in the work directory
//! by default) layered under `ONEM2M__`-prefixed environment overrides,
//! deserialized into `onem2m_common::CseConfig`. Mirrors the layering
//! `cdk-mintd` applies over its own `Settings`, using the `config` crate's
//! built-in `Environment` source rather than a hand-rolled one since the
//! CSE's configuration surface is far smaller.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, Environment, File};
use onem2m_common::CseConfig;

/// Resolve the working directory: CLI flag, then `ONEM2M_WORK_DIR`, then
/// `./onem2m-cse` under the current directory.
pub fn work_directory(cli_work_dir: Option<PathBuf>) -> Result<PathBuf> {
    let work_dir = if let Some(dir) = cli_work_dir {
        dir
    } else if let Ok(dir) = std::env::var("ONEM2M_WORK_DIR") {
        PathBuf::from(dir)
    } else {
        std::env::current_dir()?.join("onem2m-cse")
    };
    std::fs::create_dir_all(&work_dir)?;
    Ok(work_dir)
}

/// Load `CseConfig` from `config_path` (or `<work_dir>/config.toml` if it
/// exists), then apply `ONEM2M__section__field=value` environment overrides.
pub fn load(work_dir: &Path, config_path: Option<PathBuf>) -> Result<CseConfig> {
    let config_file = config_path.unwrap_or_else(|| work_dir.join("config.toml"));

    let mut builder = Config::builder().add_source(Config::try_from(&CseConfig::default())?);
    if config_file.exists() {
        builder = builder.add_source(File::from(config_file));
    }
    let config = builder
        .add_source(Environment::with_prefix("ONEM2M").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_returns_defaults() {
        let dir = std::env::temp_dir().join("onem2m-cse-settings-test-no-file");
        std::fs::create_dir_all(&dir).unwrap();
        let config = load(&dir, Some(dir.join("does-not-exist.toml"))).unwrap();
        assert_eq!(config.cse.cse_rn, "cse-in");
    }
}
