use crate::envsubst::expand_env;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::default_listen;
use super::types::Config;
use super::validate::validate_config;

/// Read, normalize and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = read_config(path)?;
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    finalize_config(&mut config, &cwd)?;
    Ok(config)
}

/// Parse a config file without applying defaults or validating it, so callers
/// can layer overrides first. Relative paths are resolved against the
/// directory containing the file.
pub fn read_config(path: &Path) -> Result<Config> {
    use serde::de::IntoDeserializer;

    let canonical =
        fs::canonicalize(path).with_context(|| format!("config not found: {}", path.display()))?;
    let raw = fs::read_to_string(&canonical)
        .with_context(|| format!("failed to read config: {}", canonical.display()))?;
    let expanded = expand_env(&raw)
        .with_context(|| format!("env expansion failed for {}", canonical.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&expanded)
        .with_context(|| format!("yaml parse failed for {}", canonical.display()))?;

    let mut ignored = Vec::new();
    let de = value.into_deserializer();
    let mut config: Config = serde_ignored::deserialize(de, |path| ignored.push(path.to_string()))
        .with_context(|| format!("failed to deserialize config: {}", canonical.display()))?;
    if !ignored.is_empty() {
        ignored.sort();
        ignored.dedup();
        return Err(anyhow!(
            "unknown config keys (fix typos to avoid unexpected defaults): {}",
            ignored.join(", ")
        ));
    }

    let base = canonical.parent().unwrap_or(Path::new("."));
    if config.document_root.as_os_str().is_empty() {
        config.document_root = base.to_path_buf();
    }
    make_paths_absolute(&mut config, base);
    Ok(config)
}

/// Apply defaults, resolve remaining relative paths against `base_dir` and
/// validate the result.
pub fn finalize_config(config: &mut Config, base_dir: &Path) -> Result<()> {
    if config.document_root.as_os_str().is_empty() {
        config.document_root = base_dir.to_path_buf();
    }
    make_paths_absolute(config, base_dir);
    config.port = config.effective_port();
    if config.listen.is_empty() {
        config.listen.push(default_listen(config.port));
    }
    for (extension, application) in std::mem::take(&mut config.invoke_on_extension) {
        config
            .invoke_on_extension
            .insert(extension.trim_start_matches('.').to_string(), application);
    }
    validate_config(config)
}

fn make_paths_absolute(config: &mut Config, base: &Path) {
    config.document_root = absolute(base, &config.document_root);
    if let Some(path) = config.logging.path.as_mut() {
        *path = absolute(base, path);
    }
    if let Some(path) = config.logging.access_path.as_mut() {
        *path = absolute(base, path);
    }
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
