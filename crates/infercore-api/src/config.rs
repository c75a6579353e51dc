//! TOML configuration loading for the serving process.
//!
//! `infercore-core::config::CoreConfig` defines the shapes and their
//! numeric defaults; this module is the one place that actually reads a
//! file off disk, keeping "what a config looks like" (core) separate
//! from "how one gets loaded" (api).

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

use infercore_core::config::CoreConfig;

/// Top-level process configuration: the core's component config plus
/// process-wide bits (bind address, tenant registry location, …) that
/// are entirely this layer's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub data_dir: PathBuf,
    #[serde(flatten)]
    pub core: CoreConfig,
}

/// Resolve `name` against `permitted`, rejecting any path that would
/// escape it via `..` or an absolute override. Config-relative file
/// references (model directories, plugin manifests) must not be able to
/// read arbitrary paths.
pub fn build_path(permitted: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<PathBuf> {
    let permitted = permitted.as_ref();
    let name = name.as_ref();
    if name.ancestors().any(|p| p.ends_with(Path::new(".."))) {
        bail!("cannot have \"..\" in names");
    }
    let path = match name.is_absolute() || name.starts_with(permitted) {
        true => name.into(),
        false => permitted.join(name),
    };
    match path.starts_with(permitted) {
        true => Ok(path),
        false => bail!("path not permitted"),
    }
}

/// Load a [`ServerConfig`] from a TOML file.
pub async fn load_config(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_path_rejects_dotdot() {
        let base = Path::new("/data/models");
        assert!(build_path(base, "../../etc/passwd").is_err());
    }

    #[test]
    fn build_path_joins_relative_names() {
        let base = Path::new("/data/models");
        let joined = build_path(base, "llama.gguf").unwrap();
        assert_eq!(joined, Path::new("/data/models/llama.gguf"));
    }

    #[test]
    fn server_config_default_embeds_core_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.core.pool.max_size, 10);
        assert_eq!(cfg.core.bulkhead.capacity, 100);
    }
}
