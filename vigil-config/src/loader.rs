use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::models::{VigilConfig, VigilConfigSource};

const DEFAULT_CANDIDATES: &[&str] = &[
    "vigil.toml",
    "vigil.json",
    "config/vigil.toml",
    "config/vigil.json",
];

impl VigilConfig {
    /// Load the deployment configuration.
    /// Evaluation order:
    /// 1) `$VIGIL_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$VIGIL_CONFIG_JSON` (inline JSON),
    /// 3) `vigil.toml` / `vigil.json` in the working directory or `config/`,
    /// 4) defaults.
    ///
    /// `$VIGIL_REDIS_URL` and `$VIGIL_LOG_FILTER` override the loaded values.
    pub fn load_from_env() -> anyhow::Result<(Self, VigilConfigSource)> {
        let cwd = env::current_dir()
            .context("failed to resolve the working directory")?;
        Self::load_with(&|key: &str| env::var(key).ok(), &cwd)
    }

    /// [`load_from_env`](Self::load_from_env) with an explicit variable
    /// lookup and search root.
    pub fn load_with(
        lookup: &impl Fn(&str) -> Option<String>,
        search_root: &Path,
    ) -> anyhow::Result<(Self, VigilConfigSource)> {
        let (mut config, source) = Self::resolve(lookup, search_root)?;
        config.apply_env_overrides(lookup);
        debug!(source = ?source, "loaded vigil configuration");
        Ok((config, source))
    }

    /// Load an explicitly named file; environment overrides still apply.
    pub fn load_path(path: &Path) -> anyhow::Result<(Self, VigilConfigSource)> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides(&|key: &str| env::var(key).ok());
        Ok((config, VigilConfigSource::File(path.to_path_buf())))
    }

    fn resolve(
        lookup: &impl Fn(&str) -> Option<String>,
        search_root: &Path,
    ) -> anyhow::Result<(Self, VigilConfigSource)> {
        if let Some(path_str) = lookup("VIGIL_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str.trim());
            let config = Self::load_from_file(&path)?;
            return Ok((config, VigilConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup("VIGIL_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .context("failed to parse VIGIL_CONFIG_JSON")?;
            return Ok((parsed, VigilConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(search_root) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, VigilConfigSource::File(path)));
        }

        Ok((Self::default(), VigilConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read vigil config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid vigil config {}", path.display())
            }),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid vigil config {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse vigil config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid vigil config json: {err}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to render vigil config")
    }

    fn find_default_file(root: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file())
    }
}
