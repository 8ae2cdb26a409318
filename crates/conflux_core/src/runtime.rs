use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{ConfluxConfig, load_config, render_default_config};

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const EXPORT_SETTINGS_FILENAME: &str = "per_export_settings.json";
pub const SITE_CONFIG_FILENAME: &str = "pelicanconf.py";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

/// Every on-disk location a run reads or writes, all derived from the data directory.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_dir: PathBuf,
    pub db_path: PathBuf,
    pub attachments_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub export_settings_path: PathBuf,
    pub site_config_path: PathBuf,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `data_dir` with the config file in its default place.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        let db_dir = data_dir.join("store_db");
        Self {
            config_path: data_dir.join(CONFIG_FILENAME),
            db_path: db_dir.join("store.sqlite"),
            db_dir,
            attachments_dir: data_dir.join("attachments"),
            exports_dir: data_dir.join("exports"),
            export_settings_path: data_dir.join(EXPORT_SETTINGS_FILENAME),
            site_config_path: data_dir.join(SITE_CONFIG_FILENAME),
            data_dir: data_dir.to_path_buf(),
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "data_dir={} ({})\nconfig_path={} ({})\ndb_path={}\nattachments_dir={}\nexports_dir={}\nexport_settings_path={}\nsite_config_path={}",
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.attachments_dir),
            normalize_for_display(&self.exports_dir),
            normalize_for_display(&self.export_settings_path),
            normalize_for_display(&self.site_config_path),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBootstrap {
    pub config: ConfluxConfig,
    pub created: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env("CONFLUX_DATA_DIR").filter(|v| !v.trim().is_empty()) {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (
            absolutize(Path::new(DEFAULT_DATA_DIR), &context.cwd),
            ValueSource::Default,
        )
    };

    let mut paths = ResolvedPaths::for_data_dir(&data_dir);
    paths.data_source = data_source;

    if let Some(path) = overrides.config.as_deref() {
        paths.config_path = absolutize(path, &context.cwd);
        paths.config_source = ValueSource::Flag;
    } else if let Some(value) = lookup_env("CONFLUX_CONFIG").filter(|v| !v.trim().is_empty()) {
        paths.config_path = absolutize(Path::new(value.trim()), &context.cwd);
        paths.config_source = ValueSource::Env;
    }

    Ok(paths)
}

/// Load the config file, creating it first when `create` is set.
/// A missing file without `create` is fatal and tells the user how to fix it.
pub fn bootstrap_config(paths: &ResolvedPaths, create: bool) -> Result<ConfigBootstrap> {
    if paths.config_path.exists() {
        return Ok(ConfigBootstrap {
            config: load_config(&paths.config_path)?,
            created: false,
        });
    }

    if !create {
        bail!(
            "{} does not exist, use --create to create file",
            normalize_for_display(&paths.config_path)
        );
    }

    fs::create_dir_all(&paths.data_dir)
        .with_context(|| format!("failed to create {}", paths.data_dir.display()))?;
    write_text_file(&paths.config_path, &render_default_config())?;
    Ok(ConfigBootstrap {
        config: load_config(&paths.config_path)?,
        created: true,
    })
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

pub(crate) fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
