use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::ConfluxConfig;
use crate::runtime::{ResolvedPaths, normalize_for_display};

/// Replaced with the data directory in configured generator arguments.
pub const DATA_DIR_PLACEHOLDER: &str = "{data_dir}";

#[derive(Debug, Clone)]
pub struct SiteBuildReport {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub elapsed: Duration,
}

/// Arguments passed to the site generator. Without configured arguments the
/// generator is pointed at the settings module in the data directory.
pub fn site_args(config: &ConfluxConfig, paths: &ResolvedPaths) -> Vec<String> {
    if config.site.args.is_empty() {
        return vec![
            "-s".to_string(),
            normalize_for_display(&paths.site_config_path),
        ];
    }
    let data_dir = normalize_for_display(&paths.data_dir);
    config
        .site
        .args
        .iter()
        .map(|arg| arg.replace(DATA_DIR_PLACEHOLDER, &data_dir))
        .collect()
}

/// Run the configured site generator from the data directory.
pub fn build_site(paths: &ResolvedPaths, config: &ConfluxConfig) -> Result<SiteBuildReport> {
    let command = config.site_command();
    let program = which::which(command)
        .with_context(|| format!("site generator `{command}` was not found on PATH"))?;
    if config.site.args.is_empty() && !paths.site_config_path.is_file() {
        warn!(
            "site settings not found at {}",
            normalize_for_display(&paths.site_config_path)
        );
    }

    let args = site_args(config, paths);
    info!(program = %program.display(), args = ?args, "building site");
    let started = Instant::now();
    let status = Command::new(&program)
        .args(&args)
        .current_dir(&paths.data_dir)
        .status()
        .with_context(|| format!("failed to run {}", program.display()))?;
    if !status.success() {
        bail!("site generator {} exited with {status}", program.display());
    }

    Ok(SiteBuildReport {
        program,
        args,
        elapsed: started.elapsed(),
    })
}
