use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "conflux/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SITE_COMMAND: &str = "pelican";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluxConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub site: SiteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub url: Option<String>,
    pub space: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportSection {
    #[serde(default = "enabled")]
    pub convert_to_index_html: bool,
    #[serde(default = "enabled")]
    pub remove_pages_from_url: bool,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            convert_to_index_html: true,
            remove_pages_from_url: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Connection settings for the content source once every required key is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub url: String,
    pub space: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl ConfluxConfig {
    /// Resolve the content source base URL: env CONFLUX_URL > config.
    pub fn source_url(&self) -> Option<String> {
        env_override("CONFLUX_URL").or_else(|| self.source.url.clone())
    }

    /// Resolve the space key: env CONFLUX_SPACE > config.
    pub fn space(&self) -> Option<String> {
        env_override("CONFLUX_SPACE").or_else(|| self.source.space.clone())
    }

    pub fn username(&self) -> Option<String> {
        env_override("CONFLUX_USERNAME").or_else(|| self.source.username.clone())
    }

    pub fn password(&self) -> Option<String> {
        env_override("CONFLUX_PASSWORD").or_else(|| self.source.password.clone())
    }

    /// Resolve user agent: env CONFLUX_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("CONFLUX_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.source.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn site_command(&self) -> &str {
        self.site
            .command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .unwrap_or(DEFAULT_SITE_COMMAND)
    }

    /// Collect everything the fetch stage needs, failing with the full list of missing keys.
    pub fn source_settings(&self) -> Result<SourceSettings> {
        let url = self.source_url();
        let space = self.space();
        let username = self.username();
        let password = self.password();

        let mut missing = Vec::new();
        if url.is_none() {
            missing.push("source.url (or CONFLUX_URL)");
        }
        if space.is_none() {
            missing.push("source.space (or CONFLUX_SPACE)");
        }
        if username.is_none() {
            missing.push("source.username (or CONFLUX_USERNAME)");
        }
        if password.is_none() {
            missing.push("source.password (or CONFLUX_PASSWORD)");
        }
        if !missing.is_empty() {
            bail!(
                "content source is not configured; missing:\n  - {}",
                missing.join("\n  - ")
            );
        }

        Ok(SourceSettings {
            url: url.unwrap_or_default(),
            space: space.unwrap_or_default(),
            username: username.unwrap_or_default(),
            password: password.unwrap_or_default(),
            user_agent: self.user_agent(),
            timeout_ms: self.timeout_ms(),
        })
    }
}

/// Load and parse a ConfluxConfig from a TOML file.
pub fn load_config(config_path: &Path) -> Result<ConfluxConfig> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ConfluxConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Default file written by `--create`; the source values are placeholders to edit.
pub fn render_default_config() -> String {
    format!(
        "# conflux configuration (materialized by `conflux --create`)\n# Every [source] key can be overridden with CONFLUX_URL, CONFLUX_SPACE,\n# CONFLUX_USERNAME, CONFLUX_PASSWORD and CONFLUX_USER_AGENT.\n\n[source]\nurl = \"https://conf.example.com/\"\nspace = \"HOME\"\nusername = \"admin\"\npassword = \"hunter2\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n# timeout_ms = {DEFAULT_TIMEOUT_MS}\n\n[export]\nconvert_to_index_html = true\nremove_pages_from_url = true\n\n[site]\ncommand = \"{DEFAULT_SITE_COMMAND}\"\n# args = [\"-s\", \"{{data_dir}}/pelicanconf.py\"]\n"
    )
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn enabled() -> bool {
    true
}
