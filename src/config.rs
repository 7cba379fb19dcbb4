use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub const DEFAULT_REGISTRY_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_WEBSERVER_PORT: u16 = 8080;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub registry: Registry,
    pub concurrency: Concurrency,
    /// Glob patterns matched against the raw image string
    pub ignore_images: Vec<String>,
    pub output: OutputFormat,
    /// Cron expression; when absent the audit runs once and the process exits
    pub schedule: Option<String>,
    pub webserver: Webserver,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Registry {
    pub timeout_seconds: u64,
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_REGISTRY_TIMEOUT_SECONDS,
            ca_certificate_paths: Vec::new(),
        }
    }
}

impl Registry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Concurrency(pub usize);

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency(DEFAULT_CONCURRENCY)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Report through the log only
    #[default]
    Log,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: DEFAULT_WEBSERVER_PORT,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.concurrency.0 == 0 {
        anyhow::bail!("concurrency must be at least 1");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
