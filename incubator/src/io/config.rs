//! Pipeline configuration stored in `incubator.toml`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fsutil::write_atomic;

/// Upper bound on a provider's own retry attempts.
pub const MAX_PROVIDER_ATTEMPTS: u32 = 10;

static PROVIDER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("provider name pattern should be valid"));

/// Pipeline configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below. A snapshot is
/// written into every run directory so `resume` uses the same settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum participant tasks in flight at once.
    pub concurrency: usize,

    /// Attempts per structured call before the participant fails.
    pub retry_max: u32,

    /// Maximum stage-2 review/iterate rounds per founder.
    pub max_iterations: u32,

    pub ideas_per_provider: u32,

    /// Restrict idea generation to one sector (e.g. `"fintech"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_focus: Option<String>,

    /// Parent directory for new run directories.
    pub out_dir: PathBuf,

    /// Failure reasons longer than this many characters are truncated.
    pub failure_reason_limit: usize,

    /// Average advisor readiness needed to stop iterating.
    pub convergence_score: f64,

    /// Drop undeclared fields from model output before validation.
    pub strip_unknown_fields: bool,

    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic canned responses.
    Mock,
    /// External program reading the prompt on stdin.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Unique name; used as participant id and in file names.
    pub name: String,
    pub kind: ProviderKind,
    /// Program and arguments for `kind = "command"` (e.g. `["llm","-m","gpt-4o"]`).
    pub command: Vec<String>,
    /// The endpoint enforces JSON output itself, so malformed output is not retried.
    pub native_json: bool,
    pub timeout_secs: u64,
    /// Attempts for transient failures (non-zero exit, timeout).
    pub max_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ProviderKind::Mock,
            command: Vec::new(),
            native_json: false,
            timeout_secs: 600,
            max_attempts: 3,
        }
    }
}

impl ProviderConfig {
    pub fn mock(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_max: 3,
            max_iterations: 3,
            ideas_per_provider: 5,
            sector_focus: None,
            out_dir: PathBuf::from("out"),
            failure_reason_limit: 500,
            convergence_score: 7.0,
            strip_unknown_fields: false,
            providers: ["openai", "anthropic", "deepseek", "gemini"]
                .into_iter()
                .map(ProviderConfig::mock)
                .collect(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be > 0"));
        }
        if self.retry_max == 0 {
            return Err(anyhow!("retry_max must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.ideas_per_provider == 0 {
            return Err(anyhow!("ideas_per_provider must be > 0"));
        }
        if self.failure_reason_limit == 0 {
            return Err(anyhow!("failure_reason_limit must be > 0"));
        }
        if !(1.0..=10.0).contains(&self.convergence_score) {
            return Err(anyhow!("convergence_score must be within 1..=10"));
        }
        if self.providers.len() < 2 {
            return Err(anyhow!(
                "at least 2 providers are required so every founder has a reviewer"
            ));
        }
        let mut names = BTreeSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(anyhow!("duplicate provider name {}", provider.name));
            }
        }
        Ok(())
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if !PROVIDER_NAME.is_match(&self.name) {
            return Err(anyhow!(
                "provider name {:?} must be non-empty and use only letters, digits, '-' or '_'",
                self.name
            ));
        }
        if self.kind == ProviderKind::Command
            && self.command.first().is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "provider {}: command must be a non-empty array",
                self.name
            ));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("provider {}: timeout_secs must be > 0", self.name));
        }
        if !(1..=MAX_PROVIDER_ATTEMPTS).contains(&self.max_attempts) {
            return Err(anyhow!(
                "provider {}: max_attempts must be between 1 and {MAX_PROVIDER_ATTEMPTS}",
                self.name
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
