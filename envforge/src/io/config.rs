//! Workflow configuration (`envforge.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Workflow configuration (TOML).
///
/// Missing fields take the defaults below, so an absent file is a valid
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// Outer orchestration rounds before giving up.
    pub max_iterations: u32,

    /// Re-prompts per stage when generator output cannot be extracted.
    pub stage_retries: u32,

    /// Critique/refine rounds the test writer runs on its own patch.
    pub test_reflexion_rounds: u32,

    /// Tool-call rounds the context collector may spend exploring the repo.
    pub context_rounds: u32,

    pub eval_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub generator_timeout_secs: u64,

    /// Bytes of child process output kept in memory.
    pub output_limit_bytes: usize,

    /// Line budget for build and test logs shown to the analyzer.
    pub log_max_lines: usize,

    pub memory_lock_timeout_secs: u64,

    /// Skip consulting prior successful runs.
    pub disable_memory_pool: bool,

    /// Skip building and running containers; the analyzer judges artifacts alone.
    pub disable_run_test: bool,

    /// Skip fetching binary test resources the test patch cannot carry.
    pub disable_download_test_resources: bool,

    /// Directory holding `results.json`.
    pub results_path: PathBuf,

    pub generator: GeneratorConfig,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a rendered conversation on stdin and prints a reply.
    pub command: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
    pub platform: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            platform: "linux/x86_64".to_string(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stage_retries: 3,
            test_reflexion_rounds: 2,
            context_rounds: 10,
            eval_timeout_secs: 60 * 60,
            build_timeout_secs: 60 * 60,
            generator_timeout_secs: 10 * 60,
            output_limit_bytes: 2_000_000,
            log_max_lines: 600,
            memory_lock_timeout_secs: 30,
            disable_memory_pool: false,
            disable_run_test: false,
            disable_download_test_resources: false,
            results_path: PathBuf::from("results"),
            generator: GeneratorConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.stage_retries == 0 {
            return Err(anyhow!("stage_retries must be > 0"));
        }
        if self.eval_timeout_secs == 0 || self.build_timeout_secs == 0 {
            return Err(anyhow!("eval_timeout_secs and build_timeout_secs must be > 0"));
        }
        if self.generator_timeout_secs == 0 {
            return Err(anyhow!("generator_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.log_max_lines < 2 {
            return Err(anyhow!("log_max_lines must be >= 2"));
        }
        if self.memory_lock_timeout_secs == 0 {
            return Err(anyhow!("memory_lock_timeout_secs must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.docker.binary.trim().is_empty() {
            return Err(anyhow!("docker.binary must not be empty"));
        }
        Ok(())
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn memory_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.memory_lock_timeout_secs)
    }

    pub fn live_execution(&self) -> bool {
        !self.disable_run_test
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForgeConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("envforge.toml");
        let cfg = ForgeConfig {
            max_iterations: 2,
            disable_run_test: true,
            ..ForgeConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("envforge.toml");
        fs::write(&path, "max_iterations = 7\n[docker]\nplatform = \"linux/arm64\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.docker.platform, "linux/arm64");
        assert_eq!(cfg.docker.binary, "docker");
        assert_eq!(cfg.stage_retries, 3);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let cfg = ForgeConfig {
            max_iterations: 0,
            ..ForgeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
