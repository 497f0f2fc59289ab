//! Container runtime boundary.
//!
//! The [`ContainerRuntime`] trait is everything the harness needs from a
//! container engine. [`DockerCli`] drives the `docker` binary; tests use a
//! scripted fake from `test_support`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::error::ForgeError;
use crate::io::process::{run_command_with_stream, run_command_with_timeout};

/// One line of build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Log(String),
    /// The build stopped; no image was produced.
    Error(String),
}

/// Parameters for an image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    pub tag: String,
    /// Passed as `--build-arg`; values never reach the command line.
    pub build_args: Vec<(String, String)>,
    /// Live build log.
    pub log_path: PathBuf,
    pub timeout: Duration,
}

/// Result of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait ContainerRuntime {
    /// Build `request.tag`. A failed build is reported through a
    /// [`BuildEvent::Error`], not an `Err`; `Err` means the runtime itself failed.
    fn build_image(&self, request: &BuildRequest) -> Result<Vec<BuildEvent>>;

    fn remove_image(&self, image: &str) -> Result<()>;

    /// Create a keep-alive container running as root. Returns its id.
    fn create_container(&self, image: &str, name: &str) -> Result<String>;

    fn start_container(&self, container: &str) -> Result<()>;

    fn stop_container(&self, container: &str) -> Result<()>;

    fn remove_container(&self, container: &str) -> Result<()>;

    /// Run a shell command in `workdir` with a wall-clock timeout.
    fn exec(&self, container: &str, command: &str, workdir: &str, timeout: Duration)
    -> Result<ExecOutput>;

    fn copy_into(&self, container: &str, local: &Path, dest: &str) -> Result<()>;
}

/// Runtime backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    platform: String,
    output_limit_bytes: usize,
}

const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

impl DockerCli {
    pub fn new(binary: impl Into<String>, platform: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            binary: binary.into(),
            platform: platform.into(),
            output_limit_bytes,
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Run a short control command and fail on non-zero exit.
    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, CONTROL_TIMEOUT, self.output_limit_bytes)
            .with_context(|| format!("run {} {}", self.binary, args.join(" ")))?;
        if output.timed_out {
            return Err(ForgeError::timeout(format!("docker {}", args.join(" ")), CONTROL_TIMEOUT).into());
        }
        if !output.status.success() {
            return Err(anyhow!(
                "docker {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout_lossy())
    }
}

impl ContainerRuntime for DockerCli {
    #[instrument(skip_all, fields(tag = %request.tag))]
    fn build_image(&self, request: &BuildRequest) -> Result<Vec<BuildEvent>> {
        info!(context = %request.context_dir.display(), "building image");
        let mut cmd = self.command();
        cmd.arg("build")
            .arg("--progress=plain")
            .arg("--platform")
            .arg(&self.platform)
            .arg("-t")
            .arg(&request.tag);
        for (key, value) in &request.build_args {
            // `--build-arg KEY` reads the value from the client environment.
            cmd.arg("--build-arg").arg(key).env(key, value);
        }
        cmd.arg(&request.context_dir);

        let output = run_command_with_stream(
            cmd,
            None,
            request.timeout,
            self.output_limit_bytes,
            &request.log_path,
        )
        .context("run docker build")?;
        if output.timed_out {
            return Err(ForgeError::timeout("docker build", request.timeout).into());
        }

        let mut events: Vec<BuildEvent> = output
            .combined_lossy()
            .lines()
            .map(|line| BuildEvent::Log(line.to_string()))
            .collect();
        if !output.status.success() {
            let last = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("docker build failed")
                .to_string();
            warn!(exit_code = ?output.status.code(), error = %last, "image build failed");
            events.push(BuildEvent::Error(last));
        }
        Ok(events)
    }

    fn remove_image(&self, image: &str) -> Result<()> {
        debug!(image, "removing image");
        self.run_checked(&["rmi", "-f", image]).map(|_| ())
    }

    fn create_container(&self, image: &str, name: &str) -> Result<String> {
        let id = self.run_checked(&[
            "create",
            "--platform",
            &self.platform,
            "--name",
            name,
            "--user",
            "root",
            image,
            "tail",
            "-f",
            "/dev/null",
        ])?;
        Ok(id.trim().to_string())
    }

    fn start_container(&self, container: &str) -> Result<()> {
        self.run_checked(&["start", container]).map(|_| ())
    }

    fn stop_container(&self, container: &str) -> Result<()> {
        self.run_checked(&["stop", "-t", "5", container]).map(|_| ())
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.run_checked(&["rm", "-f", container]).map(|_| ())
    }

    #[instrument(skip_all, fields(container = %container, timeout_secs = timeout.as_secs()))]
    fn exec(
        &self,
        container: &str,
        command: &str,
        workdir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        debug!(command, "docker exec");
        let mut cmd = self.command();
        cmd.args(["exec", "-w", workdir, container, "/bin/bash", "-c", command]);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .context("run docker exec")?;
        Ok(ExecOutput {
            exit_code: output.exit_code(),
            output: output.combined_lossy(),
            timed_out: output.timed_out,
        })
    }

    fn copy_into(&self, container: &str, local: &Path, dest: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let target = format!("{container}:{dest}");
        self.run_checked(&["cp", &local, &target]).map(|_| ())
    }
}
