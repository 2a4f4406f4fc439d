use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use hgr_config::Config;
use hgr_types::{HangarError, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use super::engine::EngineClient;
use super::runtime::{BuildSpec, ContainerRuntime, ExecSpec, ExecState, ExecStream, RunSpec};

/// Docker-backed runtime: lifecycle through the `docker` CLI, exec sessions
/// through the Engine API socket.
pub struct DockerRuntime {
    docker_bin: String,
    engine: EngineClient,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<String>, engine: EngineClient) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            engine,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.docker_bin.clone(),
            EngineClient::new(config.docker_socket.clone()),
        )
    }

    /// Check that the CLI can reach a daemon.
    pub async fn check_available(&self) -> bool {
        match Command::new(&self.docker_bin)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        debug!(args = ?redact_env(args), "docker");
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HangarError::Container(format!("Failed to spawn {}: {e}", self.docker_bin)))
    }

    /// Run a command whose "missing object" failure is not an error.
    async fn docker_ignoring_missing(&self, args: &[String], missing: &str) -> Result<()> {
        let output = self.docker(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(missing) {
            return Ok(());
        }
        Err(HangarError::Container(format!(
            "docker {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )))
    }
}

/// `docker build` arguments (without the binary).
pub fn build_image_args(spec: &BuildSpec) -> Vec<String> {
    vec![
        "build".to_string(),
        "--tag".to_string(),
        spec.tag.clone(),
        "--file".to_string(),
        spec.definition.display().to_string(),
        spec.context.display().to_string(),
    ]
}

/// `docker run` arguments (without the binary) for an idle, detached
/// container the workload is exec'd into.
pub fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--init".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        format!("--network={}", spec.network),
    ];

    if spec.limits.cores > 0 {
        args.push(format!("--cpus={}", spec.limits.cores));
    }
    if spec.limits.memory > 0 {
        args.push(format!("--memory={}b", spec.limits.memory));
    }

    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.to_docker_arg());
    }

    for (k, v) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    if let Some(env_file) = &spec.env_file {
        args.push("--env-file".to_string());
        args.push(env_file.display().to_string());
    }

    // Keep the container alive; the workload arrives through exec.
    args.push("--entrypoint".to_string());
    args.push("sleep".to_string());
    args.push(spec.image.clone());
    args.push("infinity".to_string());

    args
}

/// Copy of `args` with the value of every `-e KEY=VALUE` replaced, for
/// logging.
pub fn redact_env(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut after_flag = false;
    for arg in args {
        if after_flag {
            let key = arg.split_once('=').map_or(arg.as_str(), |(k, _)| k);
            out.push(format!("{key}=[REDACTED]"));
        } else {
            out.push(arg.clone());
        }
        after_flag = arg == "-e";
    }
    out
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let output = self
            .docker(&["image".to_string(), "inspect".to_string(), tag.to_string()])
            .await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, spec: &BuildSpec) -> Result<()> {
        let output = self.docker(&build_image_args(spec)).await?;
        if output.status.success() {
            debug!(tag = %spec.tag, "Image built");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(HangarError::Container(format!(
            "image build for {} failed: {}",
            spec.tag,
            tail.join("\n")
        )))
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.docker_ignoring_missing(
            &["rmi".to_string(), "-f".to_string(), tag.to_string()],
            "No such image",
        )
        .await
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<()> {
        let output = self.docker(&build_run_args(spec)).await?;
        if output.status.success() {
            let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(name = %spec.name, container_id = %id, "Container running");
            return Ok(());
        }
        Err(HangarError::Container(format!(
            "docker run {} failed: {}",
            spec.name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        self.engine.create_exec(container, spec).await
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecStream> {
        self.engine.start_exec(exec_id, tty).await
    }

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        self.engine.resize_exec(exec_id, height, width).await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        self.engine.inspect_exec(exec_id).await
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()> {
        let result = self
            .docker_ignoring_missing(
                &[
                    "stop".to_string(),
                    "--time".to_string(),
                    timeout.as_secs().to_string(),
                    name.to_string(),
                ],
                "No such container",
            )
            .await;
        if let Err(e) = &result {
            warn!(name, error = %e, "Container stop warning");
        }
        result
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker_ignoring_missing(
            &["rm".to_string(), "-f".to_string(), name.to_string()],
            "No such container",
        )
        .await
    }
}
