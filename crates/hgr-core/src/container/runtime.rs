use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use hgr_types::{Limits, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::mount_security::MountSpec;

/// A bidirectional byte stream attached to an exec session.
pub trait ExecIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ExecIo for T {}

pub type ExecStream = Box<dyn ExecIo>;

/// Image to build for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub tag: String,
    /// Containerfile/Dockerfile path.
    pub definition: PathBuf,
    /// Build context directory.
    pub context: PathBuf,
}

/// A long-lived container the workload is exec'd into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Plain environment, passed on the command line.
    pub env: BTreeMap<String, String>,
    /// Variables read from a file instead, for values that must not show up
    /// in argv or logs.
    pub env_file: Option<PathBuf>,
    pub mounts: Vec<MountSpec>,
    pub limits: Limits,
    pub network: String,
}

/// Command to run inside an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub attach_stdin: bool,
    pub tty: bool,
}

/// What the runtime reports about an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Operations the execution protocol needs from a container runtime.
///
/// `inspect_exec` returns [`hgr_types::HangarError::NotFound`] once the
/// runtime has forgotten the session.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    async fn build_image(&self, spec: &BuildSpec) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Start the container in the background.
    async fn run_detached(&self, spec: &RunSpec) -> Result<()>;

    /// Create an exec session and return its id.
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String>;

    /// Start the session and hand back its raw stream. With `tty == false`
    /// the output side is multiplexed (see [`crate::container::demux`]).
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecStream>;

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState>;

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;
}
