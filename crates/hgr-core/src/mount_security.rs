use std::path::{Path, PathBuf};

use hgr_types::{HangarError, Result};

use crate::security::check_path_traversal;

/// Path of the embedded runtime binary inside every workload container.
pub const CONTAINER_RUNTIME_PATH: &str = "/usr/local/bin/hangar-runtime";

/// Working directory of the workload inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Mount permission mode for container volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn as_docker_flag(&self) -> &str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// A validated bind-mount specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl MountSpec {
    /// Validate and build a mount. Both sides must be absolute and free of
    /// traversal sequences.
    pub fn new(host_path: &Path, container_path: &str, mode: MountMode) -> Result<Self> {
        let host = host_path.to_string_lossy();
        if check_path_traversal(&host) || check_path_traversal(container_path) {
            return Err(HangarError::Security(format!(
                "Path traversal detected in mount: {host} -> {container_path}"
            )));
        }
        if !host_path.is_absolute() || !container_path.starts_with('/') {
            return Err(HangarError::Security(format!(
                "Mount paths must be absolute: {host} -> {container_path}"
            )));
        }
        Ok(Self {
            host_path: host_path.to_path_buf(),
            container_path: container_path.to_string(),
            mode,
        })
    }

    /// Format as a Docker `-v` argument value: `host:container:mode`.
    pub fn to_docker_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_docker_flag()
        )
    }
}

/// Mounts every workload container gets.
///
/// - `{workspace}/src`  → `/workspace` (rw)
/// - `{runtime_binary}` → [`CONTAINER_RUNTIME_PATH`] (ro)
pub fn workload_mounts(source_dir: &Path, runtime_binary: &Path) -> Result<Vec<MountSpec>> {
    Ok(vec![
        MountSpec::new(source_dir, CONTAINER_WORKDIR, MountMode::ReadWrite)?,
        MountSpec::new(runtime_binary, CONTAINER_RUNTIME_PATH, MountMode::ReadOnly)?,
    ])
}
