//! Per-run working directory.
//!
//! ```text
//! <workspaces_dir>/<id>/
//!   src/              unpacked archive, mounted at /workspace
//!   logs.txt          captured stdout/stderr
//!   analytics.db      metrics store
//!   run.env           container secrets, owner-only
//!   Containerfile     generated image definition (only when src/ has none)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hgr_types::{HangarError, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::archive::unpack_archive;
use crate::mount_security::CONTAINER_WORKDIR;

pub const LOGS_FILE: &str = "logs.txt";
pub const ANALYTICS_FILE: &str = "analytics.db";
pub const ENV_FILE: &str = "run.env";

/// Image definition names looked up at the root of the unpacked archive.
const DEFINITION_NAMES: [&str; 2] = ["Containerfile", "Dockerfile"];

#[derive(Debug, Clone)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace for `id` under `base`, replacing leftovers
    /// from an interrupted earlier run.
    pub async fn prepare(base: &Path, id: Uuid) -> Result<Self> {
        let root = base.join(id.to_string());
        if tokio::fs::try_exists(&root).await? {
            debug!(%id, "Removing stale workspace");
            tokio::fs::remove_dir_all(&root).await?;
        }

        let ws = Self { id, root };
        tokio::fs::create_dir_all(ws.source_dir()).await.map_err(|e| {
            HangarError::Container(format!(
                "Failed to create workspace {}: {e}",
                ws.root.display()
            ))
        })?;
        tokio::fs::write(ws.logs_path(), b"").await?;
        info!(%id, path = %ws.root.display(), "Workspace prepared");
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.root.join(LOGS_FILE)
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.root.join(ANALYTICS_FILE)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.root.join(ENV_FILE)
    }

    /// Write `vars` as a `KEY=VALUE` env file readable only by the daemon's
    /// user. Values may not span lines.
    pub async fn write_env_file(&self, vars: &BTreeMap<String, String>) -> Result<PathBuf> {
        let mut body = String::new();
        for (key, value) in vars {
            if key.contains(['=', '\n']) || value.contains(['\n', '\r']) {
                return Err(HangarError::Security(format!(
                    "Environment variable {key:?} cannot be written to an env file"
                )));
            }
            body.push_str(&format!("{key}={value}\n"));
        }

        let path = self.env_file_path();
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        debug!(id = %self.id, vars = vars.len(), "Env file written");
        Ok(path)
    }

    /// Unpack the workload archive into `src/` on the blocking pool.
    pub async fn unpack(&self, archive: &Path) -> Result<u64> {
        let archive = archive.to_path_buf();
        let dest = self.source_dir();
        tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest))
            .await
            .map_err(|e| HangarError::Other(format!("Unpack task failed: {e}")))?
    }

    /// Path of the image definition for this run.
    ///
    /// A `Containerfile` or `Dockerfile` shipped at the archive root wins;
    /// otherwise a minimal one based on `base_image` is generated next to
    /// `src/` so the build context stays untouched.
    pub async fn image_definition(&self, base_image: &str) -> Result<PathBuf> {
        let src = self.source_dir();
        for name in DEFINITION_NAMES {
            let candidate = src.join(name);
            if tokio::fs::try_exists(&candidate).await? {
                debug!(id = %self.id, file = name, "Using bundled image definition");
                return Ok(candidate);
            }
        }

        let generated = self.root.join("Containerfile");
        tokio::fs::write(&generated, default_definition(base_image)).await?;
        debug!(id = %self.id, base_image, "Generated image definition");
        Ok(generated)
    }

    pub async fn read_logs(&self) -> Result<Vec<u8>> {
        read_or_empty(&self.logs_path()).await
    }

    pub async fn read_analytics(&self) -> Result<Vec<u8>> {
        read_or_empty(&self.analytics_path()).await
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(id = %self.id, "Workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HangarError::Container(format!(
                "Failed to remove workspace {}: {e}",
                self.root.display()
            ))),
        }
    }
}

fn default_definition(base_image: &str) -> String {
    format!("FROM {base_image}\nWORKDIR {CONTAINER_WORKDIR}\n")
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::pack_directory;

    #[tokio::test]
    async fn prepare_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let ws = Workspace::prepare(tmp.path(), id).await.unwrap();

        assert_eq!(ws.path(), tmp.path().join(id.to_string()));
        assert!(ws.source_dir().is_dir());
        assert!(ws.logs_path().is_file());
        assert!(ws.read_logs().await.unwrap().is_empty());
        assert!(ws.read_analytics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prepare_replaces_stale_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let stale = tmp.path().join(id.to_string()).join("src/old.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        Workspace::prepare(tmp.path(), id).await.unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn bundled_definition_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(project.join("main.wasm"), b"\0asm").unwrap();
        let archive = tmp.path().join("archive.tar.gz");
        std::fs::write(&archive, pack_directory(&project).unwrap()).unwrap();

        let ws = Workspace::prepare(&tmp.path().join("ws"), Uuid::new_v4())
            .await
            .unwrap();
        ws.unpack(&archive).await.unwrap();

        let def = ws.image_definition("debian:bookworm-slim").await.unwrap();
        assert_eq!(def, ws.source_dir().join("Dockerfile"));
    }

    #[tokio::test]
    async fn default_definition_is_generated() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::prepare(tmp.path(), Uuid::new_v4()).await.unwrap();

        let def = ws.image_definition("debian:bookworm-slim").await.unwrap();
        assert_eq!(def, ws.path().join("Containerfile"));
        let body = std::fs::read_to_string(def).unwrap();
        assert_eq!(body, "FROM debian:bookworm-slim\nWORKDIR /workspace\n");
    }

    #[tokio::test]
    async fn env_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::prepare(tmp.path(), Uuid::new_v4()).await.unwrap();
        let vars = BTreeMap::from([("HANGAR_TOKEN".to_string(), "tok-123".to_string())]);

        let path = ws.write_env_file(&vars).await.unwrap();
        assert_eq!(path, ws.env_file_path());
        assert!(!path.starts_with(ws.source_dir()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "HANGAR_TOKEN=tok-123\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn env_file_rejects_multiline_values() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::prepare(tmp.path(), Uuid::new_v4()).await.unwrap();
        let vars = BTreeMap::from([("HANGAR_TOKEN".to_string(), "a\nEVIL=1".to_string())]);

        let err = ws.write_env_file(&vars).await.unwrap_err();
        assert!(matches!(err, HangarError::Security(_)));
        assert!(!ws.env_file_path().exists());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::prepare(tmp.path(), Uuid::new_v4()).await.unwrap();
        ws.remove().await.unwrap();
        assert!(!ws.path().exists());
        ws.remove().await.unwrap();
    }
}
