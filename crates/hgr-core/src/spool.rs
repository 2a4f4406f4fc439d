//! Crash-safe persistent queue of workloads.
//!
//! The spool root holds three sibling directories, `downloading/`, `queued/`
//! and `running/`. A workload is a subdirectory named by its id that lives in
//! exactly one of them; moving between them is a single `rename`, which is
//! only atomic when all three share a filesystem. [`Spool::open`] checks that.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hgr_types::{HangarError, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::security::sanitize_filename;

pub const ARCHIVE_FILE: &str = "archive.tar.gz";
pub const METADATA_FILE: &str = "metadata.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// One of the three spool directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Downloading,
    Queued,
    Running,
}

impl Location {
    pub const ALL: [Location; 3] = [Self::Downloading, Self::Queued, Self::Running];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Queued => "queued",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A workload directory handed out by [`Spool::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    pub id: Uuid,
    pub path: PathBuf,
}

impl SpoolEntry {
    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.path.join(CREDENTIALS_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    /// Open the spool at `root`, creating the three directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let spool = Self { root: root.into() };
        for location in Location::ALL {
            let dir = spool.dir(location);
            std::fs::create_dir_all(&dir).map_err(|e| {
                HangarError::Spool(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        spool.check_same_filesystem()?;
        debug!(root = %spool.root.display(), "Spool opened");
        Ok(spool)
    }

    #[cfg(unix)]
    fn check_same_filesystem(&self) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let mut device = None;
        for location in Location::ALL {
            let dir = self.dir(location);
            let dev = std::fs::metadata(&dir)
                .map_err(|e| HangarError::Spool(format!("Failed to stat {}: {e}", dir.display())))?
                .dev();
            match device {
                None => device = Some(dev),
                Some(first) if first != dev => {
                    return Err(HangarError::Spool(format!(
                        "{} is on a different filesystem than the rest of the spool",
                        dir.display()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_same_filesystem(&self) -> Result<()> {
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, location: Location) -> PathBuf {
        self.root.join(location.dir_name())
    }

    pub fn entry_path(&self, location: Location, id: Uuid) -> PathBuf {
        self.dir(location).join(id.to_string())
    }

    /// Write `content` as file `name` under `downloading/<id>/`.
    pub async fn download(&self, id: Uuid, name: &str, content: &[u8]) -> Result<PathBuf> {
        let name = sanitize_filename(name)
            .ok_or_else(|| HangarError::Security(format!("Invalid spool file name: {name:?}")))?;
        let dir = self.entry_path(Location::Downloading, id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HangarError::Spool(format!("Failed to create {}: {e}", dir.display())))?;

        let path = dir.join(&name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| HangarError::Spool(format!("Failed to write {}: {e}", path.display())))?;
        debug!(%id, file = %name, bytes = content.len(), "Spool file downloaded");
        Ok(path)
    }

    /// Move a finished download into the queue.
    pub async fn enqueue(&self, id: Uuid) -> Result<PathBuf> {
        let to = self.move_entry(id, Location::Downloading, Location::Queued).await?;
        info!(%id, "Workload queued");
        Ok(to)
    }

    /// Take one entry out of the queue and move it to `running/`.
    ///
    /// Pick order follows directory enumeration and is not insertion order.
    /// Returns `Ok(None)` immediately when the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<SpoolEntry>> {
        for id in self.list(Location::Queued).await? {
            match self.move_entry(id, Location::Queued, Location::Running).await {
                Ok(path) => {
                    info!(%id, "Workload dequeued");
                    return Ok(Some(SpoolEntry { id, path }));
                }
                Err(HangarError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Remove a finished workload from `running/`.
    pub async fn completed(&self, id: Uuid) -> Result<()> {
        let dir = self.entry_path(Location::Running, id);
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
            HangarError::Spool(format!("Failed to remove {}: {e}", dir.display()))
        })?;
        debug!(%id, "Spool entry removed");
        Ok(())
    }

    /// Drop a partial download. Missing entries are not an error.
    pub async fn abandon(&self, id: Uuid) -> Result<()> {
        let dir = self.entry_path(Location::Downloading, id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                warn!(%id, "Partial download abandoned");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HangarError::Spool(format!(
                "Failed to remove {}: {e}",
                dir.display()
            ))),
        }
    }

    /// Move everything left in `running/` back to `queued/`.
    ///
    /// If an id is somehow present in both, the queued copy is kept so the
    /// workload still appears exactly once.
    pub async fn recover(&self) -> Result<Vec<Uuid>> {
        let mut recovered = Vec::new();
        for id in self.list(Location::Running).await? {
            let queued = self.entry_path(Location::Queued, id);
            if tokio::fs::try_exists(&queued).await.unwrap_or(false) {
                warn!(%id, "Workload already queued, dropping running copy");
                self.completed(id).await?;
            } else {
                self.move_entry(id, Location::Running, Location::Queued)
                    .await?;
            }
            recovered.push(id);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted workloads");
        }
        Ok(recovered)
    }

    /// Ids of all entries in `location`. Names that are not ids are skipped.
    pub async fn list(&self, location: Location) -> Result<Vec<Uuid>> {
        let dir = self.dir(location);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| HangarError::Spool(format!("Failed to read {}: {e}", dir.display())))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HangarError::Spool(format!("Failed to read {}: {e}", dir.display())))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match Uuid::parse_str(&name) {
                Ok(id) => ids.push(id),
                Err(_) => debug!(%location, entry = %name, "Ignoring foreign spool entry"),
            }
        }
        Ok(ids)
    }

    /// Where `id` currently lives, if anywhere.
    pub async fn locate(&self, id: Uuid) -> Result<Option<Location>> {
        for location in Location::ALL {
            if tokio::fs::try_exists(self.entry_path(location, id)).await? {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    /// True when nothing is queued or running.
    pub async fn is_idle(&self) -> Result<bool> {
        Ok(self.list(Location::Queued).await?.is_empty()
            && self.list(Location::Running).await?.is_empty())
    }

    async fn move_entry(&self, id: Uuid, from: Location, to: Location) -> Result<PathBuf> {
        let src = self.entry_path(from, id);
        let dst = self.entry_path(to, id);
        if tokio::fs::try_exists(&dst).await? {
            return Err(HangarError::Spool(format!("{id} is already in {to}")));
        }
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Ok(dst),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(HangarError::NotFound(format!("{id} is not in {from}")))
            }
            Err(e) => Err(HangarError::Spool(format!(
                "Failed to move {id} from {from} to {to}: {e}"
            ))),
        }
    }
}
