//! Reload triggers from configuration files on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hgr_types::{HangarError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

type Listener = Box<dyn Fn(&Path) + Send + Sync + 'static>;
type Listeners = Arc<Mutex<Vec<Listener>>>;

/// Watches a fixed set of configuration files and tells listeners which one
/// changed.
///
/// Editors usually replace a file instead of writing it in place, so the
/// parent directories are watched and events are matched back to the files.
/// Nothing is reloaded here; the daemon's listener asks the scheduler loop to
/// stop with a reload cause.
pub struct ConfigWatcher {
    files: Vec<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    listeners: Listeners,
}

impl ConfigWatcher {
    /// Watch `.env` in the working directory, if there is one.
    pub fn new() -> Self {
        let env_file = PathBuf::from(".env");
        let files = if env_file.is_file() {
            vec![env_file]
        } else {
            Vec::new()
        };
        Self::for_files(files)
    }

    /// Watch exactly `files`. Relative paths resolve against the working
    /// directory now, not when events arrive.
    pub fn for_files(files: Vec<PathBuf>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_default();
        let mut files: Vec<PathBuf> = files
            .into_iter()
            .map(|f| if f.is_absolute() { f } else { cwd.join(f) })
            .collect();
        files.sort();
        files.dedup();
        Self {
            files,
            watcher: None,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Register a listener; it receives the path of the changed file.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Start watching. With no files to watch this is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        if self.files.is_empty() {
            info!("No configuration files to watch");
            return Ok(());
        }

        let files = self.files.clone();
        let listeners = Arc::clone(&self.listeners);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Config watch error");
                    return;
                }
            };
            let Some(path) = changed_file(&event, &files) else {
                return;
            };
            info!(file = %path.display(), "Configuration file changed");
            if let Ok(listeners) = listeners.lock() {
                for listener in listeners.iter() {
                    listener(path);
                }
            }
        })
        .map_err(|e| HangarError::Config(format!("Failed to create watcher: {e}")))?;

        let mut dirs: Vec<PathBuf> = self.files.iter().map(|f| parent_dir(f)).collect();
        dirs.sort();
        dirs.dedup();
        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive).map_err(|e| {
                HangarError::Config(format!("Failed to watch {}: {e}", dir.display()))
            })?;
            debug!(dir = %dir.display(), "Watching config directory");
        }

        info!(files = self.files.len(), "Config watcher started");
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            debug!("Config watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Default for ConfigWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// The watched file an event touches, ignoring pure reads.
fn changed_file<'a>(event: &Event, files: &'a [PathBuf]) -> Option<&'a Path> {
    if matches!(event.kind, EventKind::Access(_)) {
        return None;
    }
    files
        .iter()
        .find(|f| event.paths.iter().any(|p| p == *f))
        .map(PathBuf::as_path)
}
