//! gzip+tar packing of workload sources.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hgr_types::{HangarError, Result};
use tar::EntryType;
use tracing::{debug, warn};

use crate::security::archive_entry_path;

/// Pack the contents of `dir` (not the directory itself) as `.tar.gz` bytes.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(HangarError::Other(format!(
            "Not a directory: {}",
            dir.display()
        )));
    }

    let mut tar = tar::Builder::new(Vec::new());
    tar.follow_symlinks(false);
    tar.append_dir_all(".", dir)
        .map_err(|e| HangarError::Other(format!("Failed to archive {}: {e}", dir.display())))?;
    let uncompressed = tar
        .into_inner()
        .map_err(|e| HangarError::Other(format!("Failed to finish archive: {e}")))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&uncompressed)?;
    Ok(gz.finish()?)
}

/// Extract a `.tar.gz` file into `dest`.
///
/// Entries with absolute paths or `..` components fail the whole unpack.
/// Links and special files are skipped.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<u64> {
    let file = File::open(archive).map_err(|e| {
        HangarError::Other(format!("Failed to open {}: {e}", archive.display()))
    })?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = tar
        .entries()
        .map_err(|e| HangarError::Other(format!("Corrupt archive: {e}")))?;

    let mut count = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| HangarError::Other(format!("Corrupt archive: {e}")))?;
        let raw = entry
            .path()
            .map_err(|e| HangarError::Other(format!("Bad entry path: {e}")))?
            .into_owned();
        let rel = archive_entry_path(&raw)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => std::fs::create_dir_all(&target)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| HangarError::Other(format!("Failed to unpack {}: {e}", rel.display())))?;
                count += 1;
            }
            other => warn!(entry = %rel.display(), kind = ?other, "Skipping archive entry"),
        }
    }

    debug!(files = count, dest = %dest.display(), "Archive unpacked");
    Ok(count)
}
