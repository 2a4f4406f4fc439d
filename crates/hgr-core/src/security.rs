use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use hgr_types::{HangarError, Result};
use regex::Regex;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\-.]").expect("static pattern"))
}

/// Reduce an arbitrary name to a single safe file name component.
///
/// Directory components are dropped, and anything outside word characters,
/// hyphens and dots is removed. Returns `None` when nothing usable remains.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut sanitized = unsafe_chars().replace_all(&name, "").to_string();
    if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized.truncate(end);
    }

    match sanitized.as_str() {
        "" | "." | ".." => None,
        _ => Some(sanitized),
    }
}

/// Returns true if path traversal is detected.
pub fn check_path_traversal(path: &str) -> bool {
    path.contains("..") || path.contains('\0')
}

/// Validate a path taken from an archive entry and return it relative to the
/// extraction root. Absolute paths and `..` components are rejected.
pub fn archive_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(HangarError::Security(format!(
                    "Unsafe archive entry: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}
