//! Resolution of user-supplied directory paths.

use std::path::{Component, Path, PathBuf};

/// Pseudo-filesystems the agent may never be rooted in.
const DISALLOWED_PREFIXES: &[&str] = &["/proc", "/sys", "/dev"];

/// Outcome of interpreting a user turn as a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCandidate {
    /// The text is not shaped like a path at all.
    NotPath,
    /// Path-shaped, but not a usable directory. Carries the trimmed text.
    Invalid(String),
    /// An existing directory, symlinks resolved where possible.
    Directory(PathBuf),
}

/// Interpret `text` as a working directory.
///
/// The trimmed text is tilde-expanded, must be absolute, is normalized
/// lexically (`.` dropped, `..` popped but never above `/`), must not fall
/// under a disallowed prefix either before or after following symlinks,
/// and must name an existing directory.
pub fn resolve_directory(text: &str) -> PathCandidate {
    let trimmed = text.trim();
    if !looks_like_path(trimmed) {
        return PathCandidate::NotPath;
    }
    let invalid = || PathCandidate::Invalid(trimmed.to_string());

    let expanded = shellexpand::tilde(trimmed).to_string();
    let path = Path::new(&expanded);
    if !path.is_absolute() {
        return invalid();
    }

    let normalized = normalize(path);
    if is_disallowed(&normalized) {
        return invalid();
    }

    let real = std::fs::canonicalize(&normalized).unwrap_or(normalized);
    if is_disallowed(&real) || !real.is_dir() {
        return invalid();
    }

    PathCandidate::Directory(real)
}

fn looks_like_path(text: &str) -> bool {
    !text.is_empty() && !text.contains('\n') && (text.starts_with('/') || text.starts_with('~'))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn is_disallowed(path: &Path) -> bool {
    DISALLOWED_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}
