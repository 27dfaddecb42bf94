use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("snapshot path is empty")]
    Empty,
    #[error("snapshot path contains unsupported component")]
    UnsupportedComponent,
}

pub fn local_path_for(local_root: &Path, snapshot_path: &str) -> Result<PathBuf, PathError> {
    if snapshot_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Snapshot paths are POSIX-like ("/Docs/A.txt"); map them under local_root.
    let mut out = local_root.to_path_buf();
    for component in Path::new(snapshot_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]: `/`-separated path relative to the root.
pub fn snapshot_path_for(local_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(local_root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            return None;
        };
        out.push('/');
        out.push_str(&part.to_string_lossy());
    }
    (!out.is_empty()).then_some(out)
}

/// Joins a remote root (`/`, `""` or `/Photos`) with a root-relative snapshot path.
pub fn remote_path_for(remote_root: &str, snapshot_path: &str) -> String {
    let root = remote_root.trim_end_matches('/');
    format!("{root}/{}", snapshot_path.trim_start_matches('/'))
}

/// Strips the remote root from a full remote display path by component count,
/// since the provider may report the root with different casing than typed.
/// Returns `None` for the root itself.
pub fn relative_to_remote_root(remote_root: &str, display_path: &str) -> Option<String> {
    let depth = remote_root.split('/').filter(|p| !p.is_empty()).count();
    let rest: Vec<&str> = display_path
        .split('/')
        .filter(|p| !p.is_empty())
        .skip(depth)
        .collect();
    if rest.is_empty() {
        return None;
    }
    Some(format!("/{}", rest.join("/")))
}
