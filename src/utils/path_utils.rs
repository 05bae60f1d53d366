use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    if path_str.trim().is_empty() {
        return Err(AppError::InvalidInputArgument("Path must not be empty".to_string()));
    }
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

/// Resolves `..` and `.` lexically, then canonicalizes when the path exists.
fn normalize_path(path: &Path, base: &Path) -> PathBuf {
    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut components = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            _ => components.push(component),
        }
    }
    let lexical: PathBuf = components.iter().collect();

    dunce::canonicalize(&lexical).unwrap_or(lexical)
}

/// Key under which sessions are matched by working directory.
pub fn normalize_cwd(cwd: &Path) -> PathBuf {
    let expanded = expand_tilde_path_buf(&cwd.to_string_lossy()).unwrap_or_else(|_| cwd.to_path_buf());
    let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    normalize_path(&expanded, &base)
}

/// Resolves a caller-supplied working directory against `default_cwd` and
/// checks that it is an existing directory.
pub fn resolve_cwd(requested: Option<&str>, default_cwd: &Path) -> Result<PathBuf, AppError> {
    let resolved = match requested {
        Some(raw) if !raw.trim().is_empty() => {
            let expanded = expand_tilde_path_buf(raw.trim())?;
            normalize_path(&expanded, default_cwd)
        }
        _ => normalize_path(default_cwd, default_cwd),
    };
    debug!(cwd = %resolved.display(), "Resolved working directory");
    if !resolved.is_dir() {
        return Err(AppError::InvalidInputArgument(format!(
            "Working directory does not exist: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}
