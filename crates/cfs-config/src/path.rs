//! Path helpers shared by the interposer and its tools.
//!
//! Build-tree roots are compared against fully canonical paths, so every root
//! goes through [`canonical_root`] exactly once at startup.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Canonicalize a configured build-tree root.
///
/// The root must exist: a missing root would make every comparison against
/// it meaningless.
pub fn canonical_root(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve build-tree root: {}", path.display()))?;
    if !canonical.is_dir() {
        anyhow::bail!("Build-tree root is not a directory: {}", canonical.display());
    }
    Ok(canonical)
}

/// Canonicalize every root, dropping duplicates and roots nested in another root.
pub fn canonical_roots<I, P>(roots: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut out: Vec<PathBuf> = Vec::new();
    for root in roots {
        let root = canonical_root(root)?;
        if out.iter().any(|r| is_within(&root, r)) {
            continue;
        }
        out.retain(|r| !is_within(r, &root));
        out.push(root);
    }
    Ok(out)
}

/// Component-wise containment check on already canonical paths.
///
/// `/build` contains `/build` and `/build/x`, but not `/buildx`.
pub fn is_within(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> bool {
    path.as_ref().starts_with(dir.as_ref())
}

/// Check if a path is within a directory, canonicalizing both first.
///
/// Returns false if either path cannot be canonicalized.
pub fn is_within_directory(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> bool {
    match (path.as_ref().canonicalize(), dir.as_ref().canonicalize()) {
        (Ok(canonical_path), Ok(canonical_dir)) => is_within(canonical_path, canonical_dir),
        _ => false,
    }
}

/// Normalize a path where the target may not exist yet.
///
/// Canonicalizes the parent directory and appends the filename.
pub fn normalize_nonexistent(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let filename = path.file_name().context("Path has no filename")?;

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let canonical_parent = parent.canonicalize().with_context(|| {
                format!("Failed to resolve parent directory: {}", parent.display())
            })?;
            Ok(canonical_parent.join(filename))
        }
        _ => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Ok(cwd.canonicalize()?.join(filename))
        }
    }
}
