//! Small filesystem utilities.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::CifuzzResult;

/// Makes `path` absolute and resolves all symlinks. Paths that don't exist
/// yet are absolutized against the working directory and lexically cleaned,
/// so that adapters can return corpus directories before they are created.
pub fn canonical_path(path: &Path) -> CifuzzResult<PathBuf> {
    let path = path_trimmed(path);
    if path.exists() {
        return Ok(std::fs::canonicalize(&path)?);
    }
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean_path(&absolute))
}

fn path_trimmed(path: &Path) -> PathBuf {
    // Info files produced by build integrations may carry a trailing newline.
    match path.to_str() {
        Some(s) => PathBuf::from(s.trim()),
        None => path.to_path_buf(),
    }
}

/// Removes `.` and `..` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Strips the working directory from `path` for display purposes.
pub fn pretty_path(path: &Path) -> String {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(rel) = path.strip_prefix(&cwd) {
            if rel.as_os_str().is_empty() {
                return ".".to_string();
            }
            return rel.display().to_string();
        }
    }
    path.display().to_string()
}

/// Creates an empty file, including missing parent directories.
pub fn touch(path: &Path) -> CifuzzResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}

/// Counts the corpus entries in `dirs`, recursively. Zero-byte files are
/// not counted because libFuzzer treats them as absent. Missing directories
/// count as empty.
pub fn count_corpus_entries(dirs: &[PathBuf]) -> CifuzzResult<u64> {
    let mut count = 0u64;
    for dir in dirs {
        if !dir.exists() {
            continue;
        }
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(io_error)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map_err(io_error)?.len() != 0 {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Computes the relative path from `base` to `path`. Both must be absolute.
pub fn relative_path(base: &Path, path: &Path) -> PathBuf {
    let base_components: Vec<_> = base.components().collect();
    let path_components: Vec<_> = path.components().collect();
    let common = base_components
        .iter()
        .zip(path_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_components.len() {
        out.push("..");
    }
    for component in &path_components[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Copies a directory tree, preserving the relative layout. Empty files are
/// copied as well.
pub fn copy_dir(src: &Path, dst: &Path) -> CifuzzResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io_error)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| crate::CifuzzError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn io_error(err: walkdir::Error) -> crate::CifuzzError {
    let msg = err.to_string();
    crate::CifuzzError::Io(
        err.into_io_error()
            .unwrap_or_else(|| std::io::Error::other(msg)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&file, &link).unwrap();
            assert_eq!(
                canonical_path(&link).unwrap(),
                std::fs::canonicalize(&file).unwrap()
            );
        }
    }

    #[test]
    fn canonical_path_accepts_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("..").join("there");
        let resolved = canonical_path(&missing).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("there"));
        assert!(!resolved.to_string_lossy().contains(".."));
    }

    #[test]
    fn count_corpus_entries_skips_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seed"), b"x").unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("other"), b"yy").unwrap();

        let count = count_corpus_entries(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn count_corpus_entries_tolerates_missing_dirs() {
        let count = count_corpus_entries(&[PathBuf::from("/no/such/dir")]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn relative_path_walks_up_to_the_common_prefix() {
        assert_eq!(
            relative_path(Path::new("/a/b/c"), Path::new("/a/d/e")),
            PathBuf::from("../../d/e")
        );
        assert_eq!(
            relative_path(Path::new("/a"), Path::new("/a/b")),
            PathBuf::from("b")
        );
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/b")),
            PathBuf::from(".")
        );
    }
}
