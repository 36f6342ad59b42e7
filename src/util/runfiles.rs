//! Locates helper binaries shipped with the cifuzz installation.

use std::path::{Path, PathBuf};

use crate::{CifuzzError, CifuzzResult};

/// Returns the path of the statically linked minijail0 binary.
pub fn minijail0_path() -> CifuzzResult<PathBuf> {
    find_bundled_tool("minijail0")
}

/// Returns the path of the process wrapper, the helper that chdirs and
/// sets up the environment inside the sandbox before exec'ing the target.
pub fn process_wrapper_path() -> CifuzzResult<PathBuf> {
    find_bundled_tool("process_wrapper")
}

/// Returns the path of llvm-symbolizer, looked up in PATH.
pub fn llvm_symbolizer_path() -> CifuzzResult<PathBuf> {
    find_in_path("llvm-symbolizer").ok_or_else(|| {
        CifuzzError::Config(
            "llvm-symbolizer was not found in PATH; it is required to symbolize \
             sanitizer reports"
                .to_string(),
        )
    })
}

fn find_bundled_tool(name: &str) -> CifuzzResult<PathBuf> {
    let candidate = install_dir().join("bin").join(name);
    if candidate.is_file() {
        return Ok(candidate);
    }
    if let Some(path) = find_in_path(name) {
        return Ok(path);
    }
    Err(CifuzzError::Config(format!(
        "{name} was not found in {} or PATH; reinstall cifuzz to restore it",
        candidate.parent().unwrap_or(Path::new("")).display()
    )))
}

/// The cifuzz data directory: `$XDG_DATA_HOME/cifuzz`, falling back to
/// `~/.local/share/cifuzz`.
fn install_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        if !data_home.is_empty() {
            return PathBuf::from(data_home).join("cifuzz");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("cifuzz")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
