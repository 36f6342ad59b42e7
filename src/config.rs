//! `cifuzz.yaml` project config loading and build-system detection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CifuzzError, CifuzzResult};

pub const PROJECT_CONFIG_FILE: &str = "cifuzz.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Cmake,
    Bazel,
    Maven,
    Gradle,
    Other,
}

impl BuildSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildSystem::Cmake => "cmake",
            BuildSystem::Bazel => "bazel",
            BuildSystem::Maven => "maven",
            BuildSystem::Gradle => "gradle",
            BuildSystem::Other => "other",
        }
    }

    /// Whether fuzz tests built with this system run on the JVM.
    pub fn is_jvm(&self) -> bool {
        matches!(self, BuildSystem::Maven | BuildSystem::Gradle)
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildSystem {
    type Err = CifuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmake" => Ok(BuildSystem::Cmake),
            "bazel" => Ok(BuildSystem::Bazel),
            "maven" => Ok(BuildSystem::Maven),
            "gradle" => Ok(BuildSystem::Gradle),
            "other" => Ok(BuildSystem::Other),
            _ => Err(CifuzzError::Config(format!(
                "unsupported build system {s:?} (expected cmake|bazel|maven|gradle|other)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProjectConfig {
    /// The build system driving the project. Auto-detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_system: Option<BuildSystem>,

    /// Shell command producing the fuzz test executable; required for the
    /// "other" build system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    /// Project name used by `remote-run` when no --project flag is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl ProjectConfig {
    /// Reads `cifuzz.yaml` from `project_dir`. A missing file yields the
    /// default config; a malformed one is a hard error.
    pub fn load(project_dir: &Path) -> CifuzzResult<Self> {
        let path = project_dir.join(PROJECT_CONFIG_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        serde_yaml::from_str(&content).map_err(|err| {
            CifuzzError::Config(format!("failed to parse {}: {err}", path.display()))
        })
    }
}

/// Walks up from `start` looking for a `cifuzz.yaml`. Returns `start` when
/// none is found, so that config-less projects keep working.
pub fn find_project_dir(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(PROJECT_CONFIG_FILE).is_file() {
            return dir;
        }
        if !dir.pop() {
            return start.to_path_buf();
        }
    }
}

/// Detects the build system from well-known marker files.
pub fn determine_build_system(project_dir: &Path) -> CifuzzResult<BuildSystem> {
    let markers: &[(&str, BuildSystem)] = &[
        ("CMakeLists.txt", BuildSystem::Cmake),
        ("WORKSPACE", BuildSystem::Bazel),
        ("WORKSPACE.bazel", BuildSystem::Bazel),
        ("MODULE.bazel", BuildSystem::Bazel),
        ("pom.xml", BuildSystem::Maven),
        ("build.gradle", BuildSystem::Gradle),
        ("build.gradle.kts", BuildSystem::Gradle),
    ];
    for (marker, system) in markers {
        if project_dir.join(marker).exists() {
            return Ok(*system);
        }
    }
    Ok(BuildSystem::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_kebab_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "build-system: cmake\nbuild-command: make all\n",
        )
        .unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.build_system, Some(BuildSystem::Cmake));
        assert_eq!(config.build_command.as_deref(), Some("make all"));
    }

    #[test]
    fn load_defaults_when_config_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert!(config.build_system.is_none());
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), "no-such-key: 1\n").unwrap();
        assert!(ProjectConfig::load(dir.path()).is_err());
    }

    #[test]
    fn determine_build_system_prefers_marker_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            determine_build_system(dir.path()).unwrap(),
            BuildSystem::Other
        );
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        assert_eq!(
            determine_build_system(dir.path()).unwrap(),
            BuildSystem::Maven
        );
        std::fs::write(dir.path().join("CMakeLists.txt"), "").unwrap();
        assert_eq!(
            determine_build_system(dir.path()).unwrap(),
            BuildSystem::Cmake
        );
    }

    #[test]
    fn find_project_dir_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), "").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_dir(&nested), dir.path());
    }
}
