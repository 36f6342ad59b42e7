//! Bundle metadata model and the deterministic tar.gz writer.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::util::runfiles;
use crate::CifuzzResult;

pub const METADATA_FILE_NAME: &str = "bundle.yaml";

/// Empty directory used as the working directory at reproduce time.
pub const WORK_DIR_NAME: &str = "work_dir";

/// Maps archive paths (slash-separated, relative) to their sources on
/// disk. A `BTreeMap` keeps the entry order lexicographic, which makes the
/// archive reproducible.
pub type FileMap = BTreeMap<String, PathBuf>;

/// The `bundle.yaml` manifest: everything a compatible host needs to re-run
/// the contained fuzz tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "codeRevision", skip_serializing_if = "Option::is_none")]
    pub code_revision: Option<CodeRevision>,
    #[serde(rename = "runEnvironment", skip_serializing_if = "Option::is_none")]
    pub run_environment: Option<RunEnvironment>,
    pub fuzzers: Vec<Fuzzer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeRevision {
    pub git: GitRevision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitRevision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEnvironment {
    /// The docker image to run the bundle in.
    pub docker: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fuzzer {
    pub name: String,
    pub engine: String,
    /// Archive-relative path of the executable (native) or manifest jar
    /// (JVM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeds: Option<String>,
    #[serde(rename = "runtimePaths", default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_paths: Vec<String>,
    #[serde(rename = "engineOptions", default)]
    pub engine_options: EngineOptions,
    /// Maximum run time in seconds.
    #[serde(rename = "maxRunTime", default)]
    pub max_run_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitizer: Option<String>,
    #[serde(rename = "projectDir")]
    pub project_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// Writes a gzipped tar with lexicographic entry order and zeroed
/// timestamps, so that identical inputs produce identical archives.
pub fn write_archive(
    file_map: &FileMap,
    empty_dirs: &[String],
    out: &Path,
) -> CifuzzResult<()> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    let mut dirs: Vec<&String> = empty_dirs.iter().collect();
    dirs.sort();
    for dir in dirs {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(0);
        let name = format!("{}/", dir.trim_end_matches('/'));
        archive.append_data(&mut header, name, std::io::empty())?;
    }

    for (archive_path, source) in file_map {
        let mut file = std::fs::File::open(source)?;
        let metadata = file.metadata()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(metadata.len());
        header.set_mode(if runfiles::is_executable(source) {
            0o755
        } else {
            0o644
        });
        header.set_mtime(0);
        archive.append_data(&mut header, archive_path, &mut file)?;
    }

    let encoder = archive.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    Ok(())
}

/// Unpacks a bundle. Only used to verify archives in tests; reproduction
/// happens on the remote side.
pub fn extract_archive(archive_path: &Path, dst: &Path) -> CifuzzResult<()> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_round_trip_and_preserve_layout() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("a"), b"alpha").unwrap();
        std::fs::write(src.join("b"), b"").unwrap();

        let mut file_map = FileMap::new();
        file_map.insert("x/a".to_string(), src.join("a"));
        file_map.insert("x/deeper/b".to_string(), src.join("b"));

        let bundle = dir.path().join("bundle.tar.gz");
        write_archive(&file_map, &[WORK_DIR_NAME.to_string()], &bundle).unwrap();

        let extracted = dir.path().join("extracted");
        extract_archive(&bundle, &extracted).unwrap();
        assert_eq!(std::fs::read(extracted.join("x/a")).unwrap(), b"alpha");
        // Empty files survive.
        assert_eq!(std::fs::read(extracted.join("x/deeper/b")).unwrap(), b"");
        assert!(extracted.join(WORK_DIR_NAME).is_dir());
    }

    #[test]
    fn identical_inputs_produce_identical_archives() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("file");
        std::fs::write(&src, b"content").unwrap();

        let mut file_map = FileMap::new();
        file_map.insert("f".to_string(), src.clone());
        file_map.insert("g/h".to_string(), src);

        let first = dir.path().join("first.tar.gz");
        let second = dir.path().join("second.tar.gz");
        write_archive(&file_map, &[], &first).unwrap();
        write_archive(&file_map, &[], &second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn metadata_serializes_with_camel_case_keys() {
        let metadata = Metadata {
            code_revision: Some(CodeRevision {
                git: GitRevision {
                    branch: Some("my-branch".to_string()),
                    commit: Some("123456abcdef".to_string()),
                },
            }),
            run_environment: Some(RunEnvironment {
                docker: "my-image".to_string(),
            }),
            fuzzers: vec![Fuzzer {
                name: "my_fuzz_test".to_string(),
                engine: "LIBFUZZER".to_string(),
                path: Some("my_fuzz_test/my_fuzz_test".to_string()),
                max_run_time: 6000,
                project_dir: "/prj".to_string(),
                ..Default::default()
            }],
        };
        let yaml = serde_yaml::to_string(&metadata).unwrap();
        assert!(yaml.contains("codeRevision:"));
        assert!(yaml.contains("branch: my-branch"));
        assert!(yaml.contains("commit: 123456abcdef"));
        assert!(yaml.contains("runEnvironment:"));
        assert!(yaml.contains("docker: my-image"));
        assert!(yaml.contains("maxRunTime: 6000"));
        assert!(yaml.contains("projectDir: /prj"));

        let parsed: Metadata = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.fuzzers[0].max_run_time, 6000);
    }
}
