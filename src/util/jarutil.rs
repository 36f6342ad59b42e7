//! Creation of manifest-only jars.
//!
//! A manifest jar contains nothing but `META-INF/MANIFEST.MF`. Putting the
//! class path into a jar manifest instead of on the `java` command line
//! avoids the command-line length limits on Windows.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::util::fileutil;
use crate::CifuzzResult;

/// Physical manifest lines must not exceed 72 bytes; longer logical lines
/// continue on the next line after a single leading space.
const MANIFEST_MAX_LINE_LEN: usize = 72;

/// Writes `<dir>/manifest.jar` containing only a `META-INF/MANIFEST.MF`
/// with the given attributes, in order.
pub fn create_manifest_jar(dir: &Path, attributes: &[(String, String)]) -> CifuzzResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let jar_path = dir.join("manifest.jar");

    let file = std::fs::File::create(&jar_path)?;
    let mut jar = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    jar.start_file("META-INF/MANIFEST.MF", options)?;
    jar.write_all(render_manifest(attributes).as_bytes())?;
    jar.finish()?;

    Ok(jar_path)
}

/// Renders manifest attributes with the 72-byte line wrapping required by
/// the jar specification.
pub fn render_manifest(attributes: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in attributes {
        let logical = format!("{key}: {value}");
        let mut bytes = logical.as_bytes();
        let mut first = true;
        while !bytes.is_empty() {
            let budget = if first {
                MANIFEST_MAX_LINE_LEN
            } else {
                out.push(' ');
                MANIFEST_MAX_LINE_LEN - 1
            };
            let take = bytes.len().min(budget);
            out.push_str(std::str::from_utf8(&bytes[..take]).unwrap_or_default());
            out.push('\n');
            bytes = &bytes[take..];
            first = false;
        }
    }
    out
}

/// Builds the value of a `Class-Path` attribute: the runtime deps as
/// space-separated URLs relative to `manifest_dir`. Directory entries get a
/// trailing slash so the JVM treats them as class directories.
pub fn class_path_value(manifest_dir: &Path, deps: &[PathBuf]) -> String {
    let mut entries = Vec::new();
    for dep in deps {
        let rel = fileutil::relative_path(manifest_dir, dep);
        let mut url = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if dep.is_dir() && !url.ends_with('/') {
            url.push('/');
        }
        entries.push(url);
    }
    entries.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn short_attributes_render_unwrapped() {
        let manifest = render_manifest(&[(
            "Jazzer-Fuzz-Target-Class".to_string(),
            "com.example.FuzzTestCase".to_string(),
        )]);
        assert_eq!(manifest, "Jazzer-Fuzz-Target-Class: com.example.FuzzTestCase\n");
    }

    #[test]
    fn long_attributes_wrap_at_72_bytes() {
        let value = "x".repeat(200);
        let manifest = render_manifest(&[("Class-Path".to_string(), value)]);
        for line in manifest.lines() {
            assert!(line.len() <= MANIFEST_MAX_LINE_LEN, "line too long: {line}");
        }
        // Continuation lines start with a space and rejoin to the original.
        let rejoined: String = manifest
            .lines()
            .map(|l| l.strip_prefix(' ').unwrap_or(l))
            .collect();
        assert_eq!(rejoined, format!("Class-Path: {}", "x".repeat(200)));
    }

    #[test]
    fn manifest_jar_contains_only_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let jar = create_manifest_jar(
            dir.path(),
            &[(
                "Jazzer-Fuzz-Target-Class".to_string(),
                "com.example.FuzzTestCase".to_string(),
            )],
        )
        .unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&jar).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_name("META-INF/MANIFEST.MF").unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "Jazzer-Fuzz-Target-Class: com.example.FuzzTestCase\n");
    }

    #[test]
    fn class_path_marks_directories_with_a_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let classes = dir.path().join("classes");
        std::fs::create_dir(&classes).unwrap();
        let jar_dep = dir.path().join("lib.jar");
        std::fs::write(&jar_dep, b"jar").unwrap();

        let manifest_dir = dir.path().join("com.example.FuzzTestCase");
        std::fs::create_dir(&manifest_dir).unwrap();

        let value = class_path_value(&manifest_dir, &[jar_dep, classes]);
        assert_eq!(value, "../lib.jar ../classes/");
    }
}
