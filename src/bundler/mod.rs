//! Assembly of self-contained fuzz test bundles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::build::{BuildResult, FuzzEngine};
use crate::bundler::archive::{EngineOptions, FileMap, Fuzzer, Metadata};
use crate::util::{fileutil, jarutil};
use crate::{CifuzzError, CifuzzResult};

pub mod archive;

#[derive(Debug, Clone, Default)]
pub struct BundlerOptions {
    pub output_path: PathBuf,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub docker_image: Option<String>,
    /// Raw `--env` specs: `KEY=VAL` or a bare `KEY` taken from the local
    /// environment.
    pub env: Vec<String>,
    pub engine_args: Vec<String>,
    pub dictionary: Option<PathBuf>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

pub struct Bundler {
    opts: BundlerOptions,
}

impl Bundler {
    pub fn new(opts: BundlerOptions) -> Bundler {
        Bundler { opts }
    }

    /// Assembles the per-fuzzer filesets and the metadata manifest, then
    /// writes the archive. A failed fuzzer aborts the bundle.
    pub fn bundle(&self, build_results: &[BuildResult]) -> CifuzzResult<()> {
        let staging = tempfile::Builder::new().prefix("cifuzz-bundle-").tempdir()?;

        let mut file_map = FileMap::new();
        let mut dep_store = RuntimeDepStore::default();
        let mut fuzzers = Vec::new();
        for result in build_results {
            let fuzzer = match result.engine {
                FuzzEngine::Jazzer => {
                    self.assemble_jazzer(result, &mut file_map, &mut dep_store, staging.path())?
                }
                FuzzEngine::Libfuzzer | FuzzEngine::LlvmCov => {
                    self.assemble_native(result, &mut file_map, &mut dep_store)?
                }
            };
            fuzzers.push(fuzzer);
        }

        let metadata = self.metadata(fuzzers);
        let metadata_path = staging.path().join(archive::METADATA_FILE_NAME);
        std::fs::write(&metadata_path, serde_yaml::to_string(&metadata)?)?;
        file_map.insert(archive::METADATA_FILE_NAME.to_string(), metadata_path);

        archive::write_archive(
            &file_map,
            &[archive::WORK_DIR_NAME.to_string()],
            &self.opts.output_path,
        )?;
        tracing::info!(
            "wrote bundle with {} fuzzer(s) to {}",
            metadata.fuzzers.len(),
            fileutil::pretty_path(&self.opts.output_path)
        );
        Ok(())
    }

    fn metadata(&self, fuzzers: Vec<Fuzzer>) -> Metadata {
        let code_revision = if self.opts.branch.is_some() || self.opts.commit.is_some() {
            Some(archive::CodeRevision {
                git: archive::GitRevision {
                    branch: self.opts.branch.clone(),
                    commit: self.opts.commit.clone(),
                },
            })
        } else {
            None
        };
        Metadata {
            code_revision,
            run_environment: self.opts.docker_image.clone().map(|docker| {
                archive::RunEnvironment { docker }
            }),
            fuzzers,
        }
    }

    fn assemble_native(
        &self,
        result: &BuildResult,
        file_map: &mut FileMap,
        dep_store: &mut RuntimeDepStore,
    ) -> CifuzzResult<Fuzzer> {
        let executable = result.executable.as_ref().ok_or_else(|| {
            CifuzzError::Internal(format!("native fuzz test {} has no executable", result.name))
        })?;
        let fuzzer_dir = archive_name(&result.name);
        let basename = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| fuzzer_dir.clone());

        // Coverage builds share the fuzzer directory with their fuzzing
        // sibling, so the binary gets its own subdirectory.
        let bits_path = match result.engine {
            FuzzEngine::LlvmCov => format!("{fuzzer_dir}/coverage/{basename}"),
            _ => format!("{fuzzer_dir}/{basename}"),
        };
        file_map.insert(bits_path.clone(), executable.clone());

        let mut runtime_paths = Vec::new();
        for dep in &result.runtime_deps {
            runtime_paths.push(dep_store.add(dep, file_map)?);
        }

        let mut env = resolve_env(&self.opts.env)?;
        env.push("NO_CIFUZZ=1".to_string());

        Ok(Fuzzer {
            name: result.name.clone(),
            engine: result.engine.manifest_name().to_string(),
            path: Some(bits_path),
            dictionary: self.add_dictionary(&fuzzer_dir, file_map)?,
            seeds: self.add_seeds(&fuzzer_dir, result, file_map)?,
            runtime_paths,
            engine_options: EngineOptions {
                flags: self.opts.engine_args.clone(),
                env,
            },
            max_run_time: self.max_run_time(),
            sanitizer: result.sanitizers.first().map(|s| s.to_string()),
            project_dir: result.project_dir.display().to_string(),
        })
    }

    fn assemble_jazzer(
        &self,
        result: &BuildResult,
        file_map: &mut FileMap,
        dep_store: &mut RuntimeDepStore,
        staging: &Path,
    ) -> CifuzzResult<Fuzzer> {
        let fuzzer_dir = archive_name(&result.name);

        // The manifest jar identifies the fuzz target class; the classpath
        // is carried by runtimePaths, with the jar always first.
        let jar_dir = staging.join(&fuzzer_dir);
        let manifest_jar = jarutil::create_manifest_jar(
            &jar_dir,
            &[("Jazzer-Fuzz-Target-Class".to_string(), result.name.clone())],
        )?;
        let jar_path = format!("{fuzzer_dir}/manifest.jar");
        file_map.insert(jar_path.clone(), manifest_jar);

        let mut runtime_paths = vec![jar_path];
        for dep in &result.runtime_deps {
            runtime_paths.push(dep_store.add(dep, file_map)?);
        }

        Ok(Fuzzer {
            name: result.name.clone(),
            engine: result.engine.manifest_name().to_string(),
            path: None,
            dictionary: self.add_dictionary(&fuzzer_dir, file_map)?,
            seeds: self.add_seeds(&fuzzer_dir, result, file_map)?,
            runtime_paths,
            engine_options: EngineOptions {
                flags: self.opts.engine_args.clone(),
                env: resolve_env(&self.opts.env)?,
            },
            max_run_time: self.max_run_time(),
            sanitizer: None,
            project_dir: result.project_dir.display().to_string(),
        })
    }

    fn add_dictionary(
        &self,
        fuzzer_dir: &str,
        file_map: &mut FileMap,
    ) -> CifuzzResult<Option<String>> {
        let Some(dictionary) = &self.opts.dictionary else {
            return Ok(None);
        };
        let path = format!("{fuzzer_dir}/dict");
        file_map.insert(path.clone(), dictionary.clone());
        Ok(Some(path))
    }

    /// Copies the user seed dirs and the adapter's default seed corpus
    /// under `<fuzzer>/seeds/<basename>/`, preserving directory structure
    /// and empty files.
    fn add_seeds(
        &self,
        fuzzer_dir: &str,
        result: &BuildResult,
        file_map: &mut FileMap,
    ) -> CifuzzResult<Option<String>> {
        let mut sources: Vec<PathBuf> = self.opts.seed_corpus_dirs.clone();
        if result.seed_corpus.is_dir() {
            sources.push(result.seed_corpus.clone());
        }
        if sources.is_empty() {
            return Ok(None);
        }

        let seeds_root = format!("{fuzzer_dir}/seeds");
        let mut added = false;
        for source in sources {
            let basename = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "seeds".to_string());
            for entry in WalkDir::new(&source) {
                let entry = entry.map_err(|e| {
                    CifuzzError::Io(std::io::Error::other(e.to_string()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&source)
                    .map_err(|e| CifuzzError::Internal(e.to_string()))?;
                file_map.insert(
                    format!("{seeds_root}/{basename}/{}", slash_path(rel)),
                    entry.path().to_path_buf(),
                );
                added = true;
            }
        }
        Ok(added.then_some(seeds_root))
    }

    fn max_run_time(&self) -> u64 {
        self.opts.timeout.map(|t| t.as_secs()).unwrap_or(0)
    }
}

/// Resolves `--env` specs: `KEY=VAL` is stored literally, a bare `KEY`
/// captures the current environment value and is dropped when unset.
pub fn resolve_env(specs: &[String]) -> CifuzzResult<Vec<String>> {
    let mut env = Vec::new();
    for spec in specs {
        if spec.contains('=') {
            env.push(spec.clone());
            continue;
        }
        match std::env::var(spec) {
            Ok(value) => env.push(format!("{spec}={value}")),
            Err(_) => {
                tracing::debug!("--env {spec} is not set in the local environment, skipping");
            }
        }
    }
    Ok(env)
}

/// Content-addressed store for runtime dependencies: a given file appears
/// at most once under `runtime_deps/`, at a path derived from its content
/// hash, even when multiple fuzzers reference it.
#[derive(Debug, Default)]
struct RuntimeDepStore {
    by_source: BTreeMap<PathBuf, String>,
    by_hash: BTreeMap<String, String>,
}

impl RuntimeDepStore {
    fn add(&mut self, dep: &Path, file_map: &mut FileMap) -> CifuzzResult<String> {
        if let Some(existing) = self.by_source.get(dep) {
            return Ok(existing.clone());
        }
        if !dep.exists() {
            return Err(CifuzzError::Config(format!(
                "runtime dependency {} does not exist",
                dep.display()
            )));
        }

        let hash = content_hash(dep)?;
        if let Some(existing) = self.by_hash.get(&hash) {
            self.by_source.insert(dep.to_path_buf(), existing.clone());
            return Ok(existing.clone());
        }

        let basename = dep
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| hash.clone());
        let archive_path = format!("runtime_deps/{hash}/{basename}");

        if dep.is_dir() {
            for entry in WalkDir::new(dep) {
                let entry =
                    entry.map_err(|e| CifuzzError::Io(std::io::Error::other(e.to_string())))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(dep)
                    .map_err(|e| CifuzzError::Internal(e.to_string()))?;
                file_map.insert(
                    format!("{archive_path}/{}", slash_path(rel)),
                    entry.path().to_path_buf(),
                );
            }
        } else {
            file_map.insert(archive_path.clone(), dep.to_path_buf());
        }

        self.by_source.insert(dep.to_path_buf(), archive_path.clone());
        self.by_hash.insert(hash, archive_path.clone());
        Ok(archive_path)
    }
}

/// Hashes file contents; directories hash the sorted sequence of relative
/// paths and per-file hashes.
fn content_hash(path: &Path) -> CifuzzResult<String> {
    if path.is_dir() {
        let mut entries = Vec::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| CifuzzError::Io(std::io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(path)
                .map_err(|e| CifuzzError::Internal(e.to_string()))?;
            entries.push((slash_path(rel), file_hash(entry.path())?));
        }
        let mut hasher = blake3::Hasher::new();
        for (rel, hash) in entries {
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
            hasher.update(hash.as_bytes());
        }
        return Ok(hasher.finalize().to_hex().to_string());
    }
    file_hash(path)
}

fn file_hash(path: &Path) -> CifuzzResult<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A filesystem-friendly directory name for a fuzz test: Bazel labels and
/// path separators flatten to underscores, JVM class names stay intact.
fn archive_name(name: &str) -> String {
    name.replace(['/', ':', '\\'], "_")
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Sanitizer;

    fn native_result(dir: &Path, name: &str) -> BuildResult {
        let exe = dir.join(name);
        std::fs::write(&exe, b"\x7fELF").unwrap();
        BuildResult {
            name: name.to_string(),
            executable: Some(exe),
            runtime_deps: Vec::new(),
            generated_corpus: dir.join("corpus"),
            seed_corpus: dir.join("seeds"),
            build_dir: dir.to_path_buf(),
            project_dir: dir.to_path_buf(),
            engine: FuzzEngine::Libfuzzer,
            sanitizers: vec![Sanitizer::Address],
        }
    }

    #[test]
    fn runtime_deps_deduplicate_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("libfoo.so");
        let second = dir.path().join("copy").join("libfoo.so");
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();
        std::fs::write(&first, b"same bytes").unwrap();
        std::fs::write(&second, b"same bytes").unwrap();
        let third = dir.path().join("libbar.so");
        std::fs::write(&third, b"different").unwrap();

        let mut store = RuntimeDepStore::default();
        let mut file_map = FileMap::new();
        let a = store.add(&first, &mut file_map).unwrap();
        let b = store.add(&second, &mut file_map).unwrap();
        let c = store.add(&third, &mut file_map).unwrap();

        assert_eq!(a, b, "equal contents must share one archive path");
        assert_ne!(a, c);
        assert_eq!(file_map.len(), 2);

        // The archive path embeds the content hash.
        let hash = a.split('/').nth(1).unwrap();
        assert_eq!(hash, file_hash(&first).unwrap());
    }

    #[test]
    fn env_specs_resolve_against_the_local_environment() {
        // HOME is part of the test environment; NO_SUCH_VARIABLE is not.
        let home = std::env::var("HOME").expect("HOME must be set for this test");
        let env = resolve_env(&[
            "FOO=foo".to_string(),
            "HOME".to_string(),
            "NO_SUCH_VARIABLE_12345".to_string(),
        ])
        .unwrap();
        assert_eq!(env, vec!["FOO=foo".to_string(), format!("HOME={home}")]);
    }

    #[test]
    fn native_fuzzers_always_get_no_cifuzz() {
        let dir = tempfile::tempdir().unwrap();
        let result = native_result(dir.path(), "my_fuzz_test");
        let bundler = Bundler::new(BundlerOptions {
            output_path: dir.path().join("bundle.tar.gz"),
            env: vec!["FOO=foo".to_string()],
            ..Default::default()
        });

        let mut file_map = FileMap::new();
        let mut store = RuntimeDepStore::default();
        let fuzzer = bundler
            .assemble_native(&result, &mut file_map, &mut store)
            .unwrap();
        assert_eq!(
            fuzzer.engine_options.env,
            vec!["FOO=foo".to_string(), "NO_CIFUZZ=1".to_string()]
        );
        assert_eq!(fuzzer.sanitizer.as_deref(), Some("address"));
        assert_eq!(fuzzer.path.as_deref(), Some("my_fuzz_test/my_fuzz_test"));
    }

    #[test]
    fn jazzer_fuzzers_get_a_manifest_jar_first_on_the_runtime_paths() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let jar = dir.path().join("mylib.jar");
        std::fs::write(&jar, b"jar bytes").unwrap();

        let result = BuildResult {
            name: "com.example.FuzzTestCase".to_string(),
            executable: None,
            runtime_deps: vec![jar],
            generated_corpus: dir.path().join("corpus"),
            seed_corpus: dir.path().join("seeds"),
            build_dir: dir.path().join("target"),
            project_dir: dir.path().to_path_buf(),
            engine: FuzzEngine::Jazzer,
            sanitizers: Vec::new(),
        };
        let bundler = Bundler::new(BundlerOptions::default());

        let mut file_map = FileMap::new();
        let mut store = RuntimeDepStore::default();
        let fuzzer = bundler
            .assemble_jazzer(&result, &mut file_map, &mut store, staging.path())
            .unwrap();

        assert_eq!(fuzzer.engine, "JAZZER");
        assert_eq!(
            fuzzer.runtime_paths.first().map(String::as_str),
            Some("com.example.FuzzTestCase/manifest.jar")
        );
        assert!(file_map.contains_key("com.example.FuzzTestCase/manifest.jar"));
        // JVM fuzzers never get NO_CIFUZZ.
        assert!(fuzzer.engine_options.env.is_empty());
    }

    #[test]
    fn seed_corpora_keep_their_directory_structure_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = dir.path().join("my-seeds");
        std::fs::create_dir_all(seeds.join("nested")).unwrap();
        std::fs::write(seeds.join("empty"), b"").unwrap();
        std::fs::write(seeds.join("nested").join("seed"), b"x").unwrap();

        let result = native_result(dir.path(), "my_fuzz_test");
        let bundler = Bundler::new(BundlerOptions {
            seed_corpus_dirs: vec![seeds],
            ..Default::default()
        });

        let mut file_map = FileMap::new();
        let mut store = RuntimeDepStore::default();
        let fuzzer = bundler
            .assemble_native(&result, &mut file_map, &mut store)
            .unwrap();
        assert_eq!(fuzzer.seeds.as_deref(), Some("my_fuzz_test/seeds"));
        assert!(file_map.contains_key("my_fuzz_test/seeds/my-seeds/empty"));
        assert!(file_map.contains_key("my_fuzz_test/seeds/my-seeds/nested/seed"));
    }

    #[test]
    fn archive_names_flatten_labels() {
        assert_eq!(archive_name("//examples:my_fuzz_test_bin"), "examples_my_fuzz_test_bin");
        assert_eq!(archive_name("com.example.FuzzTestCase"), "com.example.FuzzTestCase");
    }
}
