//! CMake build adapter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::build::{self, BuildResult, FuzzEngine, Sanitizer};
use crate::util::fileutil;
use crate::{CifuzzError, CifuzzResult};

/// The CMake configuration ("build type") used for fuzzing builds: optimized
/// enough to fuzz fast, with debug info for usable stack traces.
const CMAKE_BUILD_CONFIGURATION: &str = "RelWithDebInfo";

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub engine: FuzzEngine,
    pub sanitizers: Vec<Sanitizer>,
    /// Extra arguments forwarded to the configure step.
    pub args: Vec<String>,
    pub num_jobs: Option<u32>,
    pub find_runtime_deps: bool,
    pub verbose: bool,
}

impl BuilderOptions {
    fn validate(&self) -> CifuzzResult<()> {
        if self.project_dir.as_os_str().is_empty() {
            return Err(CifuzzError::Internal("project dir is not set".to_string()));
        }
        std::fs::metadata(&self.project_dir)?;
        Ok(())
    }
}

pub struct Builder {
    opts: BuilderOptions,
    env: Vec<String>,
}

impl Builder {
    pub fn new(opts: BuilderOptions) -> CifuzzResult<Self> {
        opts.validate()?;
        let builder = Builder {
            env: build::common_build_env()?,
            opts,
        };
        std::fs::create_dir_all(builder.build_dir())?;
        Ok(builder)
    }

    /// The build directory path encodes every cache variable (engine and
    /// sanitizers), since CMake ignores cache-variable changes on an
    /// already-configured tree.
    pub fn build_dir(&self) -> PathBuf {
        self.opts
            .project_dir
            .join(".cifuzz-build")
            .join(self.opts.engine.id())
            .join(build::sanitizers_segment(&self.opts.sanitizers))
    }

    /// Generates the project buildsystem. Re-running this is usually a
    /// no-op, but it turns a previously failed generation into a helpful
    /// error message instead of a missing-Makefile failure later.
    pub fn configure(&self) -> CifuzzResult<()> {
        let sanitizers = self
            .opts
            .sanitizers
            .iter()
            .map(Sanitizer::as_str)
            .collect::<Vec<_>>()
            .join(";");

        let mut cache_args = vec![
            format!("-DCMAKE_BUILD_TYPE={CMAKE_BUILD_CONFIGURATION}"),
            format!("-DCIFUZZ_ENGINE={}", self.opts.engine.id()),
            format!("-DCIFUZZ_SANITIZERS={sanitizers}"),
            "-DCIFUZZ_TESTING:BOOL=ON".to_string(),
        ];
        if self.opts.verbose {
            cache_args.push("-DCMAKE_VERBOSE_MAKEFILE:BOOL=ON".to_string());
        }
        if !cfg!(windows) {
            // Use $ORIGIN-relative RUNPATHs so executables from the build
            // directory find their shared libraries even when packaged
            // into a bundle.
            cache_args.push("-DCMAKE_BUILD_RPATH_USE_ORIGIN:BOOL=ON".to_string());
        }
        cache_args.extend(self.opts.args.iter().cloned());

        let mut cmd = Command::new("cmake");
        cmd.args(&cache_args)
            .arg(&self.opts.project_dir)
            .current_dir(self.build_dir())
            .env_clear()
            .envs(env_pairs(&self.env));
        build::run_build_tool(cmd)
    }

    pub fn build(&self, fuzz_tests: &[String]) -> CifuzzResult<BTreeMap<String, BuildResult>> {
        let build_dir = fileutil::canonical_path(&self.build_dir())?;

        let mut cmd = Command::new("cmake");
        cmd.arg("--build")
            .arg(&build_dir)
            .args(["--config", CMAKE_BUILD_CONFIGURATION])
            .arg("--target")
            .args(fuzz_tests);
        if let Some(num_jobs) = self.opts.num_jobs {
            cmd.arg("--parallel");
            if num_jobs != 0 {
                cmd.arg(num_jobs.to_string());
            }
        }
        cmd.env_clear().envs(env_pairs(&self.env));
        build::run_build_tool(cmd)?;

        let mut results = BTreeMap::new();
        for fuzz_test in fuzz_tests {
            let executable = self.find_fuzz_test_executable(fuzz_test)?;
            let seed_corpus = self.find_fuzz_test_seed_corpus(fuzz_test)?;
            let runtime_deps = if self.opts.find_runtime_deps {
                self.runtime_deps(fuzz_test)?
            } else {
                Vec::new()
            };
            let mut result = BuildResult {
                name: fuzz_test.clone(),
                executable: Some(executable),
                runtime_deps,
                generated_corpus: build::generated_corpus_dir(&self.opts.project_dir, fuzz_test),
                seed_corpus,
                build_dir: build_dir.clone(),
                project_dir: self.opts.project_dir.clone(),
                engine: self.opts.engine,
                sanitizers: self.opts.sanitizers.clone(),
            };
            result.canonicalize()?;
            results.insert(fuzz_test.clone(), result);
        }
        Ok(results)
    }

    /// Lists the fuzz tests the CMake integration registered during the
    /// configure step.
    pub fn list_fuzz_tests(&self) -> CifuzzResult<Vec<String>> {
        let info_dir = self.fuzz_tests_info_dir()?;
        let mut fuzz_tests = Vec::new();
        for entry in std::fs::read_dir(info_dir)? {
            fuzz_tests.push(entry?.file_name().to_string_lossy().into_owned());
        }
        fuzz_tests.sort();
        Ok(fuzz_tests)
    }

    fn find_fuzz_test_executable(&self, fuzz_test: &str) -> CifuzzResult<PathBuf> {
        self.read_info_file_as_path(fuzz_test, "executable")
    }

    fn find_fuzz_test_seed_corpus(&self, fuzz_test: &str) -> CifuzzResult<PathBuf> {
        self.read_info_file_as_path(fuzz_test, "seed_corpus")
    }

    /// Enumerates the transitive runtime dependencies of a fuzz test via the
    /// install component registered by the CMake integration. Unresolved or
    /// conflicting dependencies produce a warning, not an error.
    fn runtime_deps(&self, fuzz_test: &str) -> CifuzzResult<Vec<PathBuf>> {
        let mut cmd = Command::new("cmake");
        cmd.arg("--install")
            .arg(self.build_dir())
            .args(["--config", CMAKE_BUILD_CONFIGURATION])
            .args(["--component", &format!("cifuzz_internal_deps_{fuzz_test}")])
            .env_clear()
            .envs(env_pairs(&self.env));
        let stdout = build::capture_build_tool(cmd)?;

        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        let mut conflicting = Vec::new();
        for line in stdout.lines() {
            // Relevant lines look like:
            //   -- CIFUZZ RESOLVED /usr/lib/libfoo.so
            //   -- CIFUZZ UNRESOLVED not_found.so
            let Some(status_and_dep) = line.strip_prefix("-- CIFUZZ ") else {
                continue;
            };
            let Some((status, dep)) = status_and_dep.split_once(' ') else {
                return Err(CifuzzError::Build {
                    command: format!("invalid runtime dep line: {line}"),
                    cwd: self.opts.project_dir.clone(),
                });
            };
            match status {
                "RESOLVED" => resolved.push(fileutil::canonical_path(Path::new(dep))?),
                "UNRESOLVED" => unresolved.push(dep.to_string()),
                "CONFLICTING" => conflicting.push(dep.to_string()),
                _ => {
                    return Err(CifuzzError::Build {
                        command: format!("invalid status {status:?} in runtime dep line: {line}"),
                        cwd: self.opts.project_dir.clone(),
                    });
                }
            }
        }

        if !unresolved.is_empty() {
            tracing::warn!(
                "the following shared library dependencies of {fuzz_test} could not be \
                 resolved: {}; the archive may be incomplete",
                unresolved.join(", ")
            );
        }
        if !conflicting.is_empty() {
            tracing::warn!(
                "the following shared library dependencies of {fuzz_test} could not be \
                 resolved unambiguously: {}; the archive may be incomplete",
                conflicting.join(", ")
            );
        }

        Ok(resolved)
    }

    /// Reads a CMake-generated info file (one path per file) and resolves
    /// its content as a path.
    fn read_info_file_as_path(&self, fuzz_test: &str, kind: &str) -> CifuzzResult<PathBuf> {
        let info_file = self.fuzz_tests_info_dir()?.join(fuzz_test).join(kind);
        let content = std::fs::read_to_string(&info_file).map_err(|err| {
            CifuzzError::Config(format!(
                "no {kind} info for fuzz test {fuzz_test:?} ({}): {err}; \
                 is the cifuzz CMake integration enabled?",
                info_file.display()
            ))
        })?;
        fileutil::canonical_path(Path::new(content.trim()))
    }

    fn fuzz_tests_info_dir(&self) -> CifuzzResult<PathBuf> {
        // Single-configuration generators (Makefiles, Ninja).
        let info_dir = self.build_dir().join(".cifuzz").join("fuzz_tests");
        if info_dir.is_dir() {
            return Ok(info_dir);
        }
        // Multi-configuration generators (MSBuild).
        let info_dir = self
            .build_dir()
            .join(CMAKE_BUILD_CONFIGURATION)
            .join(".cifuzz")
            .join("fuzz_tests");
        if info_dir.is_dir() {
            return Ok(info_dir);
        }
        Err(CifuzzError::Config(format!(
            "no fuzz test info found under {}; run the configure step first",
            self.build_dir().display()
        )))
    }
}

fn env_pairs(env: &[String]) -> impl Iterator<Item = (&str, &str)> {
    env.iter().filter_map(|e| e.split_once('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(dir: &Path, engine: FuzzEngine, sanitizers: Vec<Sanitizer>) -> Builder {
        Builder::new(BuilderOptions {
            project_dir: dir.to_path_buf(),
            engine,
            sanitizers,
            args: Vec::new(),
            num_jobs: None,
            find_runtime_deps: false,
            verbose: false,
        })
        .unwrap()
    }

    #[test]
    fn build_dir_encodes_engine_and_sanitizers() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(
            dir.path(),
            FuzzEngine::Libfuzzer,
            vec![Sanitizer::Address, Sanitizer::Undefined],
        );
        assert!(b
            .build_dir()
            .ends_with(".cifuzz-build/libfuzzer/address+undefined"));

        let b = builder(dir.path(), FuzzEngine::LlvmCov, Vec::new());
        assert!(b.build_dir().ends_with(".cifuzz-build/llvm-cov/none"));
    }

    #[test]
    fn list_fuzz_tests_reads_the_info_dir() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(dir.path(), FuzzEngine::Libfuzzer, vec![Sanitizer::Address]);
        let info_dir = b.build_dir().join(".cifuzz").join("fuzz_tests");
        std::fs::create_dir_all(info_dir.join("my_fuzz_test")).unwrap();
        std::fs::create_dir_all(info_dir.join("another_fuzz_test")).unwrap();

        assert_eq!(
            b.list_fuzz_tests().unwrap(),
            vec!["another_fuzz_test".to_string(), "my_fuzz_test".to_string()]
        );
    }

    #[test]
    fn info_files_resolve_to_canonical_paths() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(dir.path(), FuzzEngine::Libfuzzer, vec![Sanitizer::Address]);
        let exe = dir.path().join("my_fuzz_test_bin");
        std::fs::write(&exe, b"").unwrap();

        let info_dir = b
            .build_dir()
            .join(".cifuzz")
            .join("fuzz_tests")
            .join("my_fuzz_test");
        std::fs::create_dir_all(&info_dir).unwrap();
        // Info files may carry a trailing newline.
        std::fs::write(
            info_dir.join("executable"),
            format!("{}\n", exe.display()),
        )
        .unwrap();

        assert_eq!(
            b.find_fuzz_test_executable("my_fuzz_test").unwrap(),
            std::fs::canonicalize(&exe).unwrap()
        );
    }
}
