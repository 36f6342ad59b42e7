//! Adapter for projects built by an arbitrary user-supplied command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;

use crate::build::{self, BuildResult, FuzzEngine, Sanitizer};
use crate::util::{envutil, runfiles};
use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub build_command: String,
    pub sanitizers: Vec<Sanitizer>,
}

pub struct Builder {
    opts: BuilderOptions,
}

impl Builder {
    pub fn new(opts: BuilderOptions) -> CifuzzResult<Self> {
        std::fs::metadata(&opts.project_dir)?;
        if opts.build_command.is_empty() {
            return Err(CifuzzError::Usage(
                "flag \"build-command\" must be set when using build system type \"other\""
                    .to_string(),
            ));
        }
        Ok(Builder { opts })
    }

    pub fn build(&self, fuzz_tests: &[String]) -> CifuzzResult<BTreeMap<String, BuildResult>> {
        let mut results = BTreeMap::new();
        for fuzz_test in fuzz_tests {
            results.insert(fuzz_test.clone(), self.build_one(fuzz_test)?);
        }
        Ok(results)
    }

    fn build_one(&self, fuzz_test: &str) -> CifuzzResult<BuildResult> {
        let mut env = build::common_build_env()?;
        // The build command addresses the requested fuzz test and the
        // required instrumentation flags through these variables.
        env = envutil::setenv(env, "FUZZ_TEST", fuzz_test)?;
        let compile_flags = compile_flags(&self.opts.sanitizers).join(" ");
        env = envutil::setenv(env, "FUZZ_TEST_CFLAGS", &compile_flags)?;
        env = envutil::setenv(env, "FUZZ_TEST_CXXFLAGS", &compile_flags)?;
        env = envutil::setenv(env, "FUZZ_TEST_LDFLAGS", "-fsanitize=fuzzer")?;

        let shell = shell();
        let mut cmd = Command::new(&shell);
        cmd.arg("-c")
            .arg(&self.opts.build_command)
            .current_dir(&self.opts.project_dir)
            .env_clear()
            .envs(env.iter().filter_map(|e| e.split_once('=')));
        build::run_build_tool(cmd)?;

        let executable = self.find_fuzz_test_executable(fuzz_test)?;
        let build_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.opts.project_dir.clone());

        let mut result = BuildResult {
            name: fuzz_test.to_string(),
            executable: Some(executable),
            runtime_deps: Vec::new(),
            generated_corpus: build::generated_corpus_dir(&self.opts.project_dir, fuzz_test),
            seed_corpus: build::default_seed_corpus(&self.opts.project_dir, fuzz_test),
            build_dir,
            project_dir: self.opts.project_dir.clone(),
            engine: FuzzEngine::Libfuzzer,
            sanitizers: self.opts.sanitizers.clone(),
        };
        result.canonicalize()?;
        Ok(result)
    }

    /// Finds the produced fuzz test executable. An absolute or relative
    /// path is accepted as-is; a bare name is searched for recursively
    /// under the project directory, preferring the most recently modified
    /// candidate.
    fn find_fuzz_test_executable(&self, fuzz_test: &str) -> CifuzzResult<PathBuf> {
        let direct = self.opts.project_dir.join(fuzz_test);
        if direct.is_file() {
            return Ok(direct);
        }

        let matcher = globset::Glob::new(fuzz_test)
            .map_err(|err| CifuzzError::Usage(format!("invalid fuzz test name: {err}")))?
            .compile_matcher();

        let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in WalkDir::new(&self.opts.project_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() || !matcher.is_match(entry.file_name()) {
                continue;
            }
            if !runfiles::is_executable(entry.path()) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                best = Some((modified, entry.path().to_path_buf()));
            }
        }

        best.map(|(_, path)| path).ok_or_else(|| {
            CifuzzError::Build {
                command: format!(
                    "could not find a fuzz test executable named {fuzz_test:?} under {}",
                    self.opts.project_dir.display()
                ),
                cwd: self.opts.project_dir.clone(),
            }
        })
    }
}

fn shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "sh".to_string(),
    }
}

fn compile_flags(sanitizers: &[Sanitizer]) -> Vec<String> {
    let mut flags = vec![
        "-g".to_string(),
        "-fno-omit-frame-pointer".to_string(),
        "-fsanitize=fuzzer".to_string(),
    ];
    for sanitizer in sanitizers {
        match sanitizer {
            Sanitizer::Address => flags.push("-fsanitize=address".to_string()),
            Sanitizer::Undefined => {
                flags.push("-fsanitize=undefined".to_string());
                flags.push("-fno-sanitize-recover=undefined".to_string());
            }
        }
    }
    flags
}
