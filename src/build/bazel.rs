//! Bazel build adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::build::{self, BuildResult, FuzzEngine, Sanitizer};
use crate::util::fileutil;
use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub sanitizers: Vec<Sanitizer>,
    /// Extra arguments forwarded to `bazel build`.
    pub args: Vec<String>,
    pub num_jobs: Option<u32>,
    pub verbose: bool,
}

pub struct Builder {
    opts: BuilderOptions,
    env: Vec<String>,
}

impl Builder {
    pub fn new(opts: BuilderOptions) -> CifuzzResult<Self> {
        std::fs::metadata(&opts.project_dir)?;
        Ok(Builder {
            env: build::common_build_env()?,
            opts,
        })
    }

    /// The cc_fuzz_test rule defines multiple targets: for a test named
    /// "foo" it defines "foo", "foo_bin" and others. The "_bin" target is
    /// the one to build and run, so it is preferred when it exists.
    pub fn resolve_label(&self, fuzz_test: &str) -> String {
        let bin_label = format!("{fuzz_test}_bin");
        let status = self
            .bazel_command(["query", bin_label.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => bin_label,
            _ => fuzz_test.to_string(),
        }
    }

    pub fn build(&self, fuzz_tests: &[String]) -> CifuzzResult<BTreeMap<String, BuildResult>> {
        let mut args = vec![
            "build".to_string(),
            "--verbose_failures".to_string(),
            "--compilation_mode=opt".to_string(),
            "--copt=-g".to_string(),
            "--@rules_fuzzing//fuzzing:cc_engine_instrumentation=libfuzzer".to_string(),
            format!(
                "--@rules_fuzzing//fuzzing:cc_engine_sanitizer={}",
                rules_fuzzing_sanitizer(&self.opts.sanitizers)
            ),
        ];
        if let Some(num_jobs) = self.opts.num_jobs {
            args.push(format!("--jobs={num_jobs}"));
        }
        args.extend(self.opts.args.iter().cloned());
        args.extend(fuzz_tests.iter().cloned());

        build::run_build_tool(self.bazel_command(args.iter().map(String::as_str)))?;

        let mut results = BTreeMap::new();
        for fuzz_test in fuzz_tests {
            let executable = self.find_executable(fuzz_test)?;
            let build_dir = executable
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.opts.project_dir.clone());
            let corpus_name = label_path(fuzz_test);
            let seed_name = corpus_name.trim_end_matches("_bin");
            let mut result = BuildResult {
                name: fuzz_test.clone(),
                executable: Some(executable),
                runtime_deps: Vec::new(),
                generated_corpus: build::generated_corpus_dir(&self.opts.project_dir, &corpus_name),
                seed_corpus: self
                    .opts
                    .project_dir
                    .join(format!("{seed_name}_inputs")),
                build_dir,
                project_dir: self.opts.project_dir.clone(),
                engine: FuzzEngine::Libfuzzer,
                sanitizers: self.opts.sanitizers.clone(),
            };
            result.canonicalize()?;
            results.insert(fuzz_test.clone(), result);
        }
        Ok(results)
    }

    /// The install base contains scripts and runfiles that must stay
    /// visible inside the sandbox, so runners bind it read-only.
    pub fn install_base(&self) -> CifuzzResult<PathBuf> {
        let stdout = build::capture_build_tool(self.bazel_command(["info", "install_base"]))?;
        fileutil::canonical_path(std::path::Path::new(stdout.trim()))
    }

    fn find_executable(&self, label: &str) -> CifuzzResult<PathBuf> {
        let stdout =
            build::capture_build_tool(self.bazel_command(["cquery", "--output=files", label]))?;
        let path = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .next_back()
            .ok_or_else(|| {
                CifuzzError::Build {
                    command: format!("bazel cquery --output=files {label}"),
                    cwd: self.opts.project_dir.clone(),
                }
            })?;
        fileutil::canonical_path(&self.opts.project_dir.join(path))
    }

    fn bazel_command<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Command {
        let mut cmd = Command::new("bazel");
        cmd.args(args)
            .current_dir(&self.opts.project_dir)
            .env_clear()
            .envs(self.env.iter().filter_map(|e| e.split_once('=')));
        cmd
    }
}

fn rules_fuzzing_sanitizer(sanitizers: &[Sanitizer]) -> &'static str {
    if sanitizers.contains(&Sanitizer::Address) {
        "asan"
    } else if sanitizers.contains(&Sanitizer::Undefined) {
        "ubsan"
    } else {
        "none"
    }
}

/// Turns a label into a filesystem-friendly relative path:
/// `//examples:my_fuzz_test_bin` becomes `examples/my_fuzz_test_bin`.
fn label_path(label: &str) -> String {
    label
        .trim_start_matches('@')
        .trim_start_matches("//")
        .replace(':', "/")
        .trim_start_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_path_flattens_bazel_labels() {
        assert_eq!(label_path("//examples:my_fuzz_test_bin"), "examples/my_fuzz_test_bin");
        assert_eq!(label_path("//:top_level"), "top_level");
        assert_eq!(label_path("my_fuzz_test"), "my_fuzz_test");
    }

    #[test]
    fn sanitizer_mapping_prefers_asan() {
        assert_eq!(
            rules_fuzzing_sanitizer(&[Sanitizer::Address, Sanitizer::Undefined]),
            "asan"
        );
        assert_eq!(rules_fuzzing_sanitizer(&[Sanitizer::Undefined]), "ubsan");
        assert_eq!(rules_fuzzing_sanitizer(&[]), "none");
    }
}
