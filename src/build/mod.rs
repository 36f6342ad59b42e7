//! Build-system adapters.
//!
//! Each adapter drives an external build tool, locates the produced fuzz
//! executable or classpath and normalizes the result into a [`BuildResult`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::util::{envutil, fileutil};
use crate::{CifuzzError, CifuzzResult};

pub mod bazel;
pub mod cmake;
pub mod gradle;
pub mod maven;
pub mod other;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FuzzEngine {
    Libfuzzer,
    Jazzer,
    LlvmCov,
}

impl FuzzEngine {
    /// Lowercase identifier used in build directory paths and cache vars.
    pub fn id(&self) -> &'static str {
        match self {
            FuzzEngine::Libfuzzer => "libfuzzer",
            FuzzEngine::Jazzer => "jazzer",
            FuzzEngine::LlvmCov => "llvm-cov",
        }
    }

    /// Uppercase name used in bundle manifests.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            FuzzEngine::Libfuzzer => "LIBFUZZER",
            FuzzEngine::Jazzer => "JAZZER",
            FuzzEngine::LlvmCov => "LLVM_COV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sanitizer {
    Address,
    Undefined,
}

impl Sanitizer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sanitizer::Address => "address",
            Sanitizer::Undefined => "undefined",
        }
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sanitizers enabled for a fuzzing build: AddressSanitizer always,
/// UBSan everywhere it is supported.
pub fn default_sanitizers() -> Vec<Sanitizer> {
    let mut sanitizers = vec![Sanitizer::Address];
    if !cfg!(windows) {
        sanitizers.push(Sanitizer::Undefined);
    }
    sanitizers
}

/// Joins sanitizers into the path segment used below `.cifuzz-build`.
pub fn sanitizers_segment(sanitizers: &[Sanitizer]) -> String {
    if sanitizers.is_empty() {
        return "none".to_string();
    }
    sanitizers
        .iter()
        .map(Sanitizer::as_str)
        .collect::<Vec<_>>()
        .join("+")
}

/// Product of a build adapter. Created once per fuzz test and never mutated
/// after being returned.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Fuzz test identifier: a target name, an executable basename or a
    /// fully qualified JVM class name.
    pub name: String,
    /// The fuzz executable. `None` for JVM fuzz tests, which are addressed
    /// by class name instead.
    pub executable: Option<PathBuf>,
    /// Shared libraries (native) or classpath entries (JVM), deduplicated
    /// and order-preserving.
    pub runtime_deps: Vec<PathBuf>,
    /// Directory the engine writes new corpus entries into. May not exist
    /// yet.
    pub generated_corpus: PathBuf,
    /// The default seed corpus directory. May not exist.
    pub seed_corpus: PathBuf,
    pub build_dir: PathBuf,
    pub project_dir: PathBuf,
    pub engine: FuzzEngine,
    pub sanitizers: Vec<Sanitizer>,
}

impl BuildResult {
    /// Resolves symlinks in every path field. Corpus directories may not
    /// exist yet and are only absolutized in that case.
    pub fn canonicalize(&mut self) -> CifuzzResult<()> {
        if let Some(executable) = &self.executable {
            self.executable = Some(fileutil::canonical_path(executable)?);
        }
        let mut deps = Vec::with_capacity(self.runtime_deps.len());
        for dep in &self.runtime_deps {
            let dep = fileutil::canonical_path(dep)?;
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        self.runtime_deps = deps;
        self.generated_corpus = fileutil::canonical_path(&self.generated_corpus)?;
        self.seed_corpus = fileutil::canonical_path(&self.seed_corpus)?;
        self.build_dir = fileutil::canonical_path(&self.build_dir)?;
        self.project_dir = fileutil::canonical_path(&self.project_dir)?;
        Ok(())
    }
}

/// Where the engine-generated corpus for a native fuzz test lives.
pub fn generated_corpus_dir(project_dir: &Path, fuzz_test: &str) -> PathBuf {
    project_dir.join(".cifuzz-corpus").join(fuzz_test)
}

/// Default seed corpus of a native fuzz test: `<name>_inputs` next to the
/// project root.
pub fn default_seed_corpus(project_dir: &Path, fuzz_test: &str) -> PathBuf {
    project_dir.join(format!("{fuzz_test}_inputs"))
}

/// Seed corpus convention for JVM fuzz tests:
/// `src/test/resources/<package path>/<ClassName>Inputs`.
pub fn jazzer_seed_corpus(project_dir: &Path, target_class: &str) -> PathBuf {
    let mut dir = project_dir.join("src").join("test").join("resources");
    for segment in target_class.split('.') {
        dir.push(segment);
    }
    let class_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.pop();
    dir.join(format!("{class_name}Inputs"))
}

/// The environment used for all build tool invocations. Clang is selected
/// when the user hasn't chosen a compiler, since the fuzzing instrumentation
/// requires it.
pub fn common_build_env() -> CifuzzResult<Vec<String>> {
    let mut env = envutil::current_env();
    if envutil::getenv(&env, "CC").is_empty() {
        env = envutil::setenv(env, "CC", "clang")?;
    }
    if envutil::getenv(&env, "CXX").is_empty() {
        env = envutil::setenv(env, "CXX", "clang++")?;
    }
    Ok(env)
}

/// Renders a command line for error messages and debug logs.
pub(crate) fn command_string(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Runs a build tool, forwarding its stderr verbatim and redirecting its
/// stdout to stderr so that only structured cifuzz output reaches stdout.
pub(crate) fn run_build_tool(mut cmd: Command) -> CifuzzResult<()> {
    let command = command_string(&cmd);
    let cwd = effective_cwd(&cmd)?;
    tracing::debug!(command = %command, cwd = %cwd.display(), "running build tool");

    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
    let mut child = cmd.spawn().map_err(|err| CifuzzError::Config(format!(
        "failed to start {command:?}: {err}"
    )))?;
    if let Some(mut stdout) = child.stdout.take() {
        std::io::copy(&mut stdout, &mut std::io::stderr())?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(CifuzzError::Build { command, cwd });
    }
    Ok(())
}

/// Runs a build tool and captures its stdout, with stderr forwarded.
pub(crate) fn capture_build_tool(mut cmd: Command) -> CifuzzResult<String> {
    let command = command_string(&cmd);
    let cwd = effective_cwd(&cmd)?;
    tracing::debug!(command = %command, cwd = %cwd.display(), "running build tool");

    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
    let output = cmd.output().map_err(|err| CifuzzError::Config(format!(
        "failed to start {command:?}: {err}"
    )))?;
    if !output.status.success() {
        return Err(CifuzzError::Build { command, cwd });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn effective_cwd(cmd: &Command) -> CifuzzResult<PathBuf> {
    match cmd.get_current_dir() {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Ok(std::env::current_dir()?),
    }
}
