//! The `bundle` command: build fuzz tests and package them into a
//! self-contained archive.

use std::path::PathBuf;
use std::time::Duration;

use crate::build::{self, bazel, cmake, gradle, maven, other, BuildResult, FuzzEngine};
use crate::bundler::{Bundler, BundlerOptions};
use crate::config::{self, BuildSystem, ProjectConfig};
use crate::util::fileutil;
use crate::{CifuzzError, CifuzzResult};

/// Bundles normally run under the Linux sandbox on the remote side; set
/// this to produce archives on other platforms anyway.
pub const UNSUPPORTED_PLATFORMS_ENV_VAR: &str = "CIFUZZ_BUNDLE_ON_UNSUPPORTED_PLATFORMS";

const DEFAULT_OUTPUT_NAME: &str = "fuzz_tests.tar.gz";

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    /// Fuzz tests to bundle. Empty bundles every fuzz test the build
    /// system can enumerate.
    pub fuzz_tests: Vec<String>,
    pub output: Option<PathBuf>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub docker_image: Option<String>,
    pub env: Vec<String>,
    pub build_tool_args: Vec<String>,
    pub build_command: Option<String>,
    pub build_jobs: Option<u32>,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub timeout: Option<Duration>,
    pub project_dir: Option<PathBuf>,
    pub verbose: bool,
}

pub fn bundle(opts: BundleOptions) -> CifuzzResult<()> {
    if !cfg!(target_os = "linux") && std::env::var(UNSUPPORTED_PLATFORMS_ENV_VAR).is_err() {
        return Err(CifuzzError::Usage(format!(
            "bundles are executed on Linux; set {UNSUPPORTED_PLATFORMS_ENV_VAR}=1 to create \
             one on this platform anyway"
        )));
    }

    let start_dir = match &opts.project_dir {
        Some(dir) => fileutil::canonical_path(dir)?,
        None => std::env::current_dir()?,
    };
    let project_dir = if opts.project_dir.is_some() {
        start_dir
    } else {
        config::find_project_dir(&start_dir)
    };
    let project_config = ProjectConfig::load(&project_dir)?;
    let build_system = match project_config.build_system {
        Some(system) => system,
        None => config::determine_build_system(&project_dir)?,
    };
    let build_command = opts.build_command.clone().or(project_config.build_command);

    let build_results = build_all(&opts, &project_dir, build_system, build_command)?;
    if build_results.is_empty() {
        return Err(CifuzzError::Usage(
            "no fuzz tests to bundle; pass at least one fuzz test name".to_string(),
        ));
    }

    let output_path = opts
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_NAME));

    let bundler = Bundler::new(BundlerOptions {
        output_path,
        branch: opts.branch.clone(),
        commit: opts.commit.clone(),
        docker_image: opts.docker_image.clone(),
        env: opts.env.clone(),
        engine_args: opts.engine_args.clone(),
        dictionary: opts.dictionary.clone(),
        seed_corpus_dirs: opts.seed_corpus_dirs.clone(),
        timeout: opts.timeout,
    });
    bundler.bundle(&build_results)
}

fn build_all(
    opts: &BundleOptions,
    project_dir: &std::path::Path,
    build_system: BuildSystem,
    build_command: Option<String>,
) -> CifuzzResult<Vec<BuildResult>> {
    let sanitizers = build::default_sanitizers();

    match build_system {
        BuildSystem::Cmake => {
            let builder = cmake::Builder::new(cmake::BuilderOptions {
                project_dir: project_dir.to_path_buf(),
                engine: FuzzEngine::Libfuzzer,
                sanitizers,
                args: opts.build_tool_args.clone(),
                num_jobs: opts.build_jobs,
                find_runtime_deps: true,
                verbose: opts.verbose,
            })?;
            builder.configure()?;
            let fuzz_tests = if opts.fuzz_tests.is_empty() {
                builder.list_fuzz_tests()?
            } else {
                opts.fuzz_tests.clone()
            };
            let mut results: Vec<BuildResult> =
                builder.build(&fuzz_tests)?.into_values().collect();

            // A coverage sibling per fuzzer, sharing seeds and dictionary,
            // so that remote runs can produce line coverage. No coverage
            // builds on Windows.
            if !cfg!(windows) {
                let coverage_builder = cmake::Builder::new(cmake::BuilderOptions {
                    project_dir: project_dir.to_path_buf(),
                    engine: FuzzEngine::LlvmCov,
                    sanitizers: Vec::new(),
                    args: opts.build_tool_args.clone(),
                    num_jobs: opts.build_jobs,
                    find_runtime_deps: true,
                    verbose: opts.verbose,
                })?;
                coverage_builder.configure()?;
                results.extend(coverage_builder.build(&fuzz_tests)?.into_values());
            }
            Ok(results)
        }
        BuildSystem::Bazel => {
            let builder = bazel::Builder::new(bazel::BuilderOptions {
                project_dir: project_dir.to_path_buf(),
                sanitizers,
                args: opts.build_tool_args.clone(),
                num_jobs: opts.build_jobs,
                verbose: opts.verbose,
            })?;
            let labels: Vec<String> = require_fuzz_tests(opts)?
                .iter()
                .map(|t| builder.resolve_label(t))
                .collect();
            Ok(builder.build(&labels)?.into_values().collect())
        }
        BuildSystem::Maven => {
            let builder = maven::Builder::new(maven::BuilderOptions {
                project_dir: project_dir.to_path_buf(),
                num_jobs: opts.build_jobs,
            })?;
            Ok(builder.build(&require_fuzz_tests(opts)?)?.into_values().collect())
        }
        BuildSystem::Gradle => {
            let builder = gradle::Builder::new(gradle::BuilderOptions {
                project_dir: project_dir.to_path_buf(),
                num_jobs: opts.build_jobs,
            })?;
            Ok(builder.build(&require_fuzz_tests(opts)?)?.into_values().collect())
        }
        BuildSystem::Other => {
            let builder = other::Builder::new(other::BuilderOptions {
                project_dir: project_dir.to_path_buf(),
                build_command: build_command.ok_or_else(|| {
                    CifuzzError::Usage(
                        "flag \"build-command\" must be set when using build system type \
                         \"other\""
                            .to_string(),
                    )
                })?,
                sanitizers,
            })?;
            Ok(builder.build(&require_fuzz_tests(opts)?)?.into_values().collect())
        }
    }
}

fn require_fuzz_tests(opts: &BundleOptions) -> CifuzzResult<Vec<String>> {
    if opts.fuzz_tests.is_empty() {
        return Err(CifuzzError::Usage(
            "this build system cannot enumerate fuzz tests; pass the fuzz test names to bundle"
                .to_string(),
        ));
    }
    Ok(opts.fuzz_tests.clone())
}
