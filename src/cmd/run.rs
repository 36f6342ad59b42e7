//! The `run` command: build a fuzz test and execute it under its engine.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::build::{self, bazel, cmake, gradle, maven, other, BuildResult, FuzzEngine};
use crate::config::{self, BuildSystem, ProjectConfig};
use crate::report_handler::{ReportHandler, ReportHandlerOptions};
use crate::runner::{jazzer, libfuzzer};
use crate::util::fileutil;
use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub fuzz_test: String,
    /// Arguments after `--`, forwarded to the build tool.
    pub build_tool_args: Vec<String>,
    pub build_command: Option<String>,
    pub build_jobs: Option<u32>,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub timeout: Option<Duration>,
    pub use_sandbox: bool,
    pub print_json: bool,
    pub build_only: bool,
    pub project_dir: Option<PathBuf>,
    pub verbose: bool,
}

struct ResolvedOptions {
    opts: RunOptions,
    project_dir: PathBuf,
    build_system: BuildSystem,
    build_command: Option<String>,
}

pub fn run(opts: RunOptions) -> CifuzzResult<()> {
    let resolved = resolve_options(opts)?;
    validate(&resolved)?;

    let Some(build_result) = build_fuzz_test(&resolved)? else {
        return Ok(());
    };

    // The engine writes crash artifacts into a run-scoped scratch dir; the
    // report handler copies them into the canonical crash corpus.
    let temp_dir = tempfile::Builder::new().prefix("cifuzz-run-").tempdir()?;
    let artifacts_dir = temp_dir.path().join("artifacts");

    std::fs::create_dir_all(&build_result.generated_corpus)?;
    tracing::info!(
        "storing generated corpus in {}",
        fileutil::pretty_path(&build_result.generated_corpus)
    );

    // User seed dirs plus the default seed corpus when it exists, all with
    // symlinks resolved so that sandbox bindings stay valid.
    let mut seed_corpus_dirs = Vec::new();
    for dir in &resolved.opts.seed_corpus_dirs {
        seed_corpus_dirs.push(fileutil::canonical_path(dir)?);
    }
    if build_result.seed_corpus.is_dir() {
        seed_corpus_dirs.push(fileutil::canonical_path(&build_result.seed_corpus)?);
    }

    // The Bazel install base holds generated scripts and runfiles that must
    // stay visible inside the sandbox.
    let mut read_only_bindings = Vec::new();
    if resolved.opts.use_sandbox && resolved.build_system == BuildSystem::Bazel {
        let builder = bazel::Builder::new(bazel::BuilderOptions {
            project_dir: resolved.project_dir.clone(),
            sanitizers: build::default_sanitizers(),
            args: Vec::new(),
            num_jobs: None,
            verbose: resolved.opts.verbose,
        })?;
        read_only_bindings.push(builder.install_base()?);
    }

    // Created right before the run starts; the handler's start timestamp
    // feeds the final wall-time metric.
    let mut handler = ReportHandler::new(ReportHandlerOptions {
        project_dir: resolved.project_dir.clone(),
        generated_corpus: build_result.generated_corpus.clone(),
        default_seed_corpus: build_result.seed_corpus.clone(),
        seed_corpus_dirs: resolved.opts.seed_corpus_dirs.clone(),
        build_dir: Some(build_result.build_dir.clone()),
        print_json: resolved.opts.print_json,
    });

    let runner_opts = libfuzzer::RunnerOptions {
        fuzz_target: build_result
            .executable
            .clone()
            .unwrap_or_else(|| PathBuf::from("java")),
        project_dir: resolved.project_dir.clone(),
        build_dir: build_result.build_dir.clone(),
        generated_corpus_dir: build_result.generated_corpus.clone(),
        seed_corpus_dirs,
        artifacts_dir,
        dictionary: resolved.opts.dictionary.clone(),
        engine_args: resolved.opts.engine_args.clone(),
        env_vars: vec!["NO_CIFUZZ=1".to_string()],
        library_dirs: Vec::new(),
        timeout: resolved.opts.timeout,
        use_minijail: resolved.opts.use_sandbox,
        read_only_bindings,
    };

    tracing::info!("running {}", resolved.opts.fuzz_test);
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(execute_runner(&resolved, &build_result, runner_opts, &mut handler));

    match result {
        Ok(()) => {
            handler.print_crashing_input_note();
            handler.print_final_metrics()?;
            Ok(())
        }
        // A finding is a successful fuzzing run: print the summary, then
        // let the dedicated exit code propagate.
        Err(CifuzzError::FindingSignalled { exit_code }) => {
            handler.print_crashing_input_note();
            handler.print_final_metrics()?;
            Err(CifuzzError::FindingSignalled { exit_code })
        }
        Err(err) => Err(err),
    }
}

async fn execute_runner(
    resolved: &ResolvedOptions,
    build_result: &BuildResult,
    runner_opts: libfuzzer::RunnerOptions,
    handler: &mut ReportHandler,
) -> CifuzzResult<()> {
    let token = CancellationToken::new();

    let run_fut = async {
        match build_result.engine {
            FuzzEngine::Jazzer => {
                let runner = jazzer::Runner::new(jazzer::RunnerOptions {
                    target_class: resolved.opts.fuzz_test.clone(),
                    class_paths: build_result.runtime_deps.clone(),
                    instrumentation_excludes: Vec::new(),
                    libfuzzer: runner_opts,
                })?;
                runner.run(token.clone(), handler).await
            }
            _ => {
                let runner = libfuzzer::Runner::new(runner_opts);
                runner.run(token.clone(), handler).await
            }
        }
    };
    shadow_signals(run_fut, wait_for_signal(), &token).await
}

/// Runs the fuzzer future while listening for termination signals. A
/// received signal cancels the token, waits for the runner to clean up and
/// always shadows whatever error the supervised child produced.
async fn shadow_signals<R, S>(
    run_fut: R,
    signal_fut: S,
    token: &CancellationToken,
) -> CifuzzResult<()>
where
    R: std::future::Future<Output = CifuzzResult<()>>,
    S: std::future::Future<Output = i32>,
{
    let mut run_fut = std::pin::pin!(run_fut);
    let mut signal_fut = std::pin::pin!(signal_fut);

    let mut received_signal: Option<i32> = None;
    let result = loop {
        tokio::select! {
            result = &mut run_fut => break result,
            signal = &mut signal_fut, if received_signal.is_none() => {
                tracing::warn!("received {}", crate::error::signal_name(signal));
                received_signal = Some(signal);
                token.cancel();
            }
        }
    };

    if let Some(signal) = received_signal {
        return Err(CifuzzError::Signal(signal));
    }
    result
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => libc_signal::SIGINT,
        _ = terminate.recv() => libc_signal::SIGTERM,
        _ = quit.recv() => libc_signal::SIGQUIT,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    libc_signal::SIGINT
}

mod libc_signal {
    pub const SIGINT: i32 = 2;
    pub const SIGQUIT: i32 = 3;
    pub const SIGTERM: i32 = 15;
}

fn resolve_options(opts: RunOptions) -> CifuzzResult<ResolvedOptions> {
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

    Ok(ResolvedOptions {
        opts,
        project_dir,
        build_system,
        build_command,
    })
}

fn validate(resolved: &ResolvedOptions) -> CifuzzResult<()> {
    if resolved.opts.fuzz_test.is_empty() {
        return Err(CifuzzError::Usage(
            "exactly one <fuzz test> argument must be provided".to_string(),
        ));
    }
    if let Some(timeout) = resolved.opts.timeout {
        if timeout < Duration::from_secs(1) {
            return Err(CifuzzError::Usage(format!(
                "invalid argument {timeout:?} for \"--timeout\": timeout can't be less than a second"
            )));
        }
    }
    if let Some(dictionary) = &resolved.opts.dictionary {
        std::fs::metadata(dictionary).map_err(|err| {
            CifuzzError::Usage(format!("dictionary {}: {err}", dictionary.display()))
        })?;
    }
    for dir in &resolved.opts.seed_corpus_dirs {
        if !dir.is_dir() {
            return Err(CifuzzError::Usage(format!(
                "seed corpus directory {} does not exist",
                dir.display()
            )));
        }
    }
    if resolved.build_system == BuildSystem::Other && resolved.build_command.is_none() {
        return Err(CifuzzError::Usage(
            "flag \"build-command\" must be set when using build system type \"other\"".to_string(),
        ));
    }
    Ok(())
}

/// Builds the requested fuzz test. Returns `None` with `--build-only`.
fn build_fuzz_test(resolved: &ResolvedOptions) -> CifuzzResult<Option<BuildResult>> {
    let opts = &resolved.opts;
    let sanitizers = build::default_sanitizers();

    let mut results = match resolved.build_system {
        BuildSystem::Cmake => {
            let builder = cmake::Builder::new(cmake::BuilderOptions {
                project_dir: resolved.project_dir.clone(),
                engine: FuzzEngine::Libfuzzer,
                sanitizers,
                args: opts.build_tool_args.clone(),
                num_jobs: opts.build_jobs,
                find_runtime_deps: false,
                verbose: opts.verbose,
            })?;
            builder.configure()?;
            builder.build(std::slice::from_ref(&opts.fuzz_test))?
        }
        BuildSystem::Bazel => {
            let builder = bazel::Builder::new(bazel::BuilderOptions {
                project_dir: resolved.project_dir.clone(),
                sanitizers,
                args: opts.build_tool_args.clone(),
                num_jobs: opts.build_jobs,
                verbose: opts.verbose,
            })?;
            let label = builder.resolve_label(&opts.fuzz_test);
            builder.build(&[label])?
        }
        BuildSystem::Maven => {
            warn_ignored_args(opts, "Maven");
            let builder = maven::Builder::new(maven::BuilderOptions {
                project_dir: resolved.project_dir.clone(),
                num_jobs: opts.build_jobs,
            })?;
            builder.build(std::slice::from_ref(&opts.fuzz_test))?
        }
        BuildSystem::Gradle => {
            warn_ignored_args(opts, "Gradle");
            let builder = gradle::Builder::new(gradle::BuilderOptions {
                project_dir: resolved.project_dir.clone(),
                num_jobs: opts.build_jobs,
            })?;
            builder.build(std::slice::from_ref(&opts.fuzz_test))?
        }
        BuildSystem::Other => {
            warn_ignored_args(opts, "build system type \"other\"");
            let builder = other::Builder::new(other::BuilderOptions {
                project_dir: resolved.project_dir.clone(),
                build_command: resolved.build_command.clone().unwrap_or_default(),
                sanitizers,
            })?;
            builder.build(std::slice::from_ref(&opts.fuzz_test))?
        }
    };

    if opts.build_only {
        return Ok(None);
    }
    results
        .pop_first()
        .map(|(_, result)| Some(result))
        .ok_or_else(|| {
            CifuzzError::Internal(format!("no build result for fuzz test {}", opts.fuzz_test))
        })
}

fn warn_ignored_args(opts: &RunOptions, tool: &str) {
    if !opts.build_tool_args.is_empty() {
        tracing::warn!(
            "passing additional arguments is not supported for {tool}; these arguments are \
             ignored: {}",
            opts.build_tool_args.join(" ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signals_shadow_errors_from_the_supervised_child() {
        let token = CancellationToken::new();
        let run_token = token.clone();
        // The "runner" fails with an exit error once it gets cancelled,
        // racing the signal path.
        let run_fut = async move {
            run_token.cancelled().await;
            Err(CifuzzError::Runner {
                command: "fuzzer".to_string(),
                message: "unexpected exit code 143".to_string(),
            })
        };
        let signal_fut = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            2
        };

        let err = shadow_signals(run_fut, signal_fut, &token).await.unwrap_err();
        match err {
            CifuzzError::Signal(signal) => assert_eq!(signal, 2),
            other => panic!("expected the signal to shadow the exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn without_a_signal_the_runner_result_passes_through() {
        let token = CancellationToken::new();
        let run_fut = async { Ok(()) };
        let signal_fut = std::future::pending::<i32>();
        shadow_signals(run_fut, signal_fut, &token).await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn validation_rejects_sub_second_timeouts() {
        let resolved = ResolvedOptions {
            opts: RunOptions {
                fuzz_test: "my_fuzz_test".to_string(),
                timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
            project_dir: PathBuf::from("."),
            build_system: BuildSystem::Cmake,
            build_command: None,
        };
        assert!(matches!(validate(&resolved), Err(CifuzzError::Usage(_))));
    }

    #[test]
    fn validation_requires_a_build_command_for_other() {
        let resolved = ResolvedOptions {
            opts: RunOptions {
                fuzz_test: "my_fuzz_test".to_string(),
                ..Default::default()
            },
            project_dir: PathBuf::from("."),
            build_system: BuildSystem::Other,
            build_command: None,
        };
        assert!(matches!(validate(&resolved), Err(CifuzzError::Usage(_))));
    }
}
