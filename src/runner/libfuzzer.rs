//! Runner for libFuzzer-family fuzz tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::minijail::{self, Binding, Minijail};
use crate::parser::{OutputParser, OutputSource, ParserOptions};
use crate::report::Report;
use crate::report_handler::ReportHandler;
use crate::runner;
use crate::util::{envutil, fileutil, runfiles};
use crate::{CifuzzError, CifuzzResult};

/// How long a child gets to exit after SIGTERM before SIGKILL follows.
const SIGTERM_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// The fuzz test executable.
    pub fuzz_target: PathBuf,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    /// First positional libFuzzer argument; the engine writes new corpus
    /// entries here.
    pub generated_corpus_dir: PathBuf,
    pub seed_corpus_dirs: Vec<PathBuf>,
    /// Where the engine writes crash artifacts; a run-scoped scratch
    /// directory, not the canonical crash corpus.
    pub artifacts_dir: PathBuf,
    pub dictionary: Option<PathBuf>,
    /// User-supplied engine arguments, appended last.
    pub engine_args: Vec<String>,
    /// `KEY=VAL` environment overrides.
    pub env_vars: Vec<String>,
    /// Directories added to `LD_LIBRARY_PATH`.
    pub library_dirs: Vec<PathBuf>,
    /// Total run timeout, enforced by the supervisor.
    pub timeout: Option<Duration>,
    pub use_minijail: bool,
    /// Extra read-only sandbox bindings, e.g. the Bazel install base.
    pub read_only_bindings: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Exited,
    Cancelled,
    TimedOut,
}

pub struct Runner {
    opts: RunnerOptions,
}

impl Runner {
    pub fn new(opts: RunnerOptions) -> Runner {
        Runner { opts }
    }

    pub async fn run(
        &self,
        token: CancellationToken,
        handler: &mut ReportHandler,
    ) -> CifuzzResult<()> {
        self.prepare_corpus_dirs()?;
        let args = self.fuzzer_args()?;
        let env = self.fuzzer_env()?;
        self.run_fuzzer(args, env, token, handler).await
    }

    fn prepare_corpus_dirs(&self) -> CifuzzResult<()> {
        std::fs::create_dir_all(&self.opts.generated_corpus_dir)?;
        std::fs::create_dir_all(&self.opts.artifacts_dir)?;
        Ok(())
    }

    /// The composed engine arguments, without the executable.
    pub(crate) fn engine_args(&self) -> CifuzzResult<Vec<String>> {
        let mut args = Vec::new();
        if let Some(timeout) = self.opts.timeout {
            args.push(format!("-timeout={}", timeout.as_secs().max(1)));
        }
        args.push(format!("-error_exitcode={}", runner::LIBFUZZER_ERROR_EXIT_CODE));
        args.push(format!(
            "-timeout_exitcode={}",
            runner::LIBFUZZER_TIMEOUT_EXIT_CODE
        ));
        // libFuzzer is whitespace-sensitive about the artifact prefix, and
        // treats it as a plain string prefix: the trailing slash is what
        // makes it a directory.
        let artifacts_dir = fileutil::canonical_path(&self.opts.artifacts_dir)?;
        args.push(format!("-artifact_prefix={}/", artifacts_dir.display()));

        // The generated corpus must be the first positional argument:
        // libFuzzer writes new corpus entries into the first directory.
        let generated_corpus = fileutil::canonical_path(&self.opts.generated_corpus_dir)?;
        args.push(generated_corpus.display().to_string());
        for dir in &self.opts.seed_corpus_dirs {
            args.push(fileutil::canonical_path(dir)?.display().to_string());
        }

        if let Some(dictionary) = &self.opts.dictionary {
            args.push(format!(
                "-dict={}",
                fileutil::canonical_path(dictionary)?.display()
            ));
        }

        args.extend(self.opts.engine_args.iter().cloned());
        Ok(args)
    }

    fn fuzzer_args(&self) -> CifuzzResult<Vec<String>> {
        let mut args = vec![self.opts.fuzz_target.display().to_string()];
        args.extend(self.engine_args()?);
        Ok(args)
    }

    pub(crate) fn fuzzer_env(&self) -> CifuzzResult<Vec<String>> {
        let mut env = runner::fuzzer_environment()?;
        env = runner::set_common_asan_options(env)?;
        env = runner::set_common_ubsan_options(env)?;
        if !self.opts.library_dirs.is_empty() {
            let dirs: Vec<String> = self
                .opts
                .library_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            let list = envutil::append_to_path_list(&envutil::getenv(&env, "LD_LIBRARY_PATH"), &dirs);
            env = envutil::setenv(env, "LD_LIBRARY_PATH", &list)?;
        }
        env = runner::add_env_flags(env, &self.opts.env_vars)?;
        Ok(env)
    }

    /// Spawns the (possibly sandboxed) fuzzer, pipes its output through the
    /// parser into the handler and classifies the exit status. Used by both
    /// the native and the JVM runner.
    pub(crate) async fn run_fuzzer(
        &self,
        args: Vec<String>,
        env: Vec<String>,
        token: CancellationToken,
        handler: &mut ReportHandler,
    ) -> CifuzzResult<()> {
        let mut sandbox = None;
        let argv = if self.opts.use_minijail {
            let jail = Minijail::new(&minijail::Options {
                args,
                env: env.clone(),
                bindings: self.sandbox_bindings()?,
            })?;
            let argv = jail.args().to_vec();
            // Keep the sandbox alive (and its chroot on disk) for the whole
            // run; cleanup happens on drop, also on early returns.
            sandbox = Some(jail);
            argv
        } else {
            args
        };
        let _sandbox = sandbox;

        let command = argv.join(" ");
        tracing::debug!(command = %command, "starting fuzzer");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(env.iter().filter_map(|e| e.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| CifuzzError::Runner {
            command: command.clone(),
            message: format!("failed to start fuzzer: {err}"),
        })?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(OutputSource, String)>();
        spawn_reader(child.stdout.take(), OutputSource::Stdout, line_tx.clone());
        spawn_reader(child.stderr.take(), OutputSource::Stderr, line_tx);

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Report>();
        let mut parser = OutputParser::new(
            ParserOptions {
                build_dir: Some(self.opts.build_dir.clone()),
            },
            report_tx,
        );
        let parser_task = tokio::spawn(async move {
            while let Some((source, line)) = line_rx.recv().await {
                parser.parse_line(source, &line);
            }
            // Emits the terminal Finished event, synthesized even when the
            // child was killed.
            parser.finish();
            (parser.found_finding(), parser.output_tail())
        });

        let supervise = async {
            let reason = tokio::select! {
                status = child.wait() => {
                    return Ok::<_, CifuzzError>((status?, StopReason::Exited));
                }
                _ = token.cancelled() => StopReason::Cancelled,
                _ = run_timeout(self.opts.timeout) => StopReason::TimedOut,
            };
            if reason == StopReason::TimedOut {
                tracing::info!("run timeout reached, stopping the fuzzer");
            }
            let status = terminate(&mut child).await?;
            Ok((status, reason))
        };
        let consume = async {
            while let Some(report) = report_rx.recv().await {
                handler.handle_report(report)?;
            }
            Ok::<_, CifuzzError>(())
        };

        let (supervised, consumed) = tokio::join!(supervise, consume);
        let (status, reason) = supervised?;
        consumed?;
        let (found_finding, output_tail) = parser_task
            .await
            .map_err(|err| CifuzzError::Internal(format!("parser task panicked: {err}")))?;

        self.check_result(status, reason, found_finding, &output_tail, &command, handler)
    }

    fn check_result(
        &self,
        status: std::process::ExitStatus,
        reason: StopReason,
        found_finding: bool,
        output_tail: &[String],
        command: &str,
        handler: &mut ReportHandler,
    ) -> CifuzzResult<()> {
        if reason != StopReason::Exited {
            // Cancellation surfaces as a SignalError in the caller; a run
            // timeout is a graceful stop.
            return Ok(());
        }
        match status.code() {
            Some(0) => Ok(()),
            Some(runner::LIBFUZZER_TIMEOUT_EXIT_CODE) => {
                if !found_finding {
                    handler.handle_report(Report::EngineError {
                        message: "libFuzzer reported a timeout without a finding".to_string(),
                    })?;
                }
                Err(CifuzzError::FindingSignalled {
                    exit_code: crate::error::FUZZING_ERROR_EXIT_CODE,
                })
            }
            Some(runner::LIBFUZZER_OOM_EXIT_CODE) => {
                if !found_finding {
                    handler.handle_report(Report::EngineError {
                        message: "libFuzzer ran out of memory without a finding".to_string(),
                    })?;
                }
                Err(CifuzzError::FindingSignalled {
                    exit_code: crate::error::FUZZING_ERROR_EXIT_CODE,
                })
            }
            Some(runner::LIBFUZZER_ERROR_EXIT_CODE) => Err(CifuzzError::FindingSignalled {
                exit_code: crate::error::FUZZING_ERROR_EXIT_CODE,
            }),
            Some(runner::SANITIZER_ERROR_EXIT_CODE) => Err(CifuzzError::FindingSignalled {
                exit_code: crate::error::SANITIZER_ERROR_EXIT_CODE,
            }),
            Some(code) => Err(CifuzzError::Runner {
                command: command.to_string(),
                message: format!(
                    "unexpected exit code {code}\n{}",
                    output_tail.join("\n")
                ),
            }),
            None => Err(CifuzzError::Runner {
                command: command.to_string(),
                message: "the fuzzer was killed by a signal".to_string(),
            }),
        }
    }

    fn sandbox_bindings(&self) -> CifuzzResult<Vec<Binding>> {
        let mut bindings = vec![Binding::read_only(&self.opts.build_dir)];
        for path in &self.opts.read_only_bindings {
            bindings.push(Binding::read_only(path));
        }
        // The corpus and artifact directories are written by the engine.
        bindings.push(Binding::read_write(&self.opts.generated_corpus_dir));
        bindings.push(Binding::read_write(&self.opts.artifacts_dir));
        for dir in &self.opts.seed_corpus_dirs {
            bindings.push(Binding::read_only(dir));
        }
        // The whole LLVM installation, so that the symbolizer and its own
        // libraries resolve inside the chroot.
        if let Ok(symbolizer) = runfiles::llvm_symbolizer_path() {
            let resolved = fileutil::canonical_path(&symbolizer)?;
            if let Some(llvm_dir) = resolved.parent().and_then(|p| p.parent()) {
                bindings.push(Binding::read_only(llvm_dir));
            }
        }
        Ok(bindings)
    }
}

fn spawn_reader<R>(
    stream: Option<R>,
    source: OutputSource,
    line_tx: mpsc::UnboundedSender<(OutputSource, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send((source, line)).is_err() {
                break;
            }
        }
    });
}

async fn run_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Terminates the child: SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) -> CifuzzResult<std::process::ExitStatus> {
    send_sigterm(child);
    match tokio::time::timeout(SIGTERM_GRACE_PERIOD, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            let _ = child.start_kill();
            Ok(child.wait().await?)
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(id) = child.id() {
        let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    // No SIGTERM; the grace period then escalates to a hard kill.
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with(dir: &std::path::Path, opts: impl FnOnce(&mut RunnerOptions)) -> Runner {
        let mut options = RunnerOptions {
            fuzz_target: dir.join("my_fuzz_test"),
            project_dir: dir.to_path_buf(),
            build_dir: dir.join("build"),
            generated_corpus_dir: dir.join("corpus"),
            seed_corpus_dirs: Vec::new(),
            artifacts_dir: dir.join("artifacts"),
            dictionary: None,
            engine_args: Vec::new(),
            env_vars: Vec::new(),
            library_dirs: Vec::new(),
            timeout: None,
            use_minijail: false,
            read_only_bindings: Vec::new(),
        };
        opts(&mut options);
        Runner::new(options)
    }

    #[test]
    fn generated_corpus_is_the_first_positional_argument() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |opts| {
            opts.seed_corpus_dirs = vec![dir.path().join("seeds")];
            opts.engine_args = vec!["-runs=0".to_string()];
        });
        runner.prepare_corpus_dirs().unwrap();
        let args = runner.engine_args().unwrap();

        let first_positional = args
            .iter()
            .position(|a| !a.starts_with('-'))
            .expect("no positional args");
        assert!(
            args[first_positional].ends_with("corpus"),
            "expected the generated corpus first, got {args:?}"
        );
        let seed_position = args.iter().position(|a| a.ends_with("seeds")).unwrap();
        assert!(first_positional < seed_position);
        assert_eq!(args.last().unwrap(), "-runs=0");
    }

    #[test]
    fn artifact_prefix_always_ends_with_a_slash() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |_| {});
        runner.prepare_corpus_dirs().unwrap();
        let args = runner.engine_args().unwrap();
        let prefix = args
            .iter()
            .find(|a| a.starts_with("-artifact_prefix="))
            .unwrap();
        assert!(prefix.ends_with('/'), "got {prefix}");
    }

    #[test]
    fn exit_code_arguments_match_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |opts| {
            opts.timeout = Some(Duration::from_secs(90));
        });
        runner.prepare_corpus_dirs().unwrap();
        let args = runner.engine_args().unwrap();
        assert_eq!(args[0], "-timeout=90");
        assert!(args.contains(&"-error_exitcode=77".to_string()));
        assert!(args.contains(&"-timeout_exitcode=70".to_string()));
    }

    #[test]
    fn dictionaries_are_passed_via_dash_dict() {
        let dir = tempfile::tempdir().unwrap();
        let dict = dir.path().join("my.dict");
        std::fs::write(&dict, b"kw=\"magic\"\n").unwrap();
        let runner = runner_with(dir.path(), |opts| {
            opts.dictionary = Some(dict.clone());
        });
        runner.prepare_corpus_dirs().unwrap();
        let args = runner.engine_args().unwrap();
        assert!(args.iter().any(|a| a.starts_with("-dict=")));
    }

    #[test]
    fn env_var_overrides_replace_inherited_values() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |opts| {
            opts.env_vars = vec!["NO_CIFUZZ=1".to_string()];
        });
        let env = runner.fuzzer_env().unwrap();
        assert_eq!(envutil::getenv(&env, "NO_CIFUZZ"), "1");
        assert_eq!(envutil::getenv(&env, "LLVM_SYMBOLIZER_OPTS"), "--relativenames");
    }

    #[tokio::test]
    async fn clean_exit_classifies_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |_| {});
        let mut handler = ReportHandler::new(crate::report_handler::ReportHandlerOptions {
            project_dir: dir.path().to_path_buf(),
            generated_corpus: dir.path().join("corpus"),
            default_seed_corpus: dir.path().join("seeds"),
            seed_corpus_dirs: Vec::new(),
            build_dir: None,
            print_json: false,
        });
        let token = CancellationToken::new();
        runner
            .run_fuzzer(
                vec!["true".to_string()],
                Vec::new(),
                token,
                &mut handler,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sanitizer_exit_code_signals_a_finding() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |_| {});
        let mut handler = ReportHandler::new(crate::report_handler::ReportHandlerOptions {
            project_dir: dir.path().to_path_buf(),
            generated_corpus: dir.path().join("corpus"),
            default_seed_corpus: dir.path().join("seeds"),
            seed_corpus_dirs: Vec::new(),
            build_dir: None,
            print_json: false,
        });
        let token = CancellationToken::new();
        let err = runner
            .run_fuzzer(
                vec!["sh".to_string(), "-c".to_string(), "exit 78".to_string()],
                Vec::new(),
                token,
                &mut handler,
            )
            .await
            .unwrap_err();
        match err {
            CifuzzError::FindingSignalled { exit_code } => assert_eq!(exit_code, 78),
            other => panic!("expected FindingSignalled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_child_without_an_exit_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |_| {});
        let mut handler = ReportHandler::new(crate::report_handler::ReportHandlerOptions {
            project_dir: dir.path().to_path_buf(),
            generated_corpus: dir.path().join("corpus"),
            default_seed_corpus: dir.path().join("seeds"),
            seed_corpus_dirs: Vec::new(),
            build_dir: None,
            print_json: false,
        });
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        runner
            .run_fuzzer(
                vec!["sleep".to_string(), "30".to_string()],
                Vec::new(),
                token,
                &mut handler,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_timeout_is_a_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), |opts| {
            opts.timeout = Some(Duration::from_millis(200));
        });
        let mut handler = ReportHandler::new(crate::report_handler::ReportHandlerOptions {
            project_dir: dir.path().to_path_buf(),
            generated_corpus: dir.path().join("corpus"),
            default_seed_corpus: dir.path().join("seeds"),
            seed_corpus_dirs: Vec::new(),
            build_dir: None,
            print_json: false,
        });
        let token = CancellationToken::new();
        runner
            .run_fuzzer(
                vec!["sleep".to_string(), "30".to_string()],
                Vec::new(),
                token,
                &mut handler,
            )
            .await
            .unwrap();
    }
}
