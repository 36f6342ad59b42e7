//! cifuzz CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use cifuzz::cmd::bundle::{self, BundleOptions};
use cifuzz::cmd::remote_run::{self, RemoteRunOptions};
use cifuzz::cmd::run::{self, RunOptions};
use cifuzz::util::duration::CifuzzDuration;
use cifuzz::CifuzzError;

#[derive(Debug, Parser)]
#[command(name = "cifuzz")]
#[command(about = "build, run and bundle fuzz tests")]
struct Cli {
    /// Verbose output, including the commands being executed.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// The project root. Defaults to the closest parent directory
    /// containing a cifuzz.yaml.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build and run a fuzz test
    Run {
        /// Name of the fuzz test: a CMake target, a Bazel label, a JVM
        /// class name or an executable basename.
        fuzz_test: String,

        /// Additional arguments forwarded to the build tool.
        #[arg(last = true)]
        build_tool_args: Vec<String>,

        /// Command building the fuzz test (build system type "other").
        #[arg(long)]
        build_command: Option<String>,

        /// Number of parallel build jobs. 0 picks a sensible default.
        #[arg(long)]
        build_jobs: Option<u32>,

        /// Only build the fuzz test, don't run it.
        #[arg(long)]
        build_only: bool,

        /// Dictionary steering the engine's mutations.
        #[arg(long)]
        dict: Option<PathBuf>,

        /// Additional engine argument (repeatable).
        #[arg(long = "engine-arg")]
        engine_args: Vec<String>,

        /// Seed corpus directory (repeatable).
        #[arg(long = "seed-corpus")]
        seed_corpus_dirs: Vec<PathBuf>,

        /// Maximum run time, e.g. "30m".
        #[arg(long)]
        timeout: Option<CifuzzDuration>,

        /// Run the fuzz test in a sandbox.
        #[arg(long)]
        use_sandbox: bool,

        /// Print output as one JSON object per event.
        #[arg(long)]
        print_json: bool,
    },

    /// Bundle fuzz tests into a self-contained archive
    Bundle {
        /// Fuzz tests to bundle; all of them when omitted.
        fuzz_tests: Vec<String>,

        /// Additional arguments forwarded to the build tool.
        #[arg(last = true)]
        build_tool_args: Vec<String>,

        /// Output path of the archive.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Branch name stored in the bundle metadata.
        #[arg(long)]
        branch: Option<String>,

        /// Commit stored in the bundle metadata.
        #[arg(long)]
        commit: Option<String>,

        /// Docker image the bundle should run in.
        #[arg(long)]
        docker_image: Option<String>,

        /// Environment variable for the bundled fuzzers: KEY=VAL, or KEY
        /// to capture the local value (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,

        #[arg(long)]
        build_command: Option<String>,

        #[arg(long)]
        build_jobs: Option<u32>,

        #[arg(long)]
        dict: Option<PathBuf>,

        #[arg(long = "engine-arg")]
        engine_args: Vec<String>,

        #[arg(long = "seed-corpus")]
        seed_corpus_dirs: Vec<PathBuf>,

        /// Maximum run time of the bundled fuzzers, e.g. "100m".
        #[arg(long)]
        timeout: Option<CifuzzDuration>,
    },

    /// Upload a bundle and start a remote fuzzing run
    RemoteRun {
        /// Path of the bundle to upload.
        #[arg(long)]
        bundle: PathBuf,

        /// Name of the remote project.
        #[arg(long)]
        project: String,

        /// URL of the remote fuzzing server.
        #[arg(long)]
        server: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // A finding is the expected outcome of a successful fuzzing
            // run; the summary was already printed.
            if !matches!(err, CifuzzError::FindingSignalled { .. }) {
                eprintln!("{err}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), CifuzzError> {
    match cli.command {
        Command::Run {
            fuzz_test,
            build_tool_args,
            build_command,
            build_jobs,
            build_only,
            dict,
            engine_args,
            seed_corpus_dirs,
            timeout,
            use_sandbox,
            print_json,
        } => run::run(RunOptions {
            fuzz_test,
            build_tool_args,
            build_command,
            build_jobs,
            dictionary: dict,
            engine_args,
            seed_corpus_dirs,
            timeout: timeout.map(|d| d.0),
            use_sandbox,
            print_json,
            build_only,
            project_dir: cli.project_dir,
            verbose: cli.verbose,
        }),

        Command::Bundle {
            fuzz_tests,
            build_tool_args,
            output,
            branch,
            commit,
            docker_image,
            env,
            build_command,
            build_jobs,
            dict,
            engine_args,
            seed_corpus_dirs,
            timeout,
        } => bundle::bundle(BundleOptions {
            fuzz_tests,
            output,
            branch,
            commit,
            docker_image,
            env,
            build_tool_args,
            build_command,
            build_jobs,
            dictionary: dict,
            engine_args,
            seed_corpus_dirs,
            timeout: timeout.map(|d| d.0),
            project_dir: cli.project_dir,
            verbose: cli.verbose,
        }),

        Command::RemoteRun {
            bundle,
            project,
            server,
        } => remote_run::remote_run(RemoteRunOptions {
            bundle,
            project,
            server,
        }),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
