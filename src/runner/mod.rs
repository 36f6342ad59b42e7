//! Fuzzer process lifecycle: environment composition, spawning,
//! supervision and exit-code classification.

use std::io::IsTerminal;

use crate::util::{envutil, fileutil, runfiles};
use crate::CifuzzResult;

pub mod jazzer;
pub mod libfuzzer;

/// Exit code a sanitizer uses when it found a bug. Configured via the
/// `exitcode` sanitizer option.
pub const SANITIZER_ERROR_EXIT_CODE: i32 = 78;

/// Exit code used by libFuzzer (and Jazzer) when the engine itself reports
/// an issue. Configured via `-error_exitcode`.
pub const LIBFUZZER_ERROR_EXIT_CODE: i32 = 77;

/// Exit code used by libFuzzer on out-of-memory. Not configurable.
pub const LIBFUZZER_OOM_EXIT_CODE: i32 = 71;

/// Exit code used by libFuzzer on per-input timeouts. Configured via
/// `-timeout_exitcode`.
pub const LIBFUZZER_TIMEOUT_EXIT_CODE: i32 = 70;

/// Merges sanitizer options: `defaults` are only set when the key is not
/// present yet, `overrides` always win. The existing options string uses
/// the `key=value:key=value` syntax the sanitizers expect.
pub fn set_sanitizer_options(
    existing: &str,
    defaults: &[(&str, String)],
    overrides: &[(&str, String)],
) -> String {
    let mut options: Vec<String> = existing
        .split(':')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();

    for (key, value) in defaults {
        set_default_if_missing(&mut options, key, value);
    }
    for (key, value) in overrides {
        override_option(&mut options, key, value);
    }

    options.join(":")
}

fn set_default_if_missing(options: &mut Vec<String>, key: &str, value: &str) {
    let prefix = format!("{key}=");
    if options.iter().any(|o| o.starts_with(&prefix)) {
        return;
    }
    options.push(format!("{key}={value}"));
}

fn override_option(options: &mut Vec<String>, key: &str, value: &str) {
    let prefix = format!("{key}=");
    for option in options.iter_mut() {
        if option.starts_with(&prefix) {
            *option = format!("{key}={value}");
            return;
        }
    }
    options.push(format!("{key}={value}"));
}

/// Applies the common ASan options: colored output matching the terminal,
/// the dedicated finding exit code and logging to stderr so that the
/// parser sees the reports.
pub fn set_common_asan_options(env: Vec<String>) -> CifuzzResult<Vec<String>> {
    let defaults = [("color", sanitizer_color_value())];
    let overrides = [
        ("exitcode", SANITIZER_ERROR_EXIT_CODE.to_string()),
        ("log_path", "stderr".to_string()),
    ];
    let options = set_sanitizer_options(&envutil::getenv(&env, "ASAN_OPTIONS"), &defaults, &overrides);
    envutil::setenv(env, "ASAN_OPTIONS", &options)
}

/// Applies the common UBSan options. `print_stacktrace=1` turns the single
/// top frame UBSan prints by default into a full stack trace with paths
/// that can be mapped back to the build directory.
pub fn set_common_ubsan_options(env: Vec<String>) -> CifuzzResult<Vec<String>> {
    let defaults = [
        ("color", sanitizer_color_value()),
        ("print_stacktrace", "1".to_string()),
    ];
    let overrides = [("log_path", "stderr".to_string())];
    let options =
        set_sanitizer_options(&envutil::getenv(&env, "UBSAN_OPTIONS"), &defaults, &overrides);
    envutil::setenv(env, "UBSAN_OPTIONS", &options)
}

/// The base environment for fuzzer processes: the current environment plus
/// symbolizer settings.
pub fn fuzzer_environment() -> CifuzzResult<Vec<String>> {
    let mut env = envutil::current_env();

    // Resolve the symbolizer path so that it remains valid inside the
    // sandbox, where symlink targets may not be bound.
    match runfiles::llvm_symbolizer_path() {
        Ok(symbolizer) => {
            let symbolizer = fileutil::canonical_path(&symbolizer)?;
            env = envutil::setenv(env, "ASAN_SYMBOLIZER_PATH", &symbolizer.display().to_string())?;
        }
        Err(_) => {
            tracing::warn!(
                "llvm-symbolizer was not found in PATH; sanitizer reports will not be symbolized"
            );
        }
    }

    // Strip the build dir from symbolized paths; relative paths are less
    // confusing when the report is read on a different machine.
    env = envutil::setenv(env, "LLVM_SYMBOLIZER_OPTS", "--relativenames")?;

    Ok(env)
}

/// Applies `KEY=VAL` env var overrides from the command line.
pub fn add_env_flags(env: Vec<String>, vars: &[String]) -> CifuzzResult<Vec<String>> {
    let mut env = env;
    for entry in vars {
        let (key, value) = envutil::split_key_value(entry)?;
        env = envutil::setenv(env, key, value)?;
    }
    Ok(env)
}

fn sanitizer_color_value() -> String {
    // The sanitizers run with their output redirected into a pipe and would
    // never detect a tty on their own; colorize if and only if cifuzz's own
    // stderr is one.
    if std::io::stderr().is_terminal() {
        "always".to_string()
    } else {
        "never".to_string()
    }
}
