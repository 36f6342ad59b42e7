//! Structured fuzzer output: metrics, findings and run statistics.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single output event produced by the parser. Events flow one-way from
/// the parser to the report handler, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    Metric(MetricReport),
    Finding(FindingReport),
    EngineError { message: String },
    Finished { stats: Option<MetricReport> },
}

/// A snapshot of the engine's progress counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricReport {
    #[serde(rename = "totalExecs")]
    pub total_execs: u64,
    #[serde(rename = "corpusSize")]
    pub corpus_size: u64,
    pub features: u64,
    pub coverage: u64,
    #[serde(rename = "execsPerSecond")]
    pub execs_per_second: u64,
    #[serde(rename = "rssMb")]
    pub rss_mb: u64,
    #[serde(rename = "runtimeSeconds")]
    pub runtime_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    HeapBufferOverflow,
    UseAfterFree,
    UndefinedBehavior,
    Timeout,
    OutOfMemory,
    RemoteCodeExecution,
    Crash,
    SlowInput,
    Other,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::HeapBufferOverflow => "heap-buffer-overflow",
            FindingKind::UseAfterFree => "use-after-free",
            FindingKind::UndefinedBehavior => "undefined-behavior",
            FindingKind::Timeout => "timeout",
            FindingKind::OutOfMemory => "out-of-memory",
            FindingKind::RemoteCodeExecution => "remote-code-execution",
            FindingKind::Crash => "crash",
            FindingKind::SlowInput => "slow-input",
            FindingKind::Other => "other",
        }
    }

    /// Maps the raw issue name printed by a sanitizer or by libFuzzer onto
    /// the finding taxonomy.
    pub fn from_engine_kind(kind: &str) -> FindingKind {
        let kind = kind.trim();
        if kind.ends_with("buffer-overflow") || kind.contains("buffer-overflow on") {
            return FindingKind::HeapBufferOverflow;
        }
        match kind {
            "heap-use-after-free" | "use-after-free" | "double-free" | "use-after-poison"
            | "stack-use-after-return" | "stack-use-after-scope" => FindingKind::UseAfterFree,
            "timeout" => FindingKind::Timeout,
            "out-of-memory" => FindingKind::OutOfMemory,
            "SEGV" | "deadly signal" | "abort" | "ABRT" => FindingKind::Crash,
            _ => FindingKind::Other,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            FindingKind::RemoteCodeExecution => Severity::Critical,
            FindingKind::HeapBufferOverflow | FindingKind::UseAfterFree | FindingKind::Crash => {
                Severity::High
            }
            FindingKind::UndefinedBehavior | FindingKind::OutOfMemory => Severity::Medium,
            FindingKind::Timeout | FindingKind::SlowInput | FindingKind::Other => Severity::Low,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One entry of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingReport {
    /// The issue name as printed by the engine, e.g. "heap-use-after-free".
    pub name: String,
    pub kind: FindingKind,
    pub message: String,
    pub severity: Severity,
    #[serde(rename = "stackTrace", default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<Frame>,
    /// The crash artifact written by the engine.
    #[serde(rename = "inputPath", skip_serializing_if = "Option::is_none")]
    pub input_path: Option<PathBuf>,
    /// Raw engine output belonging to this finding, verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

/// How many leading stack frames go into the fingerprint.
const FINGERPRINT_FRAMES: usize = 3;

impl FindingReport {
    /// A stable identifier for deduplication: SHA-256 over the finding kind
    /// and the top frames of the stack trace, after stripping
    /// instrumentation frames and normalizing paths against `build_dir`.
    pub fn fingerprint(&self, build_dir: Option<&Path>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        for frame in relevant_frames(&self.stack_trace).take(FINGERPRINT_FRAMES) {
            hasher.update(b"\n");
            hasher.update(frame.function.as_bytes());
            if let Some(file) = &frame.file {
                hasher.update(b"@");
                hasher.update(normalize_path(file, build_dir).as_bytes());
            }
            if let Some(line) = frame.line {
                hasher.update(b":");
                hasher.update(line.to_string().as_bytes());
            }
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Filters out frames that belong to the instrumentation rather than the
/// code under test.
fn relevant_frames<'a>(frames: &'a [Frame]) -> impl Iterator<Item = &'a Frame> {
    frames.iter().filter(|f| !is_instrumentation_frame(f))
}

fn is_instrumentation_frame(frame: &Frame) -> bool {
    const PREFIXES: &[&str] = &[
        "__asan",
        "__ubsan",
        "__sanitizer",
        "__interceptor",
        "__libc_start",
        "_start",
        "fuzzer::",
        "com.code_intelligence.jazzer.",
        "jdk.internal.",
    ];
    PREFIXES.iter().any(|p| frame.function.starts_with(p))
}

fn normalize_path(file: &str, build_dir: Option<&Path>) -> String {
    if let Some(build_dir) = build_dir {
        if let Ok(rel) = Path::new(file).strip_prefix(build_dir) {
            return rel.to_string_lossy().into_owned();
        }
    }
    file.to_string()
}
