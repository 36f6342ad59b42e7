//! Line-oriented parser for libFuzzer and Jazzer output.
//!
//! The runner feeds the child's stdout and stderr through this state
//! machine line by line. Recognized lines become [`Report`] events; all
//! other lines are forwarded to the log verbatim so no output is lost.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use tokio::sync::mpsc;

use crate::report::{FindingKind, FindingReport, Frame, MetricReport, Report, Severity};

/// Number of raw output lines kept for error context when the child exits
/// unexpectedly.
const OUTPUT_TAIL_LINES: usize = 50;

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?P<execs>\d+)\s+(?P<event>INITED|NEW|REDUCE|pulse|DONE|RELOAD|LOADED)\b(?P<rest>.*)$")
        .unwrap()
});
static COV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bcov: (\d+)").unwrap());
static FT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bft: (\d+)").unwrap());
static CORP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bcorp: (\d+)").unwrap());
static EXECS_PER_SEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexec/s: (\d+)").unwrap());
static RSS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\brss: (\d+)Mb").unwrap());

static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^==\d+==\s*ERROR: (?P<source>AddressSanitizer|UndefinedBehaviorSanitizer|LeakSanitizer|MemorySanitizer|ThreadSanitizer|libFuzzer): (?P<msg>.+)$",
    )
    .unwrap()
});
static UBSAN_RUNTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^ :]+):(?P<line>\d+):(?P<col>\d+): runtime error: (?P<msg>.+)$")
        .unwrap()
});
static NATIVE_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+#\d+ 0x[0-9a-fA-F]+ in (?P<rest>.+)$").unwrap());
static FRAME_LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<file>[^\s:]+):(?P<line>\d+)(?::(?P<col>\d+))?$").unwrap());
static ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"artifact_prefix='[^']*'; (?:Test|Slow) unit written to (?P<path>.+)$").unwrap()
});
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*SUMMARY: ").unwrap());
static JAVA_EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^== Java Exception: (?P<class>[\w.$]+)(?:: (?P<msg>.*))?$").unwrap()
});
static JAVA_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+at (?P<function>[\w.$/<>]+)\((?:(?P<file>[\w.$]+?)(?::(?P<line>\d+))?|Native Method)\)$")
        .unwrap()
});
static SLOW_INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Slow input detected\. Processing time: (?P<secs>\d+)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Idle,
    /// A finding header was seen; frames haven't started yet.
    FindingPreamble,
    StackTrace,
    /// The stack trace ended; waiting for the artifact line.
    FindingTail,
    Finished,
}

#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Used to normalize stack frame paths for stable fingerprints.
    pub build_dir: Option<PathBuf>,
}

struct PendingFinding {
    name: String,
    kind: FindingKind,
    message: String,
    severity: Severity,
    frames: Vec<Frame>,
    input_path: Option<PathBuf>,
    logs: Vec<String>,
}

pub struct OutputParser {
    opts: ParserOptions,
    state: ParserState,
    sender: mpsc::UnboundedSender<Report>,
    pending: Option<PendingFinding>,
    last_metric: Option<MetricReport>,
    num_findings: usize,
    started: Instant,
    tail: std::collections::VecDeque<String>,
}

impl OutputParser {
    pub fn new(opts: ParserOptions, sender: mpsc::UnboundedSender<Report>) -> Self {
        OutputParser {
            opts,
            state: ParserState::Idle,
            sender,
            pending: None,
            last_metric: None,
            num_findings: 0,
            started: Instant::now(),
            tail: std::collections::VecDeque::with_capacity(OUTPUT_TAIL_LINES),
        }
    }

    /// Whether at least one finding was emitted. Used by the runner to
    /// decide how to interpret engine exit codes.
    pub fn found_finding(&self) -> bool {
        self.num_findings > 0
    }

    /// The last raw output lines, for error context.
    pub fn output_tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    pub fn parse_line(&mut self, source: OutputSource, line: &str) {
        if self.state == ParserState::Finished {
            return;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        self.remember(line);

        if let Some(metric) = self.parse_status_line(line) {
            self.last_metric = Some(metric.clone());
            self.send(Report::Metric(metric));
            return;
        }

        if self.parse_finding_header(line) {
            return;
        }

        match self.state {
            ParserState::FindingPreamble | ParserState::StackTrace => {
                self.parse_finding_body(line);
            }
            ParserState::FindingTail => {
                if let Some(path) = parse_artifact_line(line) {
                    if let Some(pending) = self.pending.as_mut() {
                        pending.input_path = Some(path);
                        pending.logs.push(line.to_string());
                    }
                    self.emit_pending();
                    return;
                }
                if let Some(pending) = self.pending.as_mut() {
                    pending.logs.push(line.to_string());
                }
            }
            ParserState::Idle | ParserState::Finished => {
                let stream = match source {
                    OutputSource::Stdout => "stdout",
                    OutputSource::Stderr => "stderr",
                };
                tracing::debug!(target: "fuzzer", stream, "{line}");
            }
        }
    }

    /// Finalizes the stream: flushes a finding that never saw its artifact
    /// line and emits the terminal `Finished` event.
    pub fn finish(&mut self) {
        if self.pending.is_some() {
            self.emit_pending();
        }
        if self.state != ParserState::Finished {
            self.state = ParserState::Finished;
            let mut stats = self.last_metric.clone();
            if let Some(stats) = stats.as_mut() {
                stats.runtime_seconds = self.started.elapsed().as_secs();
            }
            self.send(Report::Finished { stats });
        }
    }

    fn parse_status_line(&self, line: &str) -> Option<MetricReport> {
        let captures = STATUS_RE.captures(line)?;
        let rest = captures.name("rest").map(|m| m.as_str()).unwrap_or("");
        let field = |re: &Regex| {
            re.captures(rest)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0)
        };
        Some(MetricReport {
            total_execs: captures["execs"].parse().unwrap_or(0),
            corpus_size: field(&CORP_RE),
            features: field(&FT_RE),
            coverage: field(&COV_RE),
            execs_per_second: field(&EXECS_PER_SEC_RE),
            rss_mb: field(&RSS_RE),
            runtime_seconds: self.started.elapsed().as_secs(),
        })
    }

    /// Recognizes the lines that open a finding. Returns true if the line
    /// was consumed.
    fn parse_finding_header(&mut self, line: &str) -> bool {
        if let Some(captures) = ERROR_RE.captures(line) {
            let source = &captures["source"];
            let msg = &captures["msg"];
            let raw_kind = if source == "libFuzzer" {
                libfuzzer_error_kind(msg)
            } else {
                msg.split([' ', ':']).next().unwrap_or(msg).to_string()
            };
            let kind = FindingKind::from_engine_kind(&raw_kind);
            self.begin_finding(PendingFinding {
                name: raw_kind,
                kind,
                message: format!("{source}: {msg}"),
                severity: kind.default_severity(),
                frames: Vec::new(),
                input_path: None,
                logs: vec![line.to_string()],
            });
            return true;
        }

        if let Some(captures) = UBSAN_RUNTIME_RE.captures(line) {
            let frame = Frame {
                function: String::new(),
                file: Some(captures["file"].to_string()),
                line: captures["line"].parse().ok(),
                column: captures["col"].parse().ok(),
            };
            let kind = FindingKind::UndefinedBehavior;
            self.begin_finding(PendingFinding {
                name: "undefined-behavior".to_string(),
                kind,
                message: captures["msg"].to_string(),
                severity: kind.default_severity(),
                frames: vec![frame],
                input_path: None,
                logs: vec![line.to_string()],
            });
            return true;
        }

        if let Some(captures) = JAVA_EXCEPTION_RE.captures(line) {
            let class = captures["class"].to_string();
            let message = captures
                .name("msg")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let (kind, severity) = jazzer_kind(&class, &message);
            self.begin_finding(PendingFinding {
                name: class,
                kind,
                message,
                severity,
                frames: Vec::new(),
                input_path: None,
                logs: vec![line.to_string()],
            });
            return true;
        }

        if let Some(captures) = SLOW_INPUT_RE.captures(line) {
            let kind = FindingKind::SlowInput;
            self.begin_finding(PendingFinding {
                name: "slow-input".to_string(),
                kind,
                message: format!(
                    "slow input detected, processing took {} seconds",
                    &captures["secs"]
                ),
                severity: kind.default_severity(),
                frames: Vec::new(),
                input_path: None,
                logs: vec![line.to_string()],
            });
            self.state = ParserState::FindingTail;
            return true;
        }

        false
    }

    fn parse_finding_body(&mut self, line: &str) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.logs.push(line.to_string());

        if let Some(frame) = parse_native_frame(line).or_else(|| parse_java_frame(line)) {
            pending.frames.push(frame);
            self.state = ParserState::StackTrace;
            return;
        }

        if SUMMARY_RE.is_match(line) {
            self.state = ParserState::FindingTail;
            return;
        }

        if let Some(path) = parse_artifact_line(line) {
            pending.input_path = Some(path);
            self.emit_pending();
        }
    }

    fn begin_finding(&mut self, finding: PendingFinding) {
        // A second header before the previous finding completed closes the
        // previous one; findings are never dropped.
        if self.pending.is_some() {
            self.emit_pending();
        }
        self.pending = Some(finding);
        self.state = ParserState::FindingPreamble;
    }

    fn emit_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.num_findings += 1;
        self.state = ParserState::Idle;
        self.send(Report::Finding(FindingReport {
            name: pending.name,
            kind: pending.kind,
            message: pending.message,
            severity: pending.severity,
            stack_trace: pending.frames,
            input_path: pending.input_path,
            logs: pending.logs,
        }));
    }

    fn send(&self, report: Report) {
        // The channel is unbounded; a send only fails when the handler is
        // gone, in which case the run is over anyway.
        let _ = self.sender.send(report);
    }

    fn remember(&mut self, line: &str) {
        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// The build dir used to normalize frame paths in fingerprints.
    pub fn build_dir(&self) -> Option<&std::path::Path> {
        self.opts.build_dir.as_deref()
    }
}

fn libfuzzer_error_kind(msg: &str) -> String {
    if msg.starts_with("timeout") {
        "timeout".to_string()
    } else if msg.starts_with("out-of-memory") {
        "out-of-memory".to_string()
    } else if msg.starts_with("deadly signal") {
        "deadly signal".to_string()
    } else {
        msg.to_string()
    }
}

/// Jazzer reports security issues via dedicated exception classes whose
/// names carry the severity.
fn jazzer_kind(class: &str, message: &str) -> (FindingKind, Severity) {
    let kind = if message.contains("Remote Code Execution") {
        FindingKind::RemoteCodeExecution
    } else if class.ends_with("OutOfMemoryError") {
        FindingKind::OutOfMemory
    } else {
        FindingKind::Crash
    };
    let severity = if class.ends_with("FuzzerSecurityIssueCritical") {
        Severity::Critical
    } else if class.ends_with("FuzzerSecurityIssueHigh") {
        Severity::High
    } else if class.ends_with("FuzzerSecurityIssueMedium") {
        Severity::Medium
    } else if class.ends_with("FuzzerSecurityIssueLow") {
        Severity::Low
    } else {
        kind.default_severity()
    };
    (kind, severity)
}

fn parse_native_frame(line: &str) -> Option<Frame> {
    let captures = NATIVE_FRAME_RE.captures(line)?;
    let rest = captures["rest"].trim();

    // The symbol may contain spaces; the location, if any, is the last
    // whitespace-separated token of the form path:line[:col].
    if let Some((function, location)) = rest.rsplit_once(' ') {
        if let Some(loc) = FRAME_LOCATION_RE.captures(location) {
            return Some(Frame {
                function: function.trim().to_string(),
                file: Some(loc["file"].to_string()),
                line: loc["line"].parse().ok(),
                column: loc.name("col").and_then(|c| c.as_str().parse().ok()),
            });
        }
    }
    Some(Frame {
        function: rest.to_string(),
        file: None,
        line: None,
        column: None,
    })
}

fn parse_java_frame(line: &str) -> Option<Frame> {
    let captures = JAVA_FRAME_RE.captures(line)?;
    Some(Frame {
        function: captures["function"].to_string(),
        file: captures.name("file").map(|m| m.as_str().to_string()),
        line: captures
            .name("line")
            .and_then(|m| m.as_str().parse().ok()),
        column: None,
    })
}

fn parse_artifact_line(line: &str) -> Option<PathBuf> {
    ARTIFACT_RE
        .captures(line)
        .map(|c| PathBuf::from(c["path"].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &[&str]) -> Vec<Report> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut parser = OutputParser::new(ParserOptions::default(), tx);
        for line in lines {
            parser.parse_line(OutputSource::Stderr, line);
        }
        parser.finish();
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[test]
    fn status_lines_become_metrics() {
        let reports = parse_all(&[
            "#2\tINITED cov: 3 ft: 3 corp: 1/1b exec/s: 0 rss: 27Mb",
            "#524288\tpulse  cov: 4 ft: 4 corp: 2/3b lim: 4096 exec/s: 174762 rss: 28Mb",
        ]);
        let Report::Metric(first) = &reports[0] else {
            panic!("expected metric, got {:?}", reports[0]);
        };
        assert_eq!(first.total_execs, 2);
        assert_eq!(first.coverage, 3);
        assert_eq!(first.corpus_size, 1);

        let Report::Metric(second) = &reports[1] else {
            panic!("expected metric, got {:?}", reports[1]);
        };
        assert_eq!(second.execs_per_second, 174762);
        assert_eq!(second.rss_mb, 28);

        assert!(matches!(reports.last(), Some(Report::Finished { .. })));
    }

    #[test]
    fn asan_reports_become_findings_with_stack_and_input() {
        let reports = parse_all(&[
            "==1234==ERROR: AddressSanitizer: heap-use-after-free on address 0x602000000050 at pc 0x00000051fc7d",
            "READ of size 1 at 0x602000000050 thread T0",
            "    #0 0x51fc7c in LLVMFuzzerTestOneInput /src/my_fuzz_test.c:12:3",
            "    #1 0x42a8b1 in fuzzer::Fuzzer::ExecuteCallback(unsigned char const*, unsigned long) FuzzerLoop.cpp:611",
            "SUMMARY: AddressSanitizer: heap-use-after-free /src/my_fuzz_test.c:12:3 in LLVMFuzzerTestOneInput",
            "==1234==ABORTING",
            "artifact_prefix='./crashes/'; Test unit written to ./crashes/crash-0eb8e4ed",
        ]);

        let findings: Vec<_> = reports
            .iter()
            .filter_map(|r| match r {
                Report::Finding(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(findings.len(), 1);
        let finding = findings[0];
        assert_eq!(finding.kind, FindingKind::UseAfterFree);
        assert_eq!(finding.name, "heap-use-after-free");
        assert_eq!(finding.stack_trace.len(), 2);
        assert_eq!(finding.stack_trace[0].function, "LLVMFuzzerTestOneInput");
        assert_eq!(finding.stack_trace[0].file.as_deref(), Some("/src/my_fuzz_test.c"));
        assert_eq!(finding.stack_trace[0].line, Some(12));
        assert_eq!(finding.stack_trace[0].column, Some(3));
        assert_eq!(
            finding.input_path.as_deref(),
            Some(std::path::Path::new("./crashes/crash-0eb8e4ed"))
        );
    }

    #[test]
    fn libfuzzer_timeouts_map_to_the_timeout_kind() {
        let reports = parse_all(&[
            "ALARM: working on the last Unit for 26 seconds",
            "==77== ERROR: libFuzzer: timeout after 25 seconds",
            "    #0 0x4f1b2e in __sanitizer_print_stack_trace",
            "SUMMARY: libFuzzer: timeout",
            "artifact_prefix='./'; Test unit written to ./timeout-abc",
        ]);
        let finding = reports
            .iter()
            .find_map(|r| match r {
                Report::Finding(f) => Some(f),
                _ => None,
            })
            .expect("expected a finding");
        assert_eq!(finding.kind, FindingKind::Timeout);
    }

    #[test]
    fn jazzer_exceptions_become_findings() {
        let reports = parse_all(&[
            "== Java Exception: com.code_intelligence.jazzer.api.FuzzerSecurityIssueHigh: Remote Code Execution",
            "\tat jaz.Zer.reportFinding(Zer.java:108)",
            "\tat com.example.FuzzTestCase.fuzzerTestOneInput(FuzzTestCase.java:19)",
            "artifact_prefix='./'; Test unit written to ./crash-1111",
        ]);
        let finding = reports
            .iter()
            .find_map(|r| match r {
                Report::Finding(f) => Some(f),
                _ => None,
            })
            .expect("expected a finding");
        assert_eq!(finding.kind, FindingKind::RemoteCodeExecution);
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.stack_trace.len(), 2);
        assert_eq!(finding.stack_trace[0].function, "jaz.Zer.reportFinding");
        assert_eq!(finding.stack_trace[0].line, Some(108));
    }

    #[test]
    fn streams_without_markers_produce_no_findings() {
        let reports = parse_all(&[
            "INFO: Seed: 12345",
            "INFO: Loaded 1 modules",
            "some arbitrary program output",
            "#128 pulse  cov: 4 ft: 4 corp: 2/3b exec/s: 64 rss: 28Mb",
            "Done 128 runs in 2 second(s)",
        ]);
        assert!(!reports.iter().any(|r| matches!(r, Report::Finding(_))));
    }

    #[test]
    fn findings_without_artifact_lines_are_flushed_on_finish() {
        let reports = parse_all(&[
            "==1==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000",
            "    #0 0x51fc7c in crash() /src/lib.c:5",
        ]);
        let finding = reports
            .iter()
            .find_map(|r| match r {
                Report::Finding(f) => Some(f),
                _ => None,
            })
            .expect("expected a finding");
        assert_eq!(finding.kind, FindingKind::Crash);
        assert!(finding.input_path.is_none());
    }

    #[test]
    fn finished_is_always_the_last_event() {
        let reports = parse_all(&["#2 INITED cov: 3 ft: 3 corp: 1/1b exec/s: 0 rss: 27Mb"]);
        assert!(matches!(reports.last(), Some(Report::Finished { .. })));
        let finished_count = reports
            .iter()
            .filter(|r| matches!(r, Report::Finished { .. }))
            .count();
        assert_eq!(finished_count, 1);
    }

    #[test]
    fn symbols_with_spaces_parse_into_frames() {
        let frame = parse_native_frame(
            "    #4 0x55f0 in std::vector<int, std::allocator<int> >::at(unsigned long) /usr/include/c++/12/bits/stl_vector.h:1070:2",
        )
        .unwrap();
        assert!(frame.function.starts_with("std::vector"));
        assert_eq!(frame.line, Some(1070));
    }
}
