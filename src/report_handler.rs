//! Stateful consumer of parser reports: progress printing, finding
//! deduplication, crash corpus persistence and final metrics.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::report::{FindingReport, MetricReport, Report};
use crate::util::fileutil;
use crate::CifuzzResult;

/// Human-readable progress is printed at most once per second.
const METRIC_PRINT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReportHandlerOptions {
    pub project_dir: PathBuf,
    /// Directory the engine writes new corpus entries into. The crash
    /// corpus lives in its `crashes/` subdirectory.
    pub generated_corpus: PathBuf,
    /// The fuzz test's default seed corpus; may not exist.
    pub default_seed_corpus: PathBuf,
    /// User-supplied seed corpus directories.
    pub seed_corpus_dirs: Vec<PathBuf>,
    /// Used to normalize stack frame paths in fingerprints.
    pub build_dir: Option<PathBuf>,
    /// Emit one JSON object per event instead of human-readable output.
    pub print_json: bool,
}

pub struct ReportHandler {
    opts: ReportHandlerOptions,
    started: Instant,
    last_metric_print: Option<Instant>,
    last_metric: Option<MetricReport>,
    /// First-seen finding per fingerprint, in insertion order.
    findings: Vec<(String, FindingReport)>,
    finished: bool,
}

impl ReportHandler {
    /// Creates the handler. This records the start timestamp, so it should
    /// happen right before the fuzzer is spawned.
    pub fn new(opts: ReportHandlerOptions) -> Self {
        ReportHandler {
            opts,
            started: Instant::now(),
            last_metric_print: None,
            last_metric: None,
            findings: Vec::new(),
            finished: false,
        }
    }

    /// Consumes one report. Reports must be handled in the order produced.
    pub fn handle_report(&mut self, report: Report) -> CifuzzResult<()> {
        match report {
            Report::Metric(metric) => self.handle_metric(metric),
            Report::Finding(finding) => self.handle_finding(finding)?,
            Report::EngineError { message } => {
                if self.opts.print_json {
                    self.print_json_event(&Report::EngineError {
                        message: message.clone(),
                    })?;
                }
                tracing::error!("{message}");
            }
            Report::Finished { stats } => {
                if let Some(stats) = stats {
                    self.last_metric = Some(stats);
                }
                self.finished = true;
            }
        }
        Ok(())
    }

    fn handle_metric(&mut self, metric: MetricReport) {
        if self.opts.print_json {
            // Metrics are rate-limited even in JSON mode to keep the event
            // stream bounded; findings are never dropped.
            if self.should_print_metric() {
                let _ = self.print_json_event(&Report::Metric(metric.clone()));
                self.last_metric_print = Some(Instant::now());
            }
        } else if self.should_print_metric() {
            eprintln!(
                "executions: {} ({}/s), coverage: {} edges, corpus: {} entries, rss: {}MB",
                metric.total_execs,
                metric.execs_per_second,
                metric.coverage,
                metric.corpus_size,
                metric.rss_mb,
            );
            self.last_metric_print = Some(Instant::now());
        }
        self.last_metric = Some(metric);
    }

    fn should_print_metric(&self) -> bool {
        match self.last_metric_print {
            Some(last) => last.elapsed() >= METRIC_PRINT_INTERVAL,
            None => true,
        }
    }

    fn handle_finding(&mut self, finding: FindingReport) -> CifuzzResult<()> {
        let fingerprint = finding.fingerprint(self.opts.build_dir.as_deref());
        let input_copy = self.store_crashing_input(&fingerprint, &finding)?;

        if self.findings.iter().any(|(fp, _)| *fp == fingerprint) {
            tracing::debug!(
                "duplicate finding {} ({fingerprint}), input preserved",
                finding.name
            );
            return Ok(());
        }

        let mut finding = finding;
        if let Some(input_copy) = input_copy {
            finding.input_path = Some(input_copy);
        }

        if self.opts.print_json {
            self.print_json_event(&Report::Finding(finding.clone()))?;
        } else {
            eprintln!(
                "{} [{:?}] {}: {}",
                finding.kind, finding.severity, finding.name, finding.message
            );
            for frame in &finding.stack_trace {
                match (&frame.file, frame.line) {
                    (Some(file), Some(line)) => {
                        eprintln!("    {} ({file}:{line})", frame.function);
                    }
                    _ => eprintln!("    {}", frame.function),
                }
            }
        }

        self.findings.push((fingerprint, finding));
        Ok(())
    }

    /// Copies the crashing input into the canonical crash corpus:
    /// `<generated_corpus>/crashes/<fingerprint>/<basename>`. Distinct
    /// inputs with the same fingerprint all end up in the same directory.
    fn store_crashing_input(
        &self,
        fingerprint: &str,
        finding: &FindingReport,
    ) -> CifuzzResult<Option<PathBuf>> {
        let Some(input_path) = &finding.input_path else {
            return Ok(None);
        };
        if !input_path.is_file() {
            return Ok(None);
        }
        let crash_dir = self.crashes_dir().join(fingerprint);
        std::fs::create_dir_all(&crash_dir)?;
        let name = input_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("crashing_input"));
        let target = crash_dir.join(name);
        std::fs::copy(input_path, &target)?;
        Ok(Some(target))
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.opts.generated_corpus.join("crashes")
    }

    pub fn num_findings(&self) -> usize {
        self.findings.len()
    }

    pub fn findings(&self) -> impl Iterator<Item = &FindingReport> {
        self.findings.iter().map(|(_, f)| f)
    }

    /// Tells the user where crashing inputs went, after the run.
    pub fn print_crashing_input_note(&self) {
        if self.findings.iter().all(|(_, f)| f.input_path.is_none()) {
            return;
        }
        eprintln!(
            "crashing inputs were stored in {}",
            fileutil::pretty_path(&self.crashes_dir())
        );
    }

    /// Prints the end-of-run summary. Corpus entries are counted across the
    /// user seed dirs, the generated corpus and the default seed corpus,
    /// excluding zero-byte files, which libFuzzer treats as absent.
    pub fn print_final_metrics(&self) -> CifuzzResult<()> {
        let mut corpus_dirs = self.opts.seed_corpus_dirs.clone();
        corpus_dirs.push(self.opts.generated_corpus.clone());
        corpus_dirs.push(self.opts.default_seed_corpus.clone());
        let corpus_entries = fileutil::count_corpus_entries(&corpus_dirs)?;

        let metrics = FinalMetrics {
            findings: self.findings.len() as u64,
            findings_per_kind: self.findings_per_kind(),
            total_execs: self
                .last_metric
                .as_ref()
                .map(|m| m.total_execs)
                .unwrap_or(0),
            corpus_entries,
            runtime_seconds: self.started.elapsed().as_secs(),
        };

        if self.opts.print_json {
            println!("{}", serde_json::to_string(&metrics)?);
            return Ok(());
        }

        println!("Findings: {}", metrics.findings);
        for (kind, count) in &metrics.findings_per_kind {
            println!("  {kind}: {count}");
        }
        println!("Corpus entries: {}", metrics.corpus_entries);
        println!("Executions: {}", metrics.total_execs);
        println!("Run time: {}s", metrics.runtime_seconds);
        Ok(())
    }

    fn findings_per_kind(&self) -> BTreeMap<String, u64> {
        let mut per_kind = BTreeMap::new();
        for (_, finding) in &self.findings {
            *per_kind.entry(finding.kind.to_string()).or_insert(0) += 1;
        }
        per_kind
    }

    fn print_json_event<T: Serialize>(&self, event: &T) -> CifuzzResult<()> {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct FinalMetrics {
    findings: u64,
    #[serde(rename = "findingsPerKind")]
    findings_per_kind: BTreeMap<String, u64>,
    #[serde(rename = "totalExecs")]
    total_execs: u64,
    #[serde(rename = "corpusEntries")]
    corpus_entries: u64,
    #[serde(rename = "runtimeSeconds")]
    runtime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{FindingKind, Frame, Severity};
    use std::path::Path;

    fn handler(dir: &Path) -> ReportHandler {
        ReportHandler::new(ReportHandlerOptions {
            project_dir: dir.to_path_buf(),
            generated_corpus: dir.join("corpus"),
            default_seed_corpus: dir.join("seeds"),
            seed_corpus_dirs: Vec::new(),
            build_dir: None,
            print_json: false,
        })
    }

    fn finding_with_input(dir: &Path, input_name: &str, content: &[u8], line: u32) -> FindingReport {
        let input = dir.join(input_name);
        std::fs::write(&input, content).unwrap();
        FindingReport {
            name: "heap-use-after-free".to_string(),
            kind: FindingKind::UseAfterFree,
            message: "READ of size 1".to_string(),
            severity: Severity::High,
            stack_trace: vec![Frame {
                function: "LLVMFuzzerTestOneInput".to_string(),
                file: Some("my_test.c".to_string()),
                line: Some(line),
                column: None,
            }],
            input_path: Some(input),
            logs: Vec::new(),
        }
    }

    #[test]
    fn equal_fingerprints_share_one_crash_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());

        // Same crash location, two distinct inputs.
        let first = finding_with_input(dir.path(), "crash-1", b"a", 12);
        let second = finding_with_input(dir.path(), "crash-2", b"bb", 12);
        handler.handle_report(Report::Finding(first)).unwrap();
        handler.handle_report(Report::Finding(second)).unwrap();

        assert_eq!(handler.num_findings(), 1);

        let crash_dirs: Vec<_> = std::fs::read_dir(handler.crashes_dir())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(crash_dirs.len(), 1);

        let inputs: Vec<_> = std::fs::read_dir(crash_dirs[0].path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn distinct_fingerprints_get_distinct_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());

        handler
            .handle_report(Report::Finding(finding_with_input(
                dir.path(),
                "crash-1",
                b"a",
                12,
            )))
            .unwrap();
        handler
            .handle_report(Report::Finding(finding_with_input(
                dir.path(),
                "crash-2",
                b"b",
                34,
            )))
            .unwrap();

        assert_eq!(handler.num_findings(), 2);
        let crash_dirs: Vec<_> = std::fs::read_dir(handler.crashes_dir())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(crash_dirs.len(), 2);
    }

    #[test]
    fn reported_input_paths_point_into_the_crash_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());

        handler
            .handle_report(Report::Finding(finding_with_input(
                dir.path(),
                "crash-abc",
                b"x",
                1,
            )))
            .unwrap();

        let stored = handler.findings().next().unwrap();
        let input_path = stored.input_path.as_ref().unwrap();
        assert!(input_path.starts_with(handler.crashes_dir()));
        assert!(input_path.ends_with("crash-abc"));
        assert!(input_path.is_file());
    }

    #[test]
    fn finished_stats_override_the_last_metric() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());
        handler
            .handle_report(Report::Metric(MetricReport {
                total_execs: 10,
                ..Default::default()
            }))
            .unwrap();
        handler
            .handle_report(Report::Finished {
                stats: Some(MetricReport {
                    total_execs: 128,
                    ..Default::default()
                }),
            })
            .unwrap();
        assert_eq!(handler.last_metric.as_ref().unwrap().total_execs, 128);
    }
}
