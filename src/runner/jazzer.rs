//! Runner for JVM fuzz tests via Jazzer.
//!
//! Jazzer is a libFuzzer-compatible engine started as a Java program, so
//! this runner only composes the JVM command line and then delegates the
//! whole process lifecycle to the native runner.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::report_handler::ReportHandler;
use crate::runner::libfuzzer;
use crate::util::jarutil;
use crate::{CifuzzError, CifuzzResult};

/// Classes matching these patterns are not instrumented. The build tools
/// themselves are never the code under test.
pub const DEFAULT_INSTRUMENTATION_EXCLUDES: &[&str] = &["org.apache.maven.**", "org.gradle.**"];

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Fully qualified name of the class containing the fuzz test.
    pub target_class: String,
    /// Classpath entries: jars, class directories and resource directories.
    pub class_paths: Vec<PathBuf>,
    /// Instrumentation exclude patterns; the defaults are used when empty.
    pub instrumentation_excludes: Vec<String>,
    pub libfuzzer: libfuzzer::RunnerOptions,
}

pub struct Runner {
    opts: RunnerOptions,
    libfuzzer: libfuzzer::Runner,
    temp_dir: tempfile::TempDir,
}

impl Runner {
    pub fn new(opts: RunnerOptions) -> CifuzzResult<Runner> {
        let temp_dir = tempfile::Builder::new().prefix("cifuzz-jazzer-").tempdir()?;
        Ok(Runner {
            libfuzzer: libfuzzer::Runner::new(opts.libfuzzer.clone()),
            opts,
            temp_dir,
        })
    }

    pub async fn run(
        &self,
        token: CancellationToken,
        handler: &mut ReportHandler,
    ) -> CifuzzResult<()> {
        std::fs::create_dir_all(&self.opts.libfuzzer.generated_corpus_dir)?;
        std::fs::create_dir_all(&self.opts.libfuzzer.artifacts_dir)?;
        let args = self.command_line()?;
        let env = self.libfuzzer.fuzzer_env()?;
        self.libfuzzer.run_fuzzer(args, env, token, handler).await
    }

    /// `java -cp <manifest.jar> com.code_intelligence.jazzer.Jazzer
    /// --target_class=<FQCN> <libFuzzer args…>`. The classpath goes through
    /// a manifest jar to stay clear of command-line length limits.
    fn command_line(&self) -> CifuzzResult<Vec<String>> {
        let manifest_jar = self.create_class_path_jar()?;

        let mut args = vec![
            java_binary().display().to_string(),
            "-cp".to_string(),
            manifest_jar.display().to_string(),
            "com.code_intelligence.jazzer.Jazzer".to_string(),
            format!("--target_class={}", self.opts.target_class),
        ];

        let excludes: Vec<String> = if self.opts.instrumentation_excludes.is_empty() {
            DEFAULT_INSTRUMENTATION_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.opts.instrumentation_excludes.clone()
        };
        for pattern in excludes {
            args.push(format!("--instrumentation_excludes={pattern}"));
        }

        args.extend(self.libfuzzer.engine_args()?);
        Ok(args)
    }

    /// Writes `<temp>/<FQCN>/manifest.jar` whose `Class-Path` lists all
    /// runtime deps as URLs relative to the jar.
    fn create_class_path_jar(&self) -> CifuzzResult<PathBuf> {
        let jar_dir = self.temp_dir.path().join(&self.opts.target_class);
        std::fs::create_dir_all(&jar_dir)?;
        let class_path = jarutil::class_path_value(&jar_dir, &self.opts.class_paths);
        if class_path.is_empty() {
            return Err(CifuzzError::Internal(format!(
                "no classpath entries for fuzz test {}",
                self.opts.target_class
            )));
        }
        jarutil::create_manifest_jar(
            &jar_dir,
            &[("Class-Path".to_string(), class_path)],
        )
    }
}

fn java_binary() -> PathBuf {
    if let Ok(java_home) = std::env::var("JAVA_HOME") {
        if !java_home.is_empty() {
            let java = Path::new(&java_home).join("bin").join("java");
            if java.is_file() {
                return java;
            }
        }
    }
    PathBuf::from("java")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn jazzer_runner(dir: &Path, class_paths: Vec<PathBuf>) -> Runner {
        Runner::new(RunnerOptions {
            target_class: "com.example.FuzzTestCase".to_string(),
            class_paths,
            instrumentation_excludes: Vec::new(),
            libfuzzer: libfuzzer::RunnerOptions {
                fuzz_target: PathBuf::from("java"),
                project_dir: dir.to_path_buf(),
                build_dir: dir.join("target"),
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
            },
        })
        .unwrap()
    }

    #[test]
    fn command_line_targets_the_jazzer_main_class() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("dep.jar");
        std::fs::write(&jar, b"jar").unwrap();

        let runner = jazzer_runner(dir.path(), vec![jar]);
        let args = runner.command_line().unwrap();

        assert!(args[0].ends_with("java"));
        assert_eq!(args[1], "-cp");
        assert!(args[2].ends_with("com.example.FuzzTestCase/manifest.jar"));
        assert_eq!(args[3], "com.code_intelligence.jazzer.Jazzer");
        assert_eq!(args[4], "--target_class=com.example.FuzzTestCase");
        assert!(args.contains(&"--instrumentation_excludes=org.apache.maven.**".to_string()));
        assert!(args.contains(&"--instrumentation_excludes=org.gradle.**".to_string()));
    }

    #[test]
    fn manifest_jar_carries_the_class_path() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("dep.jar");
        std::fs::write(&jar, b"jar").unwrap();
        let classes = dir.path().join("classes");
        std::fs::create_dir(&classes).unwrap();

        let runner = jazzer_runner(dir.path(), vec![jar, classes]);
        let manifest_jar = runner.create_class_path_jar().unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&manifest_jar).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("META-INF/MANIFEST.MF")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.starts_with("Class-Path: "));
        assert!(content.contains("dep.jar"));
        assert!(content.contains("classes/"));
    }

    #[test]
    fn empty_classpaths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = jazzer_runner(dir.path(), Vec::new());
        assert!(runner.create_class_path_jar().is_err());
    }
}
