//! Gradle build adapter for JVM fuzz tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::build::{self, BuildResult, FuzzEngine};
use crate::{CifuzzError, CifuzzResult};

/// Helper task provided by the cifuzz Gradle plugin. It prints the test
/// classpath as a single `cifuzz.test.classpath=<entries>` line.
const PRINT_CLASSPATH_TASK: &str = "cifuzzPrintTestClasspath";

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub num_jobs: Option<u32>,
}

pub struct Builder {
    opts: BuilderOptions,
    gradle: PathBuf,
}

impl Builder {
    pub fn new(opts: BuilderOptions) -> CifuzzResult<Self> {
        std::fs::metadata(&opts.project_dir)?;
        // A wrapper checked into the project pins the Gradle version and is
        // preferred over whatever is installed on the host.
        let gradle = find_gradle_wrapper(&opts.project_dir)
            .unwrap_or_else(|| PathBuf::from("gradle"));
        Ok(Builder { opts, gradle })
    }

    pub fn build(&self, target_classes: &[String]) -> CifuzzResult<BTreeMap<String, BuildResult>> {
        let mut args = vec!["testClasses".to_string()];
        if let Some(num_jobs) = self.opts.num_jobs {
            if num_jobs != 0 {
                args.push(format!("--max-workers={num_jobs}"));
            }
        }
        build::run_build_tool(self.gradle_command(&args))?;

        let deps = self.test_classpath()?;
        let build_dir = self.opts.project_dir.join("build");

        let mut results = BTreeMap::new();
        for target_class in target_classes {
            let mut result = BuildResult {
                name: target_class.clone(),
                executable: None,
                runtime_deps: deps.clone(),
                generated_corpus: build::generated_corpus_dir(&self.opts.project_dir, target_class),
                seed_corpus: build::jazzer_seed_corpus(&self.opts.project_dir, target_class),
                build_dir: build_dir.clone(),
                project_dir: self.opts.project_dir.clone(),
                engine: FuzzEngine::Jazzer,
                sanitizers: Vec::new(),
            };
            result.canonicalize()?;
            results.insert(target_class.clone(), result);
        }
        Ok(results)
    }

    fn test_classpath(&self) -> CifuzzResult<Vec<PathBuf>> {
        let stdout = build::capture_build_tool(
            self.gradle_command(&["-q".to_string(), PRINT_CLASSPATH_TASK.to_string()]),
        )?;
        let entries = parse_classpath_output(&stdout).ok_or_else(|| {
            CifuzzError::Config(format!(
                "the {PRINT_CLASSPATH_TASK} task printed no classpath; \
                 is the cifuzz Gradle plugin applied to the project?"
            ))
        })?;
        Ok(entries)
    }

    fn gradle_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.gradle);
        cmd.args(args).current_dir(&self.opts.project_dir);
        cmd
    }
}

/// Looks for `gradlew` (or `gradlew.bat` on Windows) at the project root.
pub fn find_gradle_wrapper(project_dir: &Path) -> Option<PathBuf> {
    let name = if cfg!(windows) { "gradlew.bat" } else { "gradlew" };
    let wrapper = project_dir.join(name);
    wrapper.is_file().then_some(wrapper)
}

fn parse_classpath_output(stdout: &str) -> Option<Vec<PathBuf>> {
    let separator = if cfg!(windows) { ';' } else { ':' };
    stdout.lines().find_map(|line| {
        let classpath = line.trim().strip_prefix("cifuzz.test.classpath=")?;
        Some(
            classpath
                .split(separator)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
        )
    })
}
