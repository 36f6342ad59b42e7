//! Maven build adapter for JVM fuzz tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use crate::build::{self, BuildResult, FuzzEngine};
use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub num_jobs: Option<u32>,
}

pub struct Builder {
    opts: BuilderOptions,
}

impl Builder {
    pub fn new(opts: BuilderOptions) -> CifuzzResult<Self> {
        std::fs::metadata(&opts.project_dir)?;
        Ok(Builder { opts })
    }

    pub fn build(&self, target_classes: &[String]) -> CifuzzResult<BTreeMap<String, BuildResult>> {
        let mut args = Vec::new();
        if let Some(num_jobs) = self.opts.num_jobs {
            args.push("-T".to_string());
            // Zero means one thread per CPU core.
            args.push(if num_jobs == 0 {
                "1C".to_string()
            } else {
                num_jobs.to_string()
            });
        }
        args.push("test-compile".to_string());
        build::run_build_tool(self.maven_command(&args))?;

        let mut deps = self.external_dependencies()?;
        deps.extend(self.local_dependencies()?);
        let build_dir = self.build_directory()?;

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

    /// The test classpath, written by the dependency plugin into a file so
    /// that it survives arbitrary plugin chatter on stdout.
    fn external_dependencies(&self) -> CifuzzResult<Vec<PathBuf>> {
        let temp_dir = tempfile::Builder::new()
            .prefix("cifuzz-maven-dependencies-")
            .tempdir()?;
        let output_path = temp_dir.path().join("cp");

        build::run_build_tool(self.maven_command(&[
            "dependency:build-classpath".to_string(),
            format!("-Dmdep.outputFile={}", output_path.display()),
        ]))?;

        let output = std::fs::read_to_string(&output_path)?;
        let separator = if cfg!(windows) { ';' } else { ':' };
        Ok(output
            .trim()
            .split(separator)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Class and resource directories, which `dependency:build-classpath`
    /// does not list. Extracted from the effective project model.
    fn local_dependencies(&self) -> CifuzzResult<Vec<PathBuf>> {
        let stdout = build::capture_build_tool(self.maven_command(&[
            "help:evaluate".to_string(),
            "-Dexpression=project".to_string(),
            "-DforceStdout".to_string(),
            "--quiet".to_string(),
        ]))?;
        Ok(parse_local_dependencies(&stdout))
    }

    fn build_directory(&self) -> CifuzzResult<PathBuf> {
        let stdout = build::capture_build_tool(self.maven_command(&[
            "help:evaluate".to_string(),
            "-Dexpression=project.build.directory".to_string(),
            "-DforceStdout".to_string(),
            "--quiet".to_string(),
        ]))?;
        Ok(PathBuf::from(stdout.trim()))
    }

    fn maven_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new("mvn");
        cmd.args(args)
            // The cifuzz profile carries the Jazzer dependencies.
            .arg("-Pcifuzz")
            .current_dir(&self.opts.project_dir);
        cmd
    }
}

static OUTPUT_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<outputDirectory>([^<]+)</outputDirectory>").unwrap());
static TEST_OUTPUT_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<testOutputDirectory>([^<]+)</testOutputDirectory>").unwrap());
static RESOURCE_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:resource|testResource)>.*?<directory>([^<]+)</directory>").unwrap()
});

/// Pulls `build.outputDirectory`, `build.testOutputDirectory` and all
/// resource directories out of the XML rendering of the project model.
fn parse_local_dependencies(project_xml: &str) -> Vec<PathBuf> {
    let mut deps = Vec::new();
    if let Some(m) = OUTPUT_DIR_RE.captures(project_xml) {
        deps.push(PathBuf::from(m[1].trim()));
    }
    if let Some(m) = TEST_OUTPUT_DIR_RE.captures(project_xml) {
        deps.push(PathBuf::from(m[1].trim()));
    }
    for m in RESOURCE_DIR_RE.captures_iter(project_xml) {
        let dir = PathBuf::from(m[1].trim());
        if !deps.contains(&dir) {
            deps.push(dir);
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_local_dependencies_extracts_class_and_resource_dirs() {
        let xml = r"
<project>
  <build>
    <outputDirectory>/prj/target/classes</outputDirectory>
    <testOutputDirectory>/prj/target/test-classes</testOutputDirectory>
    <resources>
      <resource>
        <directory>/prj/src/main/resources</directory>
      </resource>
    </resources>
    <testResources>
      <testResource>
        <targetPath>conf</targetPath>
        <directory>/prj/src/test/resources</directory>
      </testResource>
    </testResources>
  </build>
</project>";
        let deps = parse_local_dependencies(xml);
        assert_eq!(
            deps,
            vec![
                PathBuf::from("/prj/target/classes"),
                PathBuf::from("/prj/target/test-classes"),
                PathBuf::from("/prj/src/main/resources"),
                PathBuf::from("/prj/src/test/resources"),
            ]
        );
    }

    #[test]
    fn parse_local_dependencies_tolerates_missing_sections() {
        assert!(parse_local_dependencies("<project/>").is_empty());
    }
}
