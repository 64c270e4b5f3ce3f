//! External scanner hook.
//!
//! After export, each configured runner is invoked once per entity with the
//! entity's URL or IP list and its port list. Runner failures are logged and
//! never abort the sweep.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::config::{RunnerConfig, RunnerInput};
use crate::export::{sanitize_component, BucketExport};

/// A tool that consumes an exported list and produces a result file.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Which list this runner reads.
    fn input(&self) -> RunnerInput;

    /// Scan `job.input`, writing results to `job.output`. Returns the result
    /// path.
    async fn run(&self, job: &RunnerJob) -> Result<PathBuf>;
}

/// Files for one runner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerJob {
    /// URL or IP list, whichever the runner reads.
    pub input: PathBuf,
    /// The entity's `ports.txt`.
    pub ports: PathBuf,
    pub output: PathBuf,
}

/// Replace `{input}`, `{ports}` and `{output}` in each argument.
pub fn render_args(args: &[String], job: &RunnerJob) -> Vec<String> {
    let input = job.input.display().to_string();
    let ports = job.ports.display().to_string();
    let output = job.output.display().to_string();
    args.iter()
        .map(|a| {
            a.replace("{input}", &input)
                .replace("{ports}", &ports)
                .replace("{output}", &output)
        })
        .collect()
}

/// Runs a configured external program.
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ScanRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn input(&self) -> RunnerInput {
        self.config.input
    }

    async fn run(&self, job: &RunnerJob) -> Result<PathBuf> {
        let args = render_args(&self.config.args, job);
        tracing::info!(runner = %self.config.name, program = %self.config.program, ?args, "starting runner");

        let status = tokio::process::Command::new(&self.config.program)
            .args(&args)
            .status()
            .await
            .with_context(|| format!("Failed to start '{}'", self.config.program))?;

        if !status.success() {
            bail!("'{}' exited with {}", self.config.program, status);
        }
        Ok(job.output.clone())
    }
}

/// Build runners from config.
pub fn runners_from_config(configs: &[RunnerConfig]) -> Vec<Box<dyn ScanRunner>> {
    configs
        .iter()
        .cloned()
        .map(|c| Box::new(CommandRunner::new(c)) as Box<dyn ScanRunner>)
        .collect()
}

/// One runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerReport {
    pub runner: String,
    pub bucket: String,
    pub result: Result<PathBuf, String>,
}

/// Invoke every runner for every exported bucket whose input list is not
/// empty.
pub async fn run_all(runners: &[Box<dyn ScanRunner>], exports: &[BucketExport]) -> Vec<RunnerReport> {
    let mut reports = Vec::new();
    for export in exports {
        for runner in runners {
            let (input, count) = match runner.input() {
                RunnerInput::Urls => (&export.urls_file, export.url_count),
                RunnerInput::Ips => (&export.ips_file, export.ip_count),
            };
            if count == 0 {
                continue;
            }
            let job = RunnerJob {
                input: input.clone(),
                ports: export.ports_file.clone(),
                output: export
                    .dir
                    .join(format!("{}.out", sanitize_component(runner.name()))),
            };

            let result = runner
                .run(&job)
                .await
                .map_err(|e| format!("{:#}", e));
            if let Err(e) = &result {
                tracing::warn!(runner = runner.name(), bucket = %export.name, error = %e, "runner failed");
            }
            reports.push(RunnerReport {
                runner: runner.name().to_string(),
                bucket: export.name.clone(),
                result,
            });
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        input: RunnerInput,
        seen: Arc<Mutex<Vec<RunnerJob>>>,
    }

    #[async_trait]
    impl ScanRunner for Recorder {
        fn name(&self) -> &str {
            "fp/scan"
        }

        fn input(&self) -> RunnerInput {
            self.input
        }

        async fn run(&self, job: &RunnerJob) -> Result<PathBuf> {
            self.seen.lock().unwrap().push(job.clone());
            Ok(job.output.clone())
        }
    }

    fn export(name: &str, ips: usize, urls: usize) -> BucketExport {
        let dir = PathBuf::from("/out").join(name);
        BucketExport {
            name: name.to_string(),
            ips_file: dir.join("ips.txt"),
            urls_file: dir.join("urls.txt"),
            ports_file: dir.join("ports.txt"),
            dir,
            ip_count: ips,
            url_count: urls,
            port_count: 1,
        }
    }

    fn job() -> RunnerJob {
        RunnerJob {
            input: PathBuf::from("/r/ips.txt"),
            ports: PathBuf::from("/r/ports.txt"),
            output: PathBuf::from("/r/fp.out"),
        }
    }

    #[test]
    fn test_render_args() {
        let args = vec![
            "-l".to_string(),
            "{input}".to_string(),
            "--out={output}".to_string(),
        ];
        let rendered = render_args(&args, &job());
        assert_eq!(rendered, vec!["-l", "/r/ips.txt", "--out=/r/fp.out"]);
    }

    #[test]
    fn test_render_args_with_port_list() {
        let args: Vec<String> = ["-hf", "{input}", "-portf", "{ports}", "-o", "{output}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rendered = render_args(&args, &job());
        assert_eq!(
            rendered,
            vec!["-hf", "/r/ips.txt", "-portf", "/r/ports.txt", "-o", "/r/fp.out"]
        );
    }

    #[tokio::test]
    async fn test_run_all_hands_over_the_bucket_port_list() {
        let seen: Arc<Mutex<Vec<RunnerJob>>> = Arc::default();
        let runners: Vec<Box<dyn ScanRunner>> = vec![Box::new(Recorder {
            input: RunnerInput::Ips,
            seen: Arc::clone(&seen),
        })];

        let reports = run_all(&runners, &[export("Acme", 2, 0)]).await;
        assert_eq!(reports.len(), 1);

        let jobs = seen.lock().unwrap();
        assert_eq!(
            jobs[0],
            RunnerJob {
                input: PathBuf::from("/out/Acme/ips.txt"),
                ports: PathBuf::from("/out/Acme/ports.txt"),
                output: PathBuf::from("/out/Acme/fp_scan.out"),
            }
        );
    }

    #[tokio::test]
    async fn test_run_all_skips_empty_lists() {
        let runners: Vec<Box<dyn ScanRunner>> = vec![Box::new(Recorder {
            input: RunnerInput::Urls,
            seen: Arc::default(),
        })];
        let exports = vec![export("Acme", 3, 2), export("unknown entity", 1, 0)];

        let reports = run_all(&runners, &exports).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bucket, "Acme");
        assert_eq!(
            reports[0].result.as_ref().unwrap(),
            &PathBuf::from("/out/Acme/fp_scan.out")
        );
    }
}
