//! Runs one job through the isolation binary.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::fs::{create_dir, write_file};
use super::{checked_entry_point, materialize, split_stderr, CmdPrefix, ConfigTemplate, JobDir};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::model::{ExecuteResponse, ExecutionRequest};

/// A driver-provided file dropped next to a code checker (its test helper).
#[derive(Debug, Clone, Copy)]
pub struct SupportFile {
    pub name: &'static str,
    pub content: &'static str,
}

/// Prepares job directories and invokes the isolation binary.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    prefix: CmdPrefix,
    jobs_dir: PathBuf,
    nsjail_bin: String,
}

impl CommandRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            prefix: config.cmd_prefix.clone(),
            jobs_dir: config.jobs_dir.clone(),
            nsjail_bin: config.nsjail_bin.clone(),
        }
    }

    pub const fn prefix(&self) -> &CmdPrefix {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: CmdPrefix) {
        self.prefix = prefix;
    }

    /// Execute `request` inside the sandbox described by `template`.
    ///
    /// A nonzero exit code is a normal result. The job directory is removed
    /// before returning, whatever the outcome.
    #[instrument(skip_all, fields(job_id = %request.job_id))]
    pub async fn run(
        &self,
        template: &ConfigTemplate,
        support: &[SupportFile],
        request: &ExecutionRequest,
    ) -> Result<ExecuteResponse, SandboxError> {
        let entry_point = match &request.code_checker {
            Some(checker) => checker.file_name.as_str(),
            None => request.entry_point.as_str(),
        };
        let entry_point = checked_entry_point(entry_point)?;

        create_dir(&self.prefix, &self.jobs_dir).await?;
        let job = JobDir::create(&self.prefix, &self.jobs_dir, request.job_id).await?;
        let result = self
            .run_in(&job, template, support, entry_point, request)
            .await;
        job.remove().await;

        result
    }

    async fn run_in(
        &self,
        job: &JobDir,
        template: &ConfigTemplate,
        support: &[SupportFile],
        entry_point: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecuteResponse, SandboxError> {
        materialize(&self.prefix, job.path(), &request.source).await?;

        if let Some(checker) = &request.code_checker {
            for file in support {
                write_file(&self.prefix, &job.path().join(file.name), file.content.as_bytes())
                    .await?;
            }
            write_file(&self.prefix, &job.path().join(entry_point), checker.code.as_bytes())
                .await?;
        }

        let config = template.render(request.job_id, job.path(), entry_point);
        write_file(&self.prefix, job.config_path(), config.as_bytes()).await?;

        let stdin = request
            .io_checker
            .as_ref()
            .map(|checker| checker.input.as_str())
            .filter(|input| !input.is_empty());

        let output = self.spawn_isolated(job.config_path(), stdin).await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let (diagnostics, metrics) = split_stderr(&stderr)?;

        debug!(exit_code, elapsed = metrics.elapsed, "Sandbox finished");

        Ok(ExecuteResponse {
            job_id: request.job_id,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: diagnostics,
            exit_code,
            time: metrics.elapsed,
            memory: metrics.max_rss_kb,
            cpu: metrics.cpu(),
        })
    }

    async fn spawn_isolated(
        &self,
        config_path: &Path,
        stdin: Option<&str>,
    ) -> Result<Output, SandboxError> {
        let mut cmd = self.prefix.command(
            &self.nsjail_bin,
            [OsStr::new("-Q"), OsStr::new("--config"), config_path.as_os_str()],
        );
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: self.nsjail_bin.clone(),
            source,
        })?;

        // Feed stdin while draining stdout/stderr so neither side can block
        // on a full pipe.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Sandbox closed stdin early");
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output.map_err(SandboxError::Output)
    }
}
