//! Sandbox filesystem materializer and command runner.
//!
//! The isolation binary (nsjail) is an opaque collaborator. This module only
//! prepares the job directory, renders the binary's configuration, runs it and
//! parses the timing line it leaves on stderr.

mod fs;
mod metrics;
mod runner;

pub use fs::{checked_entry_point, materialize, JobDir};
pub use metrics::{split_stderr, Metrics};
pub use runner::{CommandRunner, SupportFile};

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;

use uuid::Uuid;

/// Command prefix prepended to every sandbox-side command, e.g.
/// `docker exec -i codexec-sandbox`. Empty means "run on this host".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdPrefix(Vec<String>);

impl CmdPrefix {
    pub fn parse(prefix: &str) -> Self {
        Self(prefix.split_whitespace().map(String::from).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build an async command for `program args...` behind the prefix.
    pub fn command<I, S>(&self, program: &str, args: I) -> tokio::process::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = self.argv(program, args);
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    /// Blocking twin of [`Self::command`], for cleanup outside a runtime.
    pub(crate) fn std_command<I, S>(&self, program: &str, args: I) -> std::process::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = self.argv(program, args);
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    fn argv<I, S>(&self, program: &str, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.0
            .iter()
            .map(OsString::from)
            .chain(std::iter::once(OsString::from(program)))
            .chain(args.into_iter().map(|a| a.as_ref().to_os_string()))
            .collect()
    }
}

impl fmt::Display for CmdPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Isolation binary configuration with `{{JOB_ID}}`, `{{JOB_DIR}}` and
/// `{{ENTRY_POINT}}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct ConfigTemplate(&'static str);

impl ConfigTemplate {
    pub const fn new(template: &'static str) -> Self {
        Self(template)
    }

    pub fn render(&self, job_id: Uuid, job_dir: &Path, entry_point: &str) -> String {
        self.0
            .replace("{{JOB_ID}}", &job_id.to_string())
            .replace("{{JOB_DIR}}", &job_dir.to_string_lossy())
            .replace("{{ENTRY_POINT}}", entry_point)
    }
}
