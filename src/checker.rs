//! Output checkers and the pass/fail verdict for a finished job.

use serde::{Deserialize, Serialize};

use crate::model::ExecuteResponse;

/// Which checker produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerType {
    Io,
    Code,
    Quiz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerResult {
    #[serde(rename = "type")]
    pub kind: CheckerType,
    pub success: bool,
    pub message: String,
}

/// Compares stdout against a fixed expected output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoChecker {
    /// Fed to the program's stdin.
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
}

impl IoChecker {
    /// Exact byte comparison, no trimming.
    pub fn check(&self, stdout: &str) -> CheckerResult {
        if stdout == self.expected_output {
            return CheckerResult {
                kind: CheckerType::Io,
                success: true,
                message: "Output matches expected output".into(),
            };
        }

        CheckerResult {
            kind: CheckerType::Io,
            success: false,
            message: format!(
                "Expected output: {}, Actual output: {}",
                self.expected_output, stdout
            ),
        }
    }
}

/// A test file run in place of the entry point. It reports through JSON lines
/// printed by the driver's test helper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChecker {
    pub code: String,
    pub file_name: String,
}

#[derive(Deserialize)]
struct TestLine {
    #[serde(default)]
    is_test: bool,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

impl CodeChecker {
    /// Collects every `{"is_test": true, ...}` line. Anything else is program
    /// output and is skipped.
    pub fn check(&self, stdout: &str) -> Vec<CheckerResult> {
        stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<TestLine>(line).ok())
            .filter(|line| line.is_test)
            .map(|line| CheckerResult {
                kind: CheckerType::Code,
                success: line.success,
                message: line.message,
            })
            .collect()
    }
}

/// Checker definitions attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkers {
    pub io: Option<IoChecker>,
    pub code: Option<CodeChecker>,
}

/// What a client receives once its job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    #[serde(flatten)]
    pub response: ExecuteResponse,
    pub checks: Vec<CheckerResult>,
    pub passed: bool,
}

/// Runs the attached checkers against a response.
///
/// A job passes when it exited 0 and, if any checker is attached, at least
/// one check ran and every check succeeded.
pub fn evaluate(checkers: &Checkers, response: ExecuteResponse) -> SubmissionReport {
    let mut checks = Vec::new();
    if let Some(io) = &checkers.io {
        checks.push(io.check(&response.stdout));
    }
    if let Some(code) = &checkers.code {
        checks.extend(code.check(&response.stdout));
    }

    let has_checkers = checkers.io.is_some() || checkers.code.is_some();
    let passed = response.exit_code == 0
        && (!has_checkers || (!checks.is_empty() && checks.iter().all(|c| c.success)));

    SubmissionReport {
        response,
        checks,
        passed,
    }
}
