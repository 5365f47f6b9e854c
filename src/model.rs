//! Wire types shared by the hub, the broker and the workers.
//!
//! Everything here travels as JSON: the hub publishes an [`ExecutionRequest`]
//! onto a language queue, a worker answers with an [`ExecuteResponse`] on the
//! results exchange.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checker::{CodeChecker, IoChecker};

/// A single source file inside a submitted tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,

    /// Extension without the leading dot. Empty when `name` already carries it.
    #[serde(default)]
    pub ext: String,

    #[serde(default)]
    pub content: String,
}

impl File {
    /// Name of the file on disk.
    pub fn file_name(&self) -> String {
        if self.ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.ext)
        }
    }
}

/// Recursive source tree. The root directory's own name is not materialized;
/// its children land directly in the job directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub files: Vec<File>,

    #[serde(default)]
    pub directories: Vec<Directory>,
}

/// A job published to a language queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique per submission. Also names the sandbox working directory.
    pub job_id: Uuid,

    pub source: Directory,

    /// Path of the file to run, relative to the source root.
    pub entry_point: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_checker: Option<CodeChecker>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_checker: Option<IoChecker>,
}

/// Outcome of one sandboxed run, published to the results exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub job_id: Uuid,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,

    /// Wall-clock seconds.
    pub time: f64,

    /// Peak resident set size in KB.
    pub memory: u64,

    /// `(user + sys) / elapsed`.
    pub cpu: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_execution_request() {
        let json = r#"{
            "job_id": "6f1c3a52-2f7e-4c1e-9d55-1b7a1b2f0c11",
            "source": {
                "name": "root",
                "files": [{"name": "main", "ext": "py", "content": "print(1)"}],
                "directories": [
                    {"name": "lib", "files": [{"name": "util.py", "content": "X = 1"}]}
                ]
            },
            "entry_point": "main.py",
            "io_checker": {"input": "", "expected_output": "1\n"}
        }"#;

        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.entry_point, "main.py");
        assert_eq!(request.source.files[0].file_name(), "main.py");
        assert_eq!(request.source.directories[0].files[0].file_name(), "util.py");
        assert!(request.source.directories[0].directories.is_empty());
        assert!(request.code_checker.is_none());
        assert_eq!(request.io_checker.unwrap().expected_output, "1\n");
    }

    #[test]
    fn response_field_names() {
        let response = ExecuteResponse {
            job_id: Uuid::nil(),
            exit_code: 1,
            ..ExecuteResponse::default()
        };
        let value = serde_json::to_value(&response).unwrap();
        for key in ["job_id", "stdout", "stderr", "exit_code", "time", "memory", "cpu"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["exit_code"], 1);
    }
}
