use async_trait::async_trait;

use super::Driver;
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::model::{ExecuteResponse, ExecutionRequest};
use crate::sandbox::{CmdPrefix, CommandRunner, ConfigTemplate, SupportFile};

const NSJAIL_CONFIG: ConfigTemplate = ConfigTemplate::new(
    r#"name: "JOB-{{JOB_ID}}"
mode: ONCE
hostname: "JOB-{{JOB_ID}}"

clone_newns: true
clone_newpid: true
clone_newipc: true
clone_newuts: true
clone_newuser: true
clone_newnet: true
iface_no_lo: true

cwd: "/work"
mount_proc: false

mount { src: "/opt/nsjail/rootfs" dst: "/" is_bind: true rw: false }
mount { src: "{{JOB_DIR}}" dst: "/work" is_bind: true rw: true }

mount { src: "/usr/bin/python3" dst: "/usr/bin/python3" is_bind: true rw: false }
mount { src: "/usr/bin/time" dst: "/usr/bin/time" is_bind: true rw: false }
mount { src: "/usr/lib" dst: "/usr/lib" is_bind: true rw: false }
mount { src: "/lib" dst: "/lib" is_bind: true rw: false }

mount { dst: "/tmp" fstype: "tmpfs" rw: true options: "size=128m" }
mount { dst: "/dev" fstype: "tmpfs" rw: false }
mount { src: "/dev/null" dst: "/dev/null" is_bind: true rw: true }
mount { src: "/dev/urandom" dst: "/dev/urandom" is_bind: true rw: false }

rlimit_as: 512
rlimit_cpu: 1
rlimit_nofile: 64
rlimit_nproc: 16
time_limit: 1

exec_bin {
  path: "/usr/bin/time"
  arg: "-f"
  arg: "%e,%U,%S,%M"
  arg: "/usr/bin/python3"
  arg: "/work/{{ENTRY_POINT}}"
}
"#,
);

const TEST_UTILS: SupportFile = SupportFile {
    name: "test_utils.py",
    content: r#"import json


class TestResult:
    def __init__(self, success, message):
        self.success = success
        self.message = message

    def __str__(self):
        return json.dumps({
            "is_test": True,
            "success": self.success,
            "message": self.message,
        })


class TestUtils:
    @staticmethod
    def success(message):
        print(TestResult(True, message))

    @staticmethod
    def failure(message):
        print(TestResult(False, message))
"#,
};

/// CPython 3 under nsjail.
#[derive(Debug, Clone)]
pub struct PythonDriver {
    runner: CommandRunner,
}

impl PythonDriver {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            runner: CommandRunner::new(config),
        }
    }
}

#[async_trait]
impl Driver for PythonDriver {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecuteResponse, SandboxError> {
        self.runner.run(&NSJAIL_CONFIG, &[TEST_UTILS], request).await
    }

    fn set_cmd_prefix(&mut self, prefix: CmdPrefix) {
        self.runner.set_prefix(prefix);
    }

    fn cmd_prefix(&self) -> &CmdPrefix {
        self.runner.prefix()
    }
}
