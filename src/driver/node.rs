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

mount { src: "/usr/bin/node" dst: "/usr/bin/node" is_bind: true rw: false }
mount { src: "/usr/bin/time" dst: "/usr/bin/time" is_bind: true rw: false }
mount { src: "/usr/lib" dst: "/usr/lib" is_bind: true rw: false }
mount { src: "/usr/lib/nodejs" dst: "/usr/lib/nodejs" is_bind: true rw: false }
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
  arg: "/usr/bin/node"
  arg: "/work/{{ENTRY_POINT}}"
}
"#,
);

const TEST_UTILS: SupportFile = SupportFile {
    name: "test_utils.js",
    content: r#"function report(success, message) {
  console.log(JSON.stringify({ is_test: true, success, message }));
}

module.exports = {
  success: (message) => report(true, message),
  failure: (message) => report(false, message),
};
"#,
};

/// Node.js under nsjail.
#[derive(Debug, Clone)]
pub struct NodeDriver {
    runner: CommandRunner,
}

impl NodeDriver {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            runner: CommandRunner::new(config),
        }
    }
}

#[async_trait]
impl Driver for NodeDriver {
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
