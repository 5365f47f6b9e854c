//! Language drivers.
//!
//! A driver binds a language's isolation config and test helper to the
//! [`CommandRunner`]. The set of drivers is closed: [`DriverKind`] names them
//! and [`new_driver`] is the only constructor callers need.

mod node;
mod python;

pub use node::NodeDriver;
pub use python::PythonDriver;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::model::{ExecuteResponse, ExecutionRequest};
use crate::sandbox::CmdPrefix;

/// Uniform execution capability shared by every language.
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    /// Run `request` in a fresh sandbox. A nonzero exit is a normal response.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecuteResponse, SandboxError>;

    fn set_cmd_prefix(&mut self, prefix: CmdPrefix);

    fn cmd_prefix(&self) -> &CmdPrefix;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Python,
    Node,
}

impl DriverKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "node" => Ok(Self::Node),
            other => Err(format!("driver {other} is invalid")),
        }
    }
}

/// Driver registry.
pub fn new_driver(kind: DriverKind, config: &SandboxConfig) -> Box<dyn Driver> {
    match kind {
        DriverKind::Python => Box::new(PythonDriver::new(config)),
        DriverKind::Node => Box::new(NodeDriver::new(config)),
    }
}
