//! Error types for the execution pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures while preparing or running a sandboxed job.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Job directory or file could not be written. Nothing was executed.
    #[error("sandbox setup failed: {context}")]
    Setup {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid path in source tree: {0:?}")]
    InvalidPath(String),

    #[error("sandbox command `{command}` failed: {status}")]
    Command { command: String, status: String },

    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to collect sandbox output")]
    Output(#[source] io::Error),

    /// The program ran but its resource accounting cannot be trusted.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// The isolation binary's timing line was absent or unusable.
#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("no metrics line in sandbox stderr")]
    Missing,

    #[error("malformed metrics line {line:?}: {reason}")]
    Malformed { line: String, reason: String },

    #[error("metrics line reports zero elapsed time")]
    ZeroElapsed,
}

/// Failures surfaced by the executor service.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("execution exceeded {0:?}")]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,
}

/// Broker connection, channel and encoding failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to broker")]
    Connection(#[source] lapin::Error),

    #[error("broker operation `{op}` failed")]
    Channel {
        op: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to encode payload")]
    Encode(#[from] serde_json::Error),

    #[error("publish_object only accepts objects, got {0}")]
    NotAnObject(&'static str),

    #[error("no queue bound for {exchange:?} / {routing_key:?}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("broker refused the message")]
    Nacked,
}

impl BusError {
    pub(crate) fn channel(op: &'static str) -> impl FnOnce(lapin::Error) -> Self {
        move |source| Self::Channel { op, source }
    }
}

/// Why a single delivery was not acknowledged.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to parse execution request")]
    Parse(#[source] serde_json::Error),

    #[error(transparent)]
    Execute(#[from] ExecError),

    #[error("failed to publish result")]
    Publish(#[from] BusError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Why the hub refused a client submission.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown exercise {0:?}")]
    UnknownExercise(String),

    #[error("failed to publish job")]
    Publish(#[from] BusError),
}
