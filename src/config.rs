//! Process configuration.
//!
//! Everything comes from environment variables, read once at start-up into a
//! [`Config`] that is handed to each component. Structured values (`WORKERS`,
//! `SUBJECTS`) are JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::bus::queue_name;
use crate::checker::{CodeChecker, IoChecker};
use crate::driver::DriverKind;
use crate::error::ConfigError;
use crate::sandbox::{checked_entry_point, CmdPrefix};

const DEFAULT_RESULTS_EXCHANGE: &str = "codexec.results";
const DEFAULT_QUEUE_PREFIX: &str = "codexec";
const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub results_exchange: String,
    pub queue_prefix: String,

    /// Hard deadline around a single driver call.
    pub execution_timeout: Duration,

    /// How long shutdown waits for workers to drain.
    pub shutdown_timeout: Duration,

    pub sandbox: SandboxConfig,
    pub workers: Vec<WorkerConfig>,
    pub hub: HubConfig,
}

/// Where and how sandboxed jobs run.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Parent of every job directory, as seen by the isolation binary.
    pub jobs_dir: PathBuf,
    pub nsjail_bin: String,
    pub cmd_prefix: CmdPrefix,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("/jobs"),
            nsjail_bin: "nsjail".into(),
            cmd_prefix: CmdPrefix::default(),
        }
    }
}

/// One entry of `WORKERS`, with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub driver: DriverKind,
    pub queue: String,
    pub results_exchange: String,
    pub concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct RawWorker {
    driver: DriverKind,
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    results_exchange: Option<String>,
    #[serde(default)]
    concurrency: Option<usize>,
}

/// A submission subject: where its jobs go and what its entry file is called.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubjectConfig {
    /// Job queue override. Defaults to `<prefix>.<subject>`.
    #[serde(default)]
    pub queue: Option<String>,
    pub extension: String,
}

/// An exercise clients can submit against. Its checkers are never taken
/// from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExerciseConfig {
    pub subject: String,
    #[serde(default)]
    pub io_checker: Option<IoChecker>,
    #[serde(default)]
    pub code_checker: Option<CodeChecker>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: SocketAddr,
    pub subjects: HashMap<String, SubjectConfig>,
    pub exercises: HashMap<String, ExerciseConfig>,

    /// Correlations older than this are dropped by the sweeper.
    pub correlation_ttl: Duration,
}

/// `javascript` is an alias that runs on the node workers.
fn default_subjects(queue_prefix: &str) -> HashMap<String, SubjectConfig> {
    [
        ("python", "py", None),
        ("node", "js", None),
        ("javascript", "js", Some(DriverKind::Node)),
    ]
    .into_iter()
    .map(|(subject, ext, driver)| {
        (
            subject.to_string(),
            SubjectConfig {
                queue: driver.map(|d: DriverKind| queue_name(queue_prefix, d.as_str())),
                extension: ext.to_string(),
            },
        )
    })
    .collect()
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a flat JSON object of variable name to value. Non-string
    /// values are passed through as their JSON text.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let vars: HashMap<String, Value> =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid {
                key: "config",
                reason: e.to_string(),
            })?;

        Self::from_lookup(|key| {
            vars.get(key).map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }

    /// Load through an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rabbitmq_url = get("RABBITMQ_URL").ok_or(ConfigError::Missing("RABBITMQ_URL"))?;
        let results_exchange =
            get("RESULTS_EXCHANGE").unwrap_or_else(|| DEFAULT_RESULTS_EXCHANGE.into());
        let queue_prefix = get("QUEUE_PREFIX").unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.into());

        let sandbox = SandboxConfig {
            jobs_dir: get("JOBS_DIR").map_or_else(|| PathBuf::from("/jobs"), PathBuf::from),
            nsjail_bin: get("NSJAIL_BIN").unwrap_or_else(|| "nsjail".into()),
            cmd_prefix: get("CMD_PREFIX")
                .map(|p| CmdPrefix::parse(&p))
                .unwrap_or_default(),
        };

        let workers = match get("WORKERS") {
            Some(json) => parse_workers(&json, &queue_prefix, &results_exchange)?,
            None => Vec::new(),
        };

        let subjects = match get("SUBJECTS") {
            Some(json) => serde_json::from_str(&json).map_err(|e| ConfigError::Invalid {
                key: "SUBJECTS",
                reason: e.to_string(),
            })?,
            None => default_subjects(&queue_prefix),
        };
        let exercises = match get("EXERCISES") {
            Some(json) => parse_exercises(&json, &subjects)?,
            None => HashMap::new(),
        };

        let hub = HubConfig {
            bind: get("HUB_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".into())
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                    key: "HUB_BIND",
                    reason: e.to_string(),
                })?,
            subjects,
            exercises,
            correlation_ttl: seconds(get("CORRELATION_TTL"), "CORRELATION_TTL", 600)?,
        };

        Ok(Self {
            rabbitmq_url,
            results_exchange,
            queue_prefix,
            execution_timeout: seconds(get("EXECUTION_TIMEOUT"), "EXECUTION_TIMEOUT", 10)?,
            shutdown_timeout: seconds(get("SHUTDOWN_TIMEOUT"), "SHUTDOWN_TIMEOUT", 30)?,
            sandbox,
            workers,
            hub,
        })
    }

    /// The configured workers. Running workers without any is an error.
    pub fn workers(&self) -> Result<&[WorkerConfig], ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::Missing("WORKERS"));
        }
        Ok(&self.workers)
    }
}

fn parse_workers(
    json: &str,
    queue_prefix: &str,
    results_exchange: &str,
) -> Result<Vec<WorkerConfig>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "WORKERS",
        reason,
    };

    let raw: Vec<RawWorker> = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
    if raw.is_empty() {
        return Err(invalid("at least one worker is required".into()));
    }

    raw.into_iter()
        .map(|w| {
            let concurrency = w.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
            if concurrency == 0 {
                return Err(invalid(format!("{} concurrency must be positive", w.driver)));
            }

            Ok(WorkerConfig {
                driver: w.driver,
                queue: w
                    .queue
                    .unwrap_or_else(|| queue_name(queue_prefix, w.driver.as_str())),
                results_exchange: w
                    .results_exchange
                    .unwrap_or_else(|| results_exchange.to_string()),
                concurrency,
            })
        })
        .collect()
}

fn parse_exercises(
    json: &str,
    subjects: &HashMap<String, SubjectConfig>,
) -> Result<HashMap<String, ExerciseConfig>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "EXERCISES",
        reason,
    };

    let exercises: HashMap<String, ExerciseConfig> =
        serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;

    for (id, exercise) in &exercises {
        if !subjects.contains_key(&exercise.subject) {
            return Err(invalid(format!(
                "{id}: unknown subject {:?}",
                exercise.subject
            )));
        }
        if let Some(checker) = &exercise.code_checker {
            checked_entry_point(&checker.file_name).map_err(|e| invalid(format!("{id}: {e}")))?;
        }
    }

    Ok(exercises)
}

fn seconds(value: Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(default));
    };

    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        Ok(_) => Err(ConfigError::Invalid {
            key,
            reason: "must be positive".into(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = Config::from_json(r#"{"RABBITMQ_URL": "amqp://localhost"}"#).unwrap();

        assert_eq!(config.results_exchange, "codexec.results");
        assert_eq!(config.queue_prefix, "codexec");
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.sandbox.jobs_dir, PathBuf::from("/jobs"));
        assert_eq!(config.sandbox.nsjail_bin, "nsjail");
        assert!(config.sandbox.cmd_prefix.is_empty());
        assert_eq!(config.hub.bind.port(), 8080);
        assert_eq!(config.hub.correlation_ttl, Duration::from_secs(600));
        assert_eq!(config.hub.subjects["javascript"].extension, "js");
        assert!(config.hub.exercises.is_empty());
        assert!(config.workers().is_err());
    }

    #[test]
    fn url_is_required() {
        let err = Config::from_json("{}").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RABBITMQ_URL")));
    }

    #[test]
    fn workers_fill_queue_exchange_and_concurrency() {
        let config = Config::from_json(
            r#"{
                "RABBITMQ_URL": "amqp://localhost",
                "QUEUE_PREFIX": "jobs",
                "CMD_PREFIX": "docker exec sandbox",
                "WORKERS": [
                    {"driver": "python"},
                    {"driver": "node", "queue": "custom", "results_exchange": "other", "concurrency": 2}
                ]
            }"#,
        )
        .unwrap();

        let workers = config.workers().unwrap();
        assert_eq!(
            workers[0],
            WorkerConfig {
                driver: DriverKind::Python,
                queue: "jobs.python".into(),
                results_exchange: "codexec.results".into(),
                concurrency: 10,
            }
        );
        assert_eq!(workers[1].queue, "custom");
        assert_eq!(workers[1].results_exchange, "other");
        assert_eq!(workers[1].concurrency, 2);
        assert_eq!(config.sandbox.cmd_prefix.to_string(), "docker exec sandbox");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            (r#"{"RABBITMQ_URL": "x", "WORKERS": []}"#, "WORKERS"),
            (r#"{"RABBITMQ_URL": "x", "WORKERS": [{"driver": "ruby"}]}"#, "WORKERS"),
            (r#"{"RABBITMQ_URL": "x", "WORKERS": [{"driver": "node", "concurrency": 0}]}"#, "WORKERS"),
            (r#"{"RABBITMQ_URL": "x", "EXECUTION_TIMEOUT": "0"}"#, "EXECUTION_TIMEOUT"),
            (r#"{"RABBITMQ_URL": "x", "SHUTDOWN_TIMEOUT": "soon"}"#, "SHUTDOWN_TIMEOUT"),
            (r#"{"RABBITMQ_URL": "x", "HUB_BIND": "nowhere"}"#, "HUB_BIND"),
        ];

        for (json, expected) in cases {
            match Config::from_json(json) {
                Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected, "{json}"),
                other => panic!("{json}: expected invalid {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn subjects_override_defaults() {
        let config = Config::from_json(
            r#"{"RABBITMQ_URL": "x", "SUBJECTS": {"py3": {"queue": "codexec.python", "extension": "py"}}}"#,
        )
        .unwrap();

        assert_eq!(config.hub.subjects.len(), 1);
        assert_eq!(
            config.hub.subjects["py3"].queue.as_deref(),
            Some("codexec.python")
        );
    }

    #[test]
    fn default_subjects_reach_a_consumed_queue() {
        let config = Config::from_json(
            r#"{"RABBITMQ_URL": "x", "QUEUE_PREFIX": "jobs", "WORKERS": [{"driver": "python"}, {"driver": "node"}]}"#,
        )
        .unwrap();
        let consumed: Vec<&str> = config
            .workers()
            .unwrap()
            .iter()
            .map(|w| w.queue.as_str())
            .collect();
        let catalog = crate::hub::SubjectCatalog::new(
            &config.queue_prefix,
            &config.hub.subjects,
            &config.hub.exercises,
        );

        for subject in ["python", "node", "javascript"] {
            let queue = &catalog.subject(subject).unwrap().queue;
            assert!(consumed.contains(&queue.as_str()), "{subject} -> {queue}");
        }
        assert_eq!(catalog.subject("javascript").unwrap().queue, "jobs.node");
    }

    #[test]
    fn exercises_carry_checkers() {
        let config = Config::from_json(
            r#"{"RABBITMQ_URL": "x", "EXERCISES": {
                "sum": {"subject": "python", "io_checker": {"input": "2 3\n", "expected_output": "5\n"}},
                "unit": {"subject": "node", "code_checker": {"code": "check()", "file_name": "./tests.js"}}
            }}"#,
        )
        .unwrap();

        let sum = &config.hub.exercises["sum"];
        assert_eq!(sum.subject, "python");
        assert_eq!(sum.io_checker.as_ref().unwrap().expected_output, "5\n");
        assert!(config.hub.exercises["unit"].code_checker.is_some());
    }

    #[test]
    fn exercises_are_validated() {
        let cases = [
            r#"{"RABBITMQ_URL": "x", "EXERCISES": {"e": {"subject": "cobol"}}}"#,
            r#"{"RABBITMQ_URL": "x", "EXERCISES": {"e": {"subject": "python", "code_checker": {"code": "", "file_name": "t.py\"\nkeep_caps: true"}}}}"#,
            r#"{"RABBITMQ_URL": "x", "EXERCISES": []}"#,
        ];

        for json in cases {
            assert!(
                matches!(
                    Config::from_json(json),
                    Err(ConfigError::Invalid { key: "EXERCISES", .. })
                ),
                "{json}"
            );
        }
    }

    #[test]
    fn lookup_treats_blank_as_unset() {
        let config = Config::from_lookup(|key| match key {
            "RABBITMQ_URL" => Some("amqp://broker".into()),
            _ => Some("  ".into()),
        })
        .unwrap();
        assert_eq!(config.results_exchange, "codexec.results");
    }
}
