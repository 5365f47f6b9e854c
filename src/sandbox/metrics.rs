//! The timing line the isolation binary's `time` wrapper appends to stderr:
//! `elapsed,userCPU,sysCPU,maxRSS_KB`.

use std::str::FromStr;

use crate::error::MetricsError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    /// Wall-clock seconds.
    pub elapsed: f64,
    pub user_cpu: f64,
    pub sys_cpu: f64,
    pub max_rss_kb: u64,
}

impl Metrics {
    /// Normalized CPU utilization over the run.
    pub fn cpu(&self) -> f64 {
        (self.user_cpu + self.sys_cpu) / self.elapsed
    }
}

impl FromStr for Metrics {
    type Err = MetricsError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| MetricsError::Malformed {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let &[elapsed, user, sys, rss] = fields.as_slice() else {
            return Err(malformed("expected 4 comma-separated fields"));
        };

        let seconds = |field: &str, name: &str| {
            field
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| malformed(&format!("bad {name} {field:?}")))
        };

        let metrics = Self {
            elapsed: seconds(elapsed, "elapsed")?,
            user_cpu: seconds(user, "user cpu")?,
            sys_cpu: seconds(sys, "sys cpu")?,
            max_rss_kb: rss
                .parse()
                .map_err(|_| malformed(&format!("bad max rss {rss:?}")))?,
        };

        if metrics.elapsed == 0.0 {
            return Err(MetricsError::ZeroElapsed);
        }

        Ok(metrics)
    }
}

/// Split captured stderr into the program's own diagnostics and the trailing
/// metrics line.
pub fn split_stderr(stderr: &str) -> Result<(String, Metrics), MetricsError> {
    let body = stderr.strip_suffix('\n').unwrap_or(stderr);
    if body.trim().is_empty() {
        return Err(MetricsError::Missing);
    }

    let (diagnostics, line) = match body.rsplit_once('\n') {
        Some((head, line)) => (format!("{head}\n"), line),
        None => (String::new(), body),
    };

    Ok((diagnostics, line.parse()?))
}
