//! Executor service: one driver call under a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::driver::Driver;
use crate::error::ExecError;
use crate::model::{ExecuteResponse, ExecutionRequest};

#[derive(Debug, Clone)]
pub struct ExecutorService {
    driver: Arc<dyn Driver>,
    timeout: Duration,
}

impl ExecutorService {
    pub fn new(driver: Arc<dyn Driver>, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    /// Run `request` through the driver.
    ///
    /// Gives up with [`ExecError::Timeout`] once the deadline passes and with
    /// [`ExecError::Cancelled`] if `cancel` fires first. Dropping the driver
    /// future kills the sandbox process and removes the job directory.
    #[instrument(skip_all, fields(job_id = %request.job_id))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ExecutionRequest,
    ) -> Result<ExecuteResponse, ExecError> {
        info!(entry_point = %request.entry_point, "Executing job");

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.driver.execute(request)) => match res {
                Ok(res) => res.map_err(ExecError::from),
                Err(_) => Err(ExecError::Timeout(self.timeout)),
            },
        };

        match &outcome {
            Ok(response) => {
                info!(
                    exit_code = response.exit_code,
                    time = response.time,
                    cpu = response.cpu,
                    memory = response.memory,
                    "Job finished"
                );
                debug!(stdout = %response.stdout, stderr = %response.stderr, "Job output");
            }
            Err(e) => error!(error = %e, "Job failed"),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::model::Directory;
    use crate::sandbox::CmdPrefix;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Default)]
    struct SlowDriver {
        delay: Duration,
        calls: AtomicUsize,
        prefix: CmdPrefix,
    }

    #[async_trait]
    impl Driver for SlowDriver {
        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecuteResponse, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ExecuteResponse {
                job_id: request.job_id,
                stdout: "ok\n".into(),
                exit_code: 0,
                time: 0.1,
                ..ExecuteResponse::default()
            })
        }

        fn set_cmd_prefix(&mut self, prefix: CmdPrefix) {
            self.prefix = prefix;
        }

        fn cmd_prefix(&self) -> &CmdPrefix {
            &self.prefix
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            source: Directory::default(),
            entry_point: "main.py".into(),
            code_checker: None,
            io_checker: None,
        }
    }

    fn service(delay: Duration, timeout: Duration) -> ExecutorService {
        let driver = SlowDriver {
            delay,
            ..SlowDriver::default()
        };
        ExecutorService::new(Arc::new(driver), timeout)
    }

    #[tokio::test]
    async fn returns_driver_response() {
        let svc = service(Duration::ZERO, Duration::from_secs(5));
        let req = request();

        let res = tokio_test::assert_ok!(svc.execute(&CancellationToken::new(), &req).await);
        assert_eq!(res.job_id, req.job_id);
        assert_eq!(res.stdout, "ok\n");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_slow_driver() {
        let svc = service(Duration::from_secs(60), Duration::from_secs(2));

        let err = svc
            .execute(&CancellationToken::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let svc = service(Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = svc.execute(&cancel, &request()).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn sandbox_errors_surface() {
        #[derive(Debug, Default)]
        struct Broken(CmdPrefix);

        #[async_trait]
        impl Driver for Broken {
            async fn execute(&self, _: &ExecutionRequest) -> Result<ExecuteResponse, SandboxError> {
                Err(SandboxError::InvalidPath("..".into()))
            }
            fn set_cmd_prefix(&mut self, prefix: CmdPrefix) {
                self.0 = prefix;
            }
            fn cmd_prefix(&self) -> &CmdPrefix {
                &self.0
            }
        }

        let svc = ExecutorService::new(Arc::new(Broken::default()), Duration::from_secs(1));
        let err = svc
            .execute(&CancellationToken::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Sandbox(SandboxError::InvalidPath(_))));
    }
}
