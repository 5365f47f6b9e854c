//! Worker: one executor bound to one job queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::bus::{Broker, ConsumeOptions, MessageHandler, Publisher};
use crate::config::WorkerConfig;
use crate::error::{BusError, WorkerError};
use crate::executor::ExecutorService;
use crate::model::ExecutionRequest;

/// Turns one queue message into one published result.
pub struct JobHandler<P> {
    executor: ExecutorService,
    publisher: P,
    results_exchange: String,
    cancel: CancellationToken,
}

impl<P: Publisher> JobHandler<P> {
    pub fn new(
        executor: ExecutorService,
        publisher: P,
        results_exchange: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            publisher,
            results_exchange: results_exchange.into(),
            cancel,
        }
    }

    pub async fn process(&self, body: &[u8]) -> Result<(), WorkerError> {
        let request: ExecutionRequest = serde_json::from_slice(body).map_err(WorkerError::Parse)?;
        let response = self.executor.execute(&self.cancel, &request).await?;
        self.publisher
            .publish_object(&self.results_exchange, "", &response)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<P: Publisher> MessageHandler for JobHandler<P> {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()> {
        Ok(self.process(body).await?)
    }
}

pub struct Worker {
    broker: Broker,
    config: WorkerConfig,
    executor: ExecutorService,
}

impl Worker {
    pub fn new(broker: Broker, config: WorkerConfig, executor: ExecutorService) -> Self {
        Self {
            broker,
            config,
            executor,
        }
    }

    /// Consume the worker's queue until `cancel` fires and in-flight jobs
    /// have settled.
    #[instrument(skip_all, fields(queue = %self.config.queue, driver = %self.config.driver))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BusError> {
        let Self {
            broker,
            config,
            executor,
        } = self;

        broker.declare_queue(&config.queue).await?;
        broker.declare_fanout(&config.results_exchange).await?;

        let handler = Arc::new(JobHandler::new(
            executor,
            broker.producer(),
            config.results_exchange.as_str(),
            cancel.clone(),
        ));

        info!(concurrency = config.concurrency, "Worker started");
        broker
            .consumer()
            .start(
                cancel,
                &config.queue,
                handler,
                config.concurrency,
                ConsumeOptions::default(),
            )
            .await?;
        info!("Worker stopped");

        Ok(())
    }
}
