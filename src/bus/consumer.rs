use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::close_channel;
use crate::error::BusError;

/// Per-consumer settings, mapped onto `basic.consume`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeOptions {
    /// Consumer tag. Defaults to `<queue>-<uuid>`.
    pub tag: Option<String>,
    /// Let the broker consider messages settled on delivery. Handler
    /// failures are then logged and the message is gone.
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl ConsumeOptions {
    pub fn consumer_tag(&self, queue: &str) -> String {
        self.tag
            .clone()
            .unwrap_or_else(|| format!("{queue}-{}", Uuid::new_v4()))
    }

    fn basic(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }
}

/// Processes one message body. `Ok` acks, `Err` or a panic nacks with requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()>;
}

/// A message that can be settled exactly once.
#[async_trait]
pub trait Delivery: Send + Sync + Sized {
    fn body(&self) -> &[u8];

    fn redelivered(&self) -> bool;

    async fn ack(self) -> Result<(), BusError>;

    async fn nack_requeue(self) -> Result<(), BusError>;
}

#[async_trait]
impl Delivery for lapin::message::Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self) -> Result<(), BusError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(BusError::channel("basic_ack"))
    }

    async fn nack_requeue(self) -> Result<(), BusError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(BusError::channel("basic_nack"))
    }
}

/// Feed `deliveries` to `handler`, at most `concurrency` at a time.
///
/// Stops pulling new messages once `cancel` fires or the stream ends, then
/// waits for in-flight messages to settle. With `auto_ack` the broker has
/// already settled every delivery and nothing is acked or nacked here.
pub async fn dispatch<S, D, H>(
    deliveries: S,
    handler: Arc<H>,
    concurrency: usize,
    auto_ack: bool,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<D, lapin::Error>> + Send,
    D: Delivery,
    H: MessageHandler + ?Sized,
{
    deliveries
        .take_until(cancel.cancelled())
        .for_each_concurrent(concurrency.max(1), |item| {
            let handler = Arc::clone(&handler);
            async move {
                match item {
                    Ok(delivery) => process(&*handler, delivery, auto_ack).await,
                    Err(e) => error!(error = %e, "Consumer stream error"),
                }
            }
        })
        .await;
}

async fn process<D, H>(handler: &H, delivery: D, auto_ack: bool)
where
    D: Delivery,
    H: MessageHandler + ?Sized,
{
    if delivery.redelivered() {
        warn!(redelivered = true, "Processing redelivered message");
    }

    let outcome = AssertUnwindSafe(handler.handle(delivery.body()))
        .catch_unwind()
        .await;

    let settled = match (outcome, auto_ack) {
        (Ok(Ok(())), true) => Ok(()),
        (Ok(Ok(())), false) => delivery.ack().await,
        (Ok(Err(e)), true) => {
            error!(error = %format!("{e:#}"), "Message failed, already acked");
            Ok(())
        }
        (Ok(Err(e)), false) => {
            error!(error = %format!("{e:#}"), "Message failed, requeueing");
            delivery.nack_requeue().await
        }
        (Err(panic), true) => {
            error!(panic = panic_message(&*panic), "Handler panicked, already acked");
            Ok(())
        }
        (Err(panic), false) => {
            error!(panic = panic_message(&*panic), "Handler panicked, requeueing");
            delivery.nack_requeue().await
        }
    };

    if let Err(e) = settled {
        error!(error = %e, "Failed to settle message");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Consumes queues on its own channel per call to [`Consumer::start`].
#[derive(Clone)]
pub struct Consumer {
    conn: Arc<Connection>,
}

impl Consumer {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Consume `queue` until `cancel` fires.
    ///
    /// Prefetch is five times `concurrency`, so workers never wait on the
    /// broker between messages.
    pub async fn start<H>(
        &self,
        cancel: CancellationToken,
        queue: &str,
        handler: Arc<H>,
        concurrency: usize,
        options: ConsumeOptions,
    ) -> Result<(), BusError>
    where
        H: MessageHandler + ?Sized,
    {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(BusError::channel("create_channel"))?;

        let prefetch = u16::try_from(concurrency.saturating_mul(5)).unwrap_or(u16::MAX);
        let consumer = async {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(BusError::channel("basic_qos"))?;
            channel
                .basic_consume(
                    queue,
                    &options.consumer_tag(queue),
                    options.basic(),
                    options.args.clone(),
                )
                .await
                .map_err(BusError::channel("basic_consume"))
        }
        .await;

        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(e) => {
                close_channel(channel).await;
                return Err(e);
            }
        };

        info!(queue, concurrency, prefetch, exclusive = options.exclusive, "Consuming");
        dispatch(consumer, handler, concurrency, options.auto_ack, cancel).await;
        info!(queue, "Consumer drained");

        close_channel(channel).await;
        Ok(())
    }
}
