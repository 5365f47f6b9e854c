//! AMQP plumbing: connection, topology, producer and consumer.
//!
//! Job queues are durable and point-to-point. Results go to a durable fanout
//! exchange; every hub replica binds its own exclusive, server-named queue to
//! it so each one sees every result.

mod consumer;
mod producer;

pub use consumer::{dispatch, ConsumeOptions, Consumer, Delivery, MessageHandler};
pub use producer::{Producer, PublishOptions, Publisher};

use std::sync::Arc;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use crate::error::BusError;

/// Build the job queue name for a language, e.g. `codexec.python`.
pub fn queue_name(prefix: &str, language: &str) -> String {
    format!("{prefix}.{language}")
}

/// A shared broker connection.
#[derive(Clone)]
pub struct Broker {
    conn: Arc<Connection>,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(BusError::Connection)?;
        info!("Connected to broker");

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    pub fn producer(&self) -> Producer {
        Producer::new(Arc::clone(&self.conn))
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(Arc::clone(&self.conn))
    }

    pub async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        let channel = self.open_channel().await?;
        let result = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BusError::channel("queue_declare"));
        close_channel(channel).await;

        result?;
        debug!(queue = name, "Declared queue");
        Ok(())
    }

    pub async fn declare_fanout(&self, exchange: &str) -> Result<(), BusError> {
        let channel = self.open_channel().await?;
        let result = declare_fanout_on(&channel, exchange).await;
        close_channel(channel).await;
        result
    }

    /// Declare `exchange` and bind a fresh exclusive queue to it. Returns the
    /// server-assigned queue name. The queue lives as long as the connection.
    pub async fn bind_fanout_queue(&self, exchange: &str) -> Result<String, BusError> {
        let channel = self.open_channel().await?;
        let result = async {
            declare_fanout_on(&channel, exchange).await?;

            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BusError::channel("queue_declare"))?;
            let name = queue.name().as_str().to_string();

            channel
                .queue_bind(
                    &name,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BusError::channel("queue_bind"))?;

            info!(queue = %name, exchange, "Bound results queue");
            Ok::<_, BusError>(name)
        }
        .await;
        close_channel(channel).await;

        result
    }

    pub async fn close(&self) {
        if let Err(e) = self.conn.close(200, "shutdown").await {
            debug!(error = %e, "Broker connection already closed");
        }
    }

    async fn open_channel(&self) -> Result<Channel, BusError> {
        self.conn
            .create_channel()
            .await
            .map_err(BusError::channel("create_channel"))
    }
}

async fn declare_fanout_on(channel: &Channel, exchange: &str) -> Result<(), BusError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(BusError::channel("exchange_declare"))
}

pub(crate) async fn close_channel(channel: Channel) {
    if let Err(e) = channel.close(200, "OK").await {
        debug!(error = %e, "Channel already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_joins_prefix_and_language() {
        assert_eq!(queue_name("codexec", "python"), "codexec.python");
    }
}
