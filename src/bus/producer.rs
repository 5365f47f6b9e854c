use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::close_channel;
use crate::error::BusError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Delivery mode 2, so the message survives a broker restart.
    pub persistent: bool,
    /// Fail with [`BusError::Unroutable`] instead of letting the broker drop
    /// a message no queue is bound for.
    pub mandatory: bool,
}

impl PublishOptions {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".into()),
            headers: Vec::new(),
            persistent: true,
            mandatory: false,
        }
    }

    #[must_use]
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    fn properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default();
        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }
        if self.persistent {
            props = props.with_delivery_mode(2);
        }
        if !self.headers.is_empty() {
            let mut table = FieldTable::default();
            for (key, value) in &self.headers {
                table.insert(
                    ShortString::from(key.as_str()),
                    AMQPValue::LongString(LongString::from(value.as_str())),
                );
            }
            props = props.with_headers(table);
        }
        props
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BusError>;

    /// Publish `value` as a JSON object. Anything that does not serialize to
    /// an object is rejected before touching the broker.
    async fn publish_object<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), BusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publish_object_with(exchange, routing_key, value, PublishOptions::json())
            .await
    }

    async fn publish_object_with<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<(), BusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        if !value.is_object() {
            return Err(BusError::NotAnObject(json_kind(&value)));
        }
        let body = serde_json::to_vec(&value)?;
        self.publish(exchange, routing_key, body, options).await
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Publishes each message on its own short-lived channel.
#[derive(Clone)]
pub struct Producer {
    conn: Arc<Connection>,
}

impl Producer {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Publisher for Producer {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(BusError::channel("create_channel"))?;

        let result = async {
            if options.mandatory {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(BusError::channel("confirm_select"))?;
            }

            let confirmation = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions {
                        mandatory: options.mandatory,
                        ..BasicPublishOptions::default()
                    },
                    &body,
                    options.properties(),
                )
                .await
                .map_err(BusError::channel("basic_publish"))?
                .await
                .map_err(BusError::channel("publisher_confirm"))?;

            match confirmation {
                Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
                Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                    Err(BusError::Unroutable {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    })
                }
                Confirmation::Nack(None) => Err(BusError::Nacked),
            }
        }
        .await;
        close_channel(channel).await;

        if result.is_ok() {
            debug!(exchange, routing_key, bytes = body.len(), "Published message");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String, Vec<u8>, PublishOptions)>>);

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: Vec<u8>,
            options: PublishOptions,
        ) -> Result<(), BusError> {
            self.0
                .lock()
                .unwrap()
                .push((exchange.into(), routing_key.into(), body, options));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_object_sends_json() {
        let recorder = Recorder::default();
        recorder
            .publish_object("codexec.results", "", &serde_json::json!({"job_id": "x"}))
            .await
            .unwrap();

        let sent = recorder.0.lock().unwrap();
        let (exchange, key, body, options) = &sent[0];
        assert_eq!(exchange, "codexec.results");
        assert!(key.is_empty());
        assert_eq!(body.as_slice(), br#"{"job_id":"x"}"#);
        assert_eq!(options, &PublishOptions::json());
    }

    #[tokio::test]
    async fn publish_object_rejects_non_objects() {
        let recorder = Recorder::default();

        for value in [serde_json::json!([1, 2]), serde_json::json!("s"), Value::Null] {
            let err = recorder.publish_object("x", "y", &value).await.unwrap_err();
            assert!(matches!(err, BusError::NotAnObject(_)), "{value}");
        }
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_object_with_keeps_options() {
        let recorder = Recorder::default();
        recorder
            .publish_object_with(
                "",
                "codexec.python",
                &serde_json::json!({}),
                PublishOptions::json().mandatory(),
            )
            .await
            .unwrap();

        let sent = recorder.0.lock().unwrap();
        assert!(sent[0].3.mandatory);
        assert!(!PublishOptions::json().mandatory);
    }

    #[test]
    fn json_options_set_properties() {
        let options = PublishOptions {
            headers: vec![("x-origin".into(), "hub".into())],
            ..PublishOptions::json()
        };
        let props = options.properties();

        assert_eq!(
            props.content_type().as_ref().map(ShortString::as_str),
            Some("application/json")
        );
        assert_eq!(*props.delivery_mode(), Some(2));
        assert!(props.headers().is_some());
    }
}
