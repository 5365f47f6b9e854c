//! Per-connection read and write pumps.
//!
//! The pumps are generic over the socket halves so they can be driven by
//! plain channels in tests.

use std::fmt::Display;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

use super::{ClientId, ClientSubmission, Hub};
use crate::bus::Publisher;

/// Time allowed to write one frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between frames from the peer, pongs included.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Must stay below [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Outbound messages buffered per client before results are dropped.
pub const SEND_BUFFER: usize = 256;

/// Forward queued results to the socket and keep the connection alive.
///
/// Results already waiting in `outbound` are joined with `\n` into a single
/// frame. Returns once `outbound` closes or a write fails.
pub async fn write_pump<S>(mut sink: S, mut outbound: mpsc::Receiver<String>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        let frame = tokio::select! {
            message = outbound.recv() => match message {
                Some(mut text) => {
                    while let Ok(more) = outbound.try_recv() {
                        text.push('\n');
                        text.push_str(&more);
                    }
                    Message::Text(text.into())
                }
                None => {
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Client write failed");
                return;
            }
            Err(_) => {
                debug!("Client write timed out");
                return;
            }
        }
    }
}

/// Read submissions from the socket until it closes or goes quiet for
/// [`PONG_WAIT`], then unregister the client.
pub async fn read_pump<S, E, P>(mut stream: S, hub: &Hub<P>, client: ClientId)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    P: Publisher,
{
    loop {
        let Ok(next) = timeout(PONG_WAIT, stream.next()).await else {
            debug!(client = %client, "Client timed out");
            break;
        };

        match next {
            Some(Ok(Message::Text(text))) => submit(hub, client, text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(client = %client, error = %e, "Client read failed");
                break;
            }
        }
    }

    hub.unregister_client(client).await;
}

async fn submit<P: Publisher>(hub: &Hub<P>, client: ClientId, text: &str) {
    let submission: ClientSubmission = match serde_json::from_str(text) {
        Ok(submission) => submission,
        Err(e) => {
            warn!(client = %client, error = %e, "Skipping malformed client frame");
            return;
        }
    };

    if let Err(e) = hub.submit_job(client, submission).await {
        warn!(client = %client, error = %e, "Submission rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PublishOptions;
    use crate::config::{ExerciseConfig, SubjectConfig};
    use crate::error::BusError;
    use crate::hub::SubjectCatalog;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn queued_results_share_one_frame() {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        for msg in ["a", "b", "c"] {
            tx.send(msg.into()).await.unwrap();
        }
        drop(tx);
        let (sink, frames) = futures::channel::mpsc::unbounded::<Message>();

        write_pump(sink, rx).await;

        let frames: Vec<Message> = frames.collect().await;
        assert_eq!(frames, vec![Message::Text("a\nb\nc".into()), Message::Close(None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_pinged() {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let (sink, mut frames) = futures::channel::mpsc::unbounded::<Message>();
        let pump = tokio::spawn(write_pump(sink, rx));

        let started = Instant::now();
        assert!(matches!(frames.next().await, Some(Message::Ping(_))));
        assert!(started.elapsed() >= PING_PERIOD);

        drop(tx);
        pump.await.unwrap();
        assert_eq!(frames.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn write_failure_stops_pump() {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let (sink, frames) = futures::channel::mpsc::unbounded::<Message>();
        drop(frames);
        tx.send("lost".into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), write_pump(sink, rx))
            .await
            .unwrap();
    }

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish(
            &self,
            _exchange: &str,
            routing_key: &str,
            _body: Vec<u8>,
            _options: PublishOptions,
        ) -> Result<(), BusError> {
            self.0.lock().unwrap().push(routing_key.into());
            Ok(())
        }
    }

    fn hub(publisher: Recorder) -> Hub<Recorder> {
        let subjects = HashMap::from([(
            "node".to_string(),
            SubjectConfig {
                queue: None,
                extension: "js".into(),
            },
        )]);
        let exercises = HashMap::from([(
            "hello".to_string(),
            ExerciseConfig {
                subject: "node".into(),
                io_checker: None,
                code_checker: None,
            },
        )]);
        let (hub, control) = Hub::new(
            publisher,
            SubjectCatalog::new("codexec", &subjects, &exercises),
        );
        tokio::spawn(control.run(CancellationToken::new()));
        hub
    }

    #[tokio::test]
    async fn reader_submits_frames_and_skips_garbage() {
        let publisher = Recorder::default();
        let hub = hub(publisher.clone());
        let (client, mut outbound) = hub.register_client().await;

        let frames: Vec<Result<Message, BusError>> = vec![
            Ok(Message::Text("{broken".into())),
            Ok(Message::Text(
                r#"{"exercise": "hello", "submission": {"files": [{"name": "main", "ext": "js", "content": "1"}]}}"#.into(),
            )),
            Ok(Message::Pong(Bytes::new())),
        ];
        read_pump(futures::stream::iter(frames), &hub, client).await;

        assert_eq!(*publisher.0.lock().unwrap(), vec!["codexec.node".to_string()]);
        assert_eq!(hub.pending_jobs(), 0, "disconnect forgets pending jobs");
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let hub = hub(Recorder::default());
        let (client, mut outbound) = hub.register_client().await;

        read_pump(
            futures::stream::pending::<Result<Message, BusError>>(),
            &hub,
            client,
        )
        .await;

        assert!(outbound.recv().await.is_none());
    }
}
