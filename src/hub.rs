//! Job result hub.
//!
//! Accepts submissions from connected clients, publishes them as jobs, and
//! routes each result from the fanout exchange back to the client that asked
//! for it. Every hub replica sees every result; a replica that holds no
//! correlation for a job simply drops it.
//!
//! The live-client set belongs to a single [`ControlLoop`] task and is only
//! changed through commands. The correlation map sits behind a mutex because
//! submissions and the result listener touch it independently.

mod client;
mod server;
mod subjects;

pub use client::{read_pump, write_pump, PING_PERIOD, PONG_WAIT, SEND_BUFFER, WRITE_WAIT};
pub use server::{router, serve, MAX_MESSAGE_SIZE};
pub use subjects::{Exercise, Subject, SubjectCatalog};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{MessageHandler, PublishOptions, Publisher};
use crate::checker::{evaluate, Checkers};
use crate::error::HubError;
use crate::model::{Directory, ExecuteResponse, ExecutionRequest};

pub type ClientId = Uuid;

/// A frame sent by a client to run its code. The subject and checkers come
/// from the exercise, never from the frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSubmission {
    pub exercise: String,
    pub submission: Directory,
}

#[derive(Debug)]
enum Command {
    Register {
        client: ClientId,
        outbound: mpsc::Sender<String>,
    },
    Unregister(ClientId),
    Deliver {
        client: ClientId,
        payload: String,
    },
}

#[derive(Debug)]
struct Pending {
    client: ClientId,
    checkers: Checkers,
    registered_at: Instant,
}

pub struct Hub<P> {
    commands: mpsc::Sender<Command>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    publisher: P,
    catalog: SubjectCatalog,
}

impl<P: Publisher> Hub<P> {
    /// Build a hub and the control loop that owns its clients. The loop must
    /// be running for clients to register or receive anything.
    pub fn new(publisher: P, catalog: SubjectCatalog) -> (Self, ControlLoop) {
        let (commands, rx) = mpsc::channel(SEND_BUFFER);
        let hub = Self {
            commands,
            pending: Mutex::new(HashMap::new()),
            publisher,
            catalog,
        };
        let control = ControlLoop {
            commands: rx,
            clients: HashMap::new(),
        };
        (hub, control)
    }

    /// Register a new client. Results for it arrive on the returned receiver,
    /// which closes once the client is unregistered.
    pub async fn register_client(&self) -> (ClientId, mpsc::Receiver<String>) {
        let client = Uuid::new_v4();
        let (outbound, rx) = mpsc::channel(SEND_BUFFER);
        self.send(Command::Register { client, outbound }).await;
        (client, rx)
    }

    /// Remove a client and forget every job still waiting on it.
    pub async fn unregister_client(&self, client: ClientId) {
        self.pending().retain(|_, p| p.client != client);
        self.send(Command::Unregister(client)).await;
    }

    /// Remember that `job_id`'s result belongs to `client`.
    pub fn register_job(&self, job_id: Uuid, client: ClientId, checkers: Checkers) {
        self.pending().insert(
            job_id,
            Pending {
                client,
                checkers,
                registered_at: Instant::now(),
            },
        );
    }

    /// Publish a client's submission as a job.
    ///
    /// The correlation is registered before publishing so a fast result can
    /// never arrive ahead of it. The publish is mandatory: a queue nobody
    /// declared fails the submission instead of losing the job.
    pub async fn submit_job(
        &self,
        client: ClientId,
        submission: ClientSubmission,
    ) -> Result<Uuid, HubError> {
        let exercise = self
            .catalog
            .exercise(&submission.exercise)
            .ok_or_else(|| HubError::UnknownExercise(submission.exercise.clone()))?;
        let subject = &exercise.subject;

        let request = ExecutionRequest {
            job_id: Uuid::new_v4(),
            source: submission.submission,
            entry_point: subject.entry_point(),
            code_checker: exercise.checkers.code.clone(),
            io_checker: exercise.checkers.io.clone(),
        };

        self.register_job(request.job_id, client, exercise.checkers.clone());
        if let Err(e) = self
            .publisher
            .publish_object_with("", &subject.queue, &request, PublishOptions::json().mandatory())
            .await
        {
            self.pending().remove(&request.job_id);
            return Err(e.into());
        }

        info!(job_id = %request.job_id, client = %client, queue = %subject.queue, "Submitted job");
        Ok(request.job_id)
    }

    /// Route one result from the fanout exchange. Only the first delivery for
    /// a job reaches its client; anything else is dropped.
    pub async fn deliver_result(&self, body: &[u8]) {
        let response: ExecuteResponse = match serde_json::from_slice(body) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable result");
                return;
            }
        };

        let job_id = response.job_id;
        let Some(pending) = self.pending().remove(&job_id) else {
            debug!(job_id = %job_id, "No correlation for result");
            return;
        };

        let report = evaluate(&pending.checkers, response);
        match serde_json::to_string(&report) {
            Ok(payload) => {
                debug!(job_id = %job_id, client = %pending.client, passed = report.passed, "Routing result");
                self.send(Command::Deliver {
                    client: pending.client,
                    payload,
                })
                .await;
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to encode report"),
        }
    }

    /// Drop correlations older than `ttl`. Returns how many were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|job_id, p| {
            let keep = p.registered_at.elapsed() < ttl;
            if !keep {
                warn!(job_id = %job_id, client = %p.client, "Correlation expired without a result");
            }
            keep
        });
        before - pending.len()
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!("Hub control loop has stopped");
        }
    }
}

impl<P: Publisher + 'static> Hub<P> {
    /// Periodically drop correlations whose result never came.
    pub fn start_sweeper(
        self: &Arc<Self>,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = (ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let swept = hub.sweep(ttl);
                if swept > 0 {
                    info!(swept, "Correlation sweep");
                }
            }
        })
    }
}

/// The result listener: results are always acked, whether or not they
/// belong to this replica.
#[async_trait]
impl<P: Publisher> MessageHandler for Hub<P> {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()> {
        self.deliver_result(body).await;
        Ok(())
    }
}

/// Sole owner of the live-client set.
pub struct ControlLoop {
    commands: mpsc::Receiver<Command>,
    clients: HashMap<ClientId, mpsc::Sender<String>>,
}

impl ControlLoop {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else { break };

            match command {
                Command::Register { client, outbound } => {
                    self.clients.insert(client, outbound);
                    debug!(client = %client, clients = self.clients.len(), "Client registered");
                }
                Command::Unregister(client) => {
                    if self.clients.remove(&client).is_some() {
                        debug!(client = %client, clients = self.clients.len(), "Client unregistered");
                    }
                }
                Command::Deliver { client, payload } => self.deliver(client, payload),
            }
        }

        info!(clients = self.clients.len(), "Hub control loop stopped");
    }

    fn deliver(&mut self, client: ClientId, payload: String) {
        let Some(outbound) = self.clients.get(&client) else {
            debug!(client = %client, "Result for departed client dropped");
            return;
        };

        match outbound.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(client = %client, "Client buffer full, result dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = %client, "Client gone, result dropped");
                self.clients.remove(&client);
            }
        }
    }
}
