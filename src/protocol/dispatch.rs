//! Event side of the protocol
//!
//! Every message on the shared event subject is decoded and dispatched by
//! its declared type. Bad messages are logged and dropped; the loop keeps
//! serving everyone else.

use super::wire::WorkerEvent;
use crate::ids::UserId;
use crate::pool::{AddOutcome, WorkerPool};
use crate::runtime::RuntimeError;
use crate::state_machine::Event;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Hands an event to the session of one user
#[async_trait]
pub trait SessionRouter: Send + Sync {
    async fn route(&self, user_id: UserId, event: Event) -> Result<(), RuntimeError>;
}

#[async_trait]
impl<T: SessionRouter + ?Sized> SessionRouter for Arc<T> {
    async fn route(&self, user_id: UserId, event: Event) -> Result<(), RuntimeError> {
        (**self).route(user_id, event).await
    }
}

pub struct EventDispatcher {
    pool: Arc<WorkerPool>,
    router: Arc<dyn SessionRouter>,
}

impl EventDispatcher {
    pub fn new(pool: Arc<WorkerPool>, router: Arc<dyn SessionRouter>) -> Self {
        Self { pool, router }
    }

    /// Handle one raw event-channel message
    pub async fn dispatch(&self, body: &[u8]) {
        let event = match WorkerEvent::parse(body) {
            Ok(event) => event,
            Err(violation) => {
                tracing::warn!(
                    error = %violation,
                    body = %String::from_utf8_lossy(body),
                    "Dropping worker event"
                );
                return;
            }
        };

        match event {
            WorkerEvent::WorkerFree { worker } => match self.pool.add_handle(worker.clone()) {
                AddOutcome::Added => {
                    tracing::info!(
                        worker = %worker,
                        idle = self.pool.idle_count(),
                        "Worker available"
                    );
                }
                AddOutcome::AlreadyIdle => {
                    tracing::debug!(worker = %worker, "Duplicate availability announcement");
                }
                AddOutcome::RejectedBound(key) => {
                    tracing::warn!(
                        worker = %worker,
                        user_id = key.user_id,
                        appeal_id = key.appeal_id,
                        "Ignoring FREE_WORKER from a worker bound to an unresolved appeal"
                    );
                }
            },
            WorkerEvent::Appeal(event) => {
                let user_id = event.user_id;
                let appeal_id = event.appeal_id;
                tracing::debug!(user_id, appeal_id, kind = ?event.kind, "Routing worker event");
                if let Err(e) = self.router.route(user_id, Event::Worker(event)).await {
                    tracing::error!(user_id, appeal_id, error = %e, "Failed to route worker event");
                }
            }
        }
    }

    /// Consume message bodies until the stream ends or `shutdown` fires
    pub async fn run<S, B>(self, mut messages: S, shutdown: CancellationToken)
    where
        S: Stream<Item = B> + Unpin,
        B: AsRef<[u8]>,
    {
        tracing::info!("Event dispatcher started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                message = messages.next() => match message {
                    Some(body) => self.dispatch(body.as_ref()).await,
                    None => {
                        tracing::warn!("Event subscription closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("Event dispatcher stopped");
    }
}
