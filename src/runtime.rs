//! Runtime for executing user sessions
//!
//! Each user gets one `SessionRuntime` task. Every event for a user goes
//! through its channel, so a session is never mutated concurrently.
//! Routing never waits on a session: mailboxes are unbounded and the
//! stored record is loaded inside the session task. Idle runtimes stop on
//! their own and are started again by the next event.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::Services;
pub use traits::*;

use crate::ids::UserId;
use crate::protocol::SessionRouter;
use crate::state_machine::Event;
use async_trait::async_trait;
use executor::SessionRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("session runtime of user {0} has stopped")]
    SessionClosed(UserId),
}

/// Handle to interact with a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub event_tx: mpsc::UnboundedSender<Event>,
}

struct RuntimeEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl RuntimeEntry {
    fn is_open(&self) -> bool {
        !self.handle.event_tx.is_closed()
    }
}

/// Manager for all session runtimes
pub struct RuntimeManager {
    services: Arc<Services>,
    runtimes: RwLock<HashMap<UserId, RuntimeEntry>>,
}

impl RuntimeManager {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Get the runtime of a user, starting one if it is missing or stopped
    pub async fn get_or_create(&self, user_id: UserId) -> SessionHandle {
        {
            let runtimes = self.runtimes.read().await;
            if let Some(entry) = runtimes.get(&user_id).filter(|e| e.is_open()) {
                return entry.handle.clone();
            }
        }

        let mut runtimes = self.runtimes.write().await;
        // Another caller may have started it while we waited for the lock
        if let Some(entry) = runtimes.get(&user_id).filter(|e| e.is_open()) {
            return entry.handle.clone();
        }
        // A stopped runtime may still be draining; the new one loads after it
        let previous = runtimes.remove(&user_id).map(|e| e.task);
        runtimes.retain(|_, e| e.is_open() || !e.task.is_finished());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let services = Arc::clone(&self.services);
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match SessionRuntime::load(services, user_id, event_rx).await {
                Ok(runtime) => runtime.run().await,
                Err(e) => {
                    tracing::error!(user_id, error = %e, "Failed to load session, dropping its events");
                }
            }
        });

        let handle = SessionHandle { event_tx };
        runtimes.insert(
            user_id,
            RuntimeEntry {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }

    /// Queue an event for a user's session, starting it if needed
    pub async fn send_event(&self, user_id: UserId, event: Event) -> Result<(), RuntimeError> {
        let handle = self.get_or_create(user_id).await;
        let Err(mpsc::error::SendError(event)) = handle.event_tx.send(event) else {
            return Ok(());
        };
        // The runtime stopped between lookup and send
        self.get_or_create(user_id)
            .await
            .event_tx
            .send(event)
            .map_err(|_| RuntimeError::SessionClosed(user_id))
    }

    pub async fn active_sessions(&self) -> usize {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|e| e.is_open())
            .count()
    }
}

#[async_trait]
impl SessionRouter for RuntimeManager {
    async fn route(&self, user_id: UserId, event: Event) -> Result<(), RuntimeError> {
        self.send_event(user_id, event).await
    }
}
