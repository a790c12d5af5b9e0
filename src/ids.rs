//! Identifier newtypes shared across the pool, timer, protocol and sessions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chat identity of a user (the chat id of their private conversation)
pub type UserId = i64;

/// Identifier of an appeal; the id of the message whose approval created it
pub type AppealId = i64;

/// Chat message identifier
pub type MessageId = i64;

/// Opaque identifier of one worker's private command queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle(String);

impl WorkerHandle {
    pub fn new(queue: impl Into<String>) -> Self {
        Self(queue.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An appeal addressed process-wide: appeal ids are only unique per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppealKey {
    pub user_id: UserId,
    pub appeal_id: AppealId,
}

impl AppealKey {
    pub fn new(user_id: UserId, appeal_id: AppealId) -> Self {
        Self { user_id, appeal_id }
    }
}

impl fmt::Display for AppealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.appeal_id)
    }
}
