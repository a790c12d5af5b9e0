//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::ids::{AppealKey, MessageId, UserId};
use crate::notice::UserAction;
use crate::state_machine::session::{Coordinates, ResolvedAddress};
use crate::state_machine::UserSession;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("chat api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat api rejected the request: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    BadResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("service is not configured")]
    NotConfigured,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Traits
// ============================================================================

/// One structured record per user
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: UserId) -> Result<Option<UserSession>, StoreError>;

    async fn save(&self, session: &UserSession) -> Result<(), StoreError>;

    async fn delete(&self, user_id: UserId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannedUser {
    pub user_id: UserId,
    pub reason: String,
}

/// Users barred from filing reports, managed by the admin
#[async_trait]
pub trait BanList: Send + Sync {
    async fn ban(&self, user_id: UserId, reason: &str) -> Result<(), StoreError>;

    /// Returns whether the user was on the list
    async fn unban(&self, user_id: UserId) -> Result<bool, StoreError>;

    async fn ban_reason(&self, user_id: UserId) -> Result<Option<String>, StoreError>;

    async fn banned(&self) -> Result<Vec<BannedUser>, StoreError>;
}

/// Text file sent as a document; the message text becomes its caption
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub content: String,
}

/// Outbound chat message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub chat_id: UserId,
    pub text: String,
    pub actions: Vec<UserAction>,
    /// Message this one answers; optional, dropped on retry
    pub reply_to: Option<MessageId>,
    pub attachment: Option<Attachment>,
}

impl OutboundMessage {
    pub fn text(chat_id: UserId, text: String) -> Self {
        Self {
            chat_id,
            text,
            actions: Vec::new(),
            reply_to: None,
            attachment: None,
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError>;
}

/// Source of the bytes behind a chat file id
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve_text(&self, query: &str) -> Result<Option<ResolvedAddress>, ServiceError>;

    async fn resolve_location(
        &self,
        coordinates: Coordinates,
    ) -> Result<Option<ResolvedAddress>, ServiceError>;
}

#[async_trait]
pub trait MailVerifier: Send + Sync {
    /// Mail a secret code to `email` and return it
    async fn send_code(&self, email: &str) -> Result<String, ServiceError>;

    /// Whether the password opens the mailbox
    async fn check_password(&self, email: &str, password: &str) -> Result<bool, ServiceError>;
}

/// Durable storage for violation photos, keyed by `(user, appeal)`
#[async_trait]
pub trait PhotoStorage: Send + Sync {
    /// Store the photos and return their stable URLs in order
    async fn store(&self, key: AppealKey, file_ids: &[String]) -> Result<Vec<String>, ServiceError>;

    /// Delete everything stored under `key`
    async fn clear(&self, key: AppealKey) -> Result<(), ServiceError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn load(&self, user_id: UserId) -> Result<Option<UserSession>, StoreError> {
        (**self).load(user_id).await
    }

    async fn save(&self, session: &UserSession) -> Result<(), StoreError> {
        (**self).save(session).await
    }

    async fn delete(&self, user_id: UserId) -> Result<(), StoreError> {
        (**self).delete(user_id).await
    }
}

#[async_trait]
impl<T: BanList + ?Sized> BanList for Arc<T> {
    async fn ban(&self, user_id: UserId, reason: &str) -> Result<(), StoreError> {
        (**self).ban(user_id, reason).await
    }

    async fn unban(&self, user_id: UserId) -> Result<bool, StoreError> {
        (**self).unban(user_id).await
    }

    async fn ban_reason(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        (**self).ban_reason(user_id).await
    }

    async fn banned(&self) -> Result<Vec<BannedUser>, StoreError> {
        (**self).banned().await
    }
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError> {
        (**self).send(message).await
    }
}

#[async_trait]
impl<T: FileSource + ?Sized> FileSource for Arc<T> {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, TransportError> {
        (**self).download(file_id).await
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Send a message; on failure retry once without the reply reference,
/// then give up quietly.
pub async fn deliver(chat: &dyn ChatTransport, message: OutboundMessage) -> Option<MessageId> {
    let err = match chat.send(&message).await {
        Ok(id) => return Some(id),
        Err(err) => err,
    };

    if message.reply_to.is_none() {
        tracing::warn!(chat_id = message.chat_id, error = %err, "Dropping outbound message");
        return None;
    }

    tracing::debug!(
        chat_id = message.chat_id,
        error = %err,
        "Send failed, retrying without reply reference"
    );
    let retry = OutboundMessage {
        reply_to: None,
        ..message
    };
    match chat.send(&retry).await {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(chat_id = retry.chat_id, error = %err, "Dropping outbound message");
            None
        }
    }
}
