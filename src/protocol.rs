//! Submission protocol
//!
//! Commands go to one specific worker over its private subject; events from
//! all workers arrive on one shared subject and are dispatched by type.

mod client;
mod dispatch;
mod nats;
pub mod wire;

pub use client::{CommandPublisher, ProtocolClient};
pub use dispatch::{EventDispatcher, SessionRouter};
pub use nats::NatsBroker;

use async_nats::ConnectErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("nats connect error: {0}")]
    Connect(#[from] async_nats::error::Error<ConnectErrorKind>),

    #[error("nats subscribe error: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    #[error("nats publish error: {0}")]
    Publish(#[from] async_nats::PublishError),

    #[error("serialize command failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
