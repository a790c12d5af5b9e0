//! Command side of the protocol

use super::wire::CommandMessage;
use super::ProtocolError;
use crate::appeal::AppealPayload;
use crate::ids::{AppealKey, WorkerHandle};
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers one command to the worker that owns `worker`
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(
        &self,
        worker: &WorkerHandle,
        command: &CommandMessage,
    ) -> Result<(), ProtocolError>;
}

#[async_trait]
impl<T: CommandPublisher + ?Sized> CommandPublisher for Arc<T> {
    async fn publish(
        &self,
        worker: &WorkerHandle,
        command: &CommandMessage,
    ) -> Result<(), ProtocolError> {
        (**self).publish(worker, command).await
    }
}

/// Issues commands to workers the caller already allocated
#[derive(Clone)]
pub struct ProtocolClient {
    publisher: Arc<dyn CommandPublisher>,
}

impl ProtocolClient {
    pub fn new(publisher: Arc<dyn CommandPublisher>) -> Self {
        Self { publisher }
    }

    /// Begin processing an appeal on `worker`
    pub async fn request_captcha(
        &self,
        payload: AppealPayload,
        worker: &WorkerHandle,
    ) -> Result<(), ProtocolError> {
        tracing::info!(
            user_id = payload.user_id,
            appeal_id = payload.appeal_id,
            worker = %worker,
            "Requesting captcha"
        );
        let command = CommandMessage::request_captcha(payload, worker);
        self.publisher.publish(worker, &command).await
    }

    pub async fn submit_captcha_answer(
        &self,
        key: AppealKey,
        answer: String,
        worker: &WorkerHandle,
        contact_email: Option<String>,
    ) -> Result<(), ProtocolError> {
        tracing::info!(
            user_id = key.user_id,
            appeal_id = key.appeal_id,
            worker = %worker,
            "Submitting captcha answer"
        );
        let command = CommandMessage::submit_answer(key, answer, worker, contact_email);
        self.publisher.publish(worker, &command).await
    }

    /// Abandon the appeal on the worker side
    pub async fn cancel(&self, key: AppealKey, worker: &WorkerHandle) -> Result<(), ProtocolError> {
        tracing::info!(
            user_id = key.user_id,
            appeal_id = key.appeal_id,
            worker = %worker,
            "Cancelling appeal"
        );
        self.publisher
            .publish(worker, &CommandMessage::cancel(key, worker))
            .await
    }
}
