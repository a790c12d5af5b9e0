//! NATS transport for both protocol channels

use super::client::CommandPublisher;
use super::wire::CommandMessage;
use super::ProtocolError;
use crate::ids::WorkerHandle;
use async_trait::async_trait;

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    pub async fn connect(nats_url: &str) -> Result<Self, ProtocolError> {
        let client = async_nats::connect(nats_url).await?;
        tracing::info!(url = %nats_url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Subscribe to the shared event subject
    pub async fn subscribe_events(
        &self,
        subject: &str,
    ) -> Result<async_nats::Subscriber, ProtocolError> {
        let sub = self.client.subscribe(subject.to_string()).await?;
        tracing::info!(subject = %subject, "Listening for worker events");
        Ok(sub)
    }
}

#[async_trait]
impl CommandPublisher for NatsBroker {
    async fn publish(
        &self,
        worker: &WorkerHandle,
        command: &CommandMessage,
    ) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(command)?;
        self.client
            .publish(worker.as_str().to_string(), payload.into())
            .await?;
        Ok(())
    }
}
