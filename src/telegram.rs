//! Telegram Bot API transport
//!
//! Long-polls `getUpdates`, turns updates into session events, and sends
//! notices with inline keyboards. Sessions are keyed by chat id, which for
//! private chats is the user id.

use crate::ids::{MessageId, UserId};
use crate::notice::UserAction;
use crate::runtime::{
    Attachment, ChatTransport, FileSource, OutboundMessage, RuntimeManager, TransportError,
};
use crate::state_machine::event::Command;
use crate::state_machine::session::Coordinates;
use crate::state_machine::Event;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    file_base: String,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: MessageId,
    chat: Chat,
    text: Option<String>,
    photo: Option<Vec<PhotoSize>>,
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: UserId,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct Location {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    data: Option<String>,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: UserId,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Serialize)]
struct InlineButton {
    text: &'static str,
    callback_data: String,
}

fn keyboard(actions: &[UserAction]) -> Option<InlineKeyboard> {
    if actions.is_empty() {
        return None;
    }
    Some(InlineKeyboard {
        inline_keyboard: actions
            .iter()
            .map(|a| {
                vec![InlineButton {
                    text: a.label(),
                    callback_data: a.to_callback(),
                }]
            })
            .collect(),
    })
}

/// What an update means for a session
#[derive(Debug)]
struct Incoming {
    chat_id: UserId,
    event: Event,
    /// Callback query to acknowledge
    callback_id: Option<String>,
}

fn translate(update: Update) -> Option<Incoming> {
    if let Some(query) = update.callback_query {
        let message = query.message?;
        let action = query.data.as_deref().and_then(UserAction::parse)?;
        return Some(Incoming {
            chat_id: message.chat.id,
            event: Event::UserAction {
                action,
                message_id: message.message_id,
                received_at: Utc::now(),
            },
            callback_id: Some(query.id),
        });
    }

    let message = update.message?;
    let chat_id = message.chat.id;
    let event = if let Some(text) = message.text {
        if let Some(command) = Command::parse(&text) {
            Event::UserCommand(command)
        } else if let Some(action) = UserAction::parse(&text) {
            // Button commands may also be typed: /delete_password
            Event::UserAction {
                action,
                message_id: message.message_id,
                received_at: Utc::now(),
            }
        } else {
            Event::UserText {
                text,
                message_id: message.message_id,
            }
        }
    } else if let Some(mut sizes) = message.photo {
        // Sizes are listed smallest first
        let largest = sizes.pop()?;
        Event::UserPhoto {
            file_id: largest.file_id,
            message_id: message.message_id,
        }
    } else if let Some(location) = message.location {
        Event::UserLocation {
            coordinates: Coordinates {
                lat: location.latitude,
                lon: location.longitude,
            },
        }
    } else {
        return None;
    };

    Some(Incoming {
        chat_id,
        event,
        callback_id: None,
    })
}

// ============================================================================
// Client
// ============================================================================

impl TelegramClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self, TransportError> {
        let api_url = api_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()?;
        Ok(Self {
            client,
            api_base: format!("{api_url}/bot{token}"),
            file_base: format!("{api_url}/file/bot{token}"),
        })
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        api_result(method, response)
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: multipart::Form,
    ) -> Result<T, TransportError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        api_result(method, response)
    }

    async fn send_document(
        &self,
        message: &OutboundMessage,
        attachment: &Attachment,
    ) -> Result<MessageId, TransportError> {
        let document = multipart::Part::text(attachment.content.clone())
            .file_name(attachment.file_name.clone())
            .mime_str("text/plain")?;
        let mut form = multipart::Form::new()
            .text("chat_id", message.chat_id.to_string())
            .text("caption", message.text.clone())
            .part("document", document);
        if let Some(reply_to) = message.reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }
        let sent: SentMessage = self.call_multipart("sendDocument", form).await?;
        Ok(sent.message_id)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<bool, TransportError> {
        self.call(
            "answerCallbackQuery",
            &serde_json::json!({ "callback_query_id": callback_id }),
        )
        .await
    }

    /// Long-poll for updates and route them to sessions until `shutdown`
    pub async fn run_polling(
        self: Arc<Self>,
        manager: Arc<RuntimeManager>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Telegram polling started");
        let mut offset = 0;

        loop {
            let updates = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.get_updates(offset) => result,
            };
            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!(error = %e, "getUpdates failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(incoming) = translate(update) else {
                    continue;
                };
                if let Some(callback_id) = &incoming.callback_id {
                    if let Err(e) = self.answer_callback(callback_id).await {
                        tracing::debug!(error = %e, "answerCallbackQuery failed");
                    }
                }
                tracing::debug!(
                    user_id = incoming.chat_id,
                    kind = incoming.event.kind(),
                    "Incoming update"
                );
                if let Err(e) = manager.send_event(incoming.chat_id, incoming.event).await {
                    tracing::error!(user_id = incoming.chat_id, error = %e, "Failed to route update");
                }
            }
        }
        tracing::info!("Telegram polling stopped");
    }
}

fn api_result<T>(method: &str, response: ApiResponse<T>) -> Result<T, TransportError> {
    match response {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { description, .. } => Err(TransportError::Api(
            description.unwrap_or_else(|| format!("{method} failed")),
        )),
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError> {
        if let Some(attachment) = &message.attachment {
            return self.send_document(message, attachment).await;
        }
        let body = SendMessage {
            chat_id: message.chat_id,
            text: &message.text,
            reply_to_message_id: message.reply_to,
            reply_markup: keyboard(&message.actions),
        };
        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id)
    }
}

#[async_trait]
impl FileSource for TelegramClient {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, TransportError> {
        let file: File = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| TransportError::Api(format!("file {file_id} has no path")))?;

        let response = self
            .client
            .get(format!("{}/{path}", self.file_base))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
