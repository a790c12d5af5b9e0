//! Message formats on the command and event channels

use crate::appeal::AppealPayload;
use crate::ids::{AppealId, AppealKey, UserId, WorkerHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Commands (bot -> worker)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    RequestCaptcha,
    SubmitAnswer,
    Cancel,
}

/// Full appeal for `REQUEST_CAPTCHA`, answer text for `SUBMIT_ANSWER`,
/// empty text for `CANCEL`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandPayload {
    Appeal(Box<AppealPayload>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub user_id: UserId,
    pub appeal_id: AppealId,
    /// Queue of the worker the command is addressed to
    pub response_queue: String,
    pub payload: CommandPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

impl CommandMessage {
    pub fn request_captcha(payload: AppealPayload, worker: &WorkerHandle) -> Self {
        Self {
            kind: CommandKind::RequestCaptcha,
            user_id: payload.user_id,
            appeal_id: payload.appeal_id,
            response_queue: worker.as_str().to_string(),
            contact_email: payload.contact_email.clone(),
            payload: CommandPayload::Appeal(Box::new(payload)),
        }
    }

    pub fn submit_answer(
        key: AppealKey,
        answer: String,
        worker: &WorkerHandle,
        contact_email: Option<String>,
    ) -> Self {
        Self {
            kind: CommandKind::SubmitAnswer,
            user_id: key.user_id,
            appeal_id: key.appeal_id,
            response_queue: worker.as_str().to_string(),
            payload: CommandPayload::Text(answer),
            contact_email,
        }
    }

    pub fn cancel(key: AppealKey, worker: &WorkerHandle) -> Self {
        Self {
            kind: CommandKind::Cancel,
            user_id: key.user_id,
            appeal_id: key.appeal_id,
            response_queue: worker.as_str().to_string(),
            payload: CommandPayload::Text(String::new()),
            contact_email: None,
        }
    }
}

// ============================================================================
// Events (worker -> bot)
// ============================================================================

/// Event body as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum RawEvent {
    #[serde(rename = "OK")]
    Ok {
        user_id: UserId,
        appeal_id: AppealId,
        answer_queue: String,
    },
    #[serde(rename = "CAPTCHA_URL")]
    CaptchaUrl {
        user_id: UserId,
        appeal_id: AppealId,
        answer_queue: String,
        captcha: String,
    },
    #[serde(rename = "CAPTCHA_OK")]
    CaptchaOk {
        user_id: UserId,
        appeal_id: AppealId,
        answer_queue: String,
    },
    #[serde(rename = "FREE_WORKER")]
    FreeWorker { answer_queue: String },
}

const KNOWN_EVENT_TYPES: [&str; 4] = ["OK", "CAPTCHA_URL", "CAPTCHA_OK", "FREE_WORKER"];

/// What happened to one appeal on the worker side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppealEventKind {
    /// The portal accepted the appeal
    Success,
    CaptchaRequired { url: String },
    /// The last answer was right; processing continues without the user
    CaptchaAccepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppealEvent {
    pub user_id: UserId,
    pub appeal_id: AppealId,
    /// Worker that emitted the event
    pub worker: WorkerHandle,
    pub kind: AppealEventKind,
}

impl AppealEvent {
    pub fn key(&self) -> AppealKey {
        AppealKey::new(self.user_id, self.appeal_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Appeal(AppealEvent),
    /// A worker announced idle capacity
    WorkerFree { worker: WorkerHandle },
}

/// An inbound event that cannot be acted on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unrecognized event type: {0}")]
    Unrecognized(String),
    #[error("event {event} has an empty {field}")]
    EmptyField {
        event: &'static str,
        field: &'static str,
    },
}

fn worker_handle(event: &'static str, queue: String) -> Result<WorkerHandle, ProtocolViolation> {
    if queue.trim().is_empty() {
        return Err(ProtocolViolation::EmptyField {
            event,
            field: "answer_queue",
        });
    }
    Ok(WorkerHandle::new(queue))
}

impl WorkerEvent {
    /// Decode one event-channel message
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolViolation> {
        let raw: RawEvent = serde_json::from_slice(body).map_err(|err| classify(body, &err))?;

        let (user_id, appeal_id, worker, kind) = match raw {
            RawEvent::FreeWorker { answer_queue } => {
                return Ok(WorkerEvent::WorkerFree {
                    worker: worker_handle("FREE_WORKER", answer_queue)?,
                });
            }
            RawEvent::Ok {
                user_id,
                appeal_id,
                answer_queue,
            } => (
                user_id,
                appeal_id,
                worker_handle("OK", answer_queue)?,
                AppealEventKind::Success,
            ),
            RawEvent::CaptchaUrl {
                user_id,
                appeal_id,
                answer_queue,
                captcha,
            } => {
                if captcha.trim().is_empty() {
                    return Err(ProtocolViolation::EmptyField {
                        event: "CAPTCHA_URL",
                        field: "captcha",
                    });
                }
                (
                    user_id,
                    appeal_id,
                    worker_handle("CAPTCHA_URL", answer_queue)?,
                    AppealEventKind::CaptchaRequired { url: captcha },
                )
            }
            RawEvent::CaptchaOk {
                user_id,
                appeal_id,
                answer_queue,
            } => (
                user_id,
                appeal_id,
                worker_handle("CAPTCHA_OK", answer_queue)?,
                AppealEventKind::CaptchaAccepted,
            ),
        };

        Ok(WorkerEvent::Appeal(AppealEvent {
            user_id,
            appeal_id,
            worker,
            kind,
        }))
    }
}

/// Tell an unknown `type` apart from a known one with a bad body
fn classify(body: &[u8], err: &serde_json::Error) -> ProtocolViolation {
    let declared = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
    match declared {
        Some(kind) if !KNOWN_EVENT_TYPES.contains(&kind.as_str()) => {
            ProtocolViolation::Unrecognized(kind)
        }
        _ => ProtocolViolation::Malformed(err.to_string()),
    }
}
