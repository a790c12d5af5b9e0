//! Effects produced by state transitions

use super::event::AddressQuery;
use super::session::FeedbackTarget;
use crate::ids::{AppealId, MessageId, UserId, WorkerHandle};
use crate::notice::Notice;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the session record back to the store
    PersistSession,

    /// Delete the session record
    ResetSession,

    /// Tell the user something
    Notify {
        notice: Notice,
        reply_to: Option<MessageId>,
    },

    /// Upload the draft's photos to durable storage under the appeal
    PreparePhotos {
        appeal_id: AppealId,
        file_ids: Vec<String>,
    },

    /// Allocate a worker and send it `REQUEST_CAPTCHA`
    RequestCaptcha { appeal_id: AppealId },

    SubmitCaptchaAnswer {
        appeal_id: AppealId,
        answer: String,
        worker: WorkerHandle,
    },

    /// Send `CANCEL` to the worker bound to the appeal
    CancelAppeal {
        appeal_id: AppealId,
        worker: WorkerHandle,
    },

    /// Arm the captcha cancellation timer
    ArmTimer { appeal_id: AppealId, seq: u64 },

    DisarmTimer { appeal_id: AppealId },

    /// Return the worker to the pool
    ReleaseWorker {
        appeal_id: AppealId,
        worker: WorkerHandle,
    },

    /// Forget the binding without returning the worker; it comes back on
    /// its next availability announcement
    UnbindWorker {
        appeal_id: AppealId,
        worker: WorkerHandle,
    },

    /// Delete stored photos of the appeal
    ClearAttachments { appeal_id: AppealId },

    ResolveAddress { query: AddressQuery },

    SendVerificationCode { email: String },

    CheckEmailPassword { email: String, password: String },

    /// Forward the user's feedback to the admin chat
    ForwardFeedback { text: String, message_id: MessageId },

    /// Deliver the admin's answer to the user who wrote the feedback
    ReplyToFeedback { target: FeedbackTarget, text: String },

    /// Send the user the letter of a sent appeal as a text document
    SendLetterCopy { appeal_id: AppealId, text: String },

    // Ban list, admin only
    Ban { user_id: UserId, reason: String },
    Unban { user_id: UserId },
    ShowBanList,
}

impl Effect {
    pub fn notify(notice: Notice) -> Self {
        Effect::Notify {
            notice,
            reply_to: None,
        }
    }

    pub fn notify_reply(notice: Notice, reply_to: MessageId) -> Self {
        Effect::Notify {
            notice,
            reply_to: Some(reply_to),
        }
    }
}
