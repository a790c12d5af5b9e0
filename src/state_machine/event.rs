//! Events that can occur in a user session

use super::session::{Coordinates, ResolvedAddress};
use crate::ids::{AppealId, MessageId, WorkerHandle};
use crate::notice::UserAction;
use crate::protocol::wire::AppealEvent;
use chrono::{DateTime, Utc};

/// Slash commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Reset,
    Help,
    Feedback,
    /// `/ban <user id> <reason>`; arguments are checked by the transition
    Ban { args: String },
    /// `/unban <user id>`
    Unban { args: String },
    BanList,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (word, args) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        // Group chats append the bot name: /start@parkun_bot
        let name = word.split('@').next().unwrap_or(word);
        let args = args.trim().to_string();
        match name {
            "/start" => Some(Command::Start),
            "/reset" => Some(Command::Reset),
            "/help" => Some(Command::Help),
            "/feedback" => Some(Command::Feedback),
            "/ban" => Some(Command::Ban { args }),
            "/unban" => Some(Command::Unban { args }),
            "/banlist" => Some(Command::BanList),
            _ => None,
        }
    }
}

/// Query handed to the geocoder
#[derive(Debug, Clone, PartialEq)]
pub enum AddressQuery {
    Text(String),
    Location(Coordinates),
}

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    UserCommand(Command),
    UserText {
        text: String,
        message_id: MessageId,
    },
    UserPhoto {
        file_id: String,
        message_id: MessageId,
    },
    UserLocation {
        coordinates: Coordinates,
    },
    UserAction {
        action: UserAction,
        /// Message the action button belongs to
        message_id: MessageId,
        received_at: DateTime<Utc>,
    },

    // Worker events, routed here by the event-channel dispatcher
    Worker(AppealEvent),

    // Timer
    CaptchaTimeout {
        appeal_id: AppealId,
        /// Sequence number of the prompt the timer was armed for
        seq: u64,
    },

    // Effect results
    CaptchaRequested {
        appeal_id: AppealId,
        worker: WorkerHandle,
    },
    NoWorkerAvailable {
        appeal_id: AppealId,
    },
    CommandFailed {
        appeal_id: AppealId,
        /// Worker left bound to the appeal, if any
        worker: Option<WorkerHandle>,
        reason: String,
    },
    PhotosPrepared {
        appeal_id: AppealId,
        result: Result<Vec<String>, String>,
    },
    AddressResolved {
        query: AddressQuery,
        resolved: Option<ResolvedAddress>,
    },
    VerificationCodeSent {
        code: Option<String>,
    },
    EmailPasswordChecked {
        password: String,
        valid: bool,
    },
}

impl Event {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Event::UserCommand(_) => "user_command",
            Event::UserText { .. } => "user_text",
            Event::UserPhoto { .. } => "user_photo",
            Event::UserLocation { .. } => "user_location",
            Event::UserAction { .. } => "user_action",
            Event::Worker(_) => "worker",
            Event::CaptchaTimeout { .. } => "captcha_timeout",
            Event::CaptchaRequested { .. } => "captcha_requested",
            Event::NoWorkerAvailable { .. } => "no_worker_available",
            Event::CommandFailed { .. } => "command_failed",
            Event::PhotosPrepared { .. } => "photos_prepared",
            Event::AddressResolved { .. } => "address_resolved",
            Event::VerificationCodeSent { .. } => "verification_code_sent",
            Event::EmailPasswordChecked { .. } => "email_password_checked",
        }
    }

    /// Typed or tapped by the user, as opposed to generated internally
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Event::UserCommand(_)
                | Event::UserText { .. }
                | Event::UserPhoto { .. }
                | Event::UserLocation { .. }
                | Event::UserAction { .. }
        )
    }
}
