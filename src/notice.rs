//! User-visible output
//!
//! A `Notice` is what the bot tells a user; `UserAction`s are the inline
//! buttons attached to it. Actions travel through the chat transport as
//! compact callback strings.

use crate::appeal::Region;
use crate::ids::{AppealId, MessageId, UserId};
use crate::runtime::BannedUser;
use crate::state_machine::state::{PersonalField, ViolationField};
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    EnterPersonalInfo,
    Skip,
    EditEmail,
    VerifyEmail,
    EnterEmailPassword,
    DeleteEmailPassword,
    EnterViolationInfo,
    UsePreviousAddress,
    CurrentTime,
    AddCaption,
    EnterRecipient,
    ChooseRecipient { region: Region },
    ApproveSending,
    Cancel,
    CancelCaptcha { appeal_id: AppealId },
    RetrySending { appeal_id: AppealId },
    AnswerFeedback { user_id: UserId, message_id: MessageId },
}

impl UserAction {
    pub fn to_callback(self) -> String {
        match self {
            UserAction::EnterPersonalInfo => "/enter_personal_info".to_string(),
            UserAction::Skip => "/skip".to_string(),
            UserAction::EditEmail => "/edit_email".to_string(),
            UserAction::VerifyEmail => "/verify_email".to_string(),
            UserAction::EnterEmailPassword => "/enter_password".to_string(),
            UserAction::DeleteEmailPassword => "/delete_password".to_string(),
            UserAction::EnterViolationInfo => "/enter_violation_info".to_string(),
            UserAction::UsePreviousAddress => "/previous_address".to_string(),
            UserAction::CurrentTime => "/current_time".to_string(),
            UserAction::AddCaption => "/add_caption".to_string(),
            UserAction::EnterRecipient => "/enter_recipient".to_string(),
            UserAction::ChooseRecipient { region } => format!("/recipient:{}", region.slug()),
            UserAction::ApproveSending => "/approve_sending".to_string(),
            UserAction::Cancel => "/cancel".to_string(),
            UserAction::CancelCaptcha { appeal_id } => format!("/cancel_captcha:{appeal_id}"),
            UserAction::RetrySending { appeal_id } => format!("/retry:{appeal_id}"),
            UserAction::AnswerFeedback {
                user_id,
                message_id,
            } => format!("/answer_feedback:{user_id}:{message_id}"),
        }
    }

    /// Parse a callback string; unknown or malformed data yields `None`
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.trim().split(':');
        let name = parts.next()?;
        if name == "/recipient" {
            let region = Region::from_slug(parts.next()?)?;
            return parts
                .next()
                .is_none()
                .then_some(UserAction::ChooseRecipient { region });
        }
        let mut arg = || parts.next().and_then(|p| p.parse::<i64>().ok());

        let action = match name {
            "/enter_personal_info" => UserAction::EnterPersonalInfo,
            "/skip" => UserAction::Skip,
            "/edit_email" => UserAction::EditEmail,
            "/verify_email" => UserAction::VerifyEmail,
            "/enter_password" => UserAction::EnterEmailPassword,
            "/delete_password" => UserAction::DeleteEmailPassword,
            "/enter_violation_info" => UserAction::EnterViolationInfo,
            "/previous_address" => UserAction::UsePreviousAddress,
            "/current_time" => UserAction::CurrentTime,
            "/add_caption" => UserAction::AddCaption,
            "/enter_recipient" => UserAction::EnterRecipient,
            "/approve_sending" => UserAction::ApproveSending,
            "/cancel" => UserAction::Cancel,
            "/cancel_captcha" => UserAction::CancelCaptcha { appeal_id: arg()? },
            "/retry" => UserAction::RetrySending { appeal_id: arg()? },
            "/answer_feedback" => UserAction::AnswerFeedback {
                user_id: arg()?,
                message_id: arg()?,
            },
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(action)
    }

    pub fn label(self) -> &'static str {
        match self {
            UserAction::EnterPersonalInfo => "Enter personal info",
            UserAction::Skip => "Skip",
            UserAction::EditEmail => "Change email",
            UserAction::VerifyEmail => "Verify email",
            UserAction::EnterEmailPassword => "Enter email password",
            UserAction::DeleteEmailPassword => "Delete email password",
            UserAction::EnterViolationInfo => "Enter violation info",
            UserAction::UsePreviousAddress => "Previous address",
            UserAction::CurrentTime => "Now",
            UserAction::AddCaption => "Add caption",
            UserAction::EnterRecipient => "Choose recipient",
            UserAction::ChooseRecipient { region } => region.label(),
            UserAction::ApproveSending => "Send",
            UserAction::Cancel | UserAction::CancelCaptcha { .. } => "Cancel",
            UserAction::RetrySending { .. } => "Try again",
            UserAction::AnswerFeedback { .. } => "Answer",
        }
    }
}

/// Everything the bot can say
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Welcome { registered: bool },
    Help,
    Irrelevant,
    InvalidInput(ValidationError),
    AskPersonalField(PersonalField),
    AskEmail,
    RegistrationComplete,
    EmailSaved,
    VerificationCodeSent { email: String },
    VerificationUnavailable,
    EmailVerified,
    WrongVerificationCode,
    AskEmailPassword,
    EmailPasswordSaved,
    EmailPasswordInvalid,
    EmailPasswordDeleted,
    Operational {
        email_verified: bool,
        has_password: bool,
    },
    PhotoAdded { count: usize },
    TooManyPhotos { max: usize },
    AskViolationField {
        field: ViolationField,
        has_previous_address: bool,
    },
    AddressNotFound,
    RecipientChosen { region: Region },
    ApprovalSummary { summary: String },
    ProfileIncomplete,
    EmailNotVerified,
    ViolationDiscarded,
    AppealQueued { appeal_id: AppealId },
    CaptchaPrompt { appeal_id: AppealId, url: String },
    CaptchaAnswerSent,
    AppealSent { appeal_id: AppealId },
    /// Caption of the letter sent back as a document
    LetterCopy { appeal_id: AppealId },
    AppealCancelled { appeal_id: AppealId },
    TimesUp { appeal_id: AppealId },
    NoWorkerAvailable { appeal_id: AppealId },
    SendingFailed { appeal_id: AppealId },
    AskFeedback,
    FeedbackSent,
    /// Sent to the admin chat
    FeedbackReceived {
        user_id: UserId,
        message_id: MessageId,
        text: String,
    },
    AskFeedbackAnswer,
    FeedbackAnswerSent,
    /// Sent to the user whose feedback was answered
    FeedbackAnswer { text: String },
    SessionReset,
    /// Photo refused because the user is on the ban list
    Banned { reason: String },
    UserBanned { user_id: UserId },
    UserUnbanned { user_id: UserId },
    NotBanned { user_id: UserId },
    BanList { entries: Vec<BannedUser> },
    BanListUnavailable,
}

impl Notice {
    #[allow(clippy::too_many_lines)]
    pub fn render(&self) -> String {
        match self {
            Notice::Welcome { registered: true } => {
                "Welcome back. Send a photo of a violation to start a new report.".to_string()
            }
            Notice::Welcome { registered: false } => "Hi! I file complaints about parking \
                violations. First I need your details for the sender block of the letter."
                .to_string(),
            Notice::Help => "Send photos of a violation, then enter the registration number, \
                the address and the time. I will file the complaint for you.\n\
                /reset starts over, /feedback writes to the developers."
                .to_string(),
            Notice::Irrelevant => "That does not fit here. Use the buttons above.".to_string(),
            Notice::InvalidInput(err) => {
                let mut text = err.to_string();
                if let Some(first) = text.get(..1) {
                    let upper = first.to_uppercase();
                    text.replace_range(..1, &upper);
                }
                text.push_str(". Please try again.");
                text
            }
            Notice::AskPersonalField(field) => format!("Enter your {}.", field.label()),
            Notice::AskEmail => "Enter your email. Replies from the authorities arrive there."
                .to_string(),
            Notice::RegistrationComplete => {
                "Your details are saved. Verify your email before sending reports.".to_string()
            }
            Notice::EmailSaved => "Email saved. Please verify it.".to_string(),
            Notice::VerificationCodeSent { email } => {
                format!("A code was sent to {email}. Enter it here.")
            }
            Notice::VerificationUnavailable => {
                "Could not send a verification code right now. Try again later.".to_string()
            }
            Notice::EmailVerified => "Email verified.".to_string(),
            Notice::WrongVerificationCode => "The code does not match.".to_string(),
            Notice::AskEmailPassword => "Enter the password of your mailbox. It lets the \
                portal confirm the complaint automatically."
                .to_string(),
            Notice::EmailPasswordSaved => "Password saved.".to_string(),
            Notice::EmailPasswordInvalid => {
                "That password does not open the mailbox. Try again.".to_string()
            }
            Notice::EmailPasswordDeleted => "The email password was deleted.".to_string(),
            Notice::Operational { email_verified, .. } => {
                let mut text = "Send a photo of a violation to start a report.".to_string();
                if !*email_verified {
                    text.push_str(" Your email is not verified yet.");
                }
                text
            }
            Notice::PhotoAdded { count } => format!("Photo {count} added."),
            Notice::TooManyPhotos { max } => format!("At most {max} photos per report."),
            Notice::AskViolationField { field, .. } => match field {
                ViolationField::Plate => "Enter the registration number.".to_string(),
                ViolationField::Address => {
                    "Enter the address of the violation or send a location.".to_string()
                }
                ViolationField::DateTime => {
                    "Enter the date and time, e.g. 31.12.2024 18:30.".to_string()
                }
                ViolationField::Caption => "Enter a caption for the report.".to_string(),
                ViolationField::Recipient => "Who should receive the report?".to_string(),
            },
            Notice::AddressNotFound => {
                "Could not find an address there. Type it instead.".to_string()
            }
            Notice::RecipientChosen { region } => {
                format!("The report will be addressed to {}.", region.label())
            }
            Notice::ApprovalSummary { summary } => format!("{summary}\n\nSend this report?"),
            Notice::ProfileIncomplete => {
                "Your personal details are incomplete, the report was discarded.".to_string()
            }
            Notice::EmailNotVerified => {
                "Verify your email before sending. The report was discarded.".to_string()
            }
            Notice::ViolationDiscarded => "Report discarded.".to_string(),
            Notice::AppealQueued { appeal_id } => {
                format!("Report #{appeal_id} is being prepared for sending.")
            }
            Notice::CaptchaPrompt { appeal_id, url } => {
                format!("Report #{appeal_id}: type the text from the picture\n{url}")
            }
            Notice::CaptchaAnswerSent => "Thanks, sending continues.".to_string(),
            Notice::AppealSent { appeal_id } => format!("Report #{appeal_id} was sent."),
            Notice::LetterCopy { appeal_id } => format!("Copy of report #{appeal_id}"),
            Notice::AppealCancelled { appeal_id } => {
                format!("Sending of report #{appeal_id} was cancelled.")
            }
            Notice::TimesUp { appeal_id } => {
                format!("Time is up, sending of report #{appeal_id} was cancelled.")
            }
            Notice::NoWorkerAvailable { appeal_id } => {
                format!("All senders are busy. Report #{appeal_id} is waiting, try again soon.")
            }
            Notice::SendingFailed { appeal_id } => {
                format!("Report #{appeal_id} could not be sent.")
            }
            Notice::AskFeedback => "Write your message to the developers.".to_string(),
            Notice::FeedbackSent => "Thank you, your message was delivered.".to_string(),
            Notice::FeedbackReceived {
                user_id,
                message_id,
                text,
            } => format!("Feedback from {user_id} (message {message_id}):\n{text}"),
            Notice::AskFeedbackAnswer => "Write the answer.".to_string(),
            Notice::FeedbackAnswerSent => "Answer sent.".to_string(),
            Notice::FeedbackAnswer { text } => format!("Answer from the developers:\n{text}"),
            Notice::SessionReset => "Everything was reset.".to_string(),
            Notice::Banned { reason } => {
                format!("You can no longer send reports. Reason: {reason}")
            }
            Notice::UserBanned { user_id } => format!("User {user_id} is banned."),
            Notice::UserUnbanned { user_id } => format!("User {user_id} is unbanned."),
            Notice::NotBanned { user_id } => format!("User {user_id} is not banned."),
            Notice::BanList { entries } if entries.is_empty() => "Nobody is banned.".to_string(),
            Notice::BanList { entries } => entries
                .iter()
                .map(|e| format!("{}: {}", e.user_id, e.reason))
                .collect::<Vec<_>>()
                .join("\n"),
            Notice::BanListUnavailable => "The ban list is unavailable right now.".to_string(),
        }
    }

    /// Inline actions offered with the notice
    pub fn actions(&self) -> Vec<UserAction> {
        match self {
            Notice::Welcome { registered: false } => vec![UserAction::EnterPersonalInfo],
            Notice::AskPersonalField(field) if field.is_optional() => {
                vec![UserAction::Skip, UserAction::Cancel]
            }
            Notice::AskPersonalField(_)
            | Notice::AskEmail
            | Notice::AskEmailPassword
            | Notice::EmailPasswordInvalid
            | Notice::VerificationCodeSent { .. }
            | Notice::AskFeedback
            | Notice::AskFeedbackAnswer => vec![UserAction::Cancel],
            Notice::RegistrationComplete | Notice::EmailSaved | Notice::EmailNotVerified => {
                vec![UserAction::VerifyEmail]
            }
            Notice::Operational {
                email_verified,
                has_password,
            } => {
                let mut actions = vec![UserAction::EnterPersonalInfo, UserAction::EditEmail];
                if !*email_verified {
                    actions.push(UserAction::VerifyEmail);
                }
                actions.push(UserAction::EnterEmailPassword);
                if *has_password {
                    actions.push(UserAction::DeleteEmailPassword);
                }
                actions
            }
            Notice::PhotoAdded { .. } | Notice::TooManyPhotos { .. } => {
                vec![UserAction::EnterViolationInfo, UserAction::Cancel]
            }
            Notice::AskViolationField {
                field,
                has_previous_address,
            } => match field {
                ViolationField::Address if *has_previous_address => vec![
                    UserAction::UsePreviousAddress,
                    UserAction::AddCaption,
                    UserAction::Cancel,
                ],
                ViolationField::DateTime => vec![
                    UserAction::CurrentTime,
                    UserAction::EnterRecipient,
                    UserAction::AddCaption,
                    UserAction::Cancel,
                ],
                ViolationField::Recipient => Region::ALL
                    .into_iter()
                    .map(|region| UserAction::ChooseRecipient { region })
                    .chain([UserAction::Cancel])
                    .collect(),
                ViolationField::Caption => vec![UserAction::Cancel],
                ViolationField::Plate | ViolationField::Address => {
                    vec![UserAction::AddCaption, UserAction::Cancel]
                }
            },
            Notice::ApprovalSummary { .. } => vec![
                UserAction::ApproveSending,
                UserAction::AddCaption,
                UserAction::Cancel,
            ],
            Notice::CaptchaPrompt { appeal_id, .. } => vec![UserAction::CancelCaptcha {
                appeal_id: *appeal_id,
            }],
            Notice::NoWorkerAvailable { appeal_id } => vec![UserAction::RetrySending {
                appeal_id: *appeal_id,
            }],
            Notice::FeedbackReceived {
                user_id,
                message_id,
                ..
            } => vec![UserAction::AnswerFeedback {
                user_id: *user_id,
                message_id: *message_id,
            }],
            _ => Vec::new(),
        }
    }
}
