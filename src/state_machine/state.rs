//! Conversation state types

use crate::ids::{AppealId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Form fields
// ============================================================================

/// Sender detail collected during registration, in prompt order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalField {
    FirstName,
    Patronymic,
    LastName,
    City,
    Street,
    House,
    Block,
    Flat,
    Zipcode,
}

impl PersonalField {
    pub const ALL: [PersonalField; 9] = [
        PersonalField::FirstName,
        PersonalField::Patronymic,
        PersonalField::LastName,
        PersonalField::City,
        PersonalField::Street,
        PersonalField::House,
        PersonalField::Block,
        PersonalField::Flat,
        PersonalField::Zipcode,
    ];

    /// Fields the user may leave empty with the Skip action
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            PersonalField::Patronymic
                | PersonalField::Block
                | PersonalField::Flat
                | PersonalField::Zipcode
        )
    }

    /// The field prompted after this one; `None` after the last field.
    /// Email entry sits between `LastName` and `City` and is handled by the
    /// transition function.
    pub fn next(self) -> Option<PersonalField> {
        let index = Self::ALL.iter().position(|f| *f == self)?;
        Self::ALL.get(index + 1).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            PersonalField::FirstName => "first name",
            PersonalField::Patronymic => "patronymic",
            PersonalField::LastName => "last name",
            PersonalField::City => "city",
            PersonalField::Street => "street",
            PersonalField::House => "house number",
            PersonalField::Block => "block",
            PersonalField::Flat => "flat",
            PersonalField::Zipcode => "zipcode",
        }
    }
}

/// Violation detail collected after the photos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationField {
    Plate,
    Address,
    DateTime,
    Caption,
    /// Manual choice of the authority the report goes to
    Recipient,
}

impl ViolationField {
    pub fn label(self) -> &'static str {
        match self {
            ViolationField::Plate => "registration number",
            ViolationField::Address => "address",
            ViolationField::DateTime => "date and time",
            ViolationField::Caption => "caption",
            ViolationField::Recipient => "recipient",
        }
    }
}

// ============================================================================
// Conversation State
// ============================================================================

/// Which sub-dialogue a user is currently in
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// First contact, not registered yet
    #[default]
    Initial,

    PersonalInfo { field: PersonalField },

    EmailEntry,

    /// Verification code sent, waiting for the user to type it
    EmailVerifying,

    EmailPasswordEntry,

    /// Idle and registered; a photo starts a new report
    OperationalMode,

    ViolationPhotoCollection,

    ViolationInfo { field: ViolationField },

    /// Draft complete, waiting for the user to approve sending
    SendingApprovement,

    /// A worker asked for a captcha answer for this appeal
    EnteringCaptcha { appeal_id: AppealId },

    FeedbackEntry,

    /// Admin is typing a reply to a user's feedback
    FeedbackAnswering,
}

impl ConvState {
    /// Entering one of these states suspends the current one on the
    /// interrupt stack
    pub fn suspends(&self) -> bool {
        matches!(
            self,
            ConvState::EnteringCaptcha { .. }
                | ConvState::EmailPasswordEntry
                | ConvState::FeedbackEntry
                | ConvState::FeedbackAnswering
                | ConvState::ViolationInfo {
                    field: ViolationField::Caption | ViolationField::Recipient
                }
        )
    }

    /// States that belong to building a violation draft
    pub fn is_drafting(&self) -> bool {
        matches!(
            self,
            ConvState::ViolationPhotoCollection
                | ConvState::ViolationInfo { .. }
                | ConvState::SendingApprovement
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Initial => "initial",
            ConvState::PersonalInfo { .. } => "personal_info",
            ConvState::EmailEntry => "email_entry",
            ConvState::EmailVerifying => "email_verifying",
            ConvState::EmailPasswordEntry => "email_password_entry",
            ConvState::OperationalMode => "operational_mode",
            ConvState::ViolationPhotoCollection => "violation_photo_collection",
            ConvState::ViolationInfo { .. } => "violation_info",
            ConvState::SendingApprovement => "sending_approvement",
            ConvState::EnteringCaptcha { .. } => "entering_captcha",
            ConvState::FeedbackEntry => "feedback_entry",
            ConvState::FeedbackAnswering => "feedback_answering",
        }
    }
}

impl fmt::Display for ConvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvState::PersonalInfo { field } => write!(f, "personal_info({field:?})"),
            ConvState::ViolationInfo { field } => write!(f, "violation_info({field:?})"),
            ConvState::EnteringCaptcha { appeal_id } => write!(f, "entering_captcha({appeal_id})"),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Per-user configuration the transition function reads (immutable)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub user_id: UserId,
    pub max_photos: usize,
    /// Offset applied when stamping the current time on a violation
    pub utc_offset_hours: i32,
    /// Recipient used when the geocoder yields no region
    pub default_region: String,
    pub admin_chat_id: Option<UserId>,
    /// Ban reason when the user is on the ban list; refreshed by the
    /// runtime before each photo
    pub ban_reason: Option<String>,
}

impl ConvContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            max_photos: 10,
            utc_offset_hours: 3,
            default_region: "minsk".to_string(),
            admin_chat_id: None,
            ban_reason: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin_chat_id == Some(self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personal_fields_advance_in_prompt_order() {
        let mut field = PersonalField::FirstName;
        let mut seen = vec![field];
        while let Some(next) = field.next() {
            seen.push(next);
            field = next;
        }
        assert_eq!(seen, PersonalField::ALL.to_vec());
    }

    #[test]
    fn test_suspending_targets() {
        assert!(ConvState::EnteringCaptcha { appeal_id: 7 }.suspends());
        assert!(ConvState::ViolationInfo {
            field: ViolationField::Caption
        }
        .suspends());
        assert!(!ConvState::ViolationInfo {
            field: ViolationField::Plate
        }
        .suspends());
        assert!(!ConvState::OperationalMode.suspends());
    }

    #[test]
    fn test_state_serializes_with_type_tag() {
        let json = serde_json::to_value(ConvState::EnteringCaptcha { appeal_id: 7 }).unwrap();
        assert_eq!(json["type"], "entering_captcha");
        assert_eq!(json["appeal_id"], 7);
    }
}
