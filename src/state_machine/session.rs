//! Per-user session record
//!
//! Every field has a construction-time default and deserializes to it when
//! missing from a stored record, so call sites never check for existence.

use super::stack::{BoundedStack, StackOverflow, DEFAULT_MAX_DEPTH};
use super::state::ConvState;
use crate::appeal::AppealRegistry;
use crate::ids::{AppealId, MessageId, UserId, WorkerHandle};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Geocoder output: a normalized address plus its administrative region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub address: String,
    pub region: Option<String>,
    pub coordinates: Option<Coordinates>,
}

/// One suspension: where to go back to and what it suspended into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptFrame {
    pub resume_to: ConvState,
    pub target: ConvState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaContext {
    pub url: String,
    pub appeal_id: AppealId,
    /// Distinguishes repeated prompts for the same appeal
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderProfile {
    pub first_name: Option<String>,
    pub patronymic: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub email_password: Option<String>,
    pub email_verified: bool,
    /// Code sent by the mail verifier, cleared once matched
    pub verification_code: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub house: Option<String>,
    pub block: Option<String>,
    pub flat: Option<String>,
    pub zipcode: Option<String>,
}

impl SenderProfile {
    /// All mandatory sender fields are filled
    pub fn is_complete(&self) -> bool {
        [
            &self.first_name,
            &self.last_name,
            &self.email,
            &self.city,
            &self.street,
            &self.house,
        ]
        .iter()
        .all(|f| f.is_some())
    }

    /// Replace the email; a new address is unverified and has no password
    pub fn set_email(&mut self, email: String) {
        if self.email.as_deref() != Some(email.as_str()) {
            self.email_password = None;
            self.email_verified = false;
            self.verification_code = None;
        }
        self.email = Some(email);
    }
}

/// The report being assembled before approval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationDraft {
    /// Chat file ids of the attached photos
    pub photos: Vec<String>,
    pub plate: Option<String>,
    pub address: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub region: Option<String>,
    pub datetime: Option<String>,
    pub caption: Option<String>,
}

impl ViolationDraft {
    pub fn set_address(&mut self, resolved: ResolvedAddress) {
        self.address = Some(resolved.address);
        self.region = resolved.region;
        self.coordinates = resolved.coordinates;
    }

    pub fn resolved_address(&self) -> Option<ResolvedAddress> {
        Some(ResolvedAddress {
            address: self.address.clone()?,
            region: self.region.clone(),
            coordinates: self.coordinates,
        })
    }
}

/// Message an admin is replying to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackTarget {
    pub user_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSession {
    pub user_id: UserId,
    pub state: ConvState,
    pub interrupts: BoundedStack<InterruptFrame>,
    pub captchas: BoundedStack<CaptchaContext>,
    pub appeals: AppealRegistry,
    pub profile: SenderProfile,
    pub draft: ViolationDraft,
    pub previous_address: Option<ResolvedAddress>,
    /// Worker that sent the most recent captcha
    pub pending_response_queue: Option<WorkerHandle>,
    pub feedback_target: Option<FeedbackTarget>,
    /// Last captcha sequence number handed out
    pub captcha_seq: u64,
}

impl UserSession {
    pub fn new(user_id: UserId, max_depth: usize) -> Self {
        Self {
            user_id,
            interrupts: BoundedStack::new(max_depth),
            captchas: BoundedStack::new(max_depth),
            ..Self::default()
        }
    }

    /// Apply the configured stack limit to a session loaded from storage
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.interrupts.set_max_depth(max_depth);
        self.captchas.set_max_depth(max_depth);
        self
    }

    /// Enter `target`, saving the current state on the interrupt stack.
    /// Re-entering the current state pushes nothing.
    pub fn suspend(&mut self, target: ConvState) -> Result<(), StackOverflow> {
        if self.state == target {
            return Ok(());
        }
        self.interrupts.push(InterruptFrame {
            resume_to: self.state.clone(),
            target: target.clone(),
        })?;
        self.state = target;
        Ok(())
    }

    /// Leave the current sub-dialogue. An empty stack resumes to
    /// `OperationalMode`.
    pub fn resume(&mut self) -> &ConvState {
        self.state = self
            .interrupts
            .pop()
            .map_or(ConvState::OperationalMode, |frame| frame.resume_to);
        &self.state
    }

    /// Open a captcha sub-dialogue for `appeal_id`, returning the sequence
    /// number its timeout must carry
    pub fn enter_captcha(&mut self, appeal_id: AppealId, url: String) -> Result<u64, StackOverflow> {
        let seq = self.captcha_seq + 1;
        self.captchas.push(CaptchaContext { url, appeal_id, seq })?;
        if let Err(err) = self.suspend(ConvState::EnteringCaptcha { appeal_id }) {
            self.captchas.pop();
            return Err(err);
        }
        self.captcha_seq = seq;
        Ok(seq)
    }

    /// Close the captcha sub-dialogue of `appeal_id` wherever it sits.
    ///
    /// If it is the current state the session resumes normally. If newer
    /// sub-dialogues were opened on top of it, its frame is spliced out and
    /// the frame above inherits its resume target. Returns whether the
    /// current state changed.
    pub fn leave_captcha(&mut self, appeal_id: AppealId) -> bool {
        let entered = ConvState::EnteringCaptcha { appeal_id };
        self.captchas.remove_where(|c| c.appeal_id == appeal_id);

        if self.state == entered {
            self.resume();
            return true;
        }

        if let Some((index, removed)) = self.interrupts.remove_where(|f| f.target == entered) {
            if let Some(above) = self.interrupts.get_mut(index) {
                if above.resume_to == removed.target {
                    above.resume_to = removed.resume_to;
                }
            }
        }
        false
    }

    /// Captcha context of the appeal, if its sub-dialogue is open
    pub fn captcha_for(&self, appeal_id: AppealId) -> Option<&CaptchaContext> {
        self.captchas.iter().rev().find(|c| c.appeal_id == appeal_id)
    }

    pub fn discard_draft(&mut self) {
        self.draft = ViolationDraft::default();
    }
}
