//! Appeal registry
//!
//! Per-user map of appeals in flight. An appeal is created when the user
//! approves a report and removed exactly once, when it reaches a terminal
//! status; the caller owns cleanup of attachments tied to it.

use crate::ids::{AppealId, UserId, WorkerHandle};
use crate::state_machine::session::{Coordinates, SenderProfile, ViolationDraft};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Queued,
    AwaitingCaptcha,
    AwaitingWorkerResponse,
    Sent,
    Cancelled,
    Failed,
}

impl AppealStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppealStatus::Sent | AppealStatus::Cancelled | AppealStatus::Failed
        )
    }
}

/// Authority a complaint is addressed to, one per administrative region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Minsk,
    MinskRegion,
    Brest,
    Vitebsk,
    Gomel,
    Grodno,
    Mogilev,
}

impl Region {
    pub const ALL: [Region; 7] = [
        Region::Minsk,
        Region::MinskRegion,
        Region::Brest,
        Region::Vitebsk,
        Region::Gomel,
        Region::Grodno,
        Region::Mogilev,
    ];

    /// Recipient name used on the wire and in callbacks
    pub fn slug(self) -> &'static str {
        match self {
            Region::Minsk => "minsk",
            Region::MinskRegion => "minsk_region",
            Region::Brest => "brest",
            Region::Vitebsk => "vitebsk",
            Region::Gomel => "gomel",
            Region::Grodno => "grodno",
            Region::Mogilev => "mogilev",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.slug() == slug)
    }

    pub fn label(self) -> &'static str {
        match self {
            Region::Minsk => "Minsk",
            Region::MinskRegion => "Minsk region",
            Region::Brest => "Brest region",
            Region::Vitebsk => "Vitebsk region",
            Region::Gomel => "Gomel region",
            Region::Grodno => "Grodno region",
            Region::Mogilev => "Mogilev region",
        }
    }
}

/// Sender block of the complaint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub first_name: String,
    pub last_name: String,
    pub patronymic: Option<String>,
    pub email: String,
    pub city: String,
    pub street: String,
    pub house: String,
    pub block: Option<String>,
    pub flat: Option<String>,
    pub zipcode: Option<String>,
}

/// Full complaint sent to a worker with `REQUEST_CAPTCHA`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppealPayload {
    pub user_id: UserId,
    pub appeal_id: AppealId,
    /// Composed complaint letter
    pub text: String,
    /// Administrative region the complaint is addressed to
    pub recipient: String,
    pub sender: SenderInfo,
    /// Mailbox the worker may log into; only set when its password is known
    pub contact_email: Option<String>,
    pub plate: String,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub violation_datetime: String,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo_urls: Vec<String>,
}

impl AppealPayload {
    /// Build the complaint from a registered profile and a finished draft.
    /// Returns `None` if either is incomplete.
    pub fn compose(
        user_id: UserId,
        appeal_id: AppealId,
        profile: &SenderProfile,
        draft: &ViolationDraft,
        default_region: &str,
    ) -> Option<Self> {
        let sender = SenderInfo {
            first_name: profile.first_name.clone()?,
            last_name: profile.last_name.clone()?,
            patronymic: profile.patronymic.clone(),
            email: profile.email.clone()?,
            city: profile.city.clone()?,
            street: profile.street.clone()?,
            house: profile.house.clone()?,
            block: profile.block.clone(),
            flat: profile.flat.clone(),
            zipcode: profile.zipcode.clone(),
        };
        let plate = draft.plate.clone()?;
        let address = draft.address.clone()?;
        let violation_datetime = draft.datetime.clone()?;

        let text = compose_letter(&plate, &address, &violation_datetime, draft.caption.as_deref());
        let contact_email = profile
            .email_password
            .as_ref()
            .map(|_| sender.email.clone());

        Some(Self {
            user_id,
            appeal_id,
            text,
            recipient: draft
                .region
                .clone()
                .unwrap_or_else(|| default_region.to_string()),
            sender,
            contact_email,
            plate,
            address,
            coordinates: draft.coordinates,
            violation_datetime,
            caption: draft.caption.clone(),
            photo_urls: Vec::new(),
        })
    }
}

fn compose_letter(plate: &str, address: &str, datetime: &str, caption: Option<&str>) -> String {
    let mut text = format!(
        "On {datetime} at {address} the vehicle with registration number {plate} \
         was parked in violation of the traffic rules. Photos are attached. \
         Please take action against the driver."
    );
    if let Some(caption) = caption {
        text.push_str("\n\n");
        text.push_str(caption);
    }
    text
}

/// One report in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appeal {
    pub id: AppealId,
    pub user_id: UserId,
    pub payload: AppealPayload,
    pub status: AppealStatus,
    /// Worker currently bound to the appeal
    #[serde(default)]
    pub response_queue: Option<WorkerHandle>,
    /// Photos are uploaded and `payload.photo_urls` is final
    #[serde(default)]
    pub attachments_ready: bool,
}

impl Appeal {
    pub fn new(payload: AppealPayload) -> Self {
        Self {
            id: payload.appeal_id,
            user_id: payload.user_id,
            payload,
            status: AppealStatus::Queued,
            response_queue: None,
            attachments_ready: false,
        }
    }
}

/// Appeals of one user keyed by appeal id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppealRegistry {
    appeals: BTreeMap<AppealId, Appeal>,
}

impl AppealRegistry {
    /// Returns false (and keeps the existing entry) if the id is taken
    pub fn insert(&mut self, appeal: Appeal) -> bool {
        if self.appeals.contains_key(&appeal.id) {
            return false;
        }
        self.appeals.insert(appeal.id, appeal);
        true
    }

    pub fn get(&self, id: AppealId) -> Option<&Appeal> {
        self.appeals.get(&id)
    }

    pub fn get_mut(&mut self, id: AppealId) -> Option<&mut Appeal> {
        self.appeals.get_mut(&id)
    }

    /// The appeal, if it is still in flight
    pub fn active(&self, id: AppealId) -> Option<&Appeal> {
        self.get(id).filter(|a| !a.status.is_terminal())
    }

    /// Record a terminal status and remove the appeal.
    ///
    /// Returns the removed appeal the first time and `None` afterwards, so
    /// callers run cleanup exactly once.
    pub fn finalize(&mut self, id: AppealId, status: AppealStatus) -> Option<Appeal> {
        debug_assert!(status.is_terminal(), "finalize with non-terminal status");
        let mut appeal = self.appeals.remove(&id)?;
        appeal.status = status;
        Some(appeal)
    }

    /// Remove every appeal, e.g. on session reset
    pub fn drain(&mut self) -> Vec<Appeal> {
        std::mem::take(&mut self.appeals).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.appeals.len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.appeals.is_empty()
    }

    #[allow(dead_code)] // Used in tests
    pub fn iter(&self) -> impl Iterator<Item = &Appeal> {
        self.appeals.values()
    }
}
