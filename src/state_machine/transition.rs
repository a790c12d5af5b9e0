//! Pure state transition function
//!
//! Given a session, its context and one event, produce the next session and
//! the effects to execute. No I/O happens here; the runtime executes the
//! effects and feeds their results back as events.

use super::effect::Effect;
use super::event::{AddressQuery, Command, Event};
use super::session::{Coordinates, FeedbackTarget, ResolvedAddress, UserSession};
use super::stack::StackOverflow;
use super::state::{ConvContext, ConvState, PersonalField, ViolationField};
use crate::appeal::{Appeal, AppealPayload, AppealStatus, Region};
use crate::ids::{AppealId, MessageId, WorkerHandle};
use crate::notice::{Notice, UserAction};
use crate::protocol::wire::{AppealEvent, AppealEventKind};
use crate::validation::{self, ValidationError};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_session: UserSession,
    pub effects: Vec<Effect>,
}

/// Errors that can occur during transition. The session is left unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("input does not fit state {state}")]
    Irrelevant { state: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),
    #[error("stale event for appeal {appeal_id}")]
    StaleEvent { appeal_id: AppealId },
    #[error("interrupt depth exceeded: {0}")]
    InterruptDepthExceeded(#[from] StackOverflow),
}

type Effects = Result<Vec<Effect>, TransitionError>;

/// Pure transition function
pub fn transition(
    session: &UserSession,
    ctx: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let mut next = session.clone();

    let effects = match event {
        Event::UserCommand(command) => on_command(&mut next, ctx, command)?,
        Event::UserText { text, message_id } => on_text(&mut next, &text, message_id)?,
        Event::UserPhoto { file_id, .. } => on_photo(&mut next, ctx, file_id)?,
        Event::UserLocation { coordinates } => on_location(&next, coordinates)?,
        Event::UserAction {
            action,
            message_id,
            received_at,
        } => on_action(&mut next, ctx, action, message_id, received_at)?,
        Event::Worker(event) => on_worker_event(&mut next, event)?,
        Event::CaptchaTimeout { appeal_id, seq } => {
            abandon_captcha(&mut next, appeal_id, Some(seq))?
        }
        Event::CaptchaRequested { appeal_id, worker } => {
            on_captcha_requested(&mut next, appeal_id, worker)
        }
        Event::NoWorkerAvailable { appeal_id } => match next.appeals.get(appeal_id) {
            Some(appeal) if appeal.status == AppealStatus::Queued => {
                vec![Effect::notify(Notice::NoWorkerAvailable { appeal_id })]
            }
            _ => return Err(TransitionError::StaleEvent { appeal_id }),
        },
        Event::CommandFailed {
            appeal_id, worker, ..
        } => on_command_failed(&mut next, appeal_id, worker)?,
        Event::PhotosPrepared { appeal_id, result } => {
            on_photos_prepared(&mut next, appeal_id, result)?
        }
        Event::AddressResolved { query, resolved } => {
            on_address_resolved(&mut next, query, resolved)?
        }
        Event::VerificationCodeSent { code } => on_verification_code(&mut next, code),
        Event::EmailPasswordChecked { password, valid } => {
            on_password_checked(&mut next, password, valid)?
        }
    };

    Ok(TransitionResult {
        new_session: next,
        effects,
    })
}

fn irrelevant(session: &UserSession) -> TransitionError {
    TransitionError::Irrelevant {
        state: session.state.name(),
    }
}

/// Where a user lands when a dialogue ends outside the interrupt stack
fn home(session: &UserSession) -> ConvState {
    if session.profile.is_complete() {
        ConvState::OperationalMode
    } else {
        ConvState::Initial
    }
}

/// The prompt that asks for whatever the current state expects
pub fn prompt_for(session: &UserSession) -> Notice {
    match &session.state {
        ConvState::Initial => Notice::Welcome { registered: false },
        ConvState::PersonalInfo { field } => Notice::AskPersonalField(*field),
        ConvState::EmailEntry => Notice::AskEmail,
        ConvState::EmailVerifying => Notice::VerificationCodeSent {
            email: session.profile.email.clone().unwrap_or_default(),
        },
        ConvState::EmailPasswordEntry => Notice::AskEmailPassword,
        ConvState::OperationalMode => Notice::Operational {
            email_verified: session.profile.email_verified,
            has_password: session.profile.email_password.is_some(),
        },
        ConvState::ViolationPhotoCollection => Notice::PhotoAdded {
            count: session.draft.photos.len(),
        },
        ConvState::ViolationInfo { field } => Notice::AskViolationField {
            field: *field,
            has_previous_address: session.previous_address.is_some(),
        },
        ConvState::SendingApprovement => Notice::ApprovalSummary {
            summary: draft_summary(session),
        },
        ConvState::EnteringCaptcha { appeal_id } => match session.captcha_for(*appeal_id) {
            Some(captcha) => Notice::CaptchaPrompt {
                appeal_id: *appeal_id,
                url: captcha.url.clone(),
            },
            None => Notice::Irrelevant,
        },
        ConvState::FeedbackEntry => Notice::AskFeedback,
        ConvState::FeedbackAnswering => Notice::AskFeedbackAnswer,
    }
}

fn draft_summary(session: &UserSession) -> String {
    let draft = &session.draft;
    let mut lines = vec![
        format!(
            "Registration number: {}",
            draft.plate.as_deref().unwrap_or("-")
        ),
        format!("Address: {}", draft.address.as_deref().unwrap_or("-")),
        format!("Time: {}", draft.datetime.as_deref().unwrap_or("-")),
        format!("Photos: {}", draft.photos.len()),
    ];
    if let Some(region) = &draft.region {
        let recipient = match Region::from_slug(region) {
            Some(known) => known.label(),
            None => region.as_str(),
        };
        lines.push(format!("Recipient: {recipient}"));
    }
    if let Some(caption) = &draft.caption {
        lines.push(format!("Caption: {caption}"));
    }
    lines.join("\n")
}

/// Persist and re-prompt for the (new) current state
fn persist_and_prompt(session: &UserSession) -> Vec<Effect> {
    vec![Effect::PersistSession, Effect::notify(prompt_for(session))]
}

// ============================================================================
// Commands
// ============================================================================

fn on_command(next: &mut UserSession, ctx: &ConvContext, command: Command) -> Effects {
    match command {
        Command::Start => {
            let registered = next.profile.is_complete();
            let mut effects = vec![Effect::notify(Notice::Welcome { registered })];
            if matches!(next.state, ConvState::Initial | ConvState::OperationalMode) {
                next.state = home(next);
            } else {
                effects.push(Effect::notify(prompt_for(next)));
            }
            effects.insert(0, Effect::PersistSession);
            Ok(effects)
        }
        Command::Help => Ok(vec![Effect::notify(Notice::Help)]),
        Command::Feedback => {
            next.suspend(ConvState::FeedbackEntry)?;
            Ok(persist_and_prompt(next))
        }
        Command::Reset => Ok(reset(next)),
        Command::Ban { .. } | Command::Unban { .. } | Command::BanList if !ctx.is_admin() => {
            Err(irrelevant(next))
        }
        Command::Ban { args } => {
            let (user_id, reason) = validation::ban_args(&args)?;
            Ok(vec![Effect::Ban { user_id, reason }])
        }
        Command::Unban { args } => Ok(vec![Effect::Unban {
            user_id: validation::user_id(&args)?,
        }]),
        Command::BanList => Ok(vec![Effect::ShowBanList]),
    }
}

/// Abandon every appeal in flight and start over
fn reset(next: &mut UserSession) -> Vec<Effect> {
    let mut effects = Vec::new();
    for appeal in next.appeals.drain() {
        let appeal_id = appeal.id;
        effects.push(Effect::DisarmTimer { appeal_id });
        if let Some(worker) = appeal.response_queue {
            effects.push(Effect::CancelAppeal {
                appeal_id,
                worker: worker.clone(),
            });
            effects.push(Effect::UnbindWorker { appeal_id, worker });
        }
        effects.push(Effect::ClearAttachments { appeal_id });
    }

    *next = UserSession::new(next.user_id, next.interrupts.max_depth());
    effects.push(Effect::ResetSession);
    effects.push(Effect::notify(Notice::SessionReset));
    effects.push(Effect::notify(prompt_for(next)));
    effects
}

// ============================================================================
// Text input
// ============================================================================

fn on_text(next: &mut UserSession, text: &str, message_id: MessageId) -> Effects {
    match next.state.clone() {
        ConvState::PersonalInfo { field } => {
            let value = validation::personal_field(field, text)?;
            set_personal(next, field, Some(value));
            Ok(advance_registration(next, field))
        }
        ConvState::EmailEntry => {
            let email = validation::email(text)?;
            next.profile.set_email(email);
            if next.profile.city.is_none() {
                next.state = ConvState::PersonalInfo {
                    field: PersonalField::City,
                };
                return Ok(persist_and_prompt(next));
            }
            next.state = ConvState::OperationalMode;
            if next.profile.email_verified {
                Ok(persist_and_prompt(next))
            } else {
                Ok(vec![
                    Effect::PersistSession,
                    Effect::notify(Notice::EmailSaved),
                ])
            }
        }
        ConvState::EmailVerifying => {
            let matched = next.profile.verification_code.as_deref() == Some(text.trim());
            next.profile.verification_code = None;
            next.state = ConvState::OperationalMode;
            let outcome = if matched {
                next.profile.email_verified = true;
                Notice::EmailVerified
            } else {
                Notice::WrongVerificationCode
            };
            Ok(vec![
                Effect::PersistSession,
                Effect::notify(outcome),
                Effect::notify(prompt_for(next)),
            ])
        }
        ConvState::EmailPasswordEntry => match next.profile.email.clone() {
            Some(email) => Ok(vec![Effect::CheckEmailPassword {
                email,
                password: text.trim().to_string(),
            }]),
            None => {
                next.resume();
                Ok(persist_and_prompt(next))
            }
        },
        ConvState::ViolationInfo { field } => on_violation_text(next, field, text),
        ConvState::EnteringCaptcha { appeal_id } => submit_captcha_answer(next, appeal_id, text),
        ConvState::FeedbackEntry => {
            next.resume();
            let mut effects = vec![
                Effect::ForwardFeedback {
                    text: text.to_string(),
                    message_id,
                },
                Effect::notify(Notice::FeedbackSent),
            ];
            effects.extend(persist_and_prompt(next));
            Ok(effects)
        }
        ConvState::FeedbackAnswering => {
            let target = next.feedback_target.take();
            next.resume();
            let mut effects = Vec::new();
            if let Some(target) = target {
                effects.push(Effect::ReplyToFeedback {
                    target,
                    text: text.to_string(),
                });
                effects.push(Effect::notify(Notice::FeedbackAnswerSent));
            }
            effects.extend(persist_and_prompt(next));
            Ok(effects)
        }
        ConvState::Initial
        | ConvState::OperationalMode
        | ConvState::ViolationPhotoCollection
        | ConvState::SendingApprovement => Err(irrelevant(next)),
    }
}

fn set_personal(next: &mut UserSession, field: PersonalField, value: Option<String>) {
    let profile = &mut next.profile;
    let slot = match field {
        PersonalField::FirstName => &mut profile.first_name,
        PersonalField::Patronymic => &mut profile.patronymic,
        PersonalField::LastName => &mut profile.last_name,
        PersonalField::City => &mut profile.city,
        PersonalField::Street => &mut profile.street,
        PersonalField::House => &mut profile.house,
        PersonalField::Block => &mut profile.block,
        PersonalField::Flat => &mut profile.flat,
        PersonalField::Zipcode => &mut profile.zipcode,
    };
    *slot = value;
}

fn advance_registration(next: &mut UserSession, answered: PersonalField) -> Vec<Effect> {
    if answered == PersonalField::LastName {
        next.state = ConvState::EmailEntry;
        return persist_and_prompt(next);
    }
    match answered.next() {
        Some(field) => {
            next.state = ConvState::PersonalInfo { field };
            persist_and_prompt(next)
        }
        None => {
            next.state = home(next);
            if next.profile.email_verified {
                persist_and_prompt(next)
            } else {
                vec![
                    Effect::PersistSession,
                    Effect::notify(Notice::RegistrationComplete),
                ]
            }
        }
    }
}

fn on_violation_text(next: &mut UserSession, field: ViolationField, text: &str) -> Effects {
    match field {
        ViolationField::Plate => {
            next.draft.plate = Some(validation::plate(text)?);
            next.state = ConvState::ViolationInfo {
                field: ViolationField::Address,
            };
        }
        ViolationField::Address => {
            let query = text.trim();
            if query.is_empty() {
                return Err(ValidationError::Empty { field: "address" }.into());
            }
            return Ok(vec![Effect::ResolveAddress {
                query: AddressQuery::Text(query.to_string()),
            }]);
        }
        ViolationField::DateTime => {
            next.draft.datetime = Some(validation::violation_datetime(text)?);
            next.state = ConvState::SendingApprovement;
        }
        ViolationField::Caption => {
            let caption = text.trim();
            if caption.is_empty() {
                return Err(ValidationError::Empty { field: "caption" }.into());
            }
            next.draft.caption = Some(caption.to_string());
            next.resume();
        }
        // Chosen with the buttons only
        ViolationField::Recipient => return Err(irrelevant(next)),
    }
    Ok(persist_and_prompt(next))
}

fn submit_captcha_answer(next: &mut UserSession, appeal_id: AppealId, text: &str) -> Effects {
    let answer = text.trim();
    if answer.is_empty() {
        return Err(ValidationError::Empty {
            field: "captcha answer",
        }
        .into());
    }

    let worker = match next.appeals.get_mut(appeal_id) {
        Some(appeal) if appeal.status == AppealStatus::AwaitingCaptcha => {
            appeal.status = AppealStatus::AwaitingWorkerResponse;
            appeal.response_queue.clone()
        }
        _ => None,
    };
    next.leave_captcha(appeal_id);

    let mut effects = Vec::new();
    if let Some(worker) = worker {
        effects.push(Effect::SubmitCaptchaAnswer {
            appeal_id,
            answer: answer.to_string(),
            worker,
        });
        effects.push(Effect::notify(Notice::CaptchaAnswerSent));
    }
    effects.push(Effect::DisarmTimer { appeal_id });
    effects.extend(persist_and_prompt(next));
    Ok(effects)
}

// ============================================================================
// Photos and locations
// ============================================================================

fn on_photo(next: &mut UserSession, ctx: &ConvContext, file_id: String) -> Effects {
    match next.state {
        ConvState::OperationalMode | ConvState::ViolationPhotoCollection => {
            if let Some(reason) = &ctx.ban_reason {
                return Ok(vec![Effect::notify(Notice::Banned {
                    reason: reason.clone(),
                })]);
            }
            if next.state == ConvState::OperationalMode {
                next.discard_draft();
            }
            if next.draft.photos.len() >= ctx.max_photos {
                return Ok(vec![Effect::notify(Notice::TooManyPhotos {
                    max: ctx.max_photos,
                })]);
            }
            next.draft.photos.push(file_id);
            next.state = ConvState::ViolationPhotoCollection;
            Ok(vec![
                Effect::PersistSession,
                Effect::notify(Notice::PhotoAdded {
                    count: next.draft.photos.len(),
                }),
            ])
        }
        _ => Err(irrelevant(next)),
    }
}

fn on_location(next: &UserSession, coordinates: Coordinates) -> Effects {
    match next.state {
        ConvState::ViolationInfo {
            field: ViolationField::Address,
        } => Ok(vec![Effect::ResolveAddress {
            query: AddressQuery::Location(coordinates),
        }]),
        _ => Err(irrelevant(next)),
    }
}

// ============================================================================
// Inline actions
// ============================================================================

#[allow(clippy::too_many_lines)]
fn on_action(
    next: &mut UserSession,
    ctx: &ConvContext,
    action: UserAction,
    message_id: MessageId,
    received_at: DateTime<Utc>,
) -> Effects {
    match (next.state.clone(), action) {
        (ConvState::Initial | ConvState::OperationalMode, UserAction::EnterPersonalInfo) => {
            next.state = ConvState::PersonalInfo {
                field: PersonalField::FirstName,
            };
            Ok(persist_and_prompt(next))
        }
        (ConvState::PersonalInfo { field }, UserAction::Skip) if field.is_optional() => {
            set_personal(next, field, None);
            Ok(advance_registration(next, field))
        }
        (ConvState::OperationalMode, UserAction::EditEmail) => {
            next.state = ConvState::EmailEntry;
            Ok(persist_and_prompt(next))
        }
        (ConvState::OperationalMode, UserAction::VerifyEmail) => {
            match (&next.profile.email, next.profile.email_verified) {
                (Some(email), false) => Ok(vec![Effect::SendVerificationCode {
                    email: email.clone(),
                }]),
                _ => Err(irrelevant(next)),
            }
        }
        (state, UserAction::EnterEmailPassword)
            if next.profile.email.is_some()
                && !matches!(state, ConvState::EnteringCaptcha { .. }) =>
        {
            next.suspend(ConvState::EmailPasswordEntry)?;
            Ok(persist_and_prompt(next))
        }
        (state, UserAction::DeleteEmailPassword)
            if next.profile.email_password.is_some()
                && !matches!(state, ConvState::EnteringCaptcha { .. }) =>
        {
            next.profile.email_password = None;
            Ok(vec![
                Effect::PersistSession,
                Effect::notify(Notice::EmailPasswordDeleted),
            ])
        }
        (ConvState::ViolationPhotoCollection, UserAction::EnterViolationInfo)
            if !next.draft.photos.is_empty() =>
        {
            next.state = ConvState::ViolationInfo {
                field: ViolationField::Plate,
            };
            Ok(persist_and_prompt(next))
        }
        (
            ConvState::ViolationInfo {
                field: ViolationField::Address,
            },
            UserAction::UsePreviousAddress,
        ) => {
            let Some(previous) = next.previous_address.clone() else {
                return Err(irrelevant(next));
            };
            next.draft.set_address(previous);
            next.state = ConvState::ViolationInfo {
                field: ViolationField::DateTime,
            };
            Ok(persist_and_prompt(next))
        }
        (
            ConvState::ViolationInfo {
                field: ViolationField::DateTime,
            },
            UserAction::CurrentTime,
        ) => {
            next.draft.datetime = Some(validation::format_local_time(
                received_at,
                ctx.utc_offset_hours,
            ));
            next.state = ConvState::SendingApprovement;
            Ok(persist_and_prompt(next))
        }
        (
            ConvState::ViolationInfo {
                field: ViolationField::DateTime,
            },
            UserAction::EnterRecipient,
        ) => {
            next.suspend(ConvState::ViolationInfo {
                field: ViolationField::Recipient,
            })?;
            Ok(persist_and_prompt(next))
        }
        (
            ConvState::ViolationInfo {
                field: ViolationField::Recipient,
            },
            UserAction::ChooseRecipient { region },
        ) => {
            next.draft.region = Some(region.slug().to_string());
            next.resume();
            let mut effects = vec![Effect::notify(Notice::RecipientChosen { region })];
            effects.extend(persist_and_prompt(next));
            Ok(effects)
        }
        (state, UserAction::AddCaption) if state.is_drafting() && !state.suspends() => {
            next.suspend(ConvState::ViolationInfo {
                field: ViolationField::Caption,
            })?;
            Ok(persist_and_prompt(next))
        }
        (ConvState::SendingApprovement, UserAction::ApproveSending) => {
            approve(next, ctx, message_id)
        }
        (_, UserAction::Cancel) => cancel_current(next),
        (_, UserAction::CancelCaptcha { appeal_id }) => abandon_captcha(next, appeal_id, None),
        (_, UserAction::RetrySending { appeal_id }) => match next.appeals.get(appeal_id) {
            Some(appeal)
                if appeal.status == AppealStatus::Queued
                    && appeal.attachments_ready
                    && appeal.response_queue.is_none() =>
            {
                Ok(vec![
                    Effect::RequestCaptcha { appeal_id },
                    Effect::notify(Notice::AppealQueued { appeal_id }),
                ])
            }
            _ => Err(TransitionError::StaleEvent { appeal_id }),
        },
        (
            _,
            UserAction::AnswerFeedback {
                user_id,
                message_id,
            },
        ) if ctx.is_admin() => {
            next.suspend(ConvState::FeedbackAnswering)?;
            next.feedback_target = Some(FeedbackTarget {
                user_id,
                message_id,
            });
            Ok(persist_and_prompt(next))
        }
        _ => Err(irrelevant(next)),
    }
}

fn cancel_current(next: &mut UserSession) -> Effects {
    match next.state.clone() {
        ConvState::ViolationInfo {
            field: ViolationField::Caption | ViolationField::Recipient,
        }
        | ConvState::EmailPasswordEntry
        | ConvState::FeedbackEntry => {
            next.resume();
            Ok(persist_and_prompt(next))
        }
        ConvState::FeedbackAnswering => {
            next.feedback_target = None;
            next.resume();
            Ok(persist_and_prompt(next))
        }
        ConvState::ViolationPhotoCollection
        | ConvState::ViolationInfo { .. }
        | ConvState::SendingApprovement => {
            next.discard_draft();
            next.state = ConvState::OperationalMode;
            let mut effects = vec![Effect::notify(Notice::ViolationDiscarded)];
            effects.extend(persist_and_prompt(next));
            Ok(effects)
        }
        ConvState::EnteringCaptcha { appeal_id } => abandon_captcha(next, appeal_id, None),
        ConvState::PersonalInfo { .. } | ConvState::EmailEntry | ConvState::EmailVerifying => {
            next.profile.verification_code = None;
            next.state = home(next);
            Ok(persist_and_prompt(next))
        }
        ConvState::Initial | ConvState::OperationalMode => Err(irrelevant(next)),
    }
}

fn approve(next: &mut UserSession, ctx: &ConvContext, message_id: MessageId) -> Effects {
    if !next.profile.is_complete() {
        next.discard_draft();
        next.state = home(next);
        let mut effects = vec![Effect::notify(Notice::ProfileIncomplete)];
        effects.extend(persist_and_prompt(next));
        return Ok(effects);
    }
    if !next.profile.email_verified {
        next.discard_draft();
        next.state = ConvState::OperationalMode;
        return Ok(vec![
            Effect::PersistSession,
            Effect::notify(Notice::EmailNotVerified),
        ]);
    }
    if next.appeals.get(message_id).is_some() {
        return Err(irrelevant(next));
    }
    let Some(payload) = AppealPayload::compose(
        next.user_id,
        message_id,
        &next.profile,
        &next.draft,
        &ctx.default_region,
    ) else {
        return Err(irrelevant(next));
    };

    let file_ids = std::mem::take(&mut next.draft.photos);
    next.previous_address = next.draft.resolved_address();
    next.appeals.insert(Appeal::new(payload));
    next.discard_draft();
    next.state = ConvState::OperationalMode;

    Ok(vec![
        Effect::PersistSession,
        Effect::notify(Notice::AppealQueued {
            appeal_id: message_id,
        }),
        Effect::PreparePhotos {
            appeal_id: message_id,
            file_ids,
        },
    ])
}

/// Close the captcha dialogue of an appeal awaiting an answer and cancel
/// the appeal, on user request or when its timer fires. A timeout only
/// counts against the prompt it was armed for.
fn abandon_captcha(next: &mut UserSession, appeal_id: AppealId, timeout: Option<u64>) -> Effects {
    let timed_out = timeout.is_some();
    if let Some(seq) = timeout {
        if next.captcha_for(appeal_id).map(|c| c.seq) != Some(seq) {
            return Err(TransitionError::StaleEvent { appeal_id });
        }
    }
    let awaiting = next
        .appeals
        .get(appeal_id)
        .is_some_and(|a| a.status == AppealStatus::AwaitingCaptcha);
    if !awaiting {
        // A leftover prompt of an appeal that moved on; just close it
        if !timed_out && next.captcha_for(appeal_id).is_some() {
            next.leave_captcha(appeal_id);
            return Ok(persist_and_prompt(next));
        }
        return Err(TransitionError::StaleEvent { appeal_id });
    }
    let Some(appeal) = next.appeals.finalize(appeal_id, AppealStatus::Cancelled) else {
        return Err(TransitionError::StaleEvent { appeal_id });
    };

    let mut effects = Vec::new();
    if let Some(worker) = appeal.response_queue {
        effects.push(Effect::CancelAppeal {
            appeal_id,
            worker: worker.clone(),
        });
        effects.push(Effect::UnbindWorker { appeal_id, worker });
    }
    if !timed_out {
        effects.push(Effect::DisarmTimer { appeal_id });
    }
    effects.push(Effect::ClearAttachments { appeal_id });

    let state_changed = next.leave_captcha(appeal_id);
    effects.push(Effect::PersistSession);
    effects.push(if timed_out {
        Effect::notify_reply(Notice::TimesUp { appeal_id }, appeal_id)
    } else {
        Effect::notify(Notice::AppealCancelled { appeal_id })
    });
    if state_changed {
        effects.push(Effect::notify(prompt_for(next)));
    }
    Ok(effects)
}

// ============================================================================
// Worker events
// ============================================================================

fn on_worker_event(next: &mut UserSession, event: AppealEvent) -> Effects {
    let appeal_id = event.appeal_id;
    let stale = TransitionError::StaleEvent { appeal_id };

    match event.kind {
        AppealEventKind::CaptchaRequired { url } => {
            let Some(appeal) = next.appeals.get_mut(appeal_id) else {
                return Err(stale);
            };
            if !matches!(
                appeal.status,
                AppealStatus::Queued | AppealStatus::AwaitingWorkerResponse
            ) {
                return Err(stale);
            }
            appeal.status = AppealStatus::AwaitingCaptcha;
            appeal.response_queue = Some(event.worker.clone());
            next.pending_response_queue = Some(event.worker.clone());

            let Ok(seq) = next.enter_captcha(appeal_id, url.clone()) else {
                // Too many nested dialogues to show another prompt
                return Ok(cancel_unpromptable(next, appeal_id, event.worker));
            };
            Ok(vec![
                Effect::ArmTimer { appeal_id, seq },
                Effect::PersistSession,
                Effect::notify(Notice::CaptchaPrompt { appeal_id, url }),
            ])
        }
        AppealEventKind::CaptchaAccepted => match next.appeals.get_mut(appeal_id) {
            Some(appeal)
                if matches!(
                    appeal.status,
                    AppealStatus::Queued | AppealStatus::AwaitingWorkerResponse
                ) =>
            {
                appeal.status = AppealStatus::AwaitingWorkerResponse;
                Ok(vec![Effect::PersistSession])
            }
            _ => Err(stale),
        },
        AppealEventKind::Success => {
            let Some(appeal) = next.appeals.finalize(appeal_id, AppealStatus::Sent) else {
                return Err(stale);
            };
            let mut effects = vec![
                Effect::ReleaseWorker {
                    appeal_id,
                    worker: event.worker,
                },
                Effect::ClearAttachments { appeal_id },
            ];
            let prompt_open = next.captcha_for(appeal_id).is_some();
            if prompt_open {
                effects.push(Effect::DisarmTimer { appeal_id });
            }
            let state_changed = prompt_open && next.leave_captcha(appeal_id);
            effects.push(Effect::PersistSession);
            effects.push(Effect::notify(Notice::AppealSent { appeal_id }));
            effects.push(Effect::SendLetterCopy {
                appeal_id,
                text: appeal.payload.text,
            });
            if state_changed {
                effects.push(Effect::notify(prompt_for(next)));
            }
            Ok(effects)
        }
    }
}

fn cancel_unpromptable(
    next: &mut UserSession,
    appeal_id: AppealId,
    worker: WorkerHandle,
) -> Vec<Effect> {
    next.appeals.finalize(appeal_id, AppealStatus::Cancelled);
    vec![
        Effect::CancelAppeal {
            appeal_id,
            worker: worker.clone(),
        },
        Effect::UnbindWorker { appeal_id, worker },
        Effect::ClearAttachments { appeal_id },
        Effect::PersistSession,
        Effect::notify(Notice::AppealCancelled { appeal_id }),
    ]
}

// ============================================================================
// Effect results
// ============================================================================

fn on_captcha_requested(
    next: &mut UserSession,
    appeal_id: AppealId,
    worker: WorkerHandle,
) -> Vec<Effect> {
    match next.appeals.get_mut(appeal_id) {
        Some(appeal) if appeal.status == AppealStatus::Queued => {
            appeal.response_queue = Some(worker);
            vec![Effect::PersistSession]
        }
        // The appeal went away while the request was being published
        _ => vec![
            Effect::CancelAppeal {
                appeal_id,
                worker: worker.clone(),
            },
            Effect::UnbindWorker { appeal_id, worker },
        ],
    }
}

fn on_command_failed(
    next: &mut UserSession,
    appeal_id: AppealId,
    worker: Option<WorkerHandle>,
) -> Effects {
    let Some(_) = next.appeals.finalize(appeal_id, AppealStatus::Failed) else {
        return Err(TransitionError::StaleEvent { appeal_id });
    };
    let mut effects = Vec::new();
    if let Some(worker) = worker {
        effects.push(Effect::UnbindWorker { appeal_id, worker });
    }
    effects.push(Effect::ClearAttachments { appeal_id });
    let state_changed = next.leave_captcha(appeal_id);
    effects.push(Effect::PersistSession);
    effects.push(Effect::notify(Notice::SendingFailed { appeal_id }));
    if state_changed {
        effects.push(Effect::notify(prompt_for(next)));
    }
    Ok(effects)
}

fn on_photos_prepared(
    next: &mut UserSession,
    appeal_id: AppealId,
    result: Result<Vec<String>, String>,
) -> Effects {
    let Some(appeal) = next
        .appeals
        .get_mut(appeal_id)
        .filter(|a| a.status == AppealStatus::Queued)
    else {
        return Err(TransitionError::StaleEvent { appeal_id });
    };

    match result {
        Ok(urls) => {
            appeal.payload.photo_urls = urls;
            appeal.attachments_ready = true;
            Ok(vec![
                Effect::PersistSession,
                Effect::RequestCaptcha { appeal_id },
            ])
        }
        Err(_) => {
            next.appeals.finalize(appeal_id, AppealStatus::Failed);
            Ok(vec![
                Effect::ClearAttachments { appeal_id },
                Effect::PersistSession,
                Effect::notify(Notice::SendingFailed { appeal_id }),
            ])
        }
    }
}

fn on_address_resolved(
    next: &mut UserSession,
    query: AddressQuery,
    resolved: Option<ResolvedAddress>,
) -> Effects {
    if next.state
        != (ConvState::ViolationInfo {
            field: ViolationField::Address,
        })
    {
        return Err(irrelevant(next));
    }
    let address = match (resolved, query) {
        (Some(resolved), _) => resolved,
        // Geocoder found nothing: keep the typed address as is
        (None, AddressQuery::Text(text)) => ResolvedAddress {
            address: text,
            region: None,
            coordinates: None,
        },
        (None, AddressQuery::Location(_)) => {
            return Ok(vec![Effect::notify(Notice::AddressNotFound)]);
        }
    };
    next.draft.set_address(address);
    next.state = ConvState::ViolationInfo {
        field: ViolationField::DateTime,
    };
    Ok(persist_and_prompt(next))
}

fn on_verification_code(next: &mut UserSession, code: Option<String>) -> Vec<Effect> {
    match (code, next.profile.email.clone()) {
        (Some(code), Some(email)) => {
            next.profile.verification_code = Some(code);
            next.state = ConvState::EmailVerifying;
            vec![
                Effect::PersistSession,
                Effect::notify(Notice::VerificationCodeSent { email }),
            ]
        }
        _ => vec![Effect::notify(Notice::VerificationUnavailable)],
    }
}

fn on_password_checked(next: &mut UserSession, password: String, valid: bool) -> Effects {
    if next.state != ConvState::EmailPasswordEntry {
        return Err(irrelevant(next));
    }
    if !valid {
        return Ok(vec![Effect::notify(Notice::EmailPasswordInvalid)]);
    }
    next.profile.email_password = Some(password);
    next.resume();
    let mut effects = vec![Effect::notify(Notice::EmailPasswordSaved)];
    effects.extend(persist_and_prompt(next));
    Ok(effects)
}
