//! Session runtime executor

use super::traits::{
    deliver, Attachment, BanList, ChatTransport, Geocoder, MailVerifier, OutboundMessage,
    PhotoStorage, SessionStore, StoreError,
};
use crate::config::SessionSettings;
use crate::ids::{AppealId, AppealKey, MessageId, UserId};
use crate::notice::Notice;
use crate::pool::{ReleaseOutcome, WorkerPool};
use crate::protocol::ProtocolClient;
use crate::state_machine::event::AddressQuery;
use crate::state_machine::{transition, ConvContext, Effect, Event, TransitionError, UserSession};
use crate::timer::{CancellationTimer, TimerHandle};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-wide collaborators shared by every session runtime
pub struct Services {
    pub settings: SessionSettings,
    pub store: Arc<dyn SessionStore>,
    pub bans: Arc<dyn BanList>,
    pub chat: Arc<dyn ChatTransport>,
    pub geocoder: Arc<dyn Geocoder>,
    pub mail: Arc<dyn MailVerifier>,
    pub photos: Arc<dyn PhotoStorage>,
    pub pool: Arc<WorkerPool>,
    pub timer: CancellationTimer<Event>,
    pub protocol: ProtocolClient,
}

/// One user's conversation: owns the session and applies events to it in
/// arrival order
pub struct SessionRuntime {
    services: Arc<Services>,
    context: ConvContext,
    session: UserSession,
    event_rx: mpsc::UnboundedReceiver<Event>,
    /// Armed captcha timers of this user with the prompt sequence number
    /// each was armed for
    timers: HashMap<AppealId, (u64, TimerHandle<Event>)>,
}

impl SessionRuntime {
    /// Load the user's record, or start a fresh session if there is none
    pub async fn load(
        services: Arc<Services>,
        user_id: UserId,
        event_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Result<Self, StoreError> {
        let max_depth = services.settings.max_interrupt_depth;
        let session = match services.store.load(user_id).await? {
            Some(mut session) => {
                tracing::info!(
                    user_id,
                    state = session.state.name(),
                    appeals = session.appeals.len(),
                    "Restored session"
                );
                session.user_id = user_id;
                session.with_max_depth(max_depth)
            }
            None => UserSession::new(user_id, max_depth),
        };
        let context = services.settings.context_for(user_id);
        Ok(Self {
            services,
            context,
            session,
            event_rx,
            timers: HashMap::new(),
        })
    }

    /// Process events until every sender is gone, or until the session has
    /// been idle for the configured time with no captcha deadline pending
    pub async fn run(mut self) {
        let user_id = self.context.user_id;
        let idle_timeout = self.services.settings.idle_timeout;
        tracing::info!(user_id, "Starting session runtime");

        loop {
            match tokio::time::timeout(idle_timeout, self.event_rx.recv()).await {
                Ok(Some(event)) => self.process_event(event).await,
                Ok(None) => break,
                Err(_) if !self.timers.is_empty() => {}
                Err(_) => {
                    tracing::info!(user_id, "Evicting idle session runtime");
                    self.event_rx.close();
                    // Events queued before the close still belong to this run
                    while let Some(event) = self.event_rx.recv().await {
                        self.process_event(event).await;
                    }
                    break;
                }
            }
        }

        tracing::info!(user_id, "Session runtime stopped");
    }

    async fn process_event(&mut self, event: Event) {
        // Events generated by effects run before the next queued event
        let mut events_to_process = VecDeque::from([event]);

        while let Some(current) = events_to_process.pop_front() {
            let kind = current.kind();
            let from_user = current.is_user_input();
            match &current {
                Event::CaptchaTimeout { appeal_id, seq } => {
                    if self.timers.get(appeal_id).is_some_and(|(armed, _)| armed == seq) {
                        self.timers.remove(appeal_id);
                    }
                }
                Event::UserPhoto { .. } => self.refresh_ban_status().await,
                _ => {}
            }

            let result = match transition(&self.session, &self.context, current) {
                Ok(r) => r,
                Err(e) => {
                    self.report_rejection(kind, from_user, e).await;
                    continue;
                }
            };

            if result.new_session.state != self.session.state {
                tracing::debug!(
                    user_id = self.context.user_id,
                    from = self.session.state.name(),
                    to = result.new_session.state.name(),
                    interrupts = result.new_session.interrupts.len(),
                    event = kind,
                    "State change"
                );
            }
            self.session = result.new_session;

            for effect in result.effects {
                if let Some(generated) = self.execute_effect(effect).await {
                    events_to_process.push_back(generated);
                }
            }
        }
    }

    async fn report_rejection(&self, kind: &'static str, from_user: bool, error: TransitionError) {
        let user_id = self.context.user_id;
        let notice = match error {
            TransitionError::StaleEvent { appeal_id } => {
                tracing::debug!(user_id, appeal_id, event = kind, "Ignoring stale event");
                return;
            }
            TransitionError::InvalidInput(err) => Notice::InvalidInput(err),
            TransitionError::Irrelevant { state } => {
                tracing::debug!(user_id, state, event = kind, "Irrelevant event");
                Notice::Irrelevant
            }
            TransitionError::InterruptDepthExceeded(err) => {
                tracing::error!(user_id, error = %err, event = kind, "Interrupt stack is full");
                Notice::Irrelevant
            }
        };
        if from_user {
            self.notify(user_id, &notice, None).await;
        }
    }

    async fn refresh_ban_status(&mut self) {
        let user_id = self.context.user_id;
        self.context.ban_reason = self
            .services
            .bans
            .ban_reason(user_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, error = %e, "Failed to read ban list");
                None
            });
    }

    fn key(&self, appeal_id: AppealId) -> AppealKey {
        AppealKey::new(self.context.user_id, appeal_id)
    }

    async fn notify(&self, chat_id: UserId, notice: &Notice, reply_to: Option<MessageId>) {
        let message = OutboundMessage {
            actions: notice.actions(),
            reply_to,
            ..OutboundMessage::text(chat_id, notice.render())
        };
        deliver(self.services.chat.as_ref(), message).await;
    }

    #[allow(clippy::too_many_lines)]
    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        let user_id = self.context.user_id;
        let services = Arc::clone(&self.services);

        match effect {
            Effect::PersistSession => {
                if let Err(e) = services.store.save(&self.session).await {
                    tracing::error!(user_id, error = %e, "Failed to persist session");
                }
                None
            }

            Effect::ResetSession => {
                for (_, (_, handle)) in self.timers.drain() {
                    handle.cancel();
                }
                if let Err(e) = services.store.delete(user_id).await {
                    tracing::error!(user_id, error = %e, "Failed to delete session record");
                }
                None
            }

            Effect::Notify { notice, reply_to } => {
                self.notify(user_id, &notice, reply_to).await;
                None
            }

            Effect::PreparePhotos {
                appeal_id,
                file_ids,
            } => {
                let result = services
                    .photos
                    .store(self.key(appeal_id), &file_ids)
                    .await
                    .map_err(|e| {
                        tracing::warn!(user_id, appeal_id, error = %e, "Failed to store photos");
                        e.to_string()
                    });
                Some(Event::PhotosPrepared { appeal_id, result })
            }

            Effect::RequestCaptcha { appeal_id } => {
                let Some(appeal) = self.session.appeals.active(appeal_id) else {
                    tracing::warn!(user_id, appeal_id, "Captcha requested for unknown appeal");
                    return None;
                };
                let payload = appeal.payload.clone();
                let key = self.key(appeal_id);

                let Some(worker) = services.pool.allocate(key) else {
                    tracing::info!(user_id, appeal_id, "No idle worker");
                    return Some(Event::NoWorkerAvailable { appeal_id });
                };

                match services.protocol.request_captcha(payload, &worker).await {
                    Ok(()) => Some(Event::CaptchaRequested { appeal_id, worker }),
                    Err(e) => {
                        tracing::error!(
                            user_id,
                            appeal_id,
                            worker = %worker,
                            error = %e,
                            "Failed to send REQUEST_CAPTCHA"
                        );
                        services.pool.release(&worker, key);
                        Some(Event::CommandFailed {
                            appeal_id,
                            worker: None,
                            reason: e.to_string(),
                        })
                    }
                }
            }

            Effect::SubmitCaptchaAnswer {
                appeal_id,
                answer,
                worker,
            } => {
                let contact_email = self
                    .session
                    .appeals
                    .get(appeal_id)
                    .and_then(|a| a.payload.contact_email.clone());
                let result = services
                    .protocol
                    .submit_captcha_answer(self.key(appeal_id), answer, &worker, contact_email)
                    .await;
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::error!(
                            user_id,
                            appeal_id,
                            worker = %worker,
                            error = %e,
                            "Failed to send SUBMIT_ANSWER"
                        );
                        Some(Event::CommandFailed {
                            appeal_id,
                            worker: Some(worker),
                            reason: e.to_string(),
                        })
                    }
                }
            }

            Effect::CancelAppeal { appeal_id, worker } => {
                if let Err(e) = services.protocol.cancel(self.key(appeal_id), &worker).await {
                    tracing::warn!(
                        user_id,
                        appeal_id,
                        worker = %worker,
                        error = %e,
                        "Failed to send CANCEL"
                    );
                }
                None
            }

            Effect::ArmTimer { appeal_id, seq } => {
                // Replaces any schedule still pending for the appeal
                let handle = services.timer.schedule(
                    self.key(appeal_id),
                    services.settings.captcha_timeout,
                    Event::CaptchaTimeout { appeal_id, seq },
                );
                self.timers.insert(appeal_id, (seq, handle));
                tracing::debug!(
                    user_id,
                    appeal_id,
                    seq,
                    pending = services.timer.pending_count(),
                    "Armed captcha timer"
                );
                None
            }

            Effect::DisarmTimer { appeal_id } => {
                let cancelled = match self.timers.remove(&appeal_id) {
                    Some((_, handle)) => handle.cancel(),
                    None => services.timer.cancel(&self.key(appeal_id)),
                };
                tracing::debug!(user_id, appeal_id, cancelled, "Disarmed captcha timer");
                None
            }

            Effect::ReleaseWorker { appeal_id, worker } => {
                match services.pool.release(&worker, self.key(appeal_id)) {
                    ReleaseOutcome::Released | ReleaseOutcome::Adopted => {
                        tracing::info!(user_id, appeal_id, worker = %worker, "Worker released");
                    }
                    ReleaseOutcome::AlreadyIdle => {
                        tracing::debug!(user_id, appeal_id, worker = %worker, "Worker already idle");
                    }
                    ReleaseOutcome::BoundElsewhere(other) => {
                        tracing::warn!(
                            user_id,
                            appeal_id,
                            worker = %worker,
                            bound_to = %other,
                            "Not releasing worker bound to another appeal"
                        );
                    }
                }
                None
            }

            Effect::UnbindWorker { appeal_id, worker } => {
                if services.pool.unbind(&worker, self.key(appeal_id)) {
                    tracing::info!(user_id, appeal_id, worker = %worker, "Worker unbound");
                }
                None
            }

            Effect::ClearAttachments { appeal_id } => {
                self.timers.remove(&appeal_id);
                if let Err(e) = services.photos.clear(self.key(appeal_id)).await {
                    tracing::warn!(user_id, appeal_id, error = %e, "Failed to clear photos");
                }
                None
            }

            Effect::ResolveAddress { query } => {
                let resolved = match &query {
                    AddressQuery::Text(text) => services.geocoder.resolve_text(text).await,
                    AddressQuery::Location(coordinates) => {
                        services.geocoder.resolve_location(*coordinates).await
                    }
                };
                let resolved = resolved.unwrap_or_else(|e| {
                    tracing::warn!(user_id, error = %e, "Geocoder request failed");
                    None
                });
                Some(Event::AddressResolved { query, resolved })
            }

            Effect::SendVerificationCode { email } => {
                let code = match services.mail.send_code(&email).await {
                    Ok(code) => Some(code),
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "Failed to send verification code");
                        None
                    }
                };
                Some(Event::VerificationCodeSent { code })
            }

            Effect::CheckEmailPassword { email, password } => {
                let valid = services
                    .mail
                    .check_password(&email, &password)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(user_id, error = %e, "Failed to check email password");
                        false
                    });
                Some(Event::EmailPasswordChecked { password, valid })
            }

            Effect::ForwardFeedback { text, message_id } => {
                match self.context.admin_chat_id {
                    Some(admin) => {
                        let notice = Notice::FeedbackReceived {
                            user_id,
                            message_id,
                            text,
                        };
                        self.notify(admin, &notice, None).await;
                    }
                    None => tracing::warn!(user_id, "No admin chat configured, feedback dropped"),
                }
                None
            }

            Effect::ReplyToFeedback { target, text } => {
                let notice = Notice::FeedbackAnswer { text };
                self.notify(target.user_id, &notice, Some(target.message_id))
                    .await;
                None
            }

            Effect::SendLetterCopy { appeal_id, text } => {
                let message = OutboundMessage {
                    reply_to: Some(appeal_id),
                    attachment: Some(Attachment {
                        file_name: format!("appeal_{appeal_id}.txt"),
                        content: text,
                    }),
                    ..OutboundMessage::text(user_id, Notice::LetterCopy { appeal_id }.render())
                };
                deliver(services.chat.as_ref(), message).await;
                None
            }

            Effect::Ban {
                user_id: target,
                reason,
            } => {
                let notice = match services.bans.ban(target, &reason).await {
                    Ok(()) => {
                        tracing::info!(user_id, banned = target, reason = %reason, "User banned");
                        Notice::UserBanned { user_id: target }
                    }
                    Err(e) => {
                        tracing::error!(user_id, banned = target, error = %e, "Failed to ban user");
                        Notice::BanListUnavailable
                    }
                };
                self.notify(user_id, &notice, None).await;
                None
            }

            Effect::Unban { user_id: target } => {
                let notice = match services.bans.unban(target).await {
                    Ok(true) => {
                        tracing::info!(user_id, unbanned = target, "User unbanned");
                        Notice::UserUnbanned { user_id: target }
                    }
                    Ok(false) => Notice::NotBanned { user_id: target },
                    Err(e) => {
                        tracing::error!(user_id, unbanned = target, error = %e, "Failed to unban user");
                        Notice::BanListUnavailable
                    }
                };
                self.notify(user_id, &notice, None).await;
                None
            }

            Effect::ShowBanList => {
                let notice = match services.bans.banned().await {
                    Ok(entries) => Notice::BanList { entries },
                    Err(e) => {
                        tracing::error!(user_id, error = %e, "Failed to read ban list");
                        Notice::BanListUnavailable
                    }
                };
                self.notify(user_id, &notice, None).await;
                None
            }
        }
    }
}
