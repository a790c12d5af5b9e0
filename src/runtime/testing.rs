//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::{RuntimeError, RuntimeManager, Services};
use crate::config::SessionSettings;
use crate::ids::{AppealKey, MessageId, UserId, WorkerHandle};
use crate::pool::WorkerPool;
use crate::protocol::wire::CommandMessage;
use crate::protocol::{CommandPublisher, EventDispatcher, ProtocolClient, ProtocolError, SessionRouter};
use crate::state_machine::session::{Coordinates, ResolvedAddress};
use crate::state_machine::{Event, UserSession};
use crate::timer::CancellationTimer;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn io_error(what: &str) -> std::io::Error {
    std::io::Error::other(what.to_string())
}

// ============================================================================
// Protocol
// ============================================================================

/// Command publisher that records what it was asked to send
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(WorkerHandle, CommandMessage)>>,
    fail_next: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(WorkerHandle, CommandMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Make the next publish fail without recording it
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish(
        &self,
        worker: &WorkerHandle,
        command: &CommandMessage,
    ) -> Result<(), ProtocolError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(ProtocolError::Serialize(err));
        }
        self.sent
            .lock()
            .unwrap()
            .push((worker.clone(), command.clone()));
        Ok(())
    }
}

/// Session router that records routed events
#[derive(Default)]
pub struct RecordingRouter {
    routed: Mutex<Vec<(UserId, Event)>>,
}

impl RecordingRouter {
    pub fn routed(&self) -> Vec<(UserId, Event)> {
        self.routed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionRouter for RecordingRouter {
    async fn route(&self, user_id: UserId, event: Event) -> Result<(), RuntimeError> {
        self.routed.lock().unwrap().push((user_id, event));
        Ok(())
    }
}

// ============================================================================
// In-Memory Session Store
// ============================================================================

/// Keeps serialized records so tests exercise the same encoding as the
/// SQLite store. Also serves as the ban list.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<UserId, String>>,
    bans: Mutex<BTreeMap<UserId, String>>,
    stalled: Mutex<HashSet<UserId>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: &UserSession) {
        let json = serde_json::to_string(session).unwrap();
        self.records.lock().unwrap().insert(session.user_id, json);
    }

    pub fn get(&self, user_id: UserId) -> Option<UserSession> {
        self.records
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|json| serde_json::from_str(json).unwrap())
    }

    /// Make every load of this user's record hang
    pub fn stall_loads(&self, user_id: UserId) {
        self.stalled.lock().unwrap().insert(user_id);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, user_id: UserId) -> Result<Option<UserSession>, StoreError> {
        let stalled = self.stalled.lock().unwrap().contains(&user_id);
        if stalled {
            std::future::pending::<()>().await;
        }
        let records = self.records.lock().unwrap();
        match records.get(&user_id) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &UserSession) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        self.records.lock().unwrap().insert(session.user_id, json);
        Ok(())
    }

    async fn delete(&self, user_id: UserId) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(&user_id);
        Ok(())
    }
}

#[async_trait]
impl BanList for InMemorySessionStore {
    async fn ban(&self, user_id: UserId, reason: &str) -> Result<(), StoreError> {
        self.bans.lock().unwrap().insert(user_id, reason.to_string());
        Ok(())
    }

    async fn unban(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.bans.lock().unwrap().remove(&user_id).is_some())
    }

    async fn ban_reason(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        Ok(self.bans.lock().unwrap().get(&user_id).cloned())
    }

    async fn banned(&self) -> Result<Vec<BannedUser>, StoreError> {
        Ok(self
            .bans
            .lock()
            .unwrap()
            .iter()
            .map(|(user_id, reason)| BannedUser {
                user_id: *user_id,
                reason: reason.clone(),
            })
            .collect())
    }
}

// ============================================================================
// Mock Chat
// ============================================================================

#[derive(Default)]
pub struct MockChat {
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicUsize,
    next_id: AtomicI64,
    fail_replies: AtomicBool,
    fail_all: AtomicBool,
}

impl MockChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every message that carries a reply reference
    pub fn fail_replies(&self) {
        self.fail_replies.store(true, Ordering::SeqCst);
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: UserId) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }
}

#[async_trait]
impl ChatTransport for MockChat {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst)
            || (message.reply_to.is_some() && self.fail_replies.load(Ordering::SeqCst))
        {
            return Err(TransportError::Api("Bad Request: message not found".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ============================================================================
// Mock Collaborators
// ============================================================================

/// Geocoder answering every query with the same address
#[derive(Default)]
pub struct MockGeocoder {
    result: Mutex<Option<ResolvedAddress>>,
}

impl MockGeocoder {
    pub fn resolving_to(address: &str, region: &str) -> Self {
        Self {
            result: Mutex::new(Some(ResolvedAddress {
                address: address.to_string(),
                region: Some(region.to_string()),
                coordinates: None,
            })),
        }
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn resolve_text(&self, _query: &str) -> Result<Option<ResolvedAddress>, ServiceError> {
        Ok(self.result.lock().unwrap().clone())
    }

    async fn resolve_location(
        &self,
        coordinates: Coordinates,
    ) -> Result<Option<ResolvedAddress>, ServiceError> {
        Ok(self.result.lock().unwrap().clone().map(|mut r| {
            r.coordinates = Some(coordinates);
            r
        }))
    }
}

/// Mail verifier with a fixed code and password
pub struct MockMail {
    pub code: String,
    pub password: String,
    pub available: bool,
}

impl Default for MockMail {
    fn default() -> Self {
        Self {
            code: "123456".into(),
            password: "secret".into(),
            available: true,
        }
    }
}

#[async_trait]
impl MailVerifier for MockMail {
    async fn send_code(&self, _email: &str) -> Result<String, ServiceError> {
        if !self.available {
            return Err(ServiceError::NotConfigured);
        }
        Ok(self.code.clone())
    }

    async fn check_password(&self, _email: &str, password: &str) -> Result<bool, ServiceError> {
        if !self.available {
            return Err(ServiceError::NotConfigured);
        }
        Ok(password == self.password)
    }
}

#[derive(Default)]
pub struct MockPhotos {
    stored: Mutex<HashMap<AppealKey, Vec<String>>>,
    cleared: Mutex<Vec<AppealKey>>,
    fail_store: AtomicBool,
}

impl MockPhotos {
    pub fn fail_store(&self) {
        self.fail_store.store(true, Ordering::SeqCst);
    }

    pub fn stored(&self, key: AppealKey) -> Option<Vec<String>> {
        self.stored.lock().unwrap().get(&key).cloned()
    }

    pub fn cleared(&self) -> Vec<AppealKey> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhotoStorage for MockPhotos {
    async fn store(&self, key: AppealKey, file_ids: &[String]) -> Result<Vec<String>, ServiceError> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(ServiceError::Io(io_error("disk full")));
        }
        let urls: Vec<String> = (0..file_ids.len())
            .map(|n| format!("http://photos/{}/{}/{n}.jpg", key.user_id, key.appeal_id))
            .collect();
        self.stored.lock().unwrap().insert(key, urls.clone());
        Ok(urls)
    }

    async fn clear(&self, key: AppealKey) -> Result<(), ServiceError> {
        self.stored.lock().unwrap().remove(&key);
        self.cleared.lock().unwrap().push(key);
        Ok(())
    }
}

// ============================================================================
// Test Runtime
// ============================================================================

/// A full session runtime wired to mocks, plus the worker-event dispatcher
/// and the cancellation timer sweeper
pub struct TestRuntime {
    pub manager: Arc<RuntimeManager>,
    pub store: Arc<InMemorySessionStore>,
    pub chat: Arc<MockChat>,
    pub photos: Arc<MockPhotos>,
    pub publisher: Arc<RecordingPublisher>,
    pub pool: Arc<WorkerPool>,
    pub timer: CancellationTimer<Event>,
    dispatcher: EventDispatcher,
    shutdown: CancellationToken,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let store = Arc::new(InMemorySessionStore::new());
        let chat = Arc::new(MockChat::new());
        let photos = Arc::new(MockPhotos::default());
        let publisher = Arc::new(RecordingPublisher::new());
        let pool = Arc::new(WorkerPool::new());
        let timer = CancellationTimer::new();

        let services = Arc::new(Services {
            settings,
            store: store.clone(),
            bans: store.clone(),
            chat: chat.clone(),
            geocoder: Arc::new(MockGeocoder::resolving_to("Minsk, Nezavisimosti 1", "minsk")),
            mail: Arc::new(MockMail::default()),
            photos: photos.clone(),
            pool: pool.clone(),
            timer: timer.clone(),
            protocol: ProtocolClient::new(publisher.clone()),
        });
        let manager = Arc::new(RuntimeManager::new(services));
        let dispatcher = EventDispatcher::new(pool.clone(), manager.clone());

        let shutdown = CancellationToken::new();
        let (fired_tx, mut fired_rx) = mpsc::channel(16);
        tokio::spawn(timer.clone().run(fired_tx, shutdown.clone()));
        let router = manager.clone();
        tokio::spawn(async move {
            while let Some(fired) = fired_rx.recv().await {
                let _ = router.send_event(fired.key.user_id, fired.payload).await;
            }
        });

        Self {
            manager,
            store,
            chat,
            photos,
            publisher,
            pool,
            timer,
            dispatcher,
            shutdown,
        }
    }

    pub async fn send(&self, user_id: UserId, event: Event) {
        self.manager
            .send_event(user_id, event)
            .await
            .expect("Failed to send event");
    }

    /// Feed a raw message through the event-channel dispatcher
    pub async fn worker_event(&self, body: serde_json::Value) {
        self.dispatcher.dispatch(body.to_string().as_bytes()).await;
    }

    /// Poll until `check` holds or `timeout` passes
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check(self)
    }

    /// Wait until the user was sent exactly this text
    pub async fn wait_for_text(&self, user_id: UserId, text: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |rt| {
            rt.chat.sent_to(user_id).iter().any(|m| m.text == text)
        })
        .await
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appeal::AppealStatus;
    use crate::notice::{Notice, UserAction};
    use crate::protocol::wire::{CommandKind, CommandPayload};
    use crate::state_machine::session::SenderProfile;
    use crate::state_machine::ConvState;
    use chrono::Utc;
    use serde_json::json;

    const USER: UserId = 42;
    const WAIT: Duration = Duration::from_secs(2);

    /// Registered user looking at the approval summary of a finished draft
    fn ready_to_approve() -> UserSession {
        let mut s = UserSession::new(USER, 32);
        s.profile = SenderProfile {
            first_name: Some("Ivan".into()),
            last_name: Some("Ivanov".into()),
            email: Some("ivan@example.com".into()),
            email_password: Some("secret".into()),
            email_verified: true,
            city: Some("Minsk".into()),
            street: Some("Nezavisimosti".into()),
            house: Some("1".into()),
            ..SenderProfile::default()
        };
        s.draft.photos = vec!["file-1".into(), "file-2".into()];
        s.draft.plate = Some("АВ 1234-7".into());
        s.draft.address = Some("Minsk, Nezavisimosti 1".into());
        s.draft.region = Some("minsk".into());
        s.draft.datetime = Some("01.02.2024 10:00".into());
        s.state = ConvState::SendingApprovement;
        s
    }

    fn action(action: UserAction, message_id: MessageId) -> Event {
        Event::UserAction {
            action,
            message_id,
            received_at: Utc::now(),
        }
    }

    fn text(t: &str) -> Event {
        Event::UserText {
            text: t.into(),
            message_id: 600,
        }
    }

    fn commands(rt: &TestRuntime) -> Vec<CommandKind> {
        rt.publisher.sent().iter().map(|(_, c)| c.kind).collect()
    }

    /// Approve appeal 500 with worker `w1` idle and wait for its captcha request
    async fn approved(rt: &TestRuntime) {
        rt.store.put(&ready_to_approve());
        rt.pool.add_handle(WorkerHandle::new("w1"));
        rt.send(USER, action(UserAction::ApproveSending, 500)).await;
        assert!(
            rt.wait_until(WAIT, |rt| commands(rt) == vec![CommandKind::RequestCaptcha])
                .await
        );
    }

    async fn captcha_shown(rt: &TestRuntime) {
        rt.worker_event(json!({
            "type": "CAPTCHA_URL", "user_id": USER, "appeal_id": 500,
            "answer_queue": "w1", "captcha": "http://captcha/1"
        }))
        .await;
        let prompt = Notice::CaptchaPrompt {
            appeal_id: 500,
            url: "http://captcha/1".into(),
        }
        .render();
        assert!(rt.wait_for_text(USER, &prompt, WAIT).await);
    }

    #[tokio::test]
    async fn test_captcha_round_trip_sends_appeal() {
        let rt = TestRuntime::new();
        approved(&rt).await;

        let (worker, request) = rt.publisher.sent().remove(0);
        assert_eq!(worker, WorkerHandle::new("w1"));
        match request.payload {
            CommandPayload::Appeal(payload) => {
                assert_eq!(payload.appeal_id, 500);
                assert_eq!(payload.photo_urls.len(), 2);
                assert_eq!(payload.contact_email.as_deref(), Some("ivan@example.com"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(
            rt.pool.binding_of(&WorkerHandle::new("w1")),
            Some(AppealKey::new(USER, 500))
        );

        assert_eq!(rt.photos.stored(AppealKey::new(USER, 500)).map(|u| u.len()), Some(2));

        captcha_shown(&rt).await;
        assert!(rt.timer.is_pending(&AppealKey::new(USER, 500)));

        rt.send(USER, text("AB12CD")).await;
        assert!(
            rt.wait_until(WAIT, |rt| commands(rt).len() == 2).await,
            "answer was not submitted"
        );
        assert_eq!(rt.publisher.sent()[1].1.kind, CommandKind::SubmitAnswer);
        assert_eq!(
            rt.publisher.sent()[1].1.payload,
            CommandPayload::Text("AB12CD".into())
        );
        assert!(!rt.timer.is_pending(&AppealKey::new(USER, 500)));

        rt.worker_event(json!({
            "type": "OK", "user_id": USER, "appeal_id": 500, "answer_queue": "w1"
        }))
        .await;
        let sent = Notice::AppealSent { appeal_id: 500 }.render();
        assert!(rt.wait_for_text(USER, &sent, WAIT).await);

        assert_eq!(rt.pool.idle_count(), 1);
        assert_eq!(rt.photos.cleared(), vec![AppealKey::new(USER, 500)]);
        assert!(rt.wait_until(WAIT, |rt| {
            rt.store
                .get(USER)
                .is_some_and(|s| s.appeals.is_empty() && s.state == ConvState::OperationalMode)
        })
        .await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_captcha_times_out() {
        let rt = TestRuntime::new();
        approved(&rt).await;
        captcha_shown(&rt).await;

        let times_up = Notice::TimesUp { appeal_id: 500 }.render();
        assert!(
            rt.wait_for_text(USER, &times_up, Duration::from_secs(120))
                .await
        );

        assert!(
            rt.wait_until(WAIT, |rt| commands(rt).contains(&CommandKind::Cancel))
                .await
        );
        // The worker comes back on its own FREE_WORKER announcement
        assert_eq!(rt.pool.idle_count(), 0);
        assert_eq!(rt.pool.binding_of(&WorkerHandle::new("w1")), None);
        rt.worker_event(json!({"type": "FREE_WORKER", "answer_queue": "w1"}))
            .await;
        assert_eq!(rt.pool.idle_count(), 1);

        let reply = rt
            .chat
            .sent_to(USER)
            .into_iter()
            .find(|m| m.text == times_up)
            .unwrap();
        assert_eq!(reply.reply_to, Some(500));
    }

    #[tokio::test]
    async fn test_no_worker_then_retry() {
        let rt = TestRuntime::new();
        rt.store.put(&ready_to_approve());
        rt.send(USER, action(UserAction::ApproveSending, 500)).await;

        let busy = Notice::NoWorkerAvailable { appeal_id: 500 };
        assert!(rt.wait_for_text(USER, &busy.render(), WAIT).await);
        let offered = rt
            .chat
            .sent_to(USER)
            .into_iter()
            .find(|m| m.text == busy.render())
            .unwrap();
        assert_eq!(
            offered.actions,
            vec![UserAction::RetrySending { appeal_id: 500 }]
        );
        assert!(rt.publisher.sent().is_empty());

        rt.worker_event(json!({"type": "FREE_WORKER", "answer_queue": "w2"}))
            .await;
        rt.send(USER, action(UserAction::RetrySending { appeal_id: 500 }, 501))
            .await;
        assert!(
            rt.wait_until(WAIT, |rt| commands(rt) == vec![CommandKind::RequestCaptcha])
                .await
        );
        assert_eq!(rt.publisher.sent()[0].0, WorkerHandle::new("w2"));
    }

    #[tokio::test]
    async fn test_failed_request_returns_worker_and_fails_appeal() {
        let rt = TestRuntime::new();
        rt.store.put(&ready_to_approve());
        rt.pool.add_handle(WorkerHandle::new("w1"));
        rt.publisher.fail_next();
        rt.send(USER, action(UserAction::ApproveSending, 500)).await;

        let failed = Notice::SendingFailed { appeal_id: 500 }.render();
        assert!(rt.wait_for_text(USER, &failed, WAIT).await);
        assert_eq!(rt.pool.idle_count(), 1);
        assert!(rt.wait_until(WAIT, |rt| {
            rt.store.get(USER).is_some_and(|s| s.appeals.is_empty())
        })
        .await);
    }

    #[tokio::test]
    async fn test_cancel_captcha_notifies_worker() {
        let rt = TestRuntime::new();
        approved(&rt).await;
        captcha_shown(&rt).await;

        rt.send(USER, action(UserAction::CancelCaptcha { appeal_id: 500 }, 501))
            .await;
        let cancelled = Notice::AppealCancelled { appeal_id: 500 }.render();
        assert!(rt.wait_for_text(USER, &cancelled, WAIT).await);
        assert!(commands(&rt).contains(&CommandKind::Cancel));
        assert!(!rt.timer.is_pending(&AppealKey::new(USER, 500)));
        assert_eq!(rt.pool.binding_of(&WorkerHandle::new("w1")), None);
    }

    #[tokio::test]
    async fn test_events_of_other_users_do_not_interfere() {
        let rt = TestRuntime::new();
        approved(&rt).await;

        // Event for another user's appeal with the same id
        rt.worker_event(json!({
            "type": "CAPTCHA_URL", "user_id": 7, "appeal_id": 500,
            "answer_queue": "w1", "captcha": "http://captcha/x"
        }))
        .await;
        rt.send(USER, Event::UserCommand(crate::state_machine::event::Command::Help))
            .await;
        assert!(rt.wait_for_text(USER, &Notice::Help.render(), WAIT).await);

        let s = rt.store.get(USER).unwrap();
        let appeal = s.appeals.get(500).unwrap();
        assert_eq!(appeal.status, AppealStatus::Queued);
        assert_eq!(appeal.response_queue, Some(WorkerHandle::new("w1")));
        assert!(rt.chat.sent_to(7).is_empty());
        assert_eq!(rt.manager.active_sessions().await, 2);
    }

    #[tokio::test]
    async fn test_irrelevant_input_gets_a_notice() {
        let rt = TestRuntime::new();
        rt.store.put(&ready_to_approve());
        rt.send(
            USER,
            Event::UserLocation {
                coordinates: Coordinates {
                    lat: 53.9,
                    lon: 27.56,
                },
            },
        )
        .await;
        assert!(
            rt.wait_for_text(USER, &Notice::Irrelevant.render(), WAIT)
                .await
        );
    }

    #[tokio::test]
    async fn test_photo_upload_failure_fails_appeal() {
        let rt = TestRuntime::new();
        rt.store.put(&ready_to_approve());
        rt.pool.add_handle(WorkerHandle::new("w1"));
        rt.photos.fail_store();
        rt.send(USER, action(UserAction::ApproveSending, 500)).await;

        let failed = Notice::SendingFailed { appeal_id: 500 }.render();
        assert!(rt.wait_for_text(USER, &failed, WAIT).await);
        assert!(rt.publisher.sent().is_empty());
        assert_eq!(rt.pool.idle_count(), 1);
        assert_eq!(rt.photos.cleared(), vec![AppealKey::new(USER, 500)]);
    }

    #[tokio::test]
    async fn test_email_verification_through_mail_service() {
        let rt = TestRuntime::new();
        let mut s = ready_to_approve();
        s.profile.email_verified = false;
        s.state = ConvState::OperationalMode;
        rt.store.put(&s);

        rt.send(USER, action(UserAction::VerifyEmail, 501)).await;
        let code_sent = Notice::VerificationCodeSent {
            email: "ivan@example.com".into(),
        }
        .render();
        assert!(rt.wait_for_text(USER, &code_sent, WAIT).await);

        rt.send(USER, text("123456")).await;
        assert!(
            rt.wait_for_text(USER, &Notice::EmailVerified.render(), WAIT)
                .await
        );
        assert!(rt.wait_until(WAIT, |rt| {
            rt.store.get(USER).is_some_and(|s| s.profile.email_verified)
        })
        .await);
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_hold_up_others() {
        let rt = TestRuntime::new();
        rt.store.stall_loads(7);

        // Far more than a bounded mailbox would take, plus worker events
        let flood = async {
            for _ in 0..500 {
                rt.send(7, text("hello")).await;
            }
            rt.worker_event(json!({
                "type": "CAPTCHA_URL", "user_id": 7, "appeal_id": 1,
                "answer_queue": "w1", "captcha": "http://captcha/x"
            }))
            .await;
            rt.worker_event(json!({"type": "FREE_WORKER", "answer_queue": "w2"}))
                .await;
        };
        assert!(tokio::time::timeout(WAIT, flood).await.is_ok());

        rt.send(USER, Event::UserCommand(crate::state_machine::event::Command::Help))
            .await;
        assert!(rt.wait_for_text(USER, &Notice::Help.render(), WAIT).await);
        assert_eq!(rt.pool.idle_count(), 1);
        assert!(rt.chat.sent_to(7).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_runtime_is_evicted_and_restarted() {
        let rt = TestRuntime::with_settings(SessionSettings {
            idle_timeout: Duration::from_secs(60),
            ..SessionSettings::default()
        });
        let mut s = ready_to_approve();
        s.state = ConvState::OperationalMode;
        rt.store.put(&s);

        rt.send(USER, action(UserAction::EditEmail, 501)).await;
        assert!(rt.wait_for_text(USER, &Notice::AskEmail.render(), WAIT).await);
        assert_eq!(rt.manager.active_sessions().await, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut evicted = false;
        for _ in 0..50 {
            if rt.manager.active_sessions().await == 0 {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(evicted, "idle runtime is still registered");

        // The next event starts a new runtime from the stored record
        rt.send(USER, text("petr@example.com")).await;
        assert!(rt.wait_for_text(USER, &Notice::EmailSaved.render(), WAIT).await);
        assert_eq!(rt.manager.active_sessions().await, 1);
        assert_eq!(
            rt.store.get(USER).unwrap().profile.email.as_deref(),
            Some("petr@example.com")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_captcha_keeps_runtime_alive() {
        let rt = TestRuntime::with_settings(SessionSettings {
            idle_timeout: Duration::from_secs(10),
            captcha_timeout: Duration::from_secs(60),
            ..SessionSettings::default()
        });
        approved(&rt).await;
        captcha_shown(&rt).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rt.manager.active_sessions().await, 1);

        let times_up = Notice::TimesUp { appeal_id: 500 }.render();
        assert!(
            rt.wait_for_text(USER, &times_up, Duration::from_secs(60))
                .await
        );
    }

    #[tokio::test]
    async fn test_sent_appeal_comes_back_as_a_document() {
        let rt = TestRuntime::new();
        approved(&rt).await;
        rt.worker_event(json!({
            "type": "OK", "user_id": USER, "appeal_id": 500, "answer_queue": "w1"
        }))
        .await;

        let caption = Notice::LetterCopy { appeal_id: 500 }.render();
        assert!(rt.wait_for_text(USER, &caption, WAIT).await);
        let copy = rt
            .chat
            .sent_to(USER)
            .into_iter()
            .find(|m| m.text == caption)
            .unwrap();
        let attachment = copy.attachment.unwrap();
        assert_eq!(attachment.file_name, "appeal_500.txt");
        assert!(attachment.content.contains("АВ 1234-7"));
        assert_eq!(copy.reply_to, Some(500));
    }

    #[tokio::test]
    async fn test_admin_bans_user_from_reporting() {
        const ADMIN: UserId = 1;
        let rt = TestRuntime::with_settings(SessionSettings {
            admin_chat_id: Some(ADMIN),
            ..SessionSettings::default()
        });
        let mut s = ready_to_approve();
        s.state = ConvState::OperationalMode;
        rt.store.put(&s);
        let ban = |args: &str| {
            Event::UserCommand(crate::state_machine::event::Command::Ban { args: args.into() })
        };
        let photo = || Event::UserPhoto {
            file_id: "file-9".into(),
            message_id: 700,
        };

        // Only the admin may ban
        rt.send(USER, ban("7 spam")).await;
        assert!(rt.wait_for_text(USER, &Notice::Irrelevant.render(), WAIT).await);

        rt.send(ADMIN, ban(&format!("{USER} fake reports"))).await;
        let banned = Notice::UserBanned { user_id: USER }.render();
        assert!(rt.wait_for_text(ADMIN, &banned, WAIT).await);

        rt.send(USER, photo()).await;
        let refused = Notice::Banned {
            reason: "fake reports".into(),
        }
        .render();
        assert!(rt.wait_for_text(USER, &refused, WAIT).await);
        assert_eq!(
            rt.store.get(USER).unwrap().state,
            ConvState::OperationalMode
        );

        rt.send(
            ADMIN,
            Event::UserCommand(crate::state_machine::event::Command::Unban {
                args: USER.to_string(),
            }),
        )
        .await;
        let unbanned = Notice::UserUnbanned { user_id: USER }.render();
        assert!(rt.wait_for_text(ADMIN, &unbanned, WAIT).await);

        rt.send(USER, photo()).await;
        let added = Notice::PhotoAdded { count: 1 }.render();
        assert!(rt.wait_for_text(USER, &added, WAIT).await);
    }
}
