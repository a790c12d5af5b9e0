//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::event::Command;
use super::session::SenderProfile;
use super::*;
use crate::appeal::{Appeal, AppealPayload, AppealStatus};
use crate::ids::{AppealId, WorkerHandle};
use crate::notice::UserAction;
use crate::protocol::wire::{AppealEvent, AppealEventKind};
use chrono::Utc;
use proptest::prelude::*;
use std::collections::HashMap;

const USER: i64 = 42;
const MAX_DEPTH: usize = 3;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new(USER)
}

/// Registered user with four appeals waiting for a worker
fn busy_session() -> UserSession {
    let mut s = UserSession::new(USER, MAX_DEPTH);
    s.profile = SenderProfile {
        first_name: Some("Ivan".into()),
        last_name: Some("Ivanov".into()),
        email: Some("ivan@example.com".into()),
        email_verified: true,
        city: Some("Minsk".into()),
        street: Some("Nezavisimosti".into()),
        house: Some("1".into()),
        ..SenderProfile::default()
    };
    s.state = ConvState::OperationalMode;
    for appeal_id in 1..=4 {
        let mut appeal = Appeal::new(AppealPayload {
            user_id: USER,
            appeal_id,
            ..AppealPayload::default()
        });
        appeal.attachments_ready = true;
        s.appeals.insert(appeal);
    }
    s
}

fn worker(appeal_id: AppealId, kind: AppealEventKind) -> Event {
    Event::Worker(AppealEvent {
        user_id: USER,
        appeal_id,
        worker: WorkerHandle::new(format!("w{appeal_id}")),
        kind,
    })
}

fn action(action: UserAction) -> Event {
    Event::UserAction {
        action,
        message_id: 1000,
        received_at: Utc::now(),
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_appeal_id() -> impl Strategy<Value = AppealId> {
    1i64..=4
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => (arb_appeal_id(), "[a-z]{1,8}").prop_map(|(a, path)| {
            worker(a, AppealEventKind::CaptchaRequired { url: format!("http://captcha/{path}") })
        }),
        2 => arb_appeal_id().prop_map(|a| worker(a, AppealEventKind::Success)),
        1 => arb_appeal_id().prop_map(|a| worker(a, AppealEventKind::CaptchaAccepted)),
        2 => (arb_appeal_id(), 0..4u64)
            .prop_map(|(appeal_id, seq)| Event::CaptchaTimeout { appeal_id, seq }),
        3 => "[A-Z0-9]{1,6}".prop_map(|text| Event::UserText { text, message_id: 1 }),
        1 => Just(action(UserAction::Cancel)),
        1 => arb_appeal_id().prop_map(|appeal_id| action(UserAction::CancelCaptcha { appeal_id })),
        1 => Just(Event::UserCommand(Command::Feedback)),
        1 => Just(Event::UserCommand(Command::Start)),
        1 => arb_appeal_id().prop_map(|appeal_id| Event::CommandFailed {
            appeal_id,
            worker: None,
            reason: "publish failed".into(),
        }),
    ]
}

fn arb_suspend_target() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        Just(ConvState::FeedbackEntry),
        Just(ConvState::FeedbackAnswering),
        Just(ConvState::EmailPasswordEntry),
        (1i64..100).prop_map(|appeal_id| ConvState::EnteringCaptcha { appeal_id }),
    ]
}

// ============================================================================
// Invariant Checkers
// ============================================================================

/// Open captcha prompts and appeals awaiting an answer match one to one
fn captchas_match_appeals(s: &UserSession) -> bool {
    let awaiting: Vec<AppealId> = s
        .appeals
        .iter()
        .filter(|a| a.status == AppealStatus::AwaitingCaptcha)
        .map(|a| a.id)
        .collect();
    awaiting.len() == s.captchas.len() && awaiting.iter().all(|a| s.captcha_for(*a).is_some())
}

fn current_captcha_is_open(s: &UserSession) -> bool {
    match s.state {
        ConvState::EnteringCaptcha { appeal_id } => s.captcha_for(appeal_id).is_some(),
        _ => true,
    }
}

fn finalization_key(effect: &Effect) -> Option<AppealId> {
    match effect {
        Effect::ClearAttachments { appeal_id } => Some(*appeal_id),
        _ => None,
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Stacks stay bounded and captcha bookkeeping stays consistent
    #[test]
    fn prop_random_traffic_preserves_invariants(
        events in proptest::collection::vec(arb_event(), 0..40)
    ) {
        let ctx = test_context();
        let mut session = busy_session();
        let mut finalized: HashMap<AppealId, usize> = HashMap::new();

        for event in events {
            let Ok(result) = transition(&session, &ctx, event) else {
                continue;
            };
            session = result.new_session;

            for appeal_id in result.effects.iter().filter_map(finalization_key) {
                *finalized.entry(appeal_id).or_default() += 1;
            }

            prop_assert!(session.interrupts.len() <= MAX_DEPTH);
            prop_assert!(session.captchas.len() <= MAX_DEPTH);
            prop_assert!(captchas_match_appeals(&session), "captchas out of sync: {:?}", session);
            prop_assert!(current_captcha_is_open(&session), "dangling prompt: {:?}", session.state);
            prop_assert!(session.appeals.iter().all(|a| !a.status.is_terminal()));
        }

        for (appeal_id, count) in finalized {
            prop_assert_eq!(count, 1, "appeal {} finalized {} times", appeal_id, count);
        }
    }

    // Suspending then resuming everything restores the starting state
    #[test]
    fn prop_suspend_resume_is_lifo(
        targets in proptest::collection::vec(arb_suspend_target(), 0..10)
    ) {
        let mut session = UserSession::new(USER, 32);
        session.state = ConvState::ViolationPhotoCollection;

        let mut pushed = 0;
        for target in targets {
            let before = session.interrupts.len();
            session.suspend(target).unwrap();
            pushed += session.interrupts.len() - before;
        }
        for _ in 0..pushed {
            session.resume();
        }
        prop_assert_eq!(&session.state, &ConvState::ViolationPhotoCollection);
        prop_assert!(session.interrupts.is_empty());

        prop_assert_eq!(session.resume(), &ConvState::OperationalMode);
    }

    // A repeated terminal event never runs cleanup twice
    #[test]
    fn prop_success_is_idempotent(appeal_id in arb_appeal_id(), repeats in 2usize..5) {
        let ctx = test_context();
        let mut session = busy_session();
        let mut releases = 0;

        for _ in 0..repeats {
            match transition(&session, &ctx, worker(appeal_id, AppealEventKind::Success)) {
                Ok(result) => {
                    releases += result
                        .effects
                        .iter()
                        .filter(|e| matches!(e, Effect::ReleaseWorker { .. }))
                        .count();
                    session = result.new_session;
                }
                Err(err) => {
                    prop_assert_eq!(err, TransitionError::StaleEvent { appeal_id });
                }
            }
        }
        prop_assert_eq!(releases, 1);
        prop_assert!(session.appeals.get(appeal_id).is_none());
    }
}
