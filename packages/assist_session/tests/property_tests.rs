use std::time::{Duration, Instant};

use proptest::prelude::*;

use assist_session::metrics::MIN_ESTIMATED_TOKENS;
use assist_session::turn::{FailureReason, TurnChannel, TurnKind};
use assist_session::{
    AssistantReply, Envelope, MetricsAggregator, ReconnectPolicy, StateStore, TurnController,
    TurnError, TurnStatus, classify, estimate_tokens,
};

// --- Backoff ---

fn arb_policy() -> impl Strategy<Value = ReconnectPolicy> {
    (1u32..=20, 1u64..=5_000, 1u64..=60_000).prop_map(|(max_attempts, base_ms, cap_ms)| {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms.max(base_ms)),
        }
    })
}

proptest! {
    #[test]
    fn backoff_matches_formula(policy in arb_policy()) {
        // Attempt n (1-based) waits min(cap, base * 1.5^(n-1)).
        for n in 1..=policy.max_attempts {
            let expected = (policy.base_delay.as_secs_f64() * 1.5f64.powi(n as i32 - 1))
                .min(policy.max_delay.as_secs_f64());
            let actual = policy.delay_for(n - 1).as_secs_f64();
            prop_assert!((actual - expected).abs() < 1e-6, "n={} expected={} actual={}", n, expected, actual);
        }
    }

    #[test]
    fn backoff_monotonic_and_capped(policy in arb_policy()) {
        let mut previous = Duration::ZERO;
        for n in 0..policy.max_attempts + 5 {
            let delay = policy.delay_for(n);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }
}

// --- Tokens ---

fn arb_reply() -> impl Strategy<Value = AssistantReply> {
    (proptest::option::of(0u64..10_000), ".{0,200}").prop_map(|(tokens, text)| AssistantReply {
        text,
        tokens,
        model: None,
    })
}

proptest! {
    #[test]
    fn estimate_never_below_floor(text in ".{0,500}") {
        prop_assert!(estimate_tokens(&text) >= MIN_ESTIMATED_TOKENS);
    }

    #[test]
    fn estimate_grows_with_text(a in ".{0,200}", b in ".{0,200}") {
        let joined = format!("{a}{b}");
        prop_assert!(estimate_tokens(&joined) >= estimate_tokens(&a));
    }

    #[test]
    fn total_tokens_never_decrease(replies in proptest::collection::vec(arb_reply(), 0..30)) {
        let mut store = StateStore::in_memory();
        let mut metrics = MetricsAggregator::new();
        let mut previous = 0;
        for reply in &replies {
            let (_, fields) = metrics.record_reply(reply, None);
            store.update_all(fields).unwrap();
            let total = store.state().session.total_tokens;
            prop_assert!(total >= previous);
            previous = total;
        }
        prop_assert_eq!(previous, metrics.snapshot().total_tokens);
    }
}

// --- Turns ---

#[derive(Debug, Clone)]
enum TurnOp {
    StartChat { delivered: bool },
    StartWork,
    SocketReply,
    SocketError,
    Disconnect,
    HttpDone { matching: bool, ok: bool },
    Expire,
}

fn arb_turn_op() -> impl Strategy<Value = TurnOp> {
    prop_oneof![
        any::<bool>().prop_map(|delivered| TurnOp::StartChat { delivered }),
        Just(TurnOp::StartWork),
        Just(TurnOp::SocketReply),
        Just(TurnOp::SocketError),
        Just(TurnOp::Disconnect),
        (any::<bool>(), any::<bool>()).prop_map(|(matching, ok)| TurnOp::HttpDone { matching, ok }),
        Just(TurnOp::Expire),
    ]
}

proptest! {
    #[test]
    fn at_most_one_turn_awaiting(ops in proptest::collection::vec(arb_turn_op(), 1..60)) {
        let mut turns = TurnController::new(Some(Duration::from_secs(60)));

        for op in ops {
            let before = turns.pending().map(|t| t.id);
            let now = Instant::now();
            match op {
                TurnOp::StartChat { delivered } => {
                    let result = turns.start_turn(TurnKind::Chat, TurnChannel::WebSocket, |_| delivered);
                    if let Some(pending) = before {
                        // Rejected without dispatching; existing turn untouched.
                        prop_assert_eq!(result, Err(TurnError::AlreadyPending { pending }));
                        prop_assert_eq!(turns.pending().map(|t| t.id), Some(pending));
                    } else if !delivered {
                        prop_assert!(matches!(result, Err(TurnError::DeliveryFailed { .. })), "expected DeliveryFailed, got {:?}", result);
                        prop_assert_eq!(turns.status(), TurnStatus::Idle);
                    }
                }
                TurnOp::StartWork => {
                    let _ = turns.start_turn(TurnKind::StartWork, TurnChannel::Http, |_| true);
                }
                TurnOp::SocketReply => {
                    turns.on_socket_response(now);
                }
                TurnOp::SocketError => {
                    turns.on_socket_error("boom", now);
                }
                TurnOp::Disconnect => {
                    turns.on_disconnected(now);
                }
                TurnOp::HttpDone { matching, ok } => {
                    let id = match (matching, before) {
                        (true, Some(id)) => id,
                        _ => assist_session::TurnId::new(),
                    };
                    let result = if ok { Ok(()) } else { Err(FailureReason::Backend("no".into())) };
                    turns.on_http_result(id, result, now);
                }
                TurnOp::Expire => {
                    turns.check_timeout(now + Duration::from_secs(120));
                }
            }

            let status = turns.status();
            prop_assert!(matches!(status, TurnStatus::Idle | TurnStatus::AwaitingResponse));
            prop_assert_eq!(turns.pending().is_some(), status == TurnStatus::AwaitingResponse);
        }
    }
}

// --- Classification ---

proptest! {
    #[test]
    fn message_field_round_trips(text in ".{0,200}") {
        let frame = serde_json::json!({ "message": text }).to_string();
        match classify(&frame) {
            Envelope::AssistantResponse(reply) => prop_assert_eq!(reply.text, text),
            other => prop_assert!(false, "unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn classify_never_panics(raw in ".{0,300}") {
        let _ = classify(&raw);
    }
}
