//! Ringing state derivation

use proptest::prelude::*;
use sfu_call_core::{
    derive_ringing_state, CallEvent, ClientConfig, JoinCallRequest, LoopbackCoordinator,
    LoopbackMediaEngine, LoopbackSfu, ReconnectCoordinator, RingingEvent, RingingState,
    RingingTracker,
};
use std::sync::Arc;

const MEMBERS: [&str; 4] = ["me", "a", "b", "c"];

fn member() -> impl Strategy<Value = String> {
    prop::sample::select(MEMBERS.to_vec()).prop_map(String::from)
}

fn commuting_event() -> impl Strategy<Value = RingingEvent> {
    prop_oneof![
        member().prop_map(|user_id| RingingEvent::Accepted { user_id }),
        member().prop_map(|user_id| RingingEvent::Rejected { user_id }),
        member().prop_map(|user_id| RingingEvent::ParticipantJoined { user_id }),
        Just(RingingEvent::AutoCancelElapsed),
    ]
}

fn run(created_by: &str, events: &[RingingEvent]) -> RingingTracker {
    let mut tracker = RingingTracker::new("me");
    tracker.apply(RingingEvent::Ring {
        created_by: created_by.to_string(),
        members: MEMBERS.iter().map(|m| m.to_string()).collect(),
    });
    for event in events {
        tracker.apply(event.clone());
    }
    tracker
}

proptest! {
    #[test]
    fn state_is_independent_of_event_order(
        created_by in member(),
        (events, shuffled) in prop::collection::vec(commuting_event(), 0..12)
            .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle())),
    ) {
        let a = run(&created_by, &events);
        let b = run(&created_by, &shuffled);
        prop_assert_eq!(a.state(), b.state());
        prop_assert_eq!(a.inputs(), b.inputs());
    }

    #[test]
    fn tracker_matches_fresh_derivation(
        created_by in member(),
        events in prop::collection::vec(commuting_event(), 0..12),
    ) {
        let tracker = run(&created_by, &events);
        prop_assert_eq!(tracker.state(), &derive_ringing_state(tracker.inputs()));
    }

    #[test]
    fn joining_is_always_active(
        created_by in member(),
        events in prop::collection::vec(commuting_event(), 0..12),
    ) {
        let mut tracker = run(&created_by, &events);
        tracker.apply(RingingEvent::ParticipantJoined { user_id: "me".into() });
        prop_assert_eq!(tracker.state(), &RingingState::Active);
    }
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_becomes_active_on_join() {
    let coordinator = ReconnectCoordinator::new(
        "me",
        Arc::new(LoopbackCoordinator::new(["https://sfu-1"])),
        Arc::new(LoopbackSfu::new()),
        Arc::new(LoopbackMediaEngine::new()),
        ClientConfig::default(),
    )
    .unwrap();
    let mut events = coordinator.events();

    coordinator.on_ringing_event(RingingEvent::Ring {
        created_by: "me".into(),
        members: vec!["me".into(), "a".into()],
    });
    coordinator.on_ringing_event(RingingEvent::Accepted {
        user_id: "a".into(),
    });
    coordinator
        .join(JoinCallRequest::new("default:ring"))
        .await
        .unwrap();
    coordinator.leave("hang up");
    coordinator.wait_left().await;

    let mut ringing = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::RingingChanged(state) = event {
            ringing.push(state);
        }
    }
    assert_eq!(
        ringing,
        vec![
            RingingState::Outgoing {
                accepted_by_callee: false
            },
            RingingState::Outgoing {
                accepted_by_callee: true
            },
            RingingState::Active,
            RingingState::Outgoing {
                accepted_by_callee: true
            },
        ]
    );
}
