//! SFU call core - session, signaling and reconnection for SFU-hosted calls
//!
//! A client joins a call through a coordinator, is pointed at one SFU, and
//! talks to it over a signaling channel while exchanging media through a
//! publisher/subscriber pair of peer connections. This crate owns:
//!
//! - **Sessions**: one [`CallSession`] per SFU connection, with offer/answer,
//!   ICE trickle and debounced subscription and mute-state sync
//! - **Reconnection**: fast reconnect, full rejoin and SFU migration, driven
//!   by network changes, peer health and SFU hints ([`ReconnectCoordinator`])
//! - **Lifecycle**: connection and ringing state machines
//! - **Loopback**: an in-memory SFU, coordinator and media engine for tests
//!   and simulation
//!
//! # Examples
//!
//! ```rust,no_run
//! use sfu_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let sfu = LoopbackSfu::new();
//! let api = Arc::new(LoopbackCoordinator::new(vec!["wss://sfu-a".to_string()]));
//! let engine = Arc::new(LoopbackMediaEngine::new());
//!
//! let coordinator = ReconnectCoordinator::new(
//!     "alice".to_string(),
//!     api,
//!     Arc::new(sfu),
//!     engine,
//!     ClientConfig::default(),
//! )?;
//!
//! coordinator.join(JoinCallRequest::new("default:standup")).await?;
//! coordinator.set_local_track_enabled(TrackType::Audio, true).await?;
//! coordinator.leave("done");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Identifiers and shared data model
pub mod types;

/// Client configuration
pub mod config;

/// SFU signaling protocol and handler
pub mod signaling;

/// Coordinator join-call API
pub mod coordinator_api;

/// Retry-while-current utility
pub mod retry;

/// Keyed single-flight runner
pub mod single_flight;

/// Publisher/subscriber peer connections
pub mod peer;

/// Media engine over the webrtc crate (requires webrtc-engine feature)
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

/// Subscription and mute-state synchronization
pub mod track_sync;

/// Connection and ringing state machines
pub mod lifecycle;

/// Per-session counters
pub mod stats;

/// One SFU session
pub mod session;

/// Reconnect strategies and call-level orchestration
pub mod coordinator;

/// Upward event surface
pub mod events;

/// In-memory SFU, coordinator and media engine
pub mod loopback;

// Re-export main types at crate root
pub use config::{ClientConfig, ConfigError, JoinRetryConfig, SyncRetryConfig};
pub use coordinator::{select_strategy, CoordinatorError, ReconnectCoordinator};
pub use coordinator_api::{CoordinatorApi, JoinCallRequest};
pub use events::{CallEvent, EventBus};
pub use lifecycle::{
    derive_ringing_state, ConnectionLifecycle, ConnectionState, LifecycleError, RingingEvent,
    RingingInputs, RingingState, RingingTracker,
};
pub use loopback::{LoopbackCoordinator, LoopbackMediaEngine, LoopbackSfu, Rpc};
pub use peer::{
    IceState, MediaEngine, PeerConnection, PeerConnectionPair, PeerError, PeerHealth, PeerSignal,
};
pub use retry::{retry_while_current, Relevance, RetryOutcome, RetryPolicy};
pub use session::{CallSession, SessionError, SessionNotice, SessionState};
pub use signaling::{
    ErrorClass, ReconnectHint, SfuEvent, SignalingChannel, SignalingError, SignalingHandler,
    SignalingTransport,
};
pub use single_flight::SingleFlight;
pub use stats::SessionStats;
pub use track_sync::{desired_subscriptions, SubscriptionInputs, TrackSyncEngine, VideoOverride};
pub use types::*;
#[cfg(feature = "webrtc-engine")]
pub use webrtc_engine::WebRtcMediaEngine;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ClientConfig;
    pub use crate::coordinator::{CoordinatorError, ReconnectCoordinator};
    pub use crate::coordinator_api::{CoordinatorApi, JoinCallRequest};
    pub use crate::events::CallEvent;
    pub use crate::lifecycle::{ConnectionState, RingingEvent, RingingState};
    pub use crate::loopback::{LoopbackCoordinator, LoopbackMediaEngine, LoopbackSfu};
    pub use crate::peer::MediaEngine;
    pub use crate::signaling::{SignalingTransport, SfuEvent};
    pub use crate::types::{
        PeerRole, ReconnectStrategy, SessionId, TrackSubscriptionDetail, TrackType,
        VideoDimension,
    };
}
