//! Publisher/subscriber peer connection pair
//!
//! The media engine is abstract ([`MediaEngine`], [`PeerConnection`]); this
//! module only sequences negotiations against it.

use crate::signaling::SignalingError;
use crate::types::{IceCandidate, IceServer, PeerRole, SessionId, TrackInfo, TrackType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Creating or applying an SDP failed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// ICE candidate rejected
    #[error("ICE error: {0}")]
    Ice(String),

    /// The publisher is not created yet
    #[error("Publisher not created")]
    NoPublisher,

    /// No such local track
    #[error("Track not published: {0}")]
    TrackNotFound(TrackType),

    /// Peer connection already closed
    #[error("Peer connection closed")]
    Closed,

    /// Signaling exchange failed during negotiation
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Media engine failure
    #[error("Media engine error: {0}")]
    Engine(String),
}

/// ICE connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceState {
    /// Not started
    New,
    /// Checking candidates
    Checking,
    /// Connected
    Connected,
    /// Completed
    Completed,
    /// Lost connectivity, may recover
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

impl IceState {
    /// The connection can carry media or may still get there
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            Self::New | Self::Checking | Self::Connected | Self::Completed
        )
    }
}

/// Asynchronous notifications from a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    /// Local ICE candidate gathered
    IceCandidate {
        /// Source peer connection
        role: PeerRole,
        /// Candidate
        candidate: IceCandidate,
    },
    /// ICE state changed
    IceStateChanged {
        /// Source peer connection
        role: PeerRole,
        /// New state
        state: IceState,
    },
    /// Transceivers changed and a new offer is needed
    NegotiationNeeded {
        /// Source peer connection
        role: PeerRole,
    },
    /// A remote track appeared on the subscriber
    RemoteTrack {
        /// Session publishing the track
        session_id: SessionId,
        /// Track type
        track_type: TrackType,
        /// Engine track id
        track_id: String,
    },
}

/// Media engine capability set used by sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a peer connection reporting to `signals`
    ///
    /// `session_id` names the local stream of published tracks.
    async fn create_peer_connection(
        &self,
        role: PeerRole,
        session_id: &SessionId,
        ice_servers: &[IceServer],
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add receive-only audio and video transceivers
    async fn add_receive_transceivers(&self) -> Result<(), PeerError>;

    /// Add a local track; fires [`PeerSignal::NegotiationNeeded`]
    async fn add_track(&self, track_type: TrackType) -> Result<TrackInfo, PeerError>;

    /// Create an offer and set it as local description
    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError>;

    /// Create an answer and set it as local description
    async fn create_answer(&self) -> Result<String, PeerError>;

    /// Apply a remote offer
    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerError>;

    /// Apply a remote answer
    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Start or stop sending a local track
    async fn set_track_enabled(&self, track_type: TrackType, enabled: bool)
        -> Result<(), PeerError>;

    /// Keep only the listed simulcast encodings active
    async fn set_active_encodings(
        &self,
        track_type: TrackType,
        rids: &[String],
    ) -> Result<(), PeerError>;

    /// Current ICE state
    fn ice_state(&self) -> IceState;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// ICE health of both connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHealth {
    /// Publisher state, if created
    pub publisher: Option<IceState>,
    /// Subscriber state
    pub subscriber: IceState,
}

impl PeerHealth {
    /// Neither connection can carry media
    #[must_use]
    pub fn both_unusable(&self) -> bool {
        let publisher_unusable = self.publisher.map_or(true, |s| !s.is_usable());
        publisher_unusable && !self.subscriber.is_usable()
    }
}

#[derive(Default)]
struct CandidateBuffer {
    remote_described: bool,
    pending: Vec<IceCandidate>,
}

/// The two peer connections of a session
///
/// Negotiations are serialized per connection: a new offer/answer cycle waits
/// for the running one on the same connection. Failures abort only that cycle
/// and leave the previously negotiated state in place.
pub struct PeerConnectionPair {
    engine: Arc<dyn MediaEngine>,
    session_id: SessionId,
    ice_servers: Vec<IceServer>,
    signals: mpsc::UnboundedSender<PeerSignal>,
    subscriber: Arc<dyn PeerConnection>,
    publisher: tokio::sync::Mutex<Option<Arc<dyn PeerConnection>>>,
    publisher_ice: Mutex<Option<Arc<dyn PeerConnection>>>,
    subscriber_negotiation: tokio::sync::Mutex<()>,
    publisher_negotiation: tokio::sync::Mutex<()>,
    candidates: Mutex<HashMap<PeerRole, CandidateBuffer>>,
    published: Mutex<BTreeMap<TrackType, TrackInfo>>,
    closed: AtomicBool,
}

impl PeerConnectionPair {
    /// Create the receive-only subscriber; the publisher comes later
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot create the subscriber
    pub async fn new(
        engine: Arc<dyn MediaEngine>,
        session_id: SessionId,
        ice_servers: Vec<IceServer>,
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Self, PeerError> {
        let subscriber = engine
            .create_peer_connection(
                PeerRole::Subscriber,
                &session_id,
                &ice_servers,
                signals.clone(),
            )
            .await?;
        subscriber.add_receive_transceivers().await?;

        Ok(Self {
            engine,
            session_id,
            ice_servers,
            signals,
            subscriber,
            publisher: tokio::sync::Mutex::new(None),
            publisher_ice: Mutex::new(None),
            subscriber_negotiation: tokio::sync::Mutex::new(()),
            publisher_negotiation: tokio::sync::Mutex::new(()),
            candidates: Mutex::new(HashMap::new()),
            published: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Receive-only offer for the join request
    ///
    /// Produced by a throwaway connection that is closed right away; the real
    /// subscriber only ever answers.
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to produce the offer
    pub async fn create_subscriber_offer(&self) -> Result<String, PeerError> {
        self.ensure_open()?;
        let (sink, _) = mpsc::unbounded_channel();
        let scratch = self
            .engine
            .create_peer_connection(PeerRole::Subscriber, &self.session_id, &self.ice_servers, sink)
            .await?;
        let offer = async {
            scratch.add_receive_transceivers().await?;
            scratch.create_offer(false).await
        }
        .await;
        if let Err(e) = scratch.close().await {
            tracing::debug!(error = %e, "Closing scratch peer connection failed");
        }
        offer
    }

    /// Apply a subscriber offer from the SFU and produce the answer
    ///
    /// # Errors
    ///
    /// Returns error if applying the offer or creating the answer fails
    #[tracing::instrument(skip(self, sdp), fields(session_id = %self.session_id))]
    pub async fn apply_remote_offer(&self, sdp: &str) -> Result<String, PeerError> {
        self.ensure_open()?;
        let _negotiation = self.subscriber_negotiation.lock().await;
        self.subscriber.set_remote_offer(sdp).await?;
        self.flush_candidates(PeerRole::Subscriber, &self.subscriber)
            .await;
        self.subscriber.create_answer().await
    }

    /// Apply the SFU's answer to the publisher offer
    ///
    /// Waits for a running publisher negotiation first.
    ///
    /// # Errors
    ///
    /// Returns error if there is no publisher or the answer is rejected
    pub async fn apply_remote_answer(&self, sdp: &str) -> Result<(), PeerError> {
        self.ensure_open()?;
        let _negotiation = self.publisher_negotiation.lock().await;
        let publisher = self.publisher().await.ok_or(PeerError::NoPublisher)?;
        self.apply_publisher_answer(&publisher, sdp).await
    }

    // callers hold `publisher_negotiation`
    async fn apply_publisher_answer(
        &self,
        publisher: &Arc<dyn PeerConnection>,
        sdp: &str,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        publisher.set_remote_answer(sdp).await?;
        self.flush_candidates(PeerRole::Publisher, publisher).await;
        Ok(())
    }

    /// Run one publisher offer/answer cycle
    ///
    /// `exchange` sends the offer to the SFU and returns its answer. Cycles
    /// are serialized; a second call waits for the first.
    ///
    /// # Errors
    ///
    /// Returns error if any step fails; the previous negotiated state remains
    #[tracing::instrument(skip(self, exchange), fields(session_id = %self.session_id))]
    pub async fn negotiate_publisher<F, Fut>(
        &self,
        ice_restart: bool,
        exchange: F,
    ) -> Result<(), PeerError>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = Result<String, PeerError>> + Send,
    {
        self.ensure_open()?;
        let _negotiation = self.publisher_negotiation.lock().await;
        let publisher = self.publisher().await.ok_or(PeerError::NoPublisher)?;
        let offer = publisher.create_offer(ice_restart).await?;
        let answer = exchange(offer).await?;
        self.apply_publisher_answer(&publisher, &answer).await?;
        tracing::debug!(ice_restart, "Publisher negotiated");
        Ok(())
    }

    /// Add a remote candidate, buffering it until the connection has a
    /// remote description
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the candidate
    pub async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
        role: PeerRole,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let target = match role {
            PeerRole::Subscriber => Some(self.subscriber.clone()),
            PeerRole::Publisher => self.publisher_ice.lock().clone(),
        };
        {
            let mut candidates = self.candidates.lock();
            let buffer = candidates.entry(role).or_default();
            if target.is_none() || !buffer.remote_described {
                tracing::trace!(%role, "Buffering ICE candidate");
                buffer.pending.push(candidate);
                return Ok(());
            }
        }
        match target {
            Some(pc) => pc.add_ice_candidate(&candidate).await,
            None => Ok(()),
        }
    }

    async fn flush_candidates(&self, role: PeerRole, pc: &Arc<dyn PeerConnection>) {
        let pending = {
            let mut candidates = self.candidates.lock();
            let buffer = candidates.entry(role).or_default();
            buffer.remote_described = true;
            std::mem::take(&mut buffer.pending)
        };
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(&candidate).await {
                tracing::warn!(%role, error = %e, "Buffered ICE candidate rejected");
            }
        }
    }

    /// Create the publisher if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot create it
    pub async fn ensure_publisher(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.ensure_open()?;
        let mut publisher = self.publisher.lock().await;
        if let Some(pc) = publisher.as_ref() {
            return Ok(pc.clone());
        }
        tracing::info!(session_id = %self.session_id, "Creating publisher peer connection");
        let pc = self
            .engine
            .create_peer_connection(
                PeerRole::Publisher,
                &self.session_id,
                &self.ice_servers,
                self.signals.clone(),
            )
            .await?;
        *publisher = Some(pc.clone());
        *self.publisher_ice.lock() = Some(pc.clone());
        Ok(pc)
    }

    /// The publisher, if created
    pub async fn publisher(&self) -> Option<Arc<dyn PeerConnection>> {
        self.publisher.lock().await.clone()
    }

    /// Publish a local track, creating the publisher on first use
    ///
    /// Publishing is serialized with publisher negotiations, so concurrent
    /// calls for one track add it once.
    ///
    /// # Errors
    ///
    /// Returns error if the publisher cannot be created or the track added
    pub async fn publish_track(&self, track_type: TrackType) -> Result<TrackInfo, PeerError> {
        self.ensure_open()?;
        let _negotiation = self.publisher_negotiation.lock().await;
        if let Some(info) = self.published.lock().get(&track_type) {
            return Ok(info.clone());
        }
        let publisher = self.ensure_publisher().await?;
        let info = publisher.add_track(track_type).await?;
        self.published.lock().insert(track_type, info.clone());
        Ok(info)
    }

    /// Mute or unmute a published track
    ///
    /// # Errors
    ///
    /// Returns error if the track is not published or the engine fails
    pub async fn set_track_enabled(
        &self,
        track_type: TrackType,
        enabled: bool,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.published.lock().contains_key(&track_type) {
            return Err(PeerError::TrackNotFound(track_type));
        }
        let publisher = self.publisher().await.ok_or(PeerError::NoPublisher)?;
        publisher.set_track_enabled(track_type, enabled).await?;
        if let Some(info) = self.published.lock().get_mut(&track_type) {
            info.muted = !enabled;
        }
        Ok(())
    }

    /// Apply an SFU publish-quality instruction
    ///
    /// The local layer flags change only after the engine accepted the new
    /// encoding set.
    ///
    /// # Errors
    ///
    /// Returns error if the track is not published or the engine fails
    pub async fn apply_publish_quality(
        &self,
        track_type: TrackType,
        enabled_rids: &[String],
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.published.lock().contains_key(&track_type) {
            return Err(PeerError::TrackNotFound(track_type));
        }
        let publisher = self.publisher().await.ok_or(PeerError::NoPublisher)?;
        publisher
            .set_active_encodings(track_type, enabled_rids)
            .await?;
        if let Some(info) = self.published.lock().get_mut(&track_type) {
            for layer in &mut info.layers {
                layer.active = enabled_rids.iter().any(|rid| *rid == layer.rid);
            }
        }
        Ok(())
    }

    /// Tracks announced by the publisher
    #[must_use]
    pub fn published_tracks(&self) -> Vec<TrackInfo> {
        self.published.lock().values().cloned().collect()
    }

    /// ICE health of both connections
    #[must_use]
    pub fn health(&self) -> PeerHealth {
        PeerHealth {
            publisher: self.publisher_ice.lock().as_ref().map(|pc| pc.ice_state()),
            subscriber: self.subscriber.ice_state(),
        }
    }

    /// Whether [`PeerConnectionPair::close`] ran
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close both connections; only the first call does anything
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(publisher) = self.publisher.lock().await.take() {
            if let Err(e) = publisher.close().await {
                tracing::warn!(error = %e, "Closing publisher failed");
            }
        }
        self.publisher_ice.lock().take();
        if let Err(e) = self.subscriber.close().await {
            tracing::warn!(error = %e, "Closing subscriber failed");
        }
        self.candidates.lock().clear();
        tracing::debug!(session_id = %self.session_id, "Peer connections closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackMediaEngine;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.1 {n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    async fn pair() -> (Arc<LoopbackMediaEngine>, PeerConnectionPair) {
        let engine = Arc::new(LoopbackMediaEngine::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pair = PeerConnectionPair::new(engine.clone(), SessionId::from("s1"), Vec::new(), tx)
            .await
            .unwrap();
        (engine, pair)
    }

    #[tokio::test]
    async fn test_subscriber_offer_uses_scratch_connection() {
        let (engine, pair) = pair().await;
        let offer = pair.create_subscriber_offer().await.unwrap();
        assert!(offer.contains("recvonly"));
        // subscriber + scratch
        assert_eq!(engine.created(), 2);
        assert_eq!(engine.closed(), 1);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (engine, pair) = pair().await;
        pair.add_ice_candidate(candidate(1), PeerRole::Subscriber)
            .await
            .unwrap();
        pair.add_ice_candidate(candidate(2), PeerRole::Publisher)
            .await
            .unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Subscriber), 0);

        pair.apply_remote_offer("v=0 offer").await.unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Subscriber), 1);

        pair.add_ice_candidate(candidate(3), PeerRole::Subscriber)
            .await
            .unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Subscriber), 2);

        // publisher candidates wait for the publisher and its answer
        pair.publish_track(TrackType::Audio).await.unwrap();
        pair.negotiate_publisher(false, |_offer| async { Ok("v=0 answer".to_string()) })
            .await
            .unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Publisher), 1);
    }

    #[tokio::test]
    async fn test_publisher_created_lazily() {
        let (engine, pair) = pair().await;
        assert!(pair.publisher().await.is_none());
        assert!(matches!(
            pair.negotiate_publisher(false, |_| async { Ok(String::new()) })
                .await,
            Err(PeerError::NoPublisher)
        ));

        pair.publish_track(TrackType::Video).await.unwrap();
        pair.publish_track(TrackType::Video).await.unwrap();
        assert!(pair.publisher().await.is_some());
        assert_eq!(engine.created(), 2);
        assert_eq!(pair.published_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_publish_adds_track_once() {
        let (engine, pair) = pair().await;
        let (a, b) = tokio::join!(
            pair.publish_track(TrackType::Video),
            pair.publish_track(TrackType::Video),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(engine.tracks_added(), 1);
        assert_eq!(engine.created(), 2);
    }

    #[tokio::test]
    async fn test_remote_answer_flushes_publisher_candidates() {
        let (engine, pair) = pair().await;
        assert!(matches!(
            pair.apply_remote_answer("v=0 answer").await,
            Err(PeerError::NoPublisher)
        ));

        pair.add_ice_candidate(candidate(1), PeerRole::Publisher)
            .await
            .unwrap();
        pair.publish_track(TrackType::Audio).await.unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Publisher), 0);

        pair.apply_remote_answer("v=0 answer").await.unwrap();
        assert_eq!(engine.applied_candidates(PeerRole::Publisher), 1);
    }

    #[tokio::test]
    async fn test_failed_quality_change_keeps_layers() {
        let (engine, pair) = pair().await;
        pair.publish_track(TrackType::Video).await.unwrap();

        pair.apply_publish_quality(TrackType::Video, &["q".to_string()])
            .await
            .unwrap();
        let layers = pair.published_tracks()[0].layers.clone();
        assert_eq!(
            layers.iter().filter(|l| l.active).count(),
            1,
            "only q stays active"
        );

        engine.fail_encodings(true);
        assert!(pair
            .apply_publish_quality(TrackType::Video, &["f".to_string()])
            .await
            .is_err());
        assert_eq!(pair.published_tracks()[0].layers, layers);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (engine, pair) = pair().await;
        pair.publish_track(TrackType::Audio).await.unwrap();
        pair.close().await;
        pair.close().await;
        assert!(pair.is_closed());
        assert_eq!(engine.closed(), 2);
        assert!(matches!(
            pair.apply_remote_offer("v=0").await,
            Err(PeerError::Closed)
        ));
    }

    #[test]
    fn test_health() {
        let health = PeerHealth {
            publisher: None,
            subscriber: IceState::Failed,
        };
        assert!(health.both_unusable());
        let health = PeerHealth {
            publisher: Some(IceState::Connected),
            subscriber: IceState::Failed,
        };
        assert!(!health.both_unusable());
    }
}
