//! In-memory SFU, coordinator and media engine
//!
//! Deterministic stand-ins for the network-facing collaborators. They record
//! every request, can be scripted to fail or stall, and let callers push SFU
//! events into a live connection. Used by the test suite and by the
//! `simulate` CLI command.

use crate::coordinator_api::{CoordinatorApi, JoinCallRequest};
use crate::peer::{IceState, MediaEngine, PeerConnection, PeerError, PeerSignal};
use crate::signaling::{
    JoinRequest, SfuEvent, SignalingChannel, SignalingConnection, SignalingError,
    SignalingTransport, TrackMuteState,
};
use crate::stats::SessionStats;
use crate::types::{
    CallSettings, IceCandidate, IceServer, JoinCallResponse, ParticipantInfo, PeerRole,
    ReconnectStrategy, SessionId, SfuEndpoint, TrackInfo, TrackSubscriptionDetail, TrackType,
    VideoLayer,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffered events per loopback connection
const EVENT_BUFFER: usize = 64;

/// A request received by [`LoopbackSfu`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    /// Join request
    Join {
        /// SFU that received it
        sfu: String,
        /// Request
        request: JoinRequest,
    },
    /// Subscriber answer
    SendAnswer {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Answer SDP
        sdp: String,
    },
    /// Local ICE candidate
    IceTrickle {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Source connection
        role: PeerRole,
    },
    /// Publisher offer
    SetPublisher {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Announced tracks
        tracks: Vec<TrackInfo>,
    },
    /// Subscription set
    UpdateSubscriptions {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Complete set
        tracks: Vec<TrackSubscriptionDetail>,
    },
    /// Mute-state set
    UpdateMuteStates {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Complete set
        states: Vec<TrackMuteState>,
    },
    /// ICE restart request
    IceRestart {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Connection to restart
        role: PeerRole,
    },
    /// Stats report
    SendStats {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Counters
        stats: SessionStats,
    },
    /// Leave notification
    Leave {
        /// SFU that received it
        sfu: String,
        /// Sending session
        session_id: SessionId,
        /// Reason
        reason: String,
    },
}

impl Rpc {
    /// RPC name, as accepted by [`LoopbackSfu::fail_next`]
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SendAnswer { .. } => "send_answer",
            Self::IceTrickle { .. } => "ice_trickle",
            Self::SetPublisher { .. } => "set_publisher",
            Self::UpdateSubscriptions { .. } => "update_subscriptions",
            Self::UpdateMuteStates { .. } => "update_mute_states",
            Self::IceRestart { .. } => "ice_restart",
            Self::SendStats { .. } => "send_stats",
            Self::Leave { .. } => "leave",
        }
    }

    /// SFU that received the request
    #[must_use]
    pub fn sfu(&self) -> &str {
        match self {
            Self::Join { sfu, .. }
            | Self::SendAnswer { sfu, .. }
            | Self::IceTrickle { sfu, .. }
            | Self::SetPublisher { sfu, .. }
            | Self::UpdateSubscriptions { sfu, .. }
            | Self::UpdateMuteStates { sfu, .. }
            | Self::IceRestart { sfu, .. }
            | Self::SendStats { sfu, .. }
            | Self::Leave { sfu, .. } => sfu,
        }
    }
}

struct Slot {
    events: Mutex<Option<mpsc::Sender<SfuEvent>>>,
    closed: AtomicBool,
}

impl Slot {
    fn push(&self, event: SfuEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    fn drop_socket(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().take();
    }
}

#[derive(Default)]
struct SfuState {
    rpcs: Vec<Rpc>,
    failures: HashMap<&'static str, VecDeque<SignalingError>>,
    connect_failures: VecDeque<SignalingError>,
    connections: HashMap<String, Arc<Slot>>,
    participants: Vec<ParticipantInfo>,
    silent: bool,
    delays: HashMap<&'static str, Duration>,
    offers: u64,
}

/// In-memory SFU implementing [`SignalingTransport`]
///
/// Every endpoint URL is a separate SFU sharing one request log. A join is
/// answered with a join response and, unless it is a fast reconnect, a
/// subscriber offer.
#[derive(Clone, Default)]
pub struct LoopbackSfu {
    state: Arc<Mutex<SfuState>>,
}

impl LoopbackSfu {
    /// Create an SFU with no participants
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Participants reported in join responses
    pub fn set_participants(&self, participants: Vec<ParticipantInfo>) {
        self.state.lock().participants = participants;
    }

    /// Stop answering joins
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Delay every call of `rpc` before it is recorded and answered
    pub fn set_delay(&self, rpc: &'static str, delay: Duration) {
        self.state.lock().delays.insert(rpc, delay);
    }

    /// Fail the next `times` calls of `rpc` with `error`
    pub fn fail_next(&self, rpc: &'static str, error: SignalingError, times: usize) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(rpc).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail the next `times` socket connects with `error`
    pub fn fail_connect(&self, error: SignalingError, times: usize) {
        self.state
            .lock()
            .connect_failures
            .extend(std::iter::repeat(error).take(times));
    }

    /// Push an event into the latest connection to `sfu`
    ///
    /// Returns `false` if there is no open connection.
    pub fn inject(&self, sfu: &str, event: SfuEvent) -> bool {
        let slot = self.state.lock().connections.get(sfu).cloned();
        slot.map_or(false, |slot| slot.push(event))
    }

    /// Close the latest connection to `sfu` from the server side
    pub fn drop_connection(&self, sfu: &str) {
        if let Some(slot) = self.state.lock().connections.remove(sfu) {
            slot.drop_socket();
        }
    }

    /// All requests received so far
    #[must_use]
    pub fn rpcs(&self) -> Vec<Rpc> {
        self.state.lock().rpcs.clone()
    }

    /// Number of requests matching `predicate`
    pub fn count(&self, predicate: impl Fn(&Rpc) -> bool) -> usize {
        self.state.lock().rpcs.iter().filter(|r| predicate(r)).count()
    }

    /// Forget recorded requests
    pub fn clear(&self) {
        self.state.lock().rpcs.clear();
    }
}

#[async_trait]
impl SignalingTransport for LoopbackSfu {
    async fn connect(&self, endpoint: &SfuEndpoint) -> Result<SignalingConnection, SignalingError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let slot = Arc::new(Slot {
            events: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        {
            let mut state = self.state.lock();
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            state.connections.insert(endpoint.url.clone(), slot.clone());
        }
        tracing::debug!(sfu = %endpoint.url, "Loopback socket open");
        Ok(SignalingConnection {
            channel: Arc::new(LoopbackChannel {
                sfu: endpoint.url.clone(),
                state: self.state.clone(),
                slot,
            }),
            events: rx,
        })
    }
}

struct LoopbackChannel {
    sfu: String,
    state: Arc<Mutex<SfuState>>,
    slot: Arc<Slot>,
}

impl LoopbackChannel {
    async fn call(&self, rpc: Rpc) -> Result<(), SignalingError> {
        if self.slot.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionClosed);
        }
        let name = rpc.name();
        let delay = self.state.lock().delays.get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.rpcs.push(rpc);
        match state.failures.get_mut(name).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_offer(&self) -> SfuEvent {
        let n = {
            let mut state = self.state.lock();
            state.offers += 1;
            state.offers
        };
        SfuEvent::SubscriberOffer {
            sdp: format!("v=0\r\no=sfu {n} 1 IN IP4 127.0.0.1\r\ns=loopback\r\na=sendonly\r\n"),
        }
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn join(&self, request: JoinRequest) -> Result<(), SignalingError> {
        let fast = request
            .reconnect
            .as_ref()
            .map_or(false, |c| c.strategy == ReconnectStrategy::Fast);
        self.call(Rpc::Join {
            sfu: self.sfu.clone(),
            request,
        })
        .await?;

        let (silent, participants) = {
            let state = self.state.lock();
            (state.silent, state.participants.clone())
        };
        if silent {
            return Ok(());
        }
        self.slot.push(SfuEvent::JoinResponse {
            participants,
            fast_reconnected: fast,
        });
        if !fast {
            self.slot.push(self.next_offer());
        }
        Ok(())
    }

    async fn send_answer(&self, session_id: &SessionId, sdp: String) -> Result<(), SignalingError> {
        self.call(Rpc::SendAnswer {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            sdp,
        })
        .await
    }

    async fn ice_trickle(
        &self,
        session_id: &SessionId,
        role: PeerRole,
        _candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.call(Rpc::IceTrickle {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            role,
        })
        .await
    }

    async fn set_publisher(
        &self,
        session_id: &SessionId,
        sdp: String,
        tracks: Vec<TrackInfo>,
    ) -> Result<String, SignalingError> {
        self.call(Rpc::SetPublisher {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            tracks,
        })
        .await?;
        Ok(format!("answer:{sdp}"))
    }

    async fn update_subscriptions(
        &self,
        session_id: &SessionId,
        tracks: Vec<TrackSubscriptionDetail>,
    ) -> Result<(), SignalingError> {
        self.call(Rpc::UpdateSubscriptions {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            tracks,
        })
        .await
    }

    async fn update_mute_states(
        &self,
        session_id: &SessionId,
        states: Vec<TrackMuteState>,
    ) -> Result<(), SignalingError> {
        self.call(Rpc::UpdateMuteStates {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            states,
        })
        .await
    }

    async fn ice_restart(&self, session_id: &SessionId, role: PeerRole) -> Result<(), SignalingError> {
        self.call(Rpc::IceRestart {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            role,
        })
        .await?;
        if role == PeerRole::Subscriber {
            self.slot.push(self.next_offer());
        }
        Ok(())
    }

    async fn send_stats(&self, session_id: &SessionId, stats: SessionStats) -> Result<(), SignalingError> {
        self.call(Rpc::SendStats {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            stats,
        })
        .await
    }

    async fn leave(&self, session_id: &SessionId, reason: String) -> Result<(), SignalingError> {
        self.call(Rpc::Leave {
            sfu: self.sfu.clone(),
            session_id: session_id.clone(),
            reason,
        })
        .await
    }

    async fn close(&self) {
        self.slot.drop_socket();
        let mut state = self.state.lock();
        let current = state
            .connections
            .get(&self.sfu)
            .map_or(false, |slot| Arc::ptr_eq(slot, &self.slot));
        if current {
            state.connections.remove(&self.sfu);
        }
    }
}

/// In-memory coordinator handing out SFUs round-robin
///
/// A migrating join never gets the SFU it migrates from.
pub struct LoopbackCoordinator {
    sfus: Vec<String>,
    next: AtomicUsize,
    tokens: AtomicU64,
    requests: Mutex<Vec<JoinCallRequest>>,
    failures: Mutex<VecDeque<SignalingError>>,
    settings: Mutex<CallSettings>,
    participants: Mutex<Vec<ParticipantInfo>>,
}

impl LoopbackCoordinator {
    /// Create a coordinator for the given SFU URLs
    #[must_use]
    pub fn new<S: Into<String>>(sfus: impl IntoIterator<Item = S>) -> Self {
        Self {
            sfus: sfus.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
            tokens: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            settings: Mutex::new(CallSettings::default()),
            participants: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` join-call requests with `error`
    pub fn fail_next(&self, error: SignalingError, times: usize) {
        self.failures
            .lock()
            .extend(std::iter::repeat(error).take(times));
    }

    /// Call settings returned with every response
    pub fn set_call_settings(&self, settings: CallSettings) {
        *self.settings.lock() = settings;
    }

    /// Participants returned with every response
    pub fn set_participants(&self, participants: Vec<ParticipantInfo>) {
        *self.participants.lock() = participants;
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<JoinCallRequest> {
        self.requests.lock().clone()
    }

    fn pick(&self, avoid: Option<&str>) -> Option<String> {
        for _ in 0..self.sfus.len() {
            let index = self.next.fetch_add(1, Ordering::SeqCst) % self.sfus.len();
            let candidate = &self.sfus[index];
            if avoid != Some(candidate.as_str()) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[async_trait]
impl CoordinatorApi for LoopbackCoordinator {
    async fn join_call(&self, request: JoinCallRequest) -> Result<JoinCallResponse, SignalingError> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let url = self
            .pick(request.migrating_from.as_deref())
            .ok_or_else(|| SignalingError::InvalidRequest("no SFU available".into()))?;
        let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(call_cid = %request.call_cid, sfu = %url, "Loopback coordinator assigned SFU");
        Ok(JoinCallResponse {
            credentials: SfuEndpoint {
                websocket_url: format!("{url}/ws"),
                url,
                token: format!("token-{token}"),
            },
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.loopback.invalid:3478".to_string()],
                ..Default::default()
            }],
            participants: self.participants.lock().clone(),
            call_settings: self.settings.lock().clone(),
        })
    }
}

#[derive(Default)]
struct EngineState {
    created: usize,
    closed: usize,
    tracks_added: usize,
    applied: HashMap<PeerRole, usize>,
    fail_encodings: bool,
    peers: Vec<Weak<LoopbackPeer>>,
}

/// Deterministic media engine
///
/// Produces readable SDP, reports every connection as connected until told
/// otherwise and counts what it was asked to do.
#[derive(Clone, Default)]
pub struct LoopbackMediaEngine {
    state: Arc<Mutex<EngineState>>,
}

impl LoopbackMediaEngine {
    /// Create an engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer connections created
    #[must_use]
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Peer connections closed
    #[must_use]
    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    /// Local tracks added across all connections
    #[must_use]
    pub fn tracks_added(&self) -> usize {
        self.state.lock().tracks_added
    }

    /// Remote candidates applied to connections of `role`
    #[must_use]
    pub fn applied_candidates(&self, role: PeerRole) -> usize {
        self.state.lock().applied.get(&role).copied().unwrap_or(0)
    }

    /// Make encoding changes fail
    pub fn fail_encodings(&self, fail: bool) {
        self.state.lock().fail_encodings = fail;
    }

    fn live_peers(&self) -> Vec<Arc<LoopbackPeer>> {
        let mut state = self.state.lock();
        state.peers.retain(|peer| peer.strong_count() > 0);
        state
            .peers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|peer| !peer.closed.load(Ordering::SeqCst))
            .collect()
    }

    /// Move every open connection to `state`, reporting the change
    pub fn set_ice_state_all(&self, state: IceState) {
        for peer in self.live_peers() {
            peer.set_ice_state(state);
        }
    }

    /// Move open connections of `role` to `state`, reporting the change
    pub fn set_ice_state(&self, role: PeerRole, state: IceState) {
        for peer in self.live_peers().into_iter().filter(|p| p.role == role) {
            peer.set_ice_state(state);
        }
    }

    /// Make a remote track appear on every open subscriber
    pub fn surface_remote_track(&self, session_id: SessionId, track_type: TrackType) {
        for peer in self
            .live_peers()
            .into_iter()
            .filter(|p| p.role == PeerRole::Subscriber)
        {
            let _ = peer.signals.send(PeerSignal::RemoteTrack {
                session_id: session_id.clone(),
                track_type,
                track_id: format!("{session_id}:{track_type}"),
            });
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn create_peer_connection(
        &self,
        role: PeerRole,
        session_id: &SessionId,
        _ice_servers: &[IceServer],
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(LoopbackPeer {
            role,
            session_id: session_id.clone(),
            engine: self.state.clone(),
            signals,
            ice: Mutex::new(IceState::Connected),
            receive_only: AtomicBool::new(false),
            tracks: Mutex::new(BTreeMap::new()),
            remote_offer: Mutex::new(None),
            versions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let mut state = self.state.lock();
        state.created += 1;
        state.peers.push(Arc::downgrade(&peer));
        Ok(peer)
    }
}

struct LoopbackPeer {
    role: PeerRole,
    session_id: SessionId,
    engine: Arc<Mutex<EngineState>>,
    signals: mpsc::UnboundedSender<PeerSignal>,
    ice: Mutex<IceState>,
    receive_only: AtomicBool,
    tracks: Mutex<BTreeMap<TrackType, TrackInfo>>,
    remote_offer: Mutex<Option<String>>,
    versions: AtomicU64,
    closed: AtomicBool,
}

impl LoopbackPeer {
    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_ice_state(&self, state: IceState) {
        *self.ice.lock() = state;
        let _ = self.signals.send(PeerSignal::IceStateChanged {
            role: self.role,
            state,
        });
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_receive_transceivers(&self) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.receive_only.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_track(&self, track_type: TrackType) -> Result<TrackInfo, PeerError> {
        self.ensure_open()?;
        // real engines suspend here while the transceiver is created
        tokio::task::yield_now().await;
        self.engine.lock().tracks_added += 1;
        let info = TrackInfo {
            track_type,
            track_id: format!("{}:{track_type}", self.session_id),
            layers: if track_type.is_video() {
                VideoLayer::default_simulcast()
            } else {
                Vec::new()
            },
            muted: false,
        };
        self.tracks.lock().insert(track_type, info.clone());
        let _ = self
            .signals
            .send(PeerSignal::NegotiationNeeded { role: self.role });
        Ok(info)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        self.ensure_open()?;
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sdp = format!(
            "v=0\r\no=- {version} 2 IN IP4 127.0.0.1\r\ns=loopback-{}\r\n",
            self.role
        );
        if self.receive_only.load(Ordering::SeqCst) {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=recvonly\r\n");
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n");
        }
        for track_type in self.tracks.lock().keys() {
            sdp.push_str(&format!("a=mid:{track_type}\r\na=sendonly\r\n"));
        }
        if ice_restart {
            sdp.push_str("a=ice-options:restart\r\n");
        }
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.ensure_open()?;
        let offer = self
            .remote_offer
            .lock()
            .clone()
            .ok_or_else(|| PeerError::Sdp("no remote offer".into()))?;
        Ok(format!("answer:{offer}"))
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Sdp("malformed offer".into()));
        }
        *self.remote_offer.lock() = Some(sdp.to_string());
        Ok(())
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<(), PeerError> {
        self.ensure_open()
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.engine.lock().applied.entry(self.role).or_default() += 1;
        Ok(())
    }

    async fn set_track_enabled(&self, track_type: TrackType, enabled: bool) -> Result<(), PeerError> {
        self.ensure_open()?;
        match self.tracks.lock().get_mut(&track_type) {
            Some(info) => {
                info.muted = !enabled;
                Ok(())
            }
            None => Err(PeerError::TrackNotFound(track_type)),
        }
    }

    async fn set_active_encodings(&self, track_type: TrackType, _rids: &[String]) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.engine.lock().fail_encodings {
            return Err(PeerError::Engine("encoding parameters rejected".into()));
        }
        if self.tracks.lock().contains_key(&track_type) {
            Ok(())
        } else {
            Err(PeerError::TrackNotFound(track_type))
        }
    }

    fn ice_state(&self) -> IceState {
        *self.ice.lock()
    }

    async fn close(&self) -> Result<(), PeerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.ice.lock() = IceState::Closed;
            self.engine.lock().closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> SfuEndpoint {
        SfuEndpoint {
            url: url.into(),
            websocket_url: format!("{url}/ws"),
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_join_is_answered_with_offer() {
        let sfu = LoopbackSfu::new();
        let mut conn = sfu.connect(&endpoint("https://sfu-1")).await.unwrap();
        conn.channel
            .join(JoinRequest {
                session_id: SessionId::from("s1"),
                token: "t".into(),
                subscriber_sdp: "v=0".into(),
                reconnect: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            conn.events.recv().await.unwrap(),
            SfuEvent::JoinResponse {
                fast_reconnected: false,
                ..
            }
        ));
        assert!(matches!(
            conn.events.recv().await.unwrap(),
            SfuEvent::SubscriberOffer { .. }
        ));
        assert_eq!(sfu.rpcs()[0].sfu(), "https://sfu-1");
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed() {
        let sfu = LoopbackSfu::new();
        let conn = sfu.connect(&endpoint("https://sfu-1")).await.unwrap();
        sfu.fail_next("leave", SignalingError::Timeout("slow".into()), 1);

        let id = SessionId::from("s1");
        assert!(conn.channel.leave(&id, "bye".into()).await.is_err());
        assert!(conn.channel.leave(&id, "bye".into()).await.is_ok());
        assert_eq!(sfu.count(|r| r.name() == "leave"), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_ends_event_stream() {
        let sfu = LoopbackSfu::new();
        let mut conn = sfu.connect(&endpoint("https://sfu-1")).await.unwrap();
        sfu.drop_connection("https://sfu-1");
        assert!(conn.events.recv().await.is_none());
        assert!(!sfu.inject("https://sfu-1", SfuEvent::GoAway { reason: "x".into() }));
        assert_eq!(
            conn.channel.ice_restart(&SessionId::from("s1"), PeerRole::Subscriber).await,
            Err(SignalingError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_coordinator_avoids_migration_source() {
        let coordinator = LoopbackCoordinator::new(["https://sfu-1", "https://sfu-2"]);
        let mut request = JoinCallRequest::new("default:call");
        request.migrating_from = Some("https://sfu-2".into());
        for _ in 0..4 {
            let response = coordinator.join_call(request.clone()).await.unwrap();
            assert_eq!(response.credentials.url, "https://sfu-1");
        }

        let single = LoopbackCoordinator::new(["https://sfu-1"]);
        request.migrating_from = Some("https://sfu-1".into());
        assert!(matches!(
            single.join_call(request).await,
            Err(SignalingError::InvalidRequest(_))
        ));
    }
}
