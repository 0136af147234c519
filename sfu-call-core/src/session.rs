//! Call session
//!
//! A [`CallSession`] is one attempt at being connected to one SFU. It owns
//! the signaling socket, the peer connection pair and the track sync engine.
//! Inbound SFU events and peer signals are processed by a single actor task,
//! one at a time and in arrival order. Everything the session spawns lives in
//! its task group and is aborted by [`CallSession::cleanup`].

use crate::config::ClientConfig;
use crate::events::{CallEvent, EventBus};
use crate::peer::{IceState, MediaEngine, PeerConnectionPair, PeerError, PeerHealth, PeerSignal};
use crate::retry::{guard, retry_while_current, RetryPolicy};
use crate::signaling::{
    ErrorClass, JoinRequest, ReconnectHint, SfuEvent, SignalingConnection, SignalingError,
    SignalingHandler, SignalingTransport,
};
use crate::stats::SessionStats;
use crate::track_sync::{SubscriptionInputs, TrackSyncEngine, VideoOverride};
use crate::types::{
    CallSettings, JoinCallResponse, MediaTrackHandle, ParticipantInfo, PeerRole,
    ReconnectAttemptContext, SessionId, SfuEndpoint, SfuInfoSnapshot, TrackInfo, TrackType,
    VideoDimension,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long cleanup lets a pending leave notification go out
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation on a session that is leaving or closed
    #[error("Session is closed")]
    Closed,

    /// Operation not valid in the current state
    #[error("Invalid session state: {0:?}")]
    InvalidState(SessionState),

    /// Signaling failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Peer connection failure
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The SFU did not answer the join in time
    #[error("Timed out waiting for the SFU")]
    JoinTimeout,

    /// Fast reconnect found both peer connections unusable
    #[error("Both peer connections are unusable")]
    NeedsRejoin,

    /// Call settings forbid publishing this track
    #[error("Publishing {0} is not allowed")]
    NotAllowed(TrackType),
}

impl SessionError {
    /// Classify the error for join retries
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Signaling(e) => e.class(),
            Self::Peer(PeerError::Signaling(e)) => e.class(),
            Self::JoinTimeout | Self::Peer(_) => ErrorClass::Transient,
            Self::Closed | Self::InvalidState(_) | Self::NeedsRejoin | Self::NotAllowed(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, not connected
    Idle,
    /// Joining the SFU
    Connecting,
    /// Joined and the first offer/answer cycle completed
    Connected,
    /// Leave announced; no further outbound RPCs
    Leaving,
    /// Resources released
    Closed,
}

/// Conditions a session reports to the reconnect coordinator instead of
/// acting on them itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The SFU asked the client to move away
    GoAway {
        /// Reporting session
        session_id: SessionId,
        /// Reason given by the SFU
        reason: String,
    },
    /// SFU error carrying a reconnect hint
    Hint {
        /// Reporting session
        session_id: SessionId,
        /// Suggested recovery
        hint: ReconnectHint,
        /// Error description
        message: String,
    },
    /// One peer connection lost ICE connectivity
    PeerUnhealthy {
        /// Reporting session
        session_id: SessionId,
        /// Affected connection
        role: PeerRole,
        /// Reported state
        state: IceState,
    },
    /// The signaling socket closed unexpectedly
    SocketClosed {
        /// Reporting session
        session_id: SessionId,
    },
}

impl SessionNotice {
    /// Session that raised the notice
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::GoAway { session_id, .. }
            | Self::Hint { session_id, .. }
            | Self::PeerUnhealthy { session_id, .. }
            | Self::SocketClosed { session_id } => session_id,
        }
    }
}

/// Collaborators shared by all sessions of a call
#[derive(Clone)]
pub struct SessionContext {
    /// Opens signaling sockets
    pub transport: Arc<dyn SignalingTransport>,
    /// Creates peer connections
    pub engine: Arc<dyn MediaEngine>,
    /// Client configuration
    pub config: Arc<ClientConfig>,
    /// Upward events
    pub events: EventBus,
    /// Notices for the reconnect coordinator
    pub notices: mpsc::UnboundedSender<SessionNotice>,
    /// Session the call currently uses
    pub active_session: watch::Receiver<Option<SessionId>>,
}

enum Inbound {
    Event { generation: u64, event: SfuEvent },
    SocketClosed { generation: u64 },
}

/// One connection attempt to one SFU
pub struct CallSession {
    session_id: SessionId,
    local_user_id: String,
    endpoint: SfuEndpoint,
    settings: CallSettings,
    ctx: SessionContext,
    signaling: Arc<SignalingHandler>,
    pair: Arc<PeerConnectionPair>,
    track_sync: TrackSyncEngine,
    state: watch::Sender<SessionState>,
    tracks: Mutex<HashMap<(SessionId, TrackType), MediaTrackHandle>>,
    remote_enabled: Mutex<HashMap<(SessionId, TrackType), bool>>,
    stats: Arc<Mutex<SessionStats>>,
    inbox: mpsc::UnboundedSender<Inbound>,
    socket_generation: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    join_waiter: Mutex<Option<oneshot::Sender<Vec<ParticipantInfo>>>>,
    answers: Arc<watch::Sender<u64>>,
    offer_version: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pending_leave: Mutex<Option<JoinHandle<()>>>,
    handoff: AtomicBool,
    cleaned: AtomicBool,
}

impl CallSession {
    /// Create a session for a join-call response
    ///
    /// Creates the subscriber peer connection and starts the actor and sync
    /// workers. No socket is opened until [`CallSession::connect`].
    ///
    /// # Errors
    ///
    /// Returns error if the media engine cannot create the subscriber
    pub async fn new(
        ctx: SessionContext,
        response: &JoinCallResponse,
        local_user_id: impl Into<String>,
    ) -> Result<Arc<Self>, SessionError> {
        let session_id = SessionId::new();
        let endpoint = response.credentials.clone();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let pair = Arc::new(
            PeerConnectionPair::new(
                ctx.engine.clone(),
                session_id.clone(),
                response.ice_servers.clone(),
                peer_tx,
            )
            .await?,
        );
        let signaling = Arc::new(SignalingHandler::new(
            session_id.clone(),
            endpoint.url.clone(),
        ));
        let track_sync = TrackSyncEngine::new(
            pair.clone(),
            signaling.clone(),
            session_id.clone(),
            endpoint.url.clone(),
            ctx.active_session.clone(),
            &ctx.config,
        );
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let (answers, _) = watch::channel(0);

        let session = Arc::new(Self {
            session_id,
            local_user_id: local_user_id.into(),
            endpoint,
            settings: response.call_settings.clone(),
            ctx,
            signaling,
            pair,
            track_sync,
            state,
            tracks: Mutex::new(HashMap::new()),
            remote_enabled: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(SessionStats::started_now())),
            inbox,
            socket_generation: AtomicU64::new(0),
            pump: Mutex::new(None),
            join_waiter: Mutex::new(None),
            answers: Arc::new(answers),
            offer_version: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
            pending_leave: Mutex::new(None),
            handoff: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });

        let mut tasks = session.track_sync.start();
        tasks.push(tokio::spawn(run_actor(
            Arc::downgrade(&session),
            inbox_rx,
            peer_rx,
        )));
        session.tasks.lock().extend(tasks);

        for participant in &response.participants {
            if participant.session_id != session.session_id {
                session.track_sync.add_participant(participant);
            }
        }

        tracing::debug!(session_id = %session.session_id, sfu = %session.endpoint.url, "Session created");
        Ok(session)
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Local user id
    #[must_use]
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// SFU this session is bound to
    #[must_use]
    pub fn endpoint(&self) -> &SfuEndpoint {
        &self.endpoint
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch the state
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// ICE health of both peer connections
    #[must_use]
    pub fn health(&self) -> PeerHealth {
        self.pair.health()
    }

    /// Registered track handles
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrackHandle> {
        self.tracks.lock().values().cloned().collect()
    }

    fn set_state(&self, to: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == to || *current == SessionState::Closed {
                return false;
            }
            tracing::debug!(session_id = %self.session_id, from = ?*current, to = ?to, "Session state changed");
            *current = to;
            true
        });
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.cleaned.load(Ordering::SeqCst) || self.signaling.is_leaving() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: CallEvent) {
        if !self.handoff.load(Ordering::SeqCst) {
            self.ctx.events.emit(event);
        }
    }

    fn notify(&self, notice: SessionNotice) {
        if self.ctx.notices.send(notice).is_err() {
            tracing::debug!(session_id = %self.session_id, "No coordinator listening for notices");
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.cleaned.load(Ordering::SeqCst) {
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(fut));
    }

    fn may_publish(&self, track_type: TrackType) -> bool {
        match track_type {
            TrackType::Audio => self.settings.can_publish_audio,
            TrackType::Video | TrackType::ScreenShare => self.settings.can_publish_video,
        }
    }

    /// Join the SFU
    ///
    /// Opens the socket, sends the join request with a subscriber offer,
    /// sets up publishing once the SFU answered, and becomes `Connected`
    /// when the first subscriber offer/answer cycle completed.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not idle, the socket or join fails,
    /// or the SFU does not respond in time
    #[tracing::instrument(skip(self, reconnect), fields(session_id = %self.session_id, sfu = %self.endpoint.url, strategy = ?reconnect.as_ref().map(|c| c.strategy)))]
    pub async fn connect(
        self: &Arc<Self>,
        reconnect: Option<ReconnectAttemptContext>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SessionError::InvalidState(current));
        }
        self.set_state(SessionState::Connecting);

        let announced = reconnect
            .as_ref()
            .map(|c| c.announced_tracks.clone())
            .unwrap_or_default();
        self.open_and_join(reconnect).await?;
        self.setup_publisher(&announced).await;

        let mut answers = self.answers.subscribe();
        tokio::time::timeout(
            self.ctx.config.socket_ready_timeout(),
            answers.wait_for(|count| *count > 0),
        )
        .await
        .map_err(|_| SessionError::JoinTimeout)?
        .map_err(|_| SessionError::Closed)?;

        self.ensure_open()?;
        self.set_state(SessionState::Connected);
        tracing::info!("Session connected");
        Ok(())
    }

    async fn open_and_join(
        &self,
        reconnect: Option<ReconnectAttemptContext>,
    ) -> Result<Vec<ParticipantInfo>, SessionError> {
        let subscriber_sdp = self.pair.create_subscriber_offer().await?;
        let (tx, rx) = oneshot::channel();
        *self.join_waiter.lock() = Some(tx);

        self.open_socket().await?;
        self.signaling
            .join(JoinRequest {
                session_id: self.session_id.clone(),
                token: self.endpoint.token.clone(),
                subscriber_sdp,
                reconnect,
            })
            .await?;

        tokio::time::timeout(self.ctx.config.socket_ready_timeout(), rx)
            .await
            .map_err(|_| SessionError::JoinTimeout)?
            .map_err(|_| SessionError::Closed)
    }

    async fn open_socket(&self) -> Result<(), SessionError> {
        let SignalingConnection { channel, mut events } =
            self.ctx.transport.connect(&self.endpoint).await?;
        let generation = self.socket_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.signaling.attach(channel) {
            previous.close().await;
        }

        let inbox = self.inbox.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbox.send(Inbound::Event { generation, event }).is_err() {
                    return;
                }
            }
            let _ = inbox.send(Inbound::SocketClosed { generation });
        });
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        tracing::debug!(session_id = %self.session_id, generation, "Signaling socket open");
        Ok(())
    }

    async fn setup_publisher(&self, announced: &[TrackInfo]) {
        if !self.settings.can_publish() {
            tracing::debug!(session_id = %self.session_id, "Not allowed to publish, skipping publisher");
            return;
        }
        let wanted: Vec<(TrackType, bool)> = if announced.is_empty() {
            [
                (TrackType::Audio, self.settings.audio_on_by_default),
                (TrackType::Video, self.settings.video_on_by_default),
            ]
            .into_iter()
            .filter(|(_, on)| *on)
            .collect()
        } else {
            announced.iter().map(|t| (t.track_type, !t.muted)).collect()
        };

        if let Err(e) = self.pair.ensure_publisher().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Publisher setup failed");
            return;
        }
        for (track_type, enabled) in wanted {
            if !self.may_publish(track_type) {
                continue;
            }
            if let Err(e) = self.publish_local(track_type, enabled).await {
                tracing::warn!(session_id = %self.session_id, %track_type, error = %e, "Publishing track failed");
            }
        }
    }

    async fn publish_local(&self, track_type: TrackType, enabled: bool) -> Result<(), SessionError> {
        let info = self.pair.publish_track(track_type).await?;
        let key = (self.session_id.clone(), track_type);
        let added = {
            let mut tracks = self.tracks.lock();
            if tracks.contains_key(&key) {
                None
            } else {
                let handle =
                    MediaTrackHandle::new(info.track_id, self.session_id.clone(), track_type);
                tracks.insert(key.clone(), handle.clone());
                Some(handle)
            }
        };
        if let Some(handle) = added {
            self.emit(CallEvent::TrackAdded(handle));
        }
        self.track_sync
            .set_local_track_enabled(track_type, enabled)
            .await?;
        if let Some(handle) = self.tracks.lock().get_mut(&key) {
            handle.enabled = enabled;
        }
        Ok(())
    }

    /// Enable or disable a local track
    ///
    /// The mute-state sync pushes the change to the SFU.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed, publishing is not allowed or
    /// the media engine fails
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn set_local_track_enabled(
        &self,
        track_type: TrackType,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if enabled && !self.may_publish(track_type) {
            return Err(SessionError::NotAllowed(track_type));
        }
        if enabled {
            self.publish_local(track_type, true).await
        } else {
            self.track_sync
                .set_local_track_enabled(track_type, false)
                .await?;
            if let Some(handle) = self
                .tracks
                .lock()
                .get_mut(&(self.session_id.clone(), track_type))
            {
                handle.enabled = false;
            }
            Ok(())
        }
    }

    /// Report which participants are visible and at what size
    pub fn set_visible(&self, visible: BTreeMap<SessionId, VideoDimension>) {
        self.track_sync.set_visible(visible);
    }

    /// Set or clear a manual video override
    pub fn set_override(&self, session_id: SessionId, value: Option<VideoOverride>) {
        self.track_sync.set_override(session_id, value);
    }

    /// Current subscription inputs, for carrying over to a new session
    #[must_use]
    pub fn subscription_inputs(&self) -> SubscriptionInputs {
        self.track_sync.inputs()
    }

    /// Seed subscription inputs from a previous session
    pub fn seed_subscription_inputs(&self, inputs: SubscriptionInputs) {
        self.track_sync.seed(inputs);
    }

    /// Dispatch one SFU event
    pub async fn handle_event(self: &Arc<Self>, event: SfuEvent) {
        tracing::debug!(session_id = %self.session_id, kind = event.kind(), "Inbound event");
        match event {
            SfuEvent::JoinResponse {
                participants,
                fast_reconnected,
            } => {
                for participant in &participants {
                    if participant.session_id != self.session_id {
                        self.track_sync.add_participant(participant);
                    }
                }
                match self.join_waiter.lock().take() {
                    Some(waiter) => {
                        let _ = waiter.send(participants);
                    }
                    None => tracing::debug!(fast_reconnected, "Unsolicited join response"),
                }
            }
            SfuEvent::SubscriberOffer { sdp } => self.on_subscriber_offer(sdp).await,
            SfuEvent::IceTrickle { role, candidate } => {
                if let Err(e) = self.pair.add_ice_candidate(candidate, role).await {
                    tracing::warn!(session_id = %self.session_id, %role, error = %e, "Remote ICE candidate rejected");
                }
            }
            SfuEvent::TrackPublished {
                session_id,
                track_type,
                ..
            } => self.mirror_remote_track(session_id, track_type, true),
            SfuEvent::TrackUnpublished {
                session_id,
                track_type,
                ..
            } => self.mirror_remote_track(session_id, track_type, false),
            SfuEvent::ParticipantJoined { participant } => {
                if participant.session_id == self.session_id {
                    return;
                }
                self.track_sync.add_participant(&participant);
                self.emit(CallEvent::ParticipantJoined(participant));
            }
            SfuEvent::ParticipantLeft { participant } => {
                self.track_sync.remove_participant(&participant.session_id);
                self.remove_tracks_of(&participant.session_id);
                self.emit(CallEvent::ParticipantLeft(participant));
            }
            SfuEvent::ChangePublishQuality {
                track_type,
                enabled_rids,
            } => {
                if self
                    .track_sync
                    .apply_publish_quality(track_type, &enabled_rids)
                    .await
                {
                    self.emit(CallEvent::PublishQualityChanged {
                        track_type,
                        enabled_rids,
                    });
                }
            }
            SfuEvent::GoAway { reason } => {
                tracing::info!(session_id = %self.session_id, %reason, "SFU go-away");
                self.notify(SessionNotice::GoAway {
                    session_id: self.session_id.clone(),
                    reason,
                });
            }
            SfuEvent::Error { message, hint } => {
                tracing::warn!(session_id = %self.session_id, %message, ?hint, "SFU error");
                self.notify(SessionNotice::Hint {
                    session_id: self.session_id.clone(),
                    hint,
                    message,
                });
            }
        }
    }

    async fn on_subscriber_offer(&self, sdp: String) {
        let version = self.offer_version.fetch_add(1, Ordering::SeqCst) + 1;
        let answer = match self.pair.apply_remote_offer(&sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Applying subscriber offer failed");
                return;
            }
        };

        let policy = RetryPolicy::from_sync(&self.ctx.config.answer_retry);
        let signaling = self.signaling.clone();
        let offers = self.offer_version.clone();
        let answers = self.answers.clone();
        let stats = self.stats.clone();
        self.spawn(async move {
            let gate = signaling.clone();
            let relevance = guard(
                move || offers.load(Ordering::SeqCst) == version,
                move || !gate.is_leaving(),
            );
            let outcome = retry_while_current("send_answer", &policy, &relevance, |_| {
                let signaling = signaling.clone();
                let answer = answer.clone();
                async move { signaling.send_answer(answer).await }
            })
            .await;
            if outcome.is_completed() {
                stats.lock().offers_answered += 1;
                answers.send_modify(|count| *count += 1);
            }
        });
    }

    fn mirror_remote_track(&self, session_id: SessionId, track_type: TrackType, enabled: bool) {
        if session_id == self.session_id {
            return;
        }
        let key = (session_id.clone(), track_type);
        let changed = self.remote_enabled.lock().insert(key.clone(), enabled) != Some(enabled);
        if let Some(handle) = self.tracks.lock().get_mut(&key) {
            handle.enabled = enabled;
        }
        if changed {
            self.emit(CallEvent::TrackEnabledChanged {
                session_id,
                track_type,
                enabled,
            });
        }
    }

    fn remove_tracks_of(&self, session_id: &SessionId) {
        let removed: Vec<TrackType> = {
            let mut tracks = self.tracks.lock();
            let keys: Vec<_> = tracks
                .keys()
                .filter(|(owner, _)| owner == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| tracks.remove(&key).map(|h| h.track_type))
                .collect()
        };
        self.remote_enabled
            .lock()
            .retain(|(owner, _), _| owner != session_id);
        for track_type in removed {
            self.emit(CallEvent::TrackRemoved {
                session_id: session_id.clone(),
                track_type,
            });
        }
    }

    async fn handle_inbound(self: &Arc<Self>, input: Inbound) {
        let current = self.socket_generation.load(Ordering::SeqCst);
        match input {
            Inbound::Event { generation, event } => {
                if generation != current {
                    tracing::debug!(session_id = %self.session_id, kind = event.kind(), "Dropping event from replaced socket");
                    return;
                }
                self.handle_event(event).await;
            }
            Inbound::SocketClosed { generation } => {
                if generation == current
                    && self.state() == SessionState::Connected
                    && !self.signaling.is_leaving()
                {
                    tracing::warn!(session_id = %self.session_id, "Signaling socket closed");
                    self.notify(SessionNotice::SocketClosed {
                        session_id: self.session_id.clone(),
                    });
                }
            }
        }
    }

    async fn handle_peer_signal(&self, signal: PeerSignal) {
        match signal {
            PeerSignal::IceCandidate { role, candidate } => {
                let signaling = self.signaling.clone();
                self.spawn(async move {
                    if let Err(e) = signaling.ice_trickle(role, candidate).await {
                        tracing::debug!(%role, error = %e, "ICE trickle failed");
                    }
                });
            }
            PeerSignal::IceStateChanged { role, state } => {
                tracing::debug!(session_id = %self.session_id, %role, ?state, "ICE state changed");
                if !state.is_usable()
                    && state != IceState::Closed
                    && self.state() == SessionState::Connected
                    && !self.signaling.is_leaving()
                {
                    self.notify(SessionNotice::PeerUnhealthy {
                        session_id: self.session_id.clone(),
                        role,
                        state,
                    });
                }
            }
            PeerSignal::NegotiationNeeded { role } => match role {
                PeerRole::Publisher => self.spawn_publisher_negotiation(),
                PeerRole::Subscriber => {
                    tracing::debug!(session_id = %self.session_id, "Ignoring subscriber negotiation request");
                }
            },
            PeerSignal::RemoteTrack {
                session_id,
                track_type,
                track_id,
            } => {
                if session_id == self.session_id {
                    return;
                }
                let mut handle = MediaTrackHandle::new(track_id, session_id.clone(), track_type);
                if let Some(enabled) = self
                    .remote_enabled
                    .lock()
                    .get(&(session_id.clone(), track_type))
                {
                    handle.enabled = *enabled;
                }
                self.tracks
                    .lock()
                    .insert((session_id, track_type), handle.clone());
                self.emit(CallEvent::TrackAdded(handle));
            }
        }
    }

    fn spawn_publisher_negotiation(&self) {
        let pair = self.pair.clone();
        let signaling = self.signaling.clone();
        let stats = self.stats.clone();
        let session_id = self.session_id.clone();
        self.spawn(async move {
            match negotiate_publisher(&pair, &signaling, false).await {
                Ok(()) => stats.lock().publisher_negotiations += 1,
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "Publisher negotiation failed");
                }
            }
        });
    }

    /// Restart ICE on one peer connection
    ///
    /// The subscriber restart is requested from the SFU, which then sends a
    /// new offer; the publisher renegotiates with an ICE-restart offer.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the restart fails
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn restart_ice(&self, role: PeerRole) -> Result<(), SessionError> {
        self.ensure_open()?;
        match role {
            PeerRole::Subscriber => self.signaling.ice_restart(PeerRole::Subscriber).await?,
            PeerRole::Publisher => {
                if self.pair.publisher().await.is_none() {
                    return Ok(());
                }
                negotiate_publisher(&self.pair, &self.signaling, true).await?;
            }
        }
        self.stats.lock().ice_restarts += 1;
        tracing::info!("ICE restarted");
        Ok(())
    }

    /// Fast reconnect on the same SFU and session
    ///
    /// Reopens the socket and sends a reconnect join. If neither peer
    /// connection is usable afterwards, returns [`SessionError::NeedsRejoin`];
    /// otherwise restarts ICE on both and resyncs the full subscription set.
    ///
    /// # Errors
    ///
    /// Returns error if the reconnect join fails or a rejoin is needed
    #[tracing::instrument(skip(self, context), fields(session_id = %self.session_id, sfu = %self.endpoint.url))]
    pub async fn fast_reconnect(
        &self,
        context: ReconnectAttemptContext,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.open_and_join(Some(context)).await?;

        let health = self.pair.health();
        if health.both_unusable() {
            tracing::warn!(?health, "Both peer connections unusable after fast reconnect");
            return Err(SessionError::NeedsRejoin);
        }
        self.restart_ice(PeerRole::Subscriber).await?;
        self.restart_ice(PeerRole::Publisher).await?;
        self.track_sync.resync(true);
        self.stats.lock().reconnects += 1;
        tracing::info!("Fast reconnect complete");
        Ok(())
    }

    /// Called once this session became the call's active session
    ///
    /// Pushes the full subscription and mute state and starts periodic stats.
    pub fn activate(self: &Arc<Self>) {
        self.handoff.store(false, Ordering::SeqCst);
        self.track_sync.resync(false);

        let Some(interval) = self.ctx.config.stats_interval() else {
            return;
        };
        let session = Arc::downgrade(self);
        self.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    return;
                };
                if !session.track_sync.is_target_current() {
                    continue;
                }
                let stats = session.collect_stats();
                if let Err(e) = session.signaling.send_stats(stats).await {
                    tracing::debug!(error = %e, "Stats report failed");
                }
            }
        });
    }

    /// Stop publishing upward events; used on the outgoing session of a
    /// migration
    pub fn prepare_handoff(&self) {
        self.handoff.store(true, Ordering::SeqCst);
    }

    /// Resume upward events after a handoff that did not happen
    pub fn cancel_handoff(&self) {
        self.handoff.store(false, Ordering::SeqCst);
    }

    /// Snapshot for building a reconnect context
    ///
    /// Must be taken before [`CallSession::cleanup`].
    #[must_use]
    pub fn current_sfu_info(&self) -> SfuInfoSnapshot {
        SfuInfoSnapshot {
            session_id: self.session_id.clone(),
            sfu_url: self.endpoint.url.clone(),
            subscriptions: self.track_sync.desired(),
            announced_tracks: self.pair.published_tracks(),
        }
    }

    /// Counters including signaling traffic
    #[must_use]
    pub fn collect_stats(&self) -> SessionStats {
        let mut stats = self.stats.lock().clone();
        let (sent, failed) = self.signaling.counters();
        stats.rpcs_sent += sent;
        stats.rpcs_failed += failed;
        stats
    }

    /// Merge a previous session's counters into this one
    pub fn absorb_stats(&self, previous: &SessionStats) {
        self.stats.lock().merge(previous);
    }

    /// Send a stats report, even while leaving
    ///
    /// # Errors
    ///
    /// Returns error if the report cannot be sent
    pub async fn send_stats(&self, stats: SessionStats) -> Result<(), SessionError> {
        self.signaling.send_stats(stats).await?;
        Ok(())
    }

    /// Announce leaving without waiting for the SFU
    ///
    /// Outbound RPCs stop immediately; only the first call does anything.
    pub fn leave_with_reason(&self, reason: impl Into<String>) {
        if !self.signaling.mark_leaving() {
            return;
        }
        let reason = reason.into();
        tracing::info!(session_id = %self.session_id, %reason, "Leaving");
        self.set_state(SessionState::Leaving);
        let signaling = self.signaling.clone();
        let leave = tokio::spawn(async move {
            if let Err(e) = signaling.leave(reason).await {
                tracing::debug!(error = %e, "Leave notification not delivered");
            }
        });
        *self.pending_leave.lock() = Some(leave);
    }

    /// Release everything; only the first call does anything
    ///
    /// Aborts the task group, closes the socket and both peer connections and
    /// disposes every track handle that belongs to another participant.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signaling.mark_leaving();
        self.set_state(SessionState::Leaving);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.join_waiter.lock().take();

        let pending_leave = self.pending_leave.lock().take();
        if let Some(leave) = pending_leave {
            if tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, leave).await.is_err() {
                tracing::debug!(session_id = %self.session_id, "Leave still pending at cleanup");
            }
        }
        self.signaling.close().await;
        self.pair.close().await;

        let disposed: Vec<(SessionId, TrackType)> = {
            let mut tracks = self.tracks.lock();
            let keys: Vec<_> = tracks
                .keys()
                .filter(|(owner, _)| *owner != self.session_id)
                .cloned()
                .collect();
            for key in &keys {
                tracks.remove(key);
            }
            keys
        };
        for (session_id, track_type) in disposed {
            self.emit(CallEvent::TrackRemoved {
                session_id,
                track_type,
            });
        }

        self.set_state(SessionState::Closed);
        tracing::info!(session_id = %self.session_id, sfu = %self.endpoint.url, "Session cleaned up");
    }
}

async fn negotiate_publisher(
    pair: &PeerConnectionPair,
    signaling: &Arc<SignalingHandler>,
    ice_restart: bool,
) -> Result<(), PeerError> {
    let tracks = pair.published_tracks();
    let signaling = signaling.clone();
    pair.negotiate_publisher(ice_restart, move |offer| async move {
        signaling
            .set_publisher(offer, tracks)
            .await
            .map_err(PeerError::from)
    })
    .await
}

async fn run_actor(
    session: Weak<CallSession>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    mut peer_signals: mpsc::UnboundedReceiver<PeerSignal>,
) {
    loop {
        tokio::select! {
            input = inbox.recv() => {
                let Some(input) = input else { return };
                let Some(session) = session.upgrade() else { return };
                session.handle_inbound(input).await;
            }
            signal = peer_signals.recv() => {
                let Some(signal) = signal else { return };
                let Some(session) = session.upgrade() else { return };
                session.handle_peer_signal(signal).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMediaEngine, LoopbackSfu, Rpc};
    use crate::types::{IceServer, TrackInfo};

    struct Harness {
        sfu: Arc<LoopbackSfu>,
        engine: Arc<LoopbackMediaEngine>,
        events: EventBus,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
        active: watch::Sender<Option<SessionId>>,
        ctx: SessionContext,
    }

    fn harness() -> Harness {
        let sfu = Arc::new(LoopbackSfu::new());
        let engine = Arc::new(LoopbackMediaEngine::new());
        let events = EventBus::new(64);
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (active, active_rx) = watch::channel(None);
        let ctx = SessionContext {
            transport: sfu.clone(),
            engine: engine.clone(),
            config: Arc::new(ClientConfig::default()),
            events: events.clone(),
            notices: notice_tx,
            active_session: active_rx,
        };
        Harness {
            sfu,
            engine,
            events,
            notices,
            active,
            ctx,
        }
    }

    fn response(url: &str) -> JoinCallResponse {
        JoinCallResponse {
            credentials: SfuEndpoint {
                url: url.to_string(),
                websocket_url: format!("{url}/ws"),
                token: "token".to_string(),
            },
            ice_servers: vec![IceServer::default()],
            participants: Vec::new(),
            call_settings: CallSettings::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_connected_and_publishes_audio() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        let rpcs = h.sfu.rpcs();
        assert!(matches!(rpcs[0], Rpc::Join { .. }));
        assert!(rpcs.iter().any(|r| matches!(r, Rpc::SendAnswer { .. })));

        // audio on by default; publisher negotiated in the background
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h
            .sfu
            .rpcs()
            .iter()
            .any(|r| matches!(r, Rpc::SetPublisher { tracks, .. } if tracks.len() == 1)));
        assert_eq!(session.tracks().len(), 1);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_rejected() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();
        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::InvalidState(SessionState::Connected))
        ));
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout() {
        let h = harness();
        h.sfu.set_silent(true);
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        let err = session.connect(None).await.unwrap_err();
        assert!(matches!(err, SessionError::JoinTimeout));
        assert_eq!(err.class(), ErrorClass::Transient);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_away_is_forwarded_not_acted_on() {
        let mut h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        h.sfu.inject(
            "https://sfu-1",
            SfuEvent::GoAway {
                reason: "shutting down".into(),
            },
        );
        let notice = h.notices.recv().await.unwrap();
        assert_eq!(
            notice,
            SessionNotice::GoAway {
                session_id: session.session_id().clone(),
                reason: "shutting down".into()
            }
        );
        assert_eq!(session.state(), SessionState::Connected);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_left_disposes_tracks() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        let bob = ParticipantInfo {
            user_id: "bob".into(),
            session_id: SessionId::from("s-bob"),
            published_tracks: vec![TrackType::Audio],
        };
        h.sfu.inject(
            "https://sfu-1",
            SfuEvent::ParticipantJoined {
                participant: bob.clone(),
            },
        );
        h.engine.surface_remote_track(SessionId::from("s-bob"), TrackType::Audio);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.tracks().len(), 2);

        h.sfu.inject(
            "https://sfu-1",
            SfuEvent::ParticipantLeft {
                participant: bob.clone(),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.tracks().len(), 1);

        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if let CallEvent::TrackRemoved { session_id, .. } = event {
                saw_removed |= session_id == bob.session_id;
            }
        }
        assert!(saw_removed);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_published_mirrors_mute_not_subscriptions() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();
        let before = session.current_sfu_info().subscriptions;

        h.sfu.inject(
            "https://sfu-1",
            SfuEvent::TrackUnpublished {
                user_id: "bob".into(),
                session_id: SessionId::from("s-bob"),
                track_type: TrackType::Video,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.current_sfu_info().subscriptions, before);
        let mut mirrored = false;
        while let Ok(event) = rx.try_recv() {
            mirrored |= event
                == CallEvent::TrackEnabledChanged {
                    session_id: SessionId::from("s-bob"),
                    track_type: TrackType::Video,
                    enabled: false,
                };
        }
        assert!(mirrored);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_offer_wins_over_retrying_answer() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();
        let answered_before = h.sfu.count(|r| matches!(r, Rpc::SendAnswer { .. }));

        // the answer to offer 2 fails once, offer 3 arrives during its backoff
        h.sfu.fail_next("send_answer", SignalingError::Timeout("slow".into()), 1);
        h.sfu.inject("https://sfu-1", SfuEvent::SubscriberOffer { sdp: "v=0 offer-2".into() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.sfu.inject("https://sfu-1", SfuEvent::SubscriberOffer { sdp: "v=0 offer-3".into() });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let answers: Vec<String> = h
            .sfu
            .rpcs()
            .into_iter()
            .filter_map(|r| match r {
                Rpc::SendAnswer { sdp, .. } => Some(sdp),
                _ => None,
            })
            .skip(answered_before)
            .collect();
        // one failed attempt for offer 2, then only offer 3's answer
        assert_eq!(answers.len(), 2);
        assert!(answers[1].contains("offer-3"));
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_and_cleanup_are_idempotent() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        session.leave_with_reason("user hung up");
        session.leave_with_reason("again");
        session.cleanup().await;
        session.cleanup().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(h.sfu.count(|r| matches!(r, Rpc::Leave { .. })), 1);
        assert!(matches!(
            session.set_local_track_enabled(TrackType::Audio, true).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_reconnect_needs_rejoin_when_both_peers_dead() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        h.engine.set_ice_state_all(IceState::Failed);
        let context = session
            .current_sfu_info()
            .into_context(crate::types::ReconnectStrategy::Fast, 0, "network");
        assert!(matches!(
            session.fast_reconnect(context).await,
            Err(SessionError::NeedsRejoin)
        ));
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_reconnect_restarts_ice_and_resyncs() {
        let h = harness();
        let session = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        h.active.send_replace(Some(session.session_id().clone()));
        session.connect(None).await.unwrap();
        session.activate();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let context = session
            .current_sfu_info()
            .into_context(crate::types::ReconnectStrategy::Fast, 0, "network");
        session.fast_reconnect(context).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let rpcs = h.sfu.rpcs();
        let joins: Vec<_> = rpcs
            .iter()
            .filter_map(|r| match r {
                Rpc::Join { request, .. } => Some(request.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[1].session_id, *session.session_id());
        assert!(rpcs
            .iter()
            .any(|r| matches!(r, Rpc::IceRestart { role: PeerRole::Subscriber, .. })));
        assert!(h.sfu.count(|r| matches!(r, Rpc::UpdateSubscriptions { .. })) >= 1);
        assert_eq!(session.collect_stats().ice_restarts, 2);
        assert_eq!(session.state(), SessionState::Connected);
        session.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_active_session_syncs_on_shared_sfu() {
        let h = harness();
        let old = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        old.connect(None).await.unwrap();
        let new = CallSession::new(h.ctx.clone(), &response("https://sfu-1"), "me")
            .await
            .unwrap();
        new.connect(None).await.unwrap();

        // a rejoin on the same SFU: only the session id tells them apart
        h.active.send_replace(Some(new.session_id().clone()));
        old.activate();
        new.activate();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let updates_from = |session: &CallSession| {
            h.sfu.count(|r| {
                matches!(r, Rpc::UpdateSubscriptions { session_id, .. } if session_id == session.session_id())
            })
        };
        assert_eq!(updates_from(&old), 0);
        assert!(updates_from(&new) >= 1);
        old.cleanup().await;
        new.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_quality_failure_keeps_layers() {
        let h = harness();
        let mut settings_response = response("https://sfu-1");
        settings_response.call_settings.video_on_by_default = true;
        let session = CallSession::new(h.ctx.clone(), &settings_response, "me")
            .await
            .unwrap();
        session.connect(None).await.unwrap();

        h.engine.fail_encodings(true);
        h.sfu.inject(
            "https://sfu-1",
            SfuEvent::ChangePublishQuality {
                track_type: TrackType::Video,
                enabled_rids: vec!["q".into()],
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let video: Vec<TrackInfo> = session
            .current_sfu_info()
            .announced_tracks
            .into_iter()
            .filter(|t| t.track_type == TrackType::Video)
            .collect();
        assert!(video[0].layers.iter().all(|l| l.active));
        assert_eq!(session.state(), SessionState::Connected);
        session.cleanup().await;
    }
}
