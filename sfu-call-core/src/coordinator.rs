//! Reconnect coordinator
//!
//! Owns the call's current [`CallSession`] and drives join, fast reconnect,
//! rejoin and migration. Each reconnect strategy is single-flight by name and
//! all of them run one at a time, so the connection lifecycle never enters
//! `Reconnecting` twice without resolving in between.
//!
//! The coordinator is an explicitly constructed handle; clone it to share.

use crate::config::{ClientConfig, ConfigError};
use crate::coordinator_api::{CoordinatorApi, JoinCallRequest};
use crate::events::{CallEvent, EventBus};
use crate::lifecycle::{
    ConnectionLifecycle, ConnectionState, LifecycleError, RingingEvent, RingingState,
    RingingTracker,
};
use crate::peer::{IceState, MediaEngine};
use crate::retry::RetryPolicy;
use crate::session::{CallSession, SessionContext, SessionError, SessionNotice};
use crate::signaling::{ErrorClass, ReconnectHint, SignalingError, SignalingTransport};
use crate::single_flight::SingleFlight;
use crate::stats::SessionStats;
use crate::track_sync::{SubscriptionInputs, VideoOverride};
use crate::types::{
    PeerRole, ReconnectAttemptContext, ReconnectStrategy, SessionId, TrackType, VideoDimension,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// `join` called while a session exists
    #[error("Already joined")]
    AlreadyJoined,

    /// Operation needs a session
    #[error("Not joined")]
    NotJoined,

    /// The call was left while the operation ran
    #[error("Call was left")]
    Cancelled,

    /// Coordinator RPC failed
    #[error("Join-call failed: {0}")]
    Signaling(#[from] SignalingError),

    /// Session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Lifecycle refused the transition
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// Classify the error for join retries
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Signaling(e) => e.class(),
            Self::Session(e) => e.class(),
            _ => ErrorClass::Permanent,
        }
    }
}

/// Pick the strategy for a reconnect requested `since_disconnect` after the
/// connection was lost
///
/// Fast reconnect needs a live session and a recent disconnect.
#[must_use]
pub fn select_strategy(
    since_disconnect: Duration,
    deadline: Duration,
    has_session: bool,
) -> ReconnectStrategy {
    if has_session && since_disconnect < deadline {
        ReconnectStrategy::Fast
    } else {
        ReconnectStrategy::Rejoin
    }
}

struct Inner {
    local_user_id: String,
    api: Arc<dyn CoordinatorApi>,
    transport: Arc<dyn SignalingTransport>,
    engine: Arc<dyn MediaEngine>,
    config: Arc<ClientConfig>,
    events: EventBus,
    lifecycle: ConnectionLifecycle,
    ringing: Mutex<RingingTracker>,
    current: RwLock<Option<Arc<CallSession>>>,
    request: Mutex<Option<JoinCallRequest>>,
    active_session: watch::Sender<Option<SessionId>>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
    flights: SingleFlight,
    serial: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    disconnected_at: Mutex<Option<Instant>>,
    offline_timer: Mutex<Option<JoinHandle<()>>>,
    pending_cleanup: Mutex<Option<JoinHandle<()>>>,
}

/// Drives join, fast reconnect, rejoin and migration for one call
#[derive(Clone)]
pub struct ReconnectCoordinator {
    inner: Arc<Inner>,
}

impl ReconnectCoordinator {
    /// Create a coordinator
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        local_user_id: impl Into<String>,
        api: Arc<dyn CoordinatorApi>,
        transport: Arc<dyn SignalingTransport>,
        engine: Arc<dyn MediaEngine>,
        config: ClientConfig,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let local_user_id = local_user_id.into();
        let events = EventBus::new(config.event_buffer);
        let (active_session, _) = watch::channel(None);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                ringing: Mutex::new(RingingTracker::new(local_user_id.clone())),
                local_user_id,
                api,
                transport,
                engine,
                config: Arc::new(config),
                lifecycle: ConnectionLifecycle::new(events.clone()),
                events,
                current: RwLock::new(None),
                request: Mutex::new(None),
                active_session,
                notices_tx,
                notices_rx: Mutex::new(Some(notices_rx)),
                flights: SingleFlight::new(),
                serial: tokio::sync::Mutex::new(()),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                disconnected_at: Mutex::new(None),
                offline_timer: Mutex::new(None),
                pending_cleanup: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to upward events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.current()
    }

    /// Watch the connection state
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lifecycle.subscribe()
    }

    /// Current ringing state
    #[must_use]
    pub fn ringing_state(&self) -> RingingState {
        self.inner.ringing.lock().state().clone()
    }

    /// The current session, if any
    #[must_use]
    pub fn session(&self) -> Option<Arc<CallSession>> {
        self.inner.current.read().clone()
    }

    /// Rejoin attempts since the last successful join
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            transport: self.inner.transport.clone(),
            engine: self.inner.engine.clone(),
            config: self.inner.config.clone(),
            events: self.inner.events.clone(),
            notices: self.inner.notices_tx.clone(),
            active_session: self.inner.active_session.subscribe(),
        }
    }

    fn ensure_notice_loop(&self) {
        let Some(rx) = self.inner.notices_rx.lock().take() else {
            return;
        };
        tokio::spawn(run_notices(Arc::downgrade(&self.inner), rx));
    }

    /// Join the call
    ///
    /// Waits (bounded) for a cleanup from a previous leave, then runs the
    /// join-call RPC and the session connect with linear-backoff retries.
    /// Permanent errors abort at once; any final error leaves the lifecycle
    /// in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns error if already joined or joining, or the join finally fails
    #[tracing::instrument(skip(self, request), fields(call_cid = %request.call_cid, user = %self.inner.local_user_id))]
    pub async fn join(&self, request: JoinCallRequest) -> Result<(), CoordinatorError> {
        let Some(_flight) = self.inner.flights.try_acquire("join") else {
            tracing::debug!("Join already in flight");
            return Err(CoordinatorError::AlreadyJoined);
        };
        if self.session().is_some() {
            return Err(CoordinatorError::AlreadyJoined);
        }
        self.ensure_notice_loop();
        self.wait_for_cleanup().await;
        self.inner.lifecycle.transition(ConnectionState::InProgress)?;

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        *self.inner.request.lock() = Some(JoinCallRequest {
            migrating_from: None,
            ..request.clone()
        });

        let session = match self.join_with_retry(request, None, None, epoch).await {
            Ok(session) => session,
            Err(e) => {
                if !matches!(e, CoordinatorError::Cancelled) {
                    self.inner.lifecycle.fail(e.to_string());
                }
                return Err(e);
            }
        };
        let session_id = session.session_id().clone();
        match self.install(session.clone(), epoch) {
            Ok(Some(displaced)) => {
                tracing::warn!(session_id = %displaced.session_id(), "Replacing a session installed during join");
                displaced.leave_with_reason("replaced");
                displaced.cleanup().await;
            }
            Ok(None) => {}
            Err(e) => {
                session.cleanup().await;
                return Err(e);
            }
        }
        self.inner
            .lifecycle
            .transition(ConnectionState::Joined { session_id })?;
        self.inner.lifecycle.transition(ConnectionState::Connected)?;
        self.on_ringing_event(RingingEvent::ParticipantJoined {
            user_id: self.inner.local_user_id.clone(),
        });
        tracing::info!(sfu = %session.endpoint().url, "Joined call");
        Ok(())
    }

    async fn wait_for_cleanup(&self) {
        let pending = self.inner.pending_cleanup.lock().take();
        let Some(cleanup) = pending else {
            return;
        };
        if tokio::time::timeout(self.inner.config.cleanup_wait(), cleanup)
            .await
            .is_err()
        {
            tracing::warn!("Previous cleanup still running, joining anyway");
        }
    }

    async fn join_with_retry(
        &self,
        request: JoinCallRequest,
        reconnect: Option<ReconnectAttemptContext>,
        seed: Option<SubscriptionInputs>,
        epoch: u64,
    ) -> Result<Arc<CallSession>, CoordinatorError> {
        let join = &self.inner.config.join;
        let policy = RetryPolicy::linear(
            join.max_attempts,
            Duration::from_millis(join.backoff_step_ms),
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                return Err(CoordinatorError::Cancelled);
            }
            let error = match self
                .try_join(request.clone(), reconnect.clone(), seed.clone())
                .await
            {
                Ok(session) => return Ok(session),
                Err(error) => error,
            };

            if error.class() == ErrorClass::Permanent {
                tracing::error!(attempt, error = %error, "Join failed permanently");
                return Err(error);
            }
            if attempt >= policy.max_attempts() {
                tracing::error!(attempt, error = %error, "Join retries exhausted");
                return Err(error);
            }
            let delay = policy.delay_after(attempt);
            tracing::warn!(
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Join attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_join(
        &self,
        request: JoinCallRequest,
        reconnect: Option<ReconnectAttemptContext>,
        seed: Option<SubscriptionInputs>,
    ) -> Result<Arc<CallSession>, CoordinatorError> {
        let response = self.inner.api.join_call(request).await?;
        let session = CallSession::new(
            self.session_context(),
            &response,
            self.inner.local_user_id.clone(),
        )
        .await?;
        if let Some(inputs) = seed {
            session.seed_subscription_inputs(inputs);
        }
        if let Err(e) = session.connect(reconnect).await {
            session.cleanup().await;
            return Err(e.into());
        }
        Ok(session)
    }

    fn install(
        &self,
        session: Arc<CallSession>,
        epoch: u64,
    ) -> Result<Option<Arc<CallSession>>, CoordinatorError> {
        let previous = {
            let mut current = self.inner.current.write();
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                return Err(CoordinatorError::Cancelled);
            }
            current.replace(session.clone())
        };
        self.inner
            .active_session
            .send_replace(Some(session.session_id().clone()));
        session.activate();
        self.inner.attempts.store(0, Ordering::SeqCst);
        Ok(previous)
    }

    /// Report that the OS lost network connectivity
    ///
    /// Starts the leave-after-disconnect timer if configured.
    pub fn on_network_lost(&self) {
        if self.session().is_none() {
            return;
        }
        {
            let mut disconnected_at = self.inner.disconnected_at.lock();
            if disconnected_at.is_some() {
                return;
            }
            *disconnected_at = Some(Instant::now());
        }
        tracing::info!("Network lost");

        let Some(after) = self.inner.config.leave_after_disconnect() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let coordinator = ReconnectCoordinator { inner };
            if coordinator.inner.disconnected_at.lock().is_some() {
                tracing::warn!(after_ms = after.as_millis() as u64, "Offline too long, leaving call");
                coordinator.leave("network unavailable");
            }
        });
        if let Some(previous) = self.inner.offline_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Report that the OS regained network connectivity
    ///
    /// Picks fast reconnect or rejoin by how long the network was gone.
    ///
    /// # Errors
    ///
    /// Returns error if the chosen reconnect fails
    pub async fn on_network_available(&self) -> Result<(), CoordinatorError> {
        let since = self
            .inner
            .disconnected_at
            .lock()
            .take()
            .map(|at| at.elapsed());
        if let Some(timer) = self.inner.offline_timer.lock().take() {
            timer.abort();
        }
        let Some(since) = since else {
            return Ok(());
        };
        let strategy = select_strategy(
            since,
            self.inner.config.reconnect_deadline(),
            self.session().is_some(),
        );
        tracing::info!(offline_ms = since.as_millis() as u64, %strategy, "Network restored");
        self.reconnect(strategy, "network restored").await
    }

    /// Run a reconnect strategy
    ///
    /// A request for a strategy that is already running is a no-op, and
    /// strategies never overlap: a request queued behind another one is
    /// dropped if that one already replaced the session.
    ///
    /// # Errors
    ///
    /// Returns error if the reconnect fails
    #[tracing::instrument(skip(self, reason), fields(%strategy))]
    pub async fn reconnect(
        &self,
        strategy: ReconnectStrategy,
        reason: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let reason = reason.into();
        let Some(session) = self.session() else {
            return Err(CoordinatorError::NotJoined);
        };
        let requested_for = session.session_id().clone();
        let outcome = self
            .inner
            .flights
            .run(strategy.key(), async {
                let _serial = self.inner.serial.lock().await;
                if !self.is_current(&requested_for) {
                    tracing::debug!("Session already replaced, skipping");
                    return Ok(());
                }
                let state = self.state();
                if state.is_terminal() {
                    tracing::debug!(?state, "Not reconnecting from a terminal state");
                    return Ok(());
                }
                match strategy {
                    ReconnectStrategy::Fast => self.fast_reconnect_locked(reason).await,
                    ReconnectStrategy::Rejoin => self.rejoin_locked(reason).await,
                    ReconnectStrategy::Migrate => self.migrate_locked(reason).await,
                }
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }

    fn is_current(&self, session_id: &SessionId) -> bool {
        self.session()
            .map_or(false, |s| s.session_id() == session_id)
    }

    async fn fast_reconnect_locked(&self, reason: String) -> Result<(), CoordinatorError> {
        let session = self.session().ok_or(CoordinatorError::NotJoined)?;
        self.inner.lifecycle.enter_reconnecting();
        let context = session.current_sfu_info().into_context(
            ReconnectStrategy::Fast,
            self.attempts(),
            reason.clone(),
        );
        match session.fast_reconnect(context).await {
            Ok(()) => {
                self.inner.lifecycle.transition(ConnectionState::Connected)?;
                tracing::info!(sfu = %session.endpoint().url, "Fast reconnect succeeded");
                Ok(())
            }
            Err(SessionError::Closed) => Err(CoordinatorError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Fast reconnect failed, falling back to rejoin");
                self.rejoin_locked(reason).await
            }
        }
    }

    async fn rejoin_locked(&self, reason: String) -> Result<(), CoordinatorError> {
        let old = self.session().ok_or(CoordinatorError::NotJoined)?;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.lifecycle.enter_reconnecting();
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(attempt, from = %old.session_id(), "Rejoining");

        old.prepare_handoff();
        let context =
            old.current_sfu_info()
                .into_context(ReconnectStrategy::Rejoin, attempt, reason.clone());
        let request = self.template()?;
        let next = match self
            .join_with_retry(request, Some(context), Some(old.subscription_inputs()), epoch)
            .await
        {
            Ok(next) => next,
            Err(e) => {
                old.cancel_handoff();
                if !matches!(e, CoordinatorError::Cancelled) {
                    self.inner.lifecycle.fail(format!("rejoin failed: {e}"));
                }
                return Err(e);
            }
        };

        let stats = old.collect_stats();
        if let Err(e) = old.send_stats(stats.clone()).await {
            tracing::debug!(error = %e, "Final stats of replaced session not delivered");
        }
        next.absorb_stats(&SessionStats {
            reconnects: stats.reconnects + 1,
            ..stats
        });
        if let Err(e) = self.install(next.clone(), epoch) {
            next.cleanup().await;
            return Err(e);
        }
        self.inner.lifecycle.transition(ConnectionState::Connected)?;
        tracing::info!(session_id = %next.session_id(), sfu = %next.endpoint().url, "Rejoined");

        old.leave_with_reason(reason);
        old.cleanup().await;
        Ok(())
    }

    async fn migrate_locked(&self, reason: String) -> Result<(), CoordinatorError> {
        let old = self.session().ok_or(CoordinatorError::NotJoined)?;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.lifecycle.transition(ConnectionState::Migrating)?;
        let from = old.endpoint().url.clone();
        tracing::info!(%from, %reason, "Migrating");

        old.prepare_handoff();
        let context = old.current_sfu_info().into_context(
            ReconnectStrategy::Migrate,
            self.attempts(),
            reason,
        );
        let mut request = self.template()?;
        request.migrating_from = Some(from.clone());

        let next = match self
            .join_with_retry(request, Some(context), Some(old.subscription_inputs()), epoch)
            .await
        {
            Ok(next) => next,
            Err(e) => {
                // the old SFU is going away; keep it only until the caller leaves
                old.cancel_handoff();
                if !matches!(e, CoordinatorError::Cancelled) {
                    self.inner.lifecycle.fail(format!("migration failed: {e}"));
                }
                return Err(e);
            }
        };

        next.absorb_stats(&old.collect_stats());
        if let Err(e) = self.install(next.clone(), epoch) {
            next.cleanup().await;
            return Err(e);
        }
        self.inner.lifecycle.transition(ConnectionState::Connected)?;
        tracing::info!(%from, to = %next.endpoint().url, "Migration complete");

        old.leave_with_reason("migrated");
        old.cleanup().await;
        Ok(())
    }

    fn template(&self) -> Result<JoinCallRequest, CoordinatorError> {
        self.inner
            .request
            .lock()
            .clone()
            .ok_or(CoordinatorError::NotJoined)
    }

    async fn handle_notice(&self, notice: SessionNotice) {
        if !self.is_current(notice.session_id()) {
            tracing::debug!(session_id = %notice.session_id(), "Ignoring notice from replaced session");
            return;
        }
        let result = match notice {
            SessionNotice::GoAway { reason, .. } => {
                self.reconnect(ReconnectStrategy::Migrate, reason).await
            }
            SessionNotice::Hint { hint, message, .. } => match hint {
                ReconnectHint::Fast => self.reconnect(ReconnectStrategy::Fast, message).await,
                ReconnectHint::Rejoin => self.reconnect(ReconnectStrategy::Rejoin, message).await,
                ReconnectHint::Migrate => {
                    self.reconnect(ReconnectStrategy::Migrate, message).await
                }
                ReconnectHint::Disconnect => {
                    self.leave(message);
                    Ok(())
                }
            },
            SessionNotice::PeerUnhealthy { role, state, .. } => {
                self.on_peer_unhealthy(role, state).await
            }
            SessionNotice::SocketClosed { .. } => {
                if self.inner.disconnected_at.lock().is_some() {
                    // network-available will pick the strategy
                    Ok(())
                } else {
                    self.reconnect(ReconnectStrategy::Fast, "signaling socket closed")
                        .await
                }
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Handling session notice failed");
        }
    }

    async fn on_peer_unhealthy(
        &self,
        role: PeerRole,
        state: IceState,
    ) -> Result<(), CoordinatorError> {
        let session = self.session().ok_or(CoordinatorError::NotJoined)?;
        if session.health().both_unusable() {
            tracing::warn!(%role, ?state, "Both peer connections unusable");
            return self
                .reconnect(ReconnectStrategy::Rejoin, "peer connections failed")
                .await;
        }
        tracing::info!(%role, ?state, "Restarting ICE on unhealthy peer");
        let key = format!("ice-restart-{role}");
        self.inner
            .flights
            .run(&key, session.restart_ice(role))
            .await
            .unwrap_or(Ok(()))
            .map_err(CoordinatorError::from)
    }

    /// Feed a ringing event; emits `RingingChanged` when the state moves
    pub fn on_ringing_event(&self, event: RingingEvent) {
        let changed = self.inner.ringing.lock().apply(event);
        if let Some(state) = changed {
            self.inner.events.emit(CallEvent::RingingChanged(state));
        }
    }

    /// Enable or disable a local track on the current session
    ///
    /// # Errors
    ///
    /// Returns error if not joined or the session rejects the change
    pub async fn set_local_track_enabled(
        &self,
        track_type: TrackType,
        enabled: bool,
    ) -> Result<(), CoordinatorError> {
        let session = self.session().ok_or(CoordinatorError::NotJoined)?;
        session.set_local_track_enabled(track_type, enabled).await?;
        Ok(())
    }

    /// Report the visible participants and their rendered sizes
    ///
    /// # Errors
    ///
    /// Returns error if not joined
    pub fn set_visible(
        &self,
        visible: BTreeMap<SessionId, VideoDimension>,
    ) -> Result<(), CoordinatorError> {
        let session = self.session().ok_or(CoordinatorError::NotJoined)?;
        session.set_visible(visible);
        Ok(())
    }

    /// Set or clear a manual video override
    ///
    /// # Errors
    ///
    /// Returns error if not joined
    pub fn set_override(
        &self,
        session_id: SessionId,
        value: Option<VideoOverride>,
    ) -> Result<(), CoordinatorError> {
        let session = self.session().ok_or(CoordinatorError::NotJoined)?;
        session.set_override(session_id, value);
        Ok(())
    }

    /// Leave the call
    ///
    /// Announces the leave, moves to `Disconnected` and cleans the session
    /// up in the background; a later [`ReconnectCoordinator::join`] waits for
    /// that cleanup. Running reconnects observe the leave and stop.
    pub fn leave(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let session = {
            let mut current = self.inner.current.write();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            current.take()
        };
        self.inner.disconnected_at.lock().take();
        if let Some(timer) = self.inner.offline_timer.lock().take() {
            timer.abort();
        }
        self.inner.active_session.send_replace(None);

        if let Some(session) = session {
            tracing::info!(session_id = %session.session_id(), %reason, "Leaving call");
            session.leave_with_reason(reason);
            let cleanup = tokio::spawn(async move { session.cleanup().await });
            if let Some(previous) = self.inner.pending_cleanup.lock().replace(cleanup) {
                tracing::debug!(finished = previous.is_finished(), "Replacing pending cleanup");
            }
            self.on_ringing_event(RingingEvent::ParticipantLeft {
                user_id: self.inner.local_user_id.clone(),
            });
        }
        if let Err(e) = self.inner.lifecycle.transition(ConnectionState::Disconnected) {
            tracing::debug!(error = %e, "Lifecycle not moved to disconnected");
        }
    }

    /// Wait until the background cleanup of the last leave finished
    pub async fn wait_left(&self) {
        self.wait_for_cleanup().await;
    }
}

async fn run_notices(inner: Weak<Inner>, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let coordinator = ReconnectCoordinator { inner };
        tokio::spawn(async move { coordinator.handle_notice(notice).await });
    }
}
