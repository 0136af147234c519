//! Track publish and subscription synchronization
//!
//! Two replace-all protocols share one worker shape: a debounced watch on the
//! desired value, then a guarded retry loop that sends the complete value.
//! A send only goes out while the value is still the desired one and the
//! session's SFU is still the active one.

use crate::config::ClientConfig;
use crate::peer::{PeerConnectionPair, PeerError};
use crate::retry::{guard, retry_while_current, RetryOutcome, RetryPolicy};
use crate::signaling::{SignalingError, SignalingHandler, TrackMuteState};
use crate::types::{ParticipantInfo, SessionId, TrackSubscriptionDetail, TrackType, VideoDimension};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Manual per-participant video override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoOverride {
    /// Never receive this participant's video
    Disabled,
    /// Receive at this dimension regardless of visibility
    Dimension(VideoDimension),
}

/// Inputs of the desired subscription set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInputs {
    /// Remote participants by session id, with their user id
    pub participants: BTreeMap<SessionId, String>,
    /// Participants currently on screen
    pub visible: BTreeSet<SessionId>,
    /// Rendered size per participant
    pub requested: BTreeMap<SessionId, VideoDimension>,
    /// Manual overrides; win over visibility
    pub overrides: BTreeMap<SessionId, VideoOverride>,
    /// Participants whose screen share is shown
    pub screen_shares: BTreeSet<SessionId>,
    /// Dimension used when nothing was requested
    pub default_dimension: VideoDimension,
}

impl Default for SubscriptionInputs {
    fn default() -> Self {
        Self {
            participants: BTreeMap::new(),
            visible: BTreeSet::new(),
            requested: BTreeMap::new(),
            overrides: BTreeMap::new(),
            screen_shares: BTreeSet::new(),
            default_dimension: VideoDimension::default(),
        }
    }
}

/// Compute the desired subscription set
///
/// Audio is always received. Video follows the override if there is one,
/// else visibility. With `use_defaults`, participants without visibility
/// information are received at the default dimension. The result is sorted.
#[must_use]
pub fn desired_subscriptions(
    inputs: &SubscriptionInputs,
    use_defaults: bool,
) -> Vec<TrackSubscriptionDetail> {
    let mut desired = BTreeSet::new();
    for (session_id, user_id) in &inputs.participants {
        let detail = |track_type, dimension| TrackSubscriptionDetail {
            participant_id: user_id.clone(),
            session_id: session_id.clone(),
            track_type,
            dimension,
        };

        desired.insert(detail(TrackType::Audio, None));

        let video = match inputs.overrides.get(session_id) {
            Some(VideoOverride::Disabled) => None,
            Some(VideoOverride::Dimension(dimension)) => Some(*dimension),
            None if inputs.visible.contains(session_id) || use_defaults => Some(
                inputs
                    .requested
                    .get(session_id)
                    .copied()
                    .unwrap_or(inputs.default_dimension),
            ),
            None => None,
        };
        if let Some(dimension) = video {
            desired.insert(detail(TrackType::Video, Some(dimension)));
        }

        if inputs.screen_shares.contains(session_id) {
            let dimension = inputs
                .requested
                .get(session_id)
                .copied()
                .unwrap_or(VideoDimension::HIGH);
            desired.insert(detail(TrackType::ScreenShare, Some(dimension)));
        }
    }
    desired.into_iter().collect()
}

fn is_active(
    signaling: &SignalingHandler,
    active_session: &watch::Receiver<Option<SessionId>>,
    session_id: &SessionId,
) -> bool {
    !signaling.is_leaving() && active_session.borrow().as_ref() == Some(session_id)
}

type SendFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), SignalingError>> + Send + Sync>;
type TargetFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Subscription and mute-state sync of one session
pub struct TrackSyncEngine {
    pair: Arc<PeerConnectionPair>,
    signaling: Arc<SignalingHandler>,
    session_id: SessionId,
    sfu_url: String,
    active_session: watch::Receiver<Option<SessionId>>,
    inputs: Mutex<SubscriptionInputs>,
    use_defaults: Mutex<bool>,
    subscriptions: watch::Sender<Vec<TrackSubscriptionDetail>>,
    mute: watch::Sender<BTreeMap<TrackType, bool>>,
    debounce: Duration,
    policy: RetryPolicy,
}

impl TrackSyncEngine {
    /// Create the engine for session `session_id` on `sfu_url`
    ///
    /// `active_session` names the call's current session; sends are only
    /// made while it equals `session_id`, so a rejoin on the same SFU still
    /// retires the old workers.
    #[must_use]
    pub fn new(
        pair: Arc<PeerConnectionPair>,
        signaling: Arc<SignalingHandler>,
        session_id: SessionId,
        sfu_url: String,
        active_session: watch::Receiver<Option<SessionId>>,
        config: &ClientConfig,
    ) -> Self {
        let (subscriptions, _) = watch::channel(Vec::new());
        let (mute, _) = watch::channel(BTreeMap::new());
        Self {
            pair,
            signaling,
            session_id,
            sfu_url,
            active_session,
            inputs: Mutex::new(SubscriptionInputs::default()),
            use_defaults: Mutex::new(false),
            subscriptions,
            mute,
            debounce: config.sync.debounce(),
            policy: RetryPolicy::from_sync(&config.sync),
        }
    }

    /// Whether this is the call's active session and it is not leaving
    #[must_use]
    pub fn is_target_current(&self) -> bool {
        is_active(&self.signaling, &self.active_session, &self.session_id)
    }

    fn target_fn(&self) -> TargetFn {
        let signaling = self.signaling.clone();
        let active_session = self.active_session.clone();
        let session_id = self.session_id.clone();
        Arc::new(move || is_active(&signaling, &active_session, &session_id))
    }

    /// Spawn both sync workers
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let signaling = self.signaling.clone();
        let send_subscriptions: SendFn<Vec<TrackSubscriptionDetail>> = Arc::new(move |tracks| {
            let signaling = signaling.clone();
            Box::pin(async move { signaling.update_subscriptions(tracks).await })
        });
        let signaling = self.signaling.clone();
        let send_mute: SendFn<BTreeMap<TrackType, bool>> = Arc::new(move |states| {
            let signaling = signaling.clone();
            Box::pin(async move { signaling.update_mute_states(to_mute_states(&states)).await })
        });

        vec![
            tokio::spawn(sync_worker(
                "update_subscriptions",
                self.subscriptions.subscribe(),
                self.debounce,
                self.policy.clone(),
                self.target_fn(),
                send_subscriptions,
            )),
            tokio::spawn(sync_worker(
                "update_mute_states",
                self.mute.subscribe(),
                self.debounce,
                self.policy.clone(),
                self.target_fn(),
                send_mute,
            )),
        ]
    }

    /// Mutate the subscription inputs; the desired set is recomputed and
    /// published only if it changed
    pub fn update_inputs(&self, f: impl FnOnce(&mut SubscriptionInputs)) {
        let desired = {
            let mut inputs = self.inputs.lock();
            f(&mut inputs);
            desired_subscriptions(&inputs, *self.use_defaults.lock())
        };
        self.publish_desired(desired);
    }

    fn publish_desired(&self, desired: Vec<TrackSubscriptionDetail>) {
        self.subscriptions.send_if_modified(|current| {
            if *current == desired {
                false
            } else {
                *current = desired;
                true
            }
        });
    }

    /// Add or refresh a remote participant
    pub fn add_participant(&self, participant: &ParticipantInfo) {
        self.update_inputs(|inputs| {
            inputs
                .participants
                .insert(participant.session_id.clone(), participant.user_id.clone());
            if participant.published_tracks.contains(&TrackType::ScreenShare) {
                inputs.screen_shares.insert(participant.session_id.clone());
            }
        });
    }

    /// Forget a remote participant and its per-participant inputs
    pub fn remove_participant(&self, session_id: &SessionId) {
        self.update_inputs(|inputs| {
            inputs.participants.remove(session_id);
            inputs.visible.remove(session_id);
            inputs.requested.remove(session_id);
            inputs.overrides.remove(session_id);
            inputs.screen_shares.remove(session_id);
        });
    }

    /// Replace the visible participant set with their rendered dimensions
    ///
    /// Explicit visibility ends the default-dimension fallback.
    pub fn set_visible(&self, visible: BTreeMap<SessionId, VideoDimension>) {
        *self.use_defaults.lock() = false;
        self.update_inputs(|inputs| {
            inputs.visible = visible.keys().cloned().collect();
            inputs.requested = visible;
        });
    }

    /// Set or clear a manual override
    pub fn set_override(&self, session_id: SessionId, value: Option<VideoOverride>) {
        self.update_inputs(|inputs| match value {
            Some(value) => {
                inputs.overrides.insert(session_id, value);
            }
            None => {
                inputs.overrides.remove(&session_id);
            }
        });
    }

    /// Current desired subscription set
    #[must_use]
    pub fn desired(&self) -> Vec<TrackSubscriptionDetail> {
        self.subscriptions.borrow().clone()
    }

    /// Current inputs
    #[must_use]
    pub fn inputs(&self) -> SubscriptionInputs {
        self.inputs.lock().clone()
    }

    /// Seed inputs carried over from a previous session
    pub fn seed(&self, inputs: SubscriptionInputs) {
        self.update_inputs(|current| *current = inputs);
    }

    /// Push the complete state again, even if unchanged
    ///
    /// With `fallback_to_defaults`, a desired set without any video falls
    /// back to default dimensions for every participant.
    pub fn resync(&self, fallback_to_defaults: bool) {
        let desired = {
            let inputs = self.inputs.lock();
            let mut use_defaults = self.use_defaults.lock();
            let mut desired = desired_subscriptions(&inputs, *use_defaults);
            let has_video = desired.iter().any(|d| d.track_type.is_video());
            if fallback_to_defaults && !has_video && !inputs.participants.is_empty() {
                *use_defaults = true;
                desired = desired_subscriptions(&inputs, true);
            }
            desired
        };
        tracing::debug!(sfu = %self.sfu_url, tracks = desired.len(), "Resyncing subscriptions and mute states");
        self.subscriptions.send_modify(|current| *current = desired);
        self.mute.send_modify(|_| {});
    }

    /// Enable or disable a local device track
    ///
    /// Enabling publishes the track first, creating the publisher on first
    /// use. The mute map follows only once the engine accepted the change.
    ///
    /// # Errors
    ///
    /// Returns error if the track cannot be published or toggled
    pub async fn set_local_track_enabled(
        &self,
        track_type: TrackType,
        enabled: bool,
    ) -> Result<(), PeerError> {
        if enabled {
            self.pair.publish_track(track_type).await?;
        }
        match self.pair.set_track_enabled(track_type, enabled).await {
            Ok(()) => {}
            Err(PeerError::TrackNotFound(_)) if !enabled => {}
            Err(e) => return Err(e),
        }
        self.mute.send_if_modified(|states| {
            let muted = !enabled;
            if states.get(&track_type) == Some(&muted) {
                false
            } else {
                states.insert(track_type, muted);
                true
            }
        });
        Ok(())
    }

    /// Current local mute states
    #[must_use]
    pub fn mute_states(&self) -> Vec<TrackMuteState> {
        to_mute_states(&self.mute.borrow())
    }

    /// Apply an SFU publish-quality instruction synchronously
    ///
    /// Returns whether it was applied; on failure the previous encodings stay.
    pub async fn apply_publish_quality(&self, track_type: TrackType, enabled_rids: &[String]) -> bool {
        match self.pair.apply_publish_quality(track_type, enabled_rids).await {
            Ok(()) => {
                tracing::debug!(%track_type, ?enabled_rids, "Publish quality changed");
                true
            }
            Err(e) => {
                tracing::warn!(%track_type, error = %e, "Publish quality change failed, keeping previous encodings");
                false
            }
        }
    }
}

fn to_mute_states(states: &BTreeMap<TrackType, bool>) -> Vec<TrackMuteState> {
    states
        .iter()
        .map(|(track_type, muted)| TrackMuteState {
            track_type: *track_type,
            muted: *muted,
        })
        .collect()
}

async fn sync_worker<T>(
    label: &'static str,
    mut rx: watch::Receiver<T>,
    debounce: Duration,
    policy: RetryPolicy,
    target: TargetFn,
    send: SendFn<T>,
) where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        // trailing debounce: wait for a quiet window
        loop {
            match tokio::time::timeout(debounce, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }

        let payload = rx.borrow_and_update().clone();
        if !target() {
            tracing::debug!(label, "Session not active, deferring sync");
            continue;
        }

        let current = rx.clone();
        let expected = payload.clone();
        let target = target.clone();
        let relevance = guard(move || *current.borrow() == expected, move || target());
        let outcome = retry_while_current(label, &policy, &relevance, |_| {
            let send = send.clone();
            let payload = payload.clone();
            async move { send(payload).await }
        })
        .await;

        match outcome {
            RetryOutcome::Completed(()) => tracing::debug!(label, "Synced"),
            RetryOutcome::Superseded(_) => {}
            RetryOutcome::Exhausted(e) | RetryOutcome::Permanent(e) => {
                tracing::error!(label, error = %e, "Sync gave up");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn inputs() -> SubscriptionInputs {
        let mut inputs = SubscriptionInputs::default();
        inputs
            .participants
            .insert(SessionId::from("s-a"), "alice".into());
        inputs.participants.insert(SessionId::from("s-b"), "bob".into());
        inputs
    }

    #[test]
    fn test_audio_only_without_visibility() {
        let desired = desired_subscriptions(&inputs(), false);
        assert_eq!(desired.len(), 2);
        assert!(desired.iter().all(|d| d.track_type == TrackType::Audio));
    }

    #[test]
    fn test_visibility_and_requested_dimension() {
        let mut inputs = inputs();
        inputs.visible.insert(SessionId::from("s-a"));
        inputs
            .requested
            .insert(SessionId::from("s-a"), VideoDimension::LOW);

        let video: Vec<_> = desired_subscriptions(&inputs, false)
            .into_iter()
            .filter(|d| d.track_type == TrackType::Video)
            .collect();
        assert_eq!(
            video,
            vec![TrackSubscriptionDetail {
                participant_id: "alice".into(),
                session_id: SessionId::from("s-a"),
                track_type: TrackType::Video,
                dimension: Some(VideoDimension::LOW),
            }]
        );
    }

    #[test]
    fn test_override_wins() {
        let mut inputs = inputs();
        inputs.visible.insert(SessionId::from("s-a"));
        inputs
            .overrides
            .insert(SessionId::from("s-a"), VideoOverride::Disabled);
        inputs.overrides.insert(
            SessionId::from("s-b"),
            VideoOverride::Dimension(VideoDimension::HIGH),
        );

        let video: Vec<_> = desired_subscriptions(&inputs, false)
            .into_iter()
            .filter(|d| d.track_type == TrackType::Video)
            .map(|d| (d.participant_id, d.dimension))
            .collect();
        assert_eq!(video, vec![("bob".to_string(), Some(VideoDimension::HIGH))]);
    }

    #[test]
    fn test_defaults_fill_missing_visibility() {
        let desired = desired_subscriptions(&inputs(), true);
        let video = desired
            .iter()
            .filter(|d| d.track_type == TrackType::Video)
            .count();
        assert_eq!(video, 2);
        assert!(desired
            .iter()
            .filter(|d| d.track_type == TrackType::Video)
            .all(|d| d.dimension == Some(VideoDimension::default())));
    }

    #[test]
    fn test_screen_share() {
        let mut inputs = inputs();
        inputs.screen_shares.insert(SessionId::from("s-b"));
        let desired = desired_subscriptions(&inputs, false);
        assert!(desired.iter().any(|d| d.track_type == TrackType::ScreenShare
            && d.session_id == SessionId::from("s-b")
            && d.dimension == Some(VideoDimension::HIGH)));
    }

    #[test]
    fn test_output_is_sorted_and_deterministic() {
        let mut a = inputs();
        a.visible.insert(SessionId::from("s-b"));
        a.visible.insert(SessionId::from("s-a"));
        let mut b = inputs();
        b.visible.insert(SessionId::from("s-a"));
        b.visible.insert(SessionId::from("s-b"));

        let first = desired_subscriptions(&a, false);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
        assert_eq!(first, desired_subscriptions(&b, false));
    }
}
