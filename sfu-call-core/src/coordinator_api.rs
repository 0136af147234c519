//! Coordinator join-call RPC
//!
//! The coordinator hands out SFU credentials. Only the join-call RPC is
//! consumed here; call CRUD lives elsewhere.

use crate::signaling::SignalingError;
use crate::types::JoinCallResponse;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Join-call request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCallRequest {
    /// Call to join, as `type:id`
    pub call_cid: String,
    /// Create the call if it does not exist
    pub create: bool,
    /// Ring the other members
    pub ring: bool,
    /// SFU being left; the coordinator must pick a different one
    pub migrating_from: Option<String>,
}

impl JoinCallRequest {
    /// Plain join of an existing call
    #[must_use]
    pub fn new(call_cid: impl Into<String>) -> Self {
        Self {
            call_cid: call_cid.into(),
            create: false,
            ring: false,
            migrating_from: None,
        }
    }
}

/// Coordinator RPC used by the reconnect coordinator
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Request SFU credentials for a call
    ///
    /// Errors use the signaling taxonomy so that join retries can tell
    /// transient failures from permanent ones.
    async fn join_call(&self, request: JoinCallRequest) -> Result<JoinCallResponse, SignalingError>;
}
