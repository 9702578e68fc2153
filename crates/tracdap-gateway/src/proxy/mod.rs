//! The router / proxy core.
//!
//! One [`ConnCtx`] exists per inbound connection and owns its backend
//! channel map; channels open lazily on first use and are reused by every
//! stream on the same connection. Stream handlers live in [`core`] (HTTP/2
//! front), [`http1`] (HTTP/1.1 front) and
//! [`crate::conn::websocket`]; the shared REST and gRPC call plumbing is in
//! [`rest_front`] and [`call`].

pub mod call;
pub mod channel;
pub mod core;
pub mod http1;
pub mod rest_front;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::conn::IdleMonitor;
use crate::proxy::channel::ChannelMap;
use crate::state::GatewayState;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection context, shared by reference across the connection's
/// stream handlers. Cross-connection state lives in [`GatewayState`] and is
/// immutable.
pub struct ConnCtx {
    pub state: Arc<GatewayState>,
    pub channels: Mutex<ChannelMap>,
    pub idle: Arc<IdleMonitor>,
    pub conn_id: u64,
    pub remote: SocketAddr,
}

impl ConnCtx {
    pub fn new(
        state: Arc<GatewayState>,
        idle: Arc<IdleMonitor>,
        conn_id: u64,
        remote: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            channels: Mutex::new(ChannelMap::new()),
            idle,
            conn_id,
            remote,
        })
    }

    /// Fresh correlation id for one logical call.
    pub fn correlation_id(&self) -> String {
        let seq = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", uuid::Uuid::new_v4().simple(), self.conn_id, seq)
    }
}
