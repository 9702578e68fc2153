//! Backend HTTP/2 channels.
//!
//! Each inbound connection keeps a small map of channels keyed by route
//! index. Channels open lazily on first use; a channel-level failure (TCP
//! reset, GOAWAY) evicts the entry so the next request triggers a fresh
//! open. Routes flagged as bulk-data use enlarged HTTP/2 settings.

use bytes::Bytes;
use h2::client::SendRequest;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::routing::Route;

/// Enlarged settings for bulk-data routes.
const DATA_MAX_FRAME_SIZE: u32 = 256 * 1024;
const DATA_INITIAL_WINDOW: u32 = 16 * 1024 * 1024;

/// The per-connection backend channel map.
#[derive(Default)]
pub struct ChannelMap {
    channels: HashMap<usize, SendRequest<Bytes>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel for a route, opening it on first use. The returned
    /// handle is a cheap clone; the map keeps its own.
    pub async fn get_or_open(
        &mut self,
        route: &Route,
        conn_id: u64,
    ) -> GatewayResult<SendRequest<Bytes>> {
        if let Some(existing) = self.channels.get(&route.index) {
            // A cheap readiness probe doubles as a health check.
            match existing.clone().ready().await {
                Ok(ready) => return Ok(ready),
                Err(err) => {
                    warn!(conn = conn_id, route = %route.name, error = %err,
                          "backend channel failed readiness, evicting");
                    self.channels.remove(&route.index);
                }
            }
        }

        let send = open_channel(route, conn_id).await?;
        self.channels.insert(route.index, send.clone());
        Ok(send)
    }

    /// Drop a failed channel so the next request reopens it.
    pub fn evict(&mut self, route_index: usize) {
        self.channels.remove(&route_index);
    }

    /// Drop every channel. Called on connection close and idle timeout;
    /// closing the last handle tears the backend connection down.
    pub fn close_all(&mut self) {
        self.channels.clear();
    }
}

async fn open_channel(route: &Route, conn_id: u64) -> GatewayResult<SendRequest<Bytes>> {
    let addr = (route.target.host.as_str(), route.target.port);
    let tcp = TcpStream::connect(addr).await.map_err(|e| {
        GatewayError::Unavailable(format!(
            "cannot reach backend {}:{} for route '{}': {e}",
            route.target.host, route.target.port, route.name
        ))
    })?;
    tcp.set_nodelay(true).ok();

    let mut builder = h2::client::Builder::new();
    if route.data_route {
        builder
            .max_frame_size(DATA_MAX_FRAME_SIZE)
            .initial_window_size(DATA_INITIAL_WINDOW)
            .initial_connection_window_size(DATA_INITIAL_WINDOW);
    }

    let (send, connection) = builder
        .handshake::<_, Bytes>(tcp)
        .await
        .map_err(|e| GatewayError::Unavailable(format!("backend handshake failed: {e}")))?;

    let route_name = route.name.clone();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(conn = conn_id, route = %route_name, error = %err,
                   "backend connection closed");
        }
    });

    let send = send
        .ready()
        .await
        .map_err(|e| GatewayError::Unavailable(format!("backend channel not ready: {e}")))?;

    debug!(conn = conn_id, route = %route.name, data_route = route.data_route,
           "opened backend channel");
    Ok(send)
}
