//! The gateway server: accept loop and per-connection lifecycle.
//!
//! The accept loop dispatches each new connection to its own tokio task;
//! from then on every handler for that connection runs under that task and
//! its children, with connection-local state owned outright. Cross-
//! connection state is the immutable [`GatewayState`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::conn::websocket::serve_websocket;
use crate::conn::{negotiate, IdleMonitor, Negotiated};
use crate::error::GatewayResult;
use crate::proxy::core::serve_h2;
use crate::proxy::http1::serve_http1;
use crate::proxy::ConnCtx;
use crate::state::GatewayState;

/// The gateway's listening server.
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> GatewayResult<()> {
        let listen = &self.state.config.listen;
        let addr = format!("{}:{}", listen.host, listen.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %addr,
            routes = self.state.config.routes.len(),
            idle_timeout = self.state.config.idle_timeout_seconds,
            "TRAC gateway listening"
        );

        let mut conn_seq: u64 = 0;
        loop {
            let (socket, remote) = listener.accept().await?;
            conn_seq += 1;
            let state = Arc::clone(&self.state);
            tokio::spawn(handle_connection(state, socket, remote, conn_seq));
        }
    }
}

/// One connection, start to finish: negotiate once, install the codec,
/// serve, tear down backend channels on the way out.
async fn handle_connection(
    state: Arc<GatewayState>,
    socket: TcpStream,
    remote: SocketAddr,
    conn_id: u64,
) {
    socket.set_nodelay(true).ok();

    let negotiated = match negotiate(socket, conn_id).await {
        Ok(negotiated) => negotiated,
        Err(err) => {
            debug!(conn = conn_id, remote = %remote, error = %err, "negotiation failed");
            return;
        }
    };

    info!(
        conn = conn_id,
        remote = %remote,
        protocol = negotiated.protocol_name(),
        "connection accepted"
    );

    let idle = IdleMonitor::new(Duration::from_secs(state.config.idle_timeout_seconds));
    let ctx = ConnCtx::new(state, Arc::clone(&idle), conn_id, remote);

    let result = match negotiated {
        // The HTTP/2 front races the idle monitor inside its accept loop.
        Negotiated::Http2Prior(io) => serve_h2(Arc::clone(&ctx), io).await,
        Negotiated::Http1(io) => {
            tokio::select! {
                result = serve_http1(Arc::clone(&ctx), io) => result,
                _ = idle.expired() => {
                    info!(conn = conn_id, "idle timeout, closing connection");
                    Ok(())
                }
            }
        }
        Negotiated::WebSocket(io) => {
            tokio::select! {
                result = serve_websocket(Arc::clone(&ctx), io) => result,
                _ = idle.expired() => {
                    info!(conn = conn_id, "idle timeout, closing connection");
                    Ok(())
                }
            }
        }
    };

    // Backend channels opened for this connection never outlive it.
    ctx.channels.lock().await.close_all();

    match result {
        Ok(()) => debug!(conn = conn_id, "connection closed"),
        Err(err) => debug!(conn = conn_id, error = %err, "connection ended with error"),
    }
}
