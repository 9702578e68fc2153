//! Per-stream flow-control bridging between two HTTP/2 endpoints.
//!
//! The client-facing and backend-facing connections each keep their own
//! windows. For every proxied stream one [`FlowBridge`] keeps them in step:
//! inbound DATA is handed outbound only while outbound credit covers it,
//! anything else parks in an ordered queue, and the inbound WINDOW_UPDATE
//! is withheld until the bytes have actually been handed off. The
//! accounting is deliberately visible - correctness depends on it.
//!
//! The bridge itself is a pure state machine; [`pump`] drives it against
//! the `h2` stream types.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::error::{GatewayError, GatewayResult};

/// What a bridge event produced: bytes to hand outbound now, and inbound
/// credit to release (the WINDOW_UPDATE the client may now receive).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Handoff {
    pub forward: Vec<Bytes>,
    pub release_inbound: usize,
}

impl Handoff {
    fn empty() -> Self {
        Self::default()
    }
}

/// Flow-control state machine for one proxied stream direction.
#[derive(Debug)]
pub struct FlowBridge {
    /// Credit currently available on the outbound side.
    outbound_credit: usize,
    /// Bytes received inbound but not yet handed outbound, in order.
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    /// Set once either side resets; all subsequent events are no-ops.
    reset: bool,
}

impl FlowBridge {
    /// A bridge starting with the outbound side's initial credit.
    pub fn new(initial_outbound_credit: usize) -> Self {
        Self {
            outbound_credit: initial_outbound_credit,
            queue: VecDeque::new(),
            queued_bytes: 0,
            reset: false,
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn outbound_credit(&self) -> usize {
        self.outbound_credit
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// A DATA frame arrived inbound. Consumes inbound credit (the caller
    /// releases only what the handoff reports) and produces the same bytes
    /// outbound as far as outbound credit allows; the rest parks in order.
    pub fn on_inbound_data(&mut self, mut data: Bytes) -> Handoff {
        if self.reset {
            return Handoff::empty();
        }

        // Anything already queued goes first; never reorder.
        if self.queued_bytes > 0 {
            self.queued_bytes += data.len();
            self.queue.push_back(data);
            return self.drain();
        }

        let sendable = self.outbound_credit.min(data.len());
        let mut handoff = Handoff::empty();
        if sendable > 0 {
            let chunk = data.split_to(sendable);
            self.outbound_credit -= sendable;
            handoff.release_inbound += sendable;
            handoff.forward.push(chunk);
        }
        if !data.is_empty() {
            self.queued_bytes += data.len();
            self.queue.push_back(data);
        }
        handoff
    }

    /// The outbound peer granted more credit (WINDOW_UPDATE). Flush queued
    /// bytes in order, then release inbound credit for what was handed off.
    pub fn on_outbound_credit(&mut self, added: usize) -> Handoff {
        if self.reset {
            return Handoff::empty();
        }
        self.outbound_credit += added;
        self.drain()
    }

    /// Either side reset the stream: drop the queue, stop accounting.
    pub fn on_reset(&mut self) {
        self.reset = true;
        self.queue.clear();
        self.queued_bytes = 0;
    }

    fn drain(&mut self) -> Handoff {
        let mut handoff = Handoff::empty();
        while self.outbound_credit > 0 {
            let Some(mut head) = self.queue.pop_front() else { break };
            let sendable = self.outbound_credit.min(head.len());
            let chunk = head.split_to(sendable);

            self.outbound_credit -= sendable;
            self.queued_bytes -= sendable;
            handoff.release_inbound += sendable;
            handoff.forward.push(chunk);

            if !head.is_empty() {
                self.queue.push_front(head);
                break;
            }
        }
        handoff
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Async pump over h2 streams
// ─────────────────────────────────────────────────────────────────────────────

/// Copy one h2 stream direction through a [`FlowBridge`], releasing inbound
/// capacity only as bytes are accepted outbound, then propagate trailers or
/// end-of-stream. `on_activity` is invoked for every frame so the owning
/// connection can reset its idle timer.
pub async fn pump(
    mut inbound: h2::RecvStream,
    mut outbound: h2::SendStream<Bytes>,
    on_activity: impl Fn(),
) -> GatewayResult<()> {
    while let Some(chunk) = inbound.data().await {
        let chunk = chunk.map_err(|e| map_h2_stream_error("inbound", e))?;
        on_activity();
        let len = chunk.len();
        if len > 0 {
            send_with_capacity(&mut outbound, chunk).await?;
            // The bytes are accepted outbound; only now may the inbound
            // window re-open.
            inbound
                .flow_control()
                .release_capacity(len)
                .map_err(|e| map_h2_stream_error("inbound window", e))?;
        }
    }

    match inbound.trailers().await.map_err(|e| map_h2_stream_error("inbound trailers", e))? {
        Some(trailers) => {
            on_activity();
            outbound
                .send_trailers(trailers)
                .map_err(|e| map_h2_stream_error("outbound trailers", e))?;
        }
        None => {
            outbound
                .send_data(Bytes::new(), true)
                .map_err(|e| map_h2_stream_error("outbound eos", e))?;
        }
    }
    Ok(())
}

/// Send one chunk, waiting for outbound capacity as needed. Splits the
/// chunk when the peer grants credit in smaller pieces; order is preserved.
pub async fn send_with_capacity(
    outbound: &mut h2::SendStream<Bytes>,
    mut chunk: Bytes,
) -> GatewayResult<()> {
    while !chunk.is_empty() {
        outbound.reserve_capacity(chunk.len());
        let granted = std::future::poll_fn(|cx| outbound.poll_capacity(cx))
            .await
            .ok_or_else(|| GatewayError::Unavailable("stream closed awaiting capacity".into()))?
            .map_err(|e| map_h2_stream_error("outbound capacity", e))?;

        let sendable = granted.min(chunk.len());
        let piece = chunk.split_to(sendable);
        outbound
            .send_data(piece, false)
            .map_err(|e| map_h2_stream_error("outbound data", e))?;
    }
    Ok(())
}

/// Classify an h2 stream error: connection-level failures surface as
/// upstream-unavailable (triggering channel eviction), stream resets stay
/// stream-local.
pub fn map_h2_stream_error(context: &str, err: h2::Error) -> GatewayError {
    if err.is_io() || err.is_go_away() {
        GatewayError::Unavailable(format!("{context}: {err}"))
    } else {
        GatewayError::H2(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(handoffs: &[Handoff]) -> Vec<u8> {
        handoffs
            .iter()
            .flat_map(|h| h.forward.iter())
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    #[test]
    fn forwards_within_credit_and_releases_inbound() {
        let mut bridge = FlowBridge::new(10);
        let handoff = bridge.on_inbound_data(Bytes::from_static(b"hello"));

        assert_eq!(collect(&[handoff]), b"hello");
        let handoff = bridge.on_inbound_data(Bytes::from_static(b"hello"));
        assert_eq!(handoff.release_inbound, 5);
        assert_eq!(bridge.outbound_credit(), 0);
        assert_eq!(bridge.queued_bytes(), 0);
    }

    #[test]
    fn parks_bytes_beyond_credit_without_releasing_inbound() {
        let mut bridge = FlowBridge::new(3);
        let handoff = bridge.on_inbound_data(Bytes::from_static(b"abcdef"));

        assert_eq!(collect(&[handoff]), b"abc");
        assert_eq!(bridge.queued_bytes(), 3);
        assert_eq!(bridge.outbound_credit(), 0);
    }

    #[test]
    fn outbound_credit_flushes_in_order() {
        let mut bridge = FlowBridge::new(0);
        let h1 = bridge.on_inbound_data(Bytes::from_static(b"first-"));
        let h2 = bridge.on_inbound_data(Bytes::from_static(b"second"));
        assert!(h1.forward.is_empty() && h2.forward.is_empty());

        let h3 = bridge.on_outbound_credit(4);
        let h4 = bridge.on_outbound_credit(100);

        assert_eq!(collect(&[h3, h4]), b"first-second");
        assert_eq!(bridge.queued_bytes(), 0);
    }

    #[test]
    fn delivered_bytes_are_a_prefix_of_received_bytes() {
        let mut bridge = FlowBridge::new(5);
        let mut handoffs = Vec::new();
        let input = b"the quick brown fox jumps over the lazy dog";

        for chunk in input.chunks(7) {
            handoffs.push(bridge.on_inbound_data(Bytes::copy_from_slice(chunk)));
        }
        let delivered = collect(&handoffs);
        assert_eq!(&input[..delivered.len()], delivered.as_slice());

        handoffs.push(bridge.on_outbound_credit(input.len()));
        assert_eq!(collect(&handoffs), input);
    }

    #[test]
    fn inbound_release_matches_handoff_exactly() {
        let mut bridge = FlowBridge::new(4);
        let h1 = bridge.on_inbound_data(Bytes::from_static(b"abcdefgh"));
        assert_eq!(h1.release_inbound, 4);

        let h2 = bridge.on_outbound_credit(2);
        assert_eq!(h2.release_inbound, 2);

        let h3 = bridge.on_outbound_credit(100);
        assert_eq!(h3.release_inbound, 2);
    }

    #[test]
    fn reset_drops_the_queue() {
        let mut bridge = FlowBridge::new(0);
        bridge.on_inbound_data(Bytes::from_static(b"parked"));
        assert_eq!(bridge.queued_bytes(), 6);

        bridge.on_reset();
        assert_eq!(bridge.queued_bytes(), 0);
        assert!(bridge.is_reset());

        let handoff = bridge.on_outbound_credit(100);
        assert!(handoff.forward.is_empty());
        let handoff = bridge.on_inbound_data(Bytes::from_static(b"late"));
        assert!(handoff.forward.is_empty());
        assert_eq!(handoff.release_inbound, 0);
    }

    #[test]
    fn credit_never_goes_negative() {
        let mut bridge = FlowBridge::new(1);
        bridge.on_inbound_data(Bytes::from_static(b"abc"));
        assert_eq!(bridge.outbound_credit(), 0);
        bridge.on_outbound_credit(1);
        assert_eq!(bridge.outbound_credit(), 0);
        bridge.on_outbound_credit(5);
        // 2 queued bytes consumed 2 of the 5 new credits.
        assert_eq!(bridge.outbound_credit(), 4);
    }
}
