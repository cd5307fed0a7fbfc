//! Async peer pump
//!
//! Bridges a LocalNode to a frame transport. The node itself is a
//! synchronous state machine; this task moves newline-delimited frames
//! between the per-peer queues and a duplex channel, and applies the
//! acknowledgement timeout by resetting the peer's tracked state when
//! the line goes quiet after a send.

use crate::node::{LocalNode, PeerId};
use cojson_sync::{drain_frames, SyncMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One end of a duplex frame channel.
pub struct PeerChannel {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}

/// An in-process duplex pair, for tests and local worker topologies.
pub fn channel_pair(capacity: usize) -> (PeerChannel, PeerChannel) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        PeerChannel {
            incoming: a_rx,
            outgoing: b_tx,
        },
        PeerChannel {
            incoming: b_rx,
            outgoing: a_tx,
        },
    )
}

/// Pump frames for one connected peer until its channel closes.
///
/// The node must already have the peer registered via `connect_peer`.
pub async fn run_peer(
    node: Arc<Mutex<LocalNode>>,
    peer: PeerId,
    mut channel: PeerChannel,
    ack_timeout: Duration,
) {
    let mut buffer = String::new();
    let mut awaiting_ack = false;
    let mut last_send = tokio::time::Instant::now();
    let mut flush = tokio::time::interval(Duration::from_millis(10));

    loop {
        // Ship everything queued for this peer.
        let outbound = {
            let mut node = match node.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            node.collect_outbound(&peer)
        };
        for msg in outbound {
            match msg.encode_frame() {
                Ok(frame) => {
                    if channel.outgoing.send(frame).await.is_err() {
                        disconnect(&node, &peer);
                        return;
                    }
                    awaiting_ack = true;
                    last_send = tokio::time::Instant::now();
                }
                Err(err) => tracing::warn!(%peer, %err, "dropping unencodable frame"),
            }
        }

        tokio::select! {
            received = channel.incoming.recv() => {
                let Some(chunk) = received else {
                    disconnect(&node, &peer);
                    return;
                };
                awaiting_ack = false;
                buffer.push_str(&chunk);
                let frames = match drain_frames(&mut buffer) {
                    Ok(frames) => frames,
                    Err(err) => {
                        tracing::warn!(%peer, %err, "closing peer on bad frame");
                        disconnect(&node, &peer);
                        return;
                    }
                };
                let mut node = match node.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                for frame in frames {
                    handle(&mut node, &peer, frame);
                }
            }
            _ = flush.tick() => {
                if awaiting_ack && last_send.elapsed() >= ack_timeout {
                    tracing::debug!(%peer, "acknowledgement timeout, resetting peer state");
                    if let Ok(mut node) = node.lock() {
                        node.on_ack_timeout(&peer);
                    }
                    awaiting_ack = false;
                }
            }
        }
    }
}

fn handle(node: &mut LocalNode, peer: &str, msg: SyncMessage) {
    if let Err(err) = node.handle_message(peer, msg) {
        // Sync-path errors are recovered locally; the channel stays open.
        tracing::warn!(%peer, %err, "error handling peer message");
    }
}

fn disconnect(node: &Arc<Mutex<LocalNode>>, peer: &str) {
    if let Ok(mut node) = node.lock() {
        node.disconnect_peer(peer);
    }
}
