//! Inbound stream transport: accept loop and per-socket read loops.
//!
//! One accept loop per listen address; each accepted socket gets its own
//! read loop decoding length-prefixed frames into envelope batches. Ping
//! frames keep the connection alive, produce no envelope, and are logged
//! only at trace level. Decoded envelopes are journaled and hydrated into
//! the worker queue in frame order.

use std::net::SocketAddr;
use std::sync::Arc;

use courier_core::{decode_batch, Envelope, EnvelopeStatus, PING_MESSAGE_TYPE};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::node::RuntimeInner;
use crate::store::DurabilityStore;
use crate::transport::framing;

/// Binds the listener socket for a TCP listen address.
///
/// Returns the bound socket address, which resolves an OS-assigned port
/// when the configured port is 0.
///
/// # Errors
///
/// Fails when the address is not a TCP address or the bind is refused.
pub(crate) async fn bind(
    address: &courier_core::Address,
) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let socket_addr = address
        .socket_addr()
        .ok_or_else(|| anyhow::anyhow!("{address} is not a tcp listen address"))?;
    let listener = TcpListener::bind(&socket_addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(address = %address, bound = %bound, "listening for envelopes");
    Ok((listener, bound))
}

/// Spawns the accept loop for a bound listener.
pub(crate) fn spawn(runtime: Arc<RuntimeInner>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = runtime.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(read_loop(Arc::clone(&runtime), stream, peer));
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::debug!("listener stopped");
    })
}

async fn read_loop(runtime: Arc<RuntimeInner>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(
        stream,
        framing::wire_codec(runtime.config.transport.max_frame_bytes),
    );
    let mut shutdown = runtime.shutdown.subscribe();

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = framed.next() => frame,
        };
        match frame {
            None => break,
            Some(Err(error)) => {
                tracing::warn!(peer = %peer, error = %error, "dropping connection on frame error");
                break;
            }
            Some(Ok(payload)) => {
                metrics::counter!("courier_frames_received_total").increment(1);
                if framing::is_ping_frame(&payload) {
                    tracing::trace!(peer = %peer, "ping");
                    continue;
                }
                match decode_batch(&payload) {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            if !hydrate(&runtime, envelope).await {
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        metrics::counter!("courier_frames_undecodable_total").increment(1);
                        tracing::warn!(peer = %peer, error = %error, "undecodable batch dropped");
                    }
                }
            }
        }
    }
    tracing::debug!(peer = %peer, "connection closed");
}

/// Journals a received envelope and feeds it into the worker queue.
///
/// Returns `false` when the worker queue is gone, which only happens
/// during shutdown.
async fn hydrate(runtime: &RuntimeInner, mut envelope: Envelope) -> bool {
    if envelope.message_type == PING_MESSAGE_TYPE {
        tracing::trace!(envelope = %envelope.id, "ignoring ping envelope");
        return true;
    }

    envelope.status = EnvelopeStatus::Queued;
    // Restamp with this node's configured listen address so later routing
    // (requeue, scheduled release) recognizes the envelope as ours.
    envelope.destination = runtime.config.listen_address.clone();

    if let Err(error) = runtime.store.persist(&envelope).await {
        tracing::warn!(envelope = %envelope.id, error = %error, "failed to journal inbound envelope");
    }
    runtime.dispatch_tx.send(envelope).await.is_ok()
}
