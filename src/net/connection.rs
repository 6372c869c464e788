//! Per-connection tasks: read loop, ordered packet worker and socket writer.
//!
//! ```text
//!  socket ──read──▶ read_loop ──Packet──▶ [bounded queue] ──▶ process_loop ──▶ dispatch
//!                                                                  │
//!  socket ◀─write── write_loop ◀──frames── [bounded queue] ◀── registry.send
//! ```
//! One worker per connection drains the packet queue, so packets of a
//! connection are handled strictly in arrival order while connections run in
//! parallel. The writer owns the write half, so frames to one socket are
//! written in the order they were queued.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::node::NodeContext;
use crate::net::dispatch;
use crate::protocol::packet::{self, Packet, HEADER_LEN};
use crate::session::{SessionHandle, SessionLink};
use crate::types::{NetConfig, Result};

/// Run one accepted connection until the peer leaves, a transport error
/// occurs, or its session is closed.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: NodeContext,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();
    let (mut link, outbound) = SessionLink::channel(peer, ctx.config.net.outbound_queue_capacity);
    link.closer = shutdown.child_token();
    let closer = link.closer.clone();
    let session = ctx.sessions.create_session(link);

    let span = tracing::info_span!("conn", session = %session.id(), %peer);
    async move {
        ctx.sessions.dump_sessions();

        let writer_task = tokio::spawn(write_loop(writer, outbound, closer.clone()).in_current_span());
        let (packets_tx, packets_rx) = mpsc::channel(ctx.config.net.packet_queue_capacity);
        let worker = tokio::spawn(
            process_loop(ctx.clone(), session.clone(), packets_rx, closer.clone()).in_current_span(),
        );

        match read_loop(reader, packets_tx, &closer, &ctx.config.net).await {
            Ok(()) => tracing::info!("session closed"),
            Err(e) => tracing::info!("session closed ({})", e),
        }

        ctx.sessions.close_session(&session);
        if let Err(e) = worker.await {
            tracing::error!("connection worker failed: {}", e);
        }
        if let Err(e) = writer_task.await {
            tracing::error!("connection writer failed: {}", e);
        }
        ctx.sessions.dump_sessions();
    }
    .instrument(span)
    .await
}

/// Read bytes, cut them into packets and queue each packet for the worker.
///
/// Returns `Ok(())` on peer close or cancellation; any transport failure or
/// oversize frame is an error.
pub async fn read_loop<R>(
    mut reader: R,
    packets: mpsc::Sender<Packet>,
    closer: &CancellationToken,
    net: &NetConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = vec![0u8; net.read_buffer_size];
    let mut pending = BytesMut::with_capacity(net.read_buffer_size);

    loop {
        let n = tokio::select! {
            _ = closer.cancelled() => return Ok(()),
            read = reader.read(&mut scratch) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&scratch[..n]);

        while pending.len() >= HEADER_LEN {
            match packet::unpack(&mut pending, net.max_body_bytes) {
                Ok(Some(packet)) => {
                    if packets.send(packet).await.is_err() {
                        // Worker is gone; the connection is shutting down.
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal_to_connection() => return Err(e),
                Err(e) => tracing::debug!("dropping frame: {}", e),
            }
        }
    }
}

/// Drain the packet queue in order.
async fn process_loop(
    ctx: NodeContext,
    session: SessionHandle,
    mut packets: mpsc::Receiver<Packet>,
    closer: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = closer.cancelled() => break,
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        dispatch::process_packet(&ctx, &session, packet).await;
    }
}

/// Write queued frames to the socket in order. Frames already queued when the
/// connection is closed are still flushed.
pub async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<Bytes>, closer: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closer.cancelled() => break,
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("write failed: {}", e);
            closer.cancel();
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::trace!("socket shutdown: {}", e);
    }
}
