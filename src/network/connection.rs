//! TCP connection
//!
//! Frames a `TcpStream` with the wire codec and implements the `Connection`
//! contract on top of it:
//! - Ping messages are answered with a pong without surfacing
//! - A close message from the peer ends the connection
//! - Statistics are kept for diagnostics

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::Connection;
use crate::error::{ConnectionError, ConnectionResult};
use crate::protocol::{Decoder, Encoder, SerializedFrame, WireMessage};

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Pings answered on behalf of the node
    pub pings_answered: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pings_answered: AtomicU64,
}

struct ReadSide {
    stream: OwnedReadHalf,
    decoder: Decoder,
    buf: BytesMut,
}

struct WriteSide {
    stream: OwnedWriteHalf,
    encoder: Encoder,
    buf: BytesMut,
}

/// A `Connection` over a TCP stream
pub struct TcpConnection {
    remote_addr: SocketAddr,
    reader: Mutex<ReadSide>,
    writer: Mutex<WriteSide>,
    closed: watch::Sender<bool>,
    stats: AtomicStats,
}

impl TcpConnection {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            remote_addr,
            reader: Mutex::new(ReadSide {
                stream: read,
                decoder: Decoder::new(),
                buf: BytesMut::with_capacity(4096),
            }),
            writer: Mutex::new(WriteSide {
                stream: write,
                encoder: Encoder::new(),
                buf: BytesMut::with_capacity(4096),
            }),
            closed: watch::channel(false).0,
            stats: AtomicStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            pings_answered: self.stats.pings_answered.load(Ordering::Relaxed),
        }
    }

    async fn write(&self, message: &WireMessage) -> ConnectionResult<()> {
        let mut writer = self.writer.lock().await;
        let WriteSide { stream, encoder, buf } = &mut *writer;

        buf.clear();
        encoder.encode(message, buf)?;
        stream.write_all(buf).await?;
        stream.flush().await?;

        self.stats
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read the next message off the stream
    async fn read(&self) -> ConnectionResult<WireMessage> {
        let mut reader = self.reader.lock().await;
        let ReadSide {
            stream,
            decoder,
            buf,
        } = &mut *reader;

        loop {
            if let Some(envelope) = decoder.decode(buf)? {
                return Ok(envelope.message);
            }

            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }

            buf.extend_from_slice(&chunk[..n]);
            self.stats
                .bytes_received
                .fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    async fn receive_inner(&self) -> ConnectionResult<SerializedFrame> {
        loop {
            match self.read().await? {
                WireMessage::Frame(frame) => {
                    self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(frame);
                }
                WireMessage::Ping(nonce) => {
                    tracing::trace!(remote = %self.remote_addr, nonce, "answering ping");
                    self.write(&WireMessage::Pong(nonce)).await?;
                    self.stats.pings_answered.fetch_add(1, Ordering::Relaxed);
                }
                WireMessage::Pong(_) => {}
                WireMessage::Close => {
                    tracing::debug!(remote = %self.remote_addr, "peer closed connection");
                    self.closed.send_replace(true);
                    return Err(ConnectionError::Closed);
                }
            }
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: SerializedFrame) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        self.write(&WireMessage::Frame(frame))
            .await
            .map_err(|e| match e {
                ConnectionError::Closed => ConnectionError::Closed,
                other => ConnectionError::Transport(other.to_string()),
            })?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self) -> ConnectionResult<SerializedFrame> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnectionError::Closed);
        }

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Closed),
            result = self.receive_inner() => result.map_err(|e| {
                if !matches!(e, ConnectionError::Closed) {
                    tracing::debug!(remote = %self.remote_addr, error = %e, "receive failed");
                }
                ConnectionError::Closed
            }),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        // Best effort: tell the peer, then shut our half down
        let _ = self.write(&WireMessage::Close).await;
        let mut writer = self.writer.lock().await;
        let _ = writer.stream.shutdown().await;
        tracing::debug!(remote = %self.remote_addr, "connection closed");
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
