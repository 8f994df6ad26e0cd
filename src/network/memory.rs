//! In-process loopback connection

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::Connection;
use crate::error::{ConnectionError, ConnectionResult};
use crate::protocol::SerializedFrame;

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-memory connection pair
///
/// Closing either end makes both ends fail with `ConnectionError::Closed`.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    tx: Mutex<Option<mpsc::Sender<SerializedFrame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<SerializedFrame>>,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = MemoryInner {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            closed: watch::channel(false).0,
        };
        let b = MemoryInner {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            closed: watch::channel(false).0,
        };

        (
            Self { inner: Arc::new(a) },
            Self { inner: Arc::new(b) },
        )
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: SerializedFrame) -> ConnectionResult<()> {
        let tx = self.inner.tx.lock().clone().ok_or(ConnectionError::Closed)?;
        tx.send(frame).await.map_err(|_| ConnectionError::Closed)
    }

    async fn receive(&self) -> ConnectionResult<SerializedFrame> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnectionError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Closed),
            frame = rx.recv() => frame.ok_or(ConnectionError::Closed),
        }
    }

    async fn close(&self) {
        // Dropping our sender ends the peer's receive stream
        self.inner.tx.lock().take();
        self.inner.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryConnection::pair();
        a.send(SerializedFrame::Text("one".into())).await.unwrap();
        a.send(SerializedFrame::Binary(Bytes::from_static(b"two"))).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), SerializedFrame::Text("one".into()));
        assert_eq!(
            b.receive().await.unwrap(),
            SerializedFrame::Binary(Bytes::from_static(b"two"))
        );
    }

    #[tokio::test]
    async fn test_close_releases_local_receiver() {
        let (a, _b) = MemoryConnection::pair();
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.close().await;
        a.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert!(a.is_closed());
        assert!(matches!(a.send(SerializedFrame::Text("x".into())).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (a, b) = MemoryConnection::pair();
        a.close().await;
        assert!(matches!(b.receive().await, Err(ConnectionError::Closed)));
    }
}
