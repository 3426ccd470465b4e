//! Defines the `Channel` trait.
//!
//! A channel is an N-1 flow as seen by the relaying and multiplexing task:
//! it moves opaque frames, each one an encoded PDU, and gives no guarantee
//! about loss, duplication or ordering.
#![deny(missing_docs)]
use async_std::channel::{unbounded, Receiver, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Error, ErrorKind, Result};

/// Channel trait is used to decouple the RMT from the N-1 DIF.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Receive a frame from the channel.
    async fn recv(&self) -> Result<Bytes>;

    /// Send a frame to the channel.
    async fn send(&self, frame: Bytes) -> Result<()>;
}

fn closed() -> Error {
    Error::new(ErrorKind::BrokenPipe, "channel closed")
}

/// An in-memory channel.
///
/// `Loopback::default()` returns every frame sent on it, `Loopback::pair()`
/// creates two connected ends.
#[derive(Clone)]
pub struct Loopback {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl Default for Loopback {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl Loopback {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (atx, brx) = unbounded();
        let (btx, arx) = unbounded();
        (Self { tx: atx, rx: arx }, Self { tx: btx, rx: brx })
    }

    /// Closes the sending direction, the peer's `recv` fails once drained.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[async_trait]
impl Channel for Loopback {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| closed())
    }

    async fn recv(&self) -> Result<Bytes> {
        self.rx.recv().await.map_err(|_| closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    #[test]
    fn test_loopback() {
        task::block_on(async {
            let ch = Loopback::default();
            ch.send(Bytes::from_static(b"ping")).await.unwrap();
            assert_eq!(ch.pending(), 1);
            let msg = ch.recv().await.unwrap();
            assert_eq!(&msg[..], b"ping");
        });
    }

    #[test]
    fn test_pair() {
        task::block_on(async {
            let (a, b) = Loopback::pair();
            a.send(Bytes::from_static(b"ping")).await.unwrap();
            b.send(Bytes::from_static(b"pong")).await.unwrap();
            assert_eq!(&b.recv().await.unwrap()[..], b"ping");
            assert_eq!(&a.recv().await.unwrap()[..], b"pong");
            a.close();
            assert!(b.recv().await.is_err());
        });
    }
}
