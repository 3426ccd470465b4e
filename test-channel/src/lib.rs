//! N-1 channels that lose, hold back and repeat frames, for exercising the
//! data transfer machinery over an imperfect link.
#![deny(missing_docs)]
use async_trait::async_trait;
use bytes::Bytes;
use channel::{Channel, Loopback};
use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Mutex};

/// Selects frames that never reach the peer. Returning `true` drops the
/// frame.
pub type Filter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One direction of a lossy link.
#[derive(Clone)]
struct Link {
    deliver: f64,
    hold: f64,
    filter: Option<Filter>,
    /// Frames held back until the next send.
    held: Arc<Mutex<VecDeque<Bytes>>>,
    wire: Loopback,
}

impl Link {
    fn new(deliver: f64, hold: f64, filter: Option<Filter>) -> Self {
        Self {
            deliver,
            hold,
            filter,
            held: Default::default(),
            wire: Default::default(),
        }
    }

    fn release_held(&self) -> Vec<Bytes> {
        self.held.lock().unwrap().drain(..).collect()
    }
}

#[async_trait]
impl Channel for Link {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.filter.as_ref().map_or(false, |filter| filter(&frame)) {
            return Ok(());
        }
        let roll: f64 = rand::random();
        if roll < self.deliver {
            self.wire.send(frame.clone()).await?;
        }
        // Held frames overtake nothing, they follow the current one.
        for held in self.release_held() {
            self.wire.send(held).await?;
        }
        if roll < self.hold {
            self.held.lock().unwrap().push_back(frame);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        self.wire.recv().await
    }
}

/// One end of a lossy link.
pub struct LossyChannel {
    rx: Link,
    tx: Link,
}

#[async_trait]
impl Channel for LossyChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).await
    }

    async fn recv(&self) -> Result<Bytes> {
        self.rx.recv().await
    }
}

impl LossyChannel {
    /// Closes the sending direction, the peer's `recv` fails once the
    /// frames in flight are read.
    pub fn close(&self) {
        self.tx.wire.close();
    }
}

/// Configures a pair of lossy channel ends.
pub struct LossyChannelBuilder {
    deliver: f64,
    hold: f64,
    filter: Option<Filter>,
}

impl LossyChannelBuilder {
    /// Each frame sent is delivered at once with probability `deliver` and
    /// independently held back with probability `hold`. A held frame is
    /// delivered after the next frame sent in the same direction, arriving
    /// out of order, or a second time if it was also delivered at once.
    ///
    /// `(1.0, 0.0)` is a perfect link and `(0.0, 0.0)` a partitioned one.
    pub fn new(deliver: f64, hold: f64) -> Self {
        assert!((0.0..=1.0).contains(&deliver));
        assert!((0.0..=1.0).contains(&hold));
        Self {
            deliver,
            hold,
            filter: None,
        }
    }

    /// Drops the frames the filter selects, whatever the probabilities.
    ///
    /// Both directions share the filter.
    pub fn set_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Builds the two ends of the link.
    pub fn split(self) -> (LossyChannel, LossyChannel) {
        let forward = Link::new(self.deliver, self.hold, self.filter.clone());
        let backward = Link::new(self.deliver, self.hold, self.filter);
        let near = LossyChannel {
            rx: backward.clone(),
            tx: forward.clone(),
        };
        let far = LossyChannel {
            rx: forward,
            tx: backward,
        };
        (near, far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn frame(b: &'static [u8]) -> Bytes {
        Bytes::from_static(b)
    }

    async fn link() -> Result<()> {
        let perfect = Link::new(1.0, 0.0, None);
        perfect.send(frame(b"ping")).await?;
        assert_eq!(&perfect.recv().await?[..], b"ping");

        let partitioned = Link::new(0.0, 0.0, None);
        partitioned.send(frame(b"ping")).await?;
        assert_eq!(partitioned.wire.pending(), 0);

        // Each frame shows up again after the next one.
        let repeating = Link::new(1.0, 1.0, None);
        repeating.send(frame(b"ping")).await?;
        repeating.send(frame(b"pong")).await?;
        assert_eq!(&repeating.recv().await?[..], b"ping");
        assert_eq!(&repeating.recv().await?[..], b"pong");
        assert_eq!(&repeating.recv().await?[..], b"ping");

        // Held back only, so reordered.
        let reordering = Link::new(0.0, 1.0, None);
        reordering.send(frame(b"one")).await?;
        assert_eq!(reordering.wire.pending(), 0);
        reordering.send(frame(b"two")).await?;
        assert_eq!(&reordering.recv().await?[..], b"one");
        Ok(())
    }

    #[test]
    fn test_link() {
        task::block_on(link()).unwrap();
    }

    async fn lossy_channel() -> Result<()> {
        let (a, b) = LossyChannelBuilder::new(1.0, 0.0).split();
        a.send(frame(b"ping")).await?;
        assert_eq!(&b.recv().await?[..], b"ping");
        b.send(frame(b"pong")).await?;
        assert_eq!(&a.recv().await?[..], b"pong");
        Ok(())
    }

    #[test]
    fn test_lossy_channel() {
        task::block_on(lossy_channel()).unwrap();
    }

    async fn filtered_channel() -> Result<()> {
        let (a, b) = LossyChannelBuilder::new(1.0, 0.0)
            .set_filter(|frame| frame == b"drop")
            .split();
        a.send(frame(b"drop")).await?;
        a.send(frame(b"keep")).await?;
        assert_eq!(&b.recv().await?[..], b"keep");
        Ok(())
    }

    #[test]
    fn test_filtered_channel() {
        task::block_on(filtered_channel()).unwrap();
    }
}
