use crate::scheduler::Scheduler;
use async_std::channel::{bounded, Receiver, Sender};
use channel::Channel;
use naming::PortId;
use pdu::{Pdu, SinkError};
use std::sync::{Arc, Mutex};

/// An N-1 port: a channel and its output queue.
pub(crate) struct OutputPort {
    pub id: PortId,
    pub channel: Arc<dyn Channel>,
    queue: Mutex<Box<dyn Scheduler>>,
    capacity: usize,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl OutputPort {
    pub fn new(
        id: PortId,
        channel: Arc<dyn Channel>,
        queue: Box<dyn Scheduler>,
        capacity: usize,
    ) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            id,
            channel,
            queue: Mutex::new(queue),
            capacity,
            doorbell_tx,
            doorbell_rx,
        }
    }

    pub fn push(&self, pdu: Pdu) -> Result<(), SinkError> {
        if self.doorbell_tx.is_closed() {
            return Err(SinkError::Closed);
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                return Err(SinkError::QueueFull);
            }
            queue.enqueue(pdu);
        }
        // A full doorbell already wakes the worker.
        self.doorbell_tx.try_send(()).ok();
        Ok(())
    }

    pub fn pop(&self) -> Option<Pdu> {
        self.queue.lock().unwrap().dequeue()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Waits until a PDU was queued. Returns `false` once the port closed
    /// and its queue is empty.
    pub async fn ready(&self) -> bool {
        if self.len() > 0 {
            return true;
        }
        self.doorbell_rx.recv().await.is_ok() || self.len() > 0
    }

    pub fn close(&self) {
        self.doorbell_tx.close();
    }
}
