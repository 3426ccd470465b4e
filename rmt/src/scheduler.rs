//! Output queue disciplines.
use naming::QosId;
use pdu::Pdu;
use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;

/// Scheduling discipline of an output queue.
pub trait Scheduler: Send {
    /// Queues a PDU.
    fn enqueue(&mut self, pdu: Pdu);

    /// Returns the next PDU to transmit.
    fn dequeue(&mut self) -> Option<Pdu>;

    /// Number of queued PDUs.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First in first out.
#[derive(Default)]
pub struct Fifo(VecDeque<Pdu>);

impl Scheduler for Fifo {
    fn enqueue(&mut self, pdu: Pdu) {
        self.0.push_back(pdu);
    }

    fn dequeue(&mut self) -> Option<Pdu> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Strict priority by QoS id, lower ids first. FIFO within a QoS id.
#[derive(Default)]
pub struct QosPriority {
    queues: BTreeMap<QosId, VecDeque<Pdu>>,
    len: usize,
}

impl Scheduler for QosPriority {
    fn enqueue(&mut self, pdu: Pdu) {
        let qos_id = pdu.pci().qos_id();
        self.queues.entry(qos_id).or_default().push_back(pdu);
        self.len += 1;
    }

    fn dequeue(&mut self) -> Option<Pdu> {
        let pdu = self
            .queues
            .values_mut()
            .find(|queue| !queue.is_empty())?
            .pop_front()?;
        self.len -= 1;
        Some(pdu)
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Selects a scheduler, `rmt.scheduler` in the DIF configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerKind {
    /// `fifo`
    Fifo,
    /// `qos-priority`
    QosPriority,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::Fifo
    }
}

impl SchedulerKind {
    /// Creates an empty queue.
    pub fn build(self) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Fifo => Box::new(Fifo::default()),
            SchedulerKind::QosPriority => Box::new(QosPriority::default()),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "fifo" => Ok(SchedulerKind::Fifo),
            "qos-priority" => Ok(SchedulerKind::QosPriority),
            _ => Err(()),
        }
    }
}
