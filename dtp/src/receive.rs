//! Receive side state vector: sequencing, gap handling and reassembly.
use crate::config::DtpConfig;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use pdu::{Pdu, Sdu, SeqNum, SeqSpace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What happens to a gap that the A-timer gave up waiting for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum GapPolicy {
    /// Report the gap and wait for retransmissions.
    Retransmit,
    /// Count the gap as lost and deliver what follows it.
    Skip,
    /// Count the gap as lost and discard what follows it.
    Drop,
}

/// Result of feeding the state vector.
#[derive(Debug, Default)]
pub(crate) struct Delivery {
    /// Completed SDUs in order.
    pub sdus: Vec<Sdu>,
    /// The PDU advanced or extended the receive window.
    pub accepted: bool,
    /// The PDU was received before.
    pub duplicate: bool,
    /// PDUs dropped.
    pub dropped: u64,
    /// Sequence numbers skipped over.
    pub lost: u64,
    /// Fragments discarded by reassembly.
    pub discarded: u64,
    /// Sequence numbers to report in a selective ack.
    pub missing: Option<Vec<SeqNum>>,
}

pub(crate) struct RecvState {
    space: SeqSpace,
    max_gap: u64,
    max_sdu: usize,
    a_timer: Duration,
    inactivity: Duration,
    policy: GapPolicy,
    /// Next expected sequence number, `None` until a data run starts.
    next: Option<SeqNum>,
    /// In order PDUs waiting for the A-timer.
    held: VecDeque<Pdu>,
    /// Out of order PDUs, sorted by sequence number.
    ooo: Vec<Pdu>,
    /// Fragments of the SDU being reassembled.
    partial: Vec<Bytes>,
    partial_len: usize,
    a_deadline: Option<Instant>,
    last_rx: Option<Instant>,
    /// SDUs completed while no user was attached.
    pub undelivered: VecDeque<Sdu>,
}

impl RecvState {
    pub fn new(config: &DtpConfig) -> Self {
        let policy = match config.dtcp() {
            Some(dtcp) if dtcp.is_reliable() => GapPolicy::Retransmit,
            Some(_) => GapPolicy::Skip,
            None => GapPolicy::Drop,
        };
        Self {
            space: config.seq_space(),
            max_gap: config.max_gap(),
            max_sdu: config.max_sdu_size(),
            a_timer: config.a_timer(),
            inactivity: config.receiver_inactivity(),
            policy,
            next: None,
            held: Default::default(),
            ooo: Default::default(),
            partial: Default::default(),
            partial_len: 0,
            a_deadline: None,
            last_rx: None,
            undelivered: Default::default(),
        }
    }

    /// Next expected sequence number.
    pub fn next_expected(&self) -> Option<SeqNum> {
        self.next
    }

    /// Deadline of the A-timer.
    pub fn a_deadline(&self) -> Option<Instant> {
        self.a_deadline
    }

    pub fn receive(&mut self, pdu: Pdu, now: Instant) -> Delivery {
        let mut d = Delivery::default();
        if let Some(last) = self.last_rx {
            if now.saturating_duration_since(last) >= self.inactivity {
                trace!("receiver inactive, forgetting data run");
                d.dropped += self.clear() as u64;
                self.last_rx = None;
            }
        }

        let seq = pdu.seq();
        let next = match self.next {
            Some(next) => next,
            None if pdu.pci().drf() || self.policy != GapPolicy::Retransmit => {
                trace!("data run starts at {}", seq);
                self.next = Some(seq);
                seq
            }
            None => {
                trace!("pdu {} precedes the data run", seq);
                d.dropped += 1;
                return d;
            }
        };
        if self.space.lt(seq, next) {
            trace!("duplicate pdu {}", seq);
            d.dropped += 1;
            d.duplicate = true;
            return d;
        }
        let distance = self.space.distance(next, seq);
        if distance > self.max_gap {
            trace!("pdu {} beyond the window at {}", seq, next);
            d.dropped += 1;
            return d;
        }
        if distance == 0 {
            self.accept(pdu, &mut d);
            self.drain_ooo(&mut d);
        } else if self.ooo.iter().any(|p| p.seq() == seq) {
            trace!("duplicate pdu {}", seq);
            d.dropped += 1;
            d.duplicate = true;
            return d;
        } else if self.a_timer == Duration::from_millis(0) && self.policy != GapPolicy::Retransmit {
            trace!("skipping gap {}..{}", next, seq);
            d.lost += distance;
            self.discard_partial(&mut d);
            self.next = Some(seq);
            self.accept(pdu, &mut d);
        } else {
            let new_gap = self.ooo.is_empty();
            let pos = self
                .ooo
                .iter()
                .position(|p| self.space.gt(p.seq(), seq))
                .unwrap_or_else(|| self.ooo.len());
            self.ooo.insert(pos, pdu);
            if new_gap && self.policy == GapPolicy::Retransmit {
                d.missing = Some(self.missing());
            }
        }
        d.accepted = true;
        self.last_rx = Some(now);
        self.arm(now);
        d
    }

    /// Runs the A-timer.
    pub fn expire(&mut self, now: Instant) -> Delivery {
        let mut d = Delivery::default();
        match self.a_deadline {
            Some(deadline) if now >= deadline => self.a_deadline = None,
            _ => return d,
        }
        self.flush_held(&mut d);
        if !self.ooo.is_empty() {
            match self.policy {
                GapPolicy::Retransmit => d.missing = Some(self.missing()),
                GapPolicy::Skip => {
                    while let Some(seq) = self.ooo.first().map(Pdu::seq) {
                        let next = self.next.unwrap_or(seq);
                        trace!("skipping gap {}..{}", next, seq);
                        d.lost += self.space.distance(next, seq);
                        self.discard_partial(&mut d);
                        self.next = Some(seq);
                        self.drain_ooo(&mut d);
                    }
                    self.flush_held(&mut d);
                }
                GapPolicy::Drop => {
                    let first = self.ooo[0].seq();
                    let last = self.ooo[self.ooo.len() - 1].seq();
                    let next = self.next.unwrap_or(first);
                    trace!("dropping {}..={} after gap at {}", first, last, next);
                    d.lost += self.space.distance(next, first);
                    d.dropped += self.ooo.len() as u64;
                    self.ooo.clear();
                    self.discard_partial(&mut d);
                    self.next = Some(self.space.add(last, 1));
                }
            }
        }
        self.arm(now);
        d
    }

    /// Sequence numbers missing below the highest out of order PDU.
    pub fn missing(&self) -> Vec<SeqNum> {
        let mut missing = Vec::new();
        let mut seq = match self.next {
            Some(next) => next,
            None => return missing,
        };
        for pdu in &self.ooo {
            while self.space.lt(seq, pdu.seq()) {
                missing.push(seq);
                seq = self.space.add(seq, 1);
            }
            seq = self.space.add(pdu.seq(), 1);
        }
        missing
    }

    /// Forgets the data run, returns the number of buffers released.
    pub fn clear(&mut self) -> usize {
        let released = self.held.len() + self.ooo.len() + self.partial.len();
        self.held.clear();
        self.ooo.clear();
        self.partial.clear();
        self.partial_len = 0;
        self.next = None;
        self.a_deadline = None;
        released
    }

    fn accept(&mut self, pdu: Pdu, d: &mut Delivery) {
        self.next = Some(self.space.add(pdu.seq(), 1));
        if self.a_timer == Duration::from_millis(0) {
            self.reassemble(pdu, d);
        } else {
            self.held.push_back(pdu);
        }
    }

    fn drain_ooo(&mut self, d: &mut Delivery) {
        while !self.ooo.is_empty() && Some(self.ooo[0].seq()) == self.next {
            let pdu = self.ooo.remove(0);
            self.accept(pdu, d);
        }
    }

    fn flush_held(&mut self, d: &mut Delivery) {
        while let Some(pdu) = self.held.pop_front() {
            self.reassemble(pdu, d);
        }
    }

    fn arm(&mut self, now: Instant) {
        if self.a_timer == Duration::from_millis(0) || self.a_deadline.is_some() {
            return;
        }
        if !self.held.is_empty() || !self.ooo.is_empty() {
            self.a_deadline = Some(now + self.a_timer);
        }
    }

    fn reassemble(&mut self, pdu: Pdu, d: &mut Delivery) {
        let first = pdu.pci().first_fragment();
        let last = pdu.pci().last_fragment();
        let seq = pdu.seq();
        if first {
            self.discard_partial(d);
        } else if self.partial.is_empty() {
            trace!("fragment {} without a first fragment", seq);
            d.discarded += 1;
            return;
        }
        let payload = pdu.into_payload();
        self.partial_len += payload.len();
        self.partial.push(payload);
        if self.partial_len > self.max_sdu {
            trace!("sdu exceeds {} bytes", self.max_sdu);
            self.discard_partial(d);
            return;
        }
        if last {
            let sdu = if self.partial.len() == 1 {
                self.partial.remove(0)
            } else {
                let mut buf = BytesMut::with_capacity(self.partial_len);
                for fragment in self.partial.drain(..) {
                    buf.put_slice(&fragment);
                }
                buf.freeze()
            };
            self.partial.clear();
            self.partial_len = 0;
            d.sdus.push(Sdu::new(sdu));
        }
    }

    fn discard_partial(&mut self, d: &mut Delivery) {
        if !self.partial.is_empty() {
            trace!("discarding {} fragments", self.partial.len());
            d.discarded += self.partial.len() as u64;
            self.partial.clear();
        }
        self.partial_len = 0;
    }
}
