use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a DTP instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DtpCounters {
    /// SDUs accepted for writing.
    pub tx_sdus: u64,
    /// Data PDUs handed to the RMT, retransmissions excluded.
    pub tx_pdus: u64,
    /// Data PDUs retransmitted.
    pub retransmitted: u64,
    /// Data PDUs that waited in the closed window queue.
    pub queued: u64,
    /// Data PDUs received.
    pub rx_pdus: u64,
    /// SDUs delivered to the user.
    pub rx_sdus: u64,
    /// Received PDUs dropped as duplicate, outside the window or beyond a
    /// gap.
    pub dropped: u64,
    /// Sequence numbers skipped over.
    pub lost: u64,
    /// Fragments discarded because their SDU could not be reassembled.
    pub discarded: u64,
    /// Control PDUs sent.
    pub control_tx: u64,
    /// Control PDUs received.
    pub control_rx: u64,
    /// PDUs the RMT refused.
    pub sink_errors: u64,
    /// PDUs dropped by a full receive queue.
    pub rx_overflow: u64,
}

#[derive(Default)]
pub(crate) struct DtpStats {
    pub tx_sdus: AtomicU64,
    pub tx_pdus: AtomicU64,
    pub retransmitted: AtomicU64,
    pub queued: AtomicU64,
    pub rx_pdus: AtomicU64,
    pub rx_sdus: AtomicU64,
    pub dropped: AtomicU64,
    pub lost: AtomicU64,
    pub discarded: AtomicU64,
    pub control_tx: AtomicU64,
    pub control_rx: AtomicU64,
    pub sink_errors: AtomicU64,
    pub rx_overflow: AtomicU64,
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    if n > 0 {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl DtpStats {
    pub fn snapshot(&self) -> DtpCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DtpCounters {
            tx_sdus: get(&self.tx_sdus),
            tx_pdus: get(&self.tx_pdus),
            retransmitted: get(&self.retransmitted),
            queued: get(&self.queued),
            rx_pdus: get(&self.rx_pdus),
            rx_sdus: get(&self.rx_sdus),
            dropped: get(&self.dropped),
            lost: get(&self.lost),
            discarded: get(&self.discarded),
            control_tx: get(&self.control_tx),
            control_rx: get(&self.control_rx),
            sink_errors: get(&self.sink_errors),
            rx_overflow: get(&self.rx_overflow),
        }
    }
}
