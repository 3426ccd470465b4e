use crate::DtcpError;
use log::trace;
use pdu::{Pdu, SeqNum, SeqSpace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Transmission {
    seq: SeqNum,
    pdu: Pdu,
    last_tx: Instant,
    rtx: u32,
}

/// Queue of sent PDUs that have not yet been acknowledged.
///
/// Entries are kept in transmission order, which is sequence number order.
pub struct RetransmissionControl {
    space: SeqSpace,
    rto: Duration,
    max_rtx: u32,
    queue: VecDeque<Transmission>,
}

impl RetransmissionControl {
    pub fn new(space: SeqSpace, rto: Duration, max_rtx: u32) -> Self {
        Self {
            space,
            rto,
            max_rtx,
            queue: Default::default(),
        }
    }

    /// Registers a PDU for potential retransmission.
    pub fn send(&mut self, pdu: &Pdu, now: Instant) {
        self.queue.push_back(Transmission {
            seq: pdu.seq(),
            pdu: pdu.clone(),
            last_tx: now,
            rtx: 0,
        });
    }

    /// Releases every PDU below `ack`, returns how many were released.
    pub fn ack(&mut self, ack: SeqNum) -> usize {
        let mut acked = 0;
        while let Some(tx) = self.queue.front() {
            if !self.space.lt(tx.seq, ack) {
                break;
            }
            self.queue.pop_front();
            acked += 1;
        }
        acked
    }

    /// Returns copies of the listed PDUs that are still unacknowledged.
    pub fn nack(&mut self, missing: &[SeqNum], now: Instant) -> Vec<Pdu> {
        let mut resend = Vec::new();
        for tx in self.queue.iter_mut() {
            if missing.contains(&tx.seq) {
                trace!("nack {}", tx.seq);
                tx.rtx += 1;
                tx.last_tx = now;
                resend.push(tx.pdu.clone());
            }
        }
        resend
    }

    /// Returns copies of every PDU whose timer expired.
    pub fn expired(&mut self, now: Instant) -> Result<Vec<Pdu>, DtcpError> {
        let mut resend = Vec::new();
        for tx in self.queue.iter_mut() {
            if now.saturating_duration_since(tx.last_tx) < self.rto {
                continue;
            }
            if tx.rtx >= self.max_rtx {
                return Err(DtcpError::RetransmissionsExceeded {
                    seq: tx.seq,
                    attempts: tx.rtx,
                });
            }
            trace!("retransmit {}", tx.seq);
            tx.rtx += 1;
            tx.last_tx = now;
            resend.push(tx.pdu.clone());
        }
        Ok(resend)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every outstanding PDU, returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let len = self.queue.len();
        self.queue.clear();
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pdu::{Pci, PduType};

    fn pdu(seq: SeqNum) -> Pdu {
        let mut pci = Pci::new(PduType::Data);
        pci.set_seq(seq);
        Pdu::new(pci, Bytes::from(vec![seq as u8]))
    }

    fn rtx(max_rtx: u32) -> RetransmissionControl {
        RetransmissionControl::new(SeqSpace::default(), Duration::from_millis(10), max_rtx)
    }

    #[test]
    fn test_timeout() {
        let now = Instant::now();
        let mut rtx = rtx(0);
        rtx.send(&pdu(10), now);
        assert!(rtx.expired(now).unwrap().is_empty());
        match rtx.expired(now + Duration::from_millis(10)) {
            Err(DtcpError::RetransmissionsExceeded { seq: 10, attempts: 0 }) => {}
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_transmission() {
        let now = Instant::now();
        let mut rtx = rtx(0);
        rtx.send(&pdu(20), now);
        rtx.send(&pdu(21), now);
        assert_eq!(rtx.ack(21), 1);
        assert_eq!(rtx.len(), 1);
        assert_eq!(rtx.ack(22), 1);
        assert!(rtx.is_empty());
        assert!(rtx.expired(now + Duration::from_secs(1)).unwrap().is_empty());
    }

    #[test]
    fn test_retransmission() {
        let now = Instant::now();
        let mut rtx = rtx(1);
        rtx.send(&pdu(30), now);
        let later = now + Duration::from_millis(10);
        let resend = rtx.expired(later).unwrap();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].payload(), [30]);
        // Timer restarted by the retransmission.
        assert!(rtx.expired(later + Duration::from_millis(5)).unwrap().is_empty());
        assert!(rtx.expired(later + Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_nack() {
        let now = Instant::now();
        let mut rtx = rtx(1);
        for seq in 40..44 {
            rtx.send(&pdu(seq), now);
        }
        let resend = rtx.nack(&[41, 43, 50], now);
        let seqs: Vec<_> = resend.iter().map(Pdu::seq).collect();
        assert_eq!(seqs, vec![41, 43]);
        assert_eq!(rtx.clear(), 4);
    }

    #[test]
    fn test_ack_wraps() {
        let space = SeqSpace::new(32);
        let now = Instant::now();
        let mut rtx = RetransmissionControl::new(space, Duration::from_millis(10), 1);
        let max = u64::from(u32::max_value());
        rtx.send(&pdu(max), now);
        rtx.send(&pdu(0), now);
        assert_eq!(rtx.ack(1), 2);
    }
}
