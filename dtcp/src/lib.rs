//! # DTCP implementation
//! DTCP is the optional control half of EFCP. A DTP instance consults it
//! before sending, reports every sent PDU and feeds it the control PDUs
//! received from the peer. DTCP never touches the network itself: it answers
//! with the PDUs to retransmit and the control messages to send, the DTP
//! hands them to the RMT.
//!
//! ## Reliable communication
//! With retransmission control enabled, PDUs are kept until the peer
//! acknowledges them. The receiver acknowledges cumulatively and reports
//! gaps with selective acks, the sender retransmits the listed PDUs at once
//! and any other unacknowledged PDU when its timer expires. A PDU that is not
//! acknowledged after the maximum number of retransmissions fails the
//! connection.
//!
//! ## Flow control
//! Mechanism to avoid a fast sender overwhelming a slow receiver. Window
//! based flow control limits the sender to sequence numbers below the right
//! window edge advertised by the receiver. Rate based flow control limits the
//! number of PDUs sent per time unit. Either, both or none can be enabled.
//!
//! ## Congestion avoidance
//! Only the hooks are provided: the ECN flag of the PCI and the window and
//! rate parameters. No policy is implemented.
//!
//! ## References
//! [0]: http://nes.fit.vutbr.cz/ivesely/specs/uploads/RINA/EFCPSpec140124.pdf
//! [1]: Timer-Based Mechanisms in Reliable Transport Connection Management
#![deny(missing_docs)]
mod flow;
mod packet;
mod retransmission;

use crate::flow::{RateFlowControl, WindowFlowControl};
pub use crate::packet::ControlMsg;
use crate::retransmission::RetransmissionControl;
use failure::Fail;
use log::{debug, trace};
use pdu::{Pdu, SeqNum, SeqSpace};
use std::time::{Duration, Instant};

/// Unrecoverable DTCP error.
#[derive(Debug, Fail)]
pub enum DtcpError {
    /// A PDU was not acknowledged in time.
    #[fail(display = "pdu {} unacknowledged after {} retransmissions", seq, attempts)]
    RetransmissionsExceeded {
        /// Sequence number of the PDU.
        seq: SeqNum,
        /// Retransmissions performed.
        attempts: u32,
    },
}

/// Builder for dtcp instances.
#[derive(Clone, Debug)]
pub struct DtcpConfig {
    /// Credit granted by the receiver, window flow control is off if `None`.
    window: Option<u64>,
    /// Duration to wait before retransmitting, retransmission control is off
    /// if `None`.
    rtx: Option<Duration>,
    /// Number of retransmissions before failing the connection.
    max_rtx: u32,
    /// PDUs per time unit, rate flow control is off if `None`.
    rate: Option<(u64, Duration)>,
}

impl Default for DtcpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DtcpConfig {
    /// Creates a new `DtcpConfig` with window flow control and
    /// retransmission control enabled.
    pub fn new() -> Self {
        Self {
            window: Some(64),
            rtx: Some(Duration::from_secs(1)),
            max_rtx: 2,
            rate: None,
        }
    }

    /// Enables window flow control granting `credit` PDUs.
    pub fn set_window(mut self, credit: u64) -> Self {
        assert!(credit > 0);
        self.window = Some(credit);
        self
    }

    /// Disables window flow control.
    pub fn no_window(mut self) -> Self {
        self.window = None;
        self
    }

    /// Enables retransmission control with the given timeout.
    pub fn set_rtx(mut self, rto: Duration) -> Self {
        self.rtx = Some(rto);
        self
    }

    /// Disables retransmission control.
    pub fn no_rtx(mut self) -> Self {
        self.rtx = None;
        self
    }

    /// Number of retransmissions before failing the connection.
    pub fn set_max_rtx(mut self, max_rtx: u32) -> Self {
        self.max_rtx = max_rtx;
        self
    }

    /// Enables rate flow control.
    pub fn set_rate(mut self, pdus: u64, time_unit: Duration) -> Self {
        assert!(pdus > 0);
        self.rate = Some((pdus, time_unit));
        self
    }

    /// Window credit.
    pub fn window(&self) -> Option<u64> {
        self.window
    }

    /// Retransmission timeout.
    pub fn rto(&self) -> Option<Duration> {
        self.rtx
    }

    /// Maximum number of retransmissions.
    pub fn max_rtx(&self) -> u32 {
        self.max_rtx
    }

    /// Sending rate.
    pub fn rate(&self) -> Option<(u64, Duration)> {
        self.rate
    }

    /// Returns `true` if lost PDUs are retransmitted.
    pub fn is_reliable(&self) -> bool {
        self.rtx.is_some()
    }

    /// Creates a dtcp instance for a connection whose first data PDU is
    /// numbered `first`.
    pub fn build(&self, space: SeqSpace, first: SeqNum, now: Instant) -> Dtcp {
        Dtcp {
            config: self.clone(),
            space,
            window: self
                .window
                .map(|credit| WindowFlowControl::new(space, first, credit)),
            rate: self
                .rate
                .map(|(pdus, unit)| RateFlowControl::new(pdus, unit, now)),
            rtx: self
                .rtx
                .map(|rto| RetransmissionControl::new(space, rto, self.max_rtx)),
            ctrl_seq: 0,
            last_ctrl_seq: None,
            lost_reported: 0,
        }
    }
}

/// Result of processing a control PDU.
#[derive(Debug, Default)]
pub struct ControlOutcome {
    /// The control PDU was older than one already processed.
    pub stale: bool,
    /// Number of PDUs released from the retransmission queue.
    pub acked: usize,
    /// The send window grew.
    pub window_opened: bool,
    /// PDUs to send again.
    pub retransmit: Vec<Pdu>,
}

/// Result of a timer tick.
#[derive(Debug, Default)]
pub struct TimerOutcome {
    /// PDUs whose retransmission timer expired.
    pub retransmit: Vec<Pdu>,
    /// A new rate time slice started after the rate was fulfilled.
    pub window_opened: bool,
}

/// Per connection DTCP state.
pub struct Dtcp {
    config: DtcpConfig,
    space: SeqSpace,
    window: Option<WindowFlowControl>,
    rate: Option<RateFlowControl>,
    rtx: Option<RetransmissionControl>,
    /// Next control sequence number to send.
    ctrl_seq: SeqNum,
    /// Largest control sequence number received.
    last_ctrl_seq: Option<SeqNum>,
    /// Sequence numbers the receiver dropped before processing them.
    lost_reported: u64,
}

impl Dtcp {
    /// Configuration of the instance.
    pub fn config(&self) -> &DtcpConfig {
        &self.config
    }

    /// Returns `true` if lost PDUs are retransmitted.
    pub fn is_reliable(&self) -> bool {
        self.rtx.is_some()
    }

    /// Returns `true` if `seq` may be sent now.
    pub fn window_open(&self, seq: SeqNum) -> bool {
        if let Some(window) = self.window.as_ref() {
            if !window.window_open(seq) {
                return false;
            }
        }
        if let Some(rate) = self.rate.as_ref() {
            if !rate.window_open() {
                return false;
            }
        }
        true
    }

    /// Returns `true` if the `count` PDUs starting at `first` may all be
    /// sent now.
    pub fn admits(&self, first: SeqNum, count: u64) -> bool {
        if count == 0 {
            return true;
        }
        if let Some(window) = self.window.as_ref() {
            if !window.window_open(self.space.add(first, count - 1)) {
                return false;
            }
        }
        self.rate.as_ref().map_or(true, |rate| rate.remaining() >= count)
    }

    /// Right window edge of the sender.
    pub fn send_window_end(&self) -> Option<SeqNum> {
        self.window.as_ref().map(WindowFlowControl::send_window_end)
    }

    /// Registers a PDU handed to the RMT for the first time.
    pub fn on_sent(&mut self, pdu: &Pdu, now: Instant) {
        if let Some(rate) = self.rate.as_mut() {
            rate.register_pdu();
        }
        if let Some(rtx) = self.rtx.as_mut() {
            rtx.send(pdu, now);
        }
    }

    /// Releases every PDU below `ack`, returns how many were released.
    pub fn on_received_ack(&mut self, ack: SeqNum) -> usize {
        match self.rtx.as_mut() {
            Some(rtx) => rtx.ack(ack),
            None => 0,
        }
    }

    /// Feedback for a receiver expecting `next` next.
    pub fn feedback(&self, next: SeqNum) -> Option<ControlMsg> {
        let rwe = self.window.as_ref().map(|w| w.receive_window_end(next));
        match (self.rtx.is_some(), rwe) {
            (true, Some(rwe)) => Some(ControlMsg::AckFlow { ack: next, rwe }),
            (true, None) => Some(ControlMsg::Ack { ack: next }),
            (false, Some(rwe)) => Some(ControlMsg::Flow { rwe }),
            (false, None) => None,
        }
    }

    /// Selective ack for a receiver expecting `next` and missing `missing`.
    pub fn selective_ack(&self, next: SeqNum, missing: Vec<SeqNum>) -> ControlMsg {
        let rwe = self
            .window
            .as_ref()
            .map(|w| w.receive_window_end(next))
            .unwrap_or(0);
        ControlMsg::SelectiveAck {
            ack: next,
            rwe,
            missing,
        }
    }

    /// Takes note of data PDUs the receiver dropped before processing them.
    ///
    /// With retransmission control the sequence numbers not yet received
    /// are asked for again in a selective ack.
    pub fn report_lost(&mut self, next: Option<SeqNum>, mut lost: Vec<SeqNum>) -> Option<ControlMsg> {
        self.lost_reported += lost.len() as u64;
        let next = next?;
        if self.rtx.is_none() {
            return None;
        }
        let space = self.space;
        lost.retain(|seq| space.le(next, *seq));
        lost.sort_by_key(|seq| space.distance(next, *seq));
        lost.dedup();
        if lost.is_empty() {
            return None;
        }
        trace!("asking for {} pdus dropped on ingress", lost.len());
        Some(self.selective_ack(next, lost))
    }

    /// Number of sequence numbers reported lost on ingress.
    pub fn lost_reported(&self) -> u64 {
        self.lost_reported
    }

    /// Returns the control sequence number for the next control PDU.
    pub fn next_ctrl_seq(&mut self) -> SeqNum {
        let seq = self.ctrl_seq;
        self.ctrl_seq = self.space.add(seq, 1);
        seq
    }

    /// Processes a control PDU received from the peer.
    pub fn control_receive(
        &mut self,
        ctrl_seq: SeqNum,
        msg: &ControlMsg,
        now: Instant,
    ) -> ControlOutcome {
        let mut outcome = ControlOutcome::default();
        if let Some(last) = self.last_ctrl_seq {
            if !self.space.gt(ctrl_seq, last) {
                trace!("stale control pdu {} <= {}", ctrl_seq, last);
                outcome.stale = true;
                return outcome;
            }
        }
        self.last_ctrl_seq = Some(ctrl_seq);
        if let Some(ack) = msg.ack() {
            outcome.acked = self.on_received_ack(ack);
        }
        if let (Some(rwe), Some(window)) = (msg.rwe(), self.window.as_mut()) {
            outcome.window_opened = window.update(rwe);
        }
        if let (ControlMsg::SelectiveAck { missing, .. }, Some(rtx)) = (msg, self.rtx.as_mut()) {
            outcome.retransmit = rtx.nack(missing, now);
        }
        outcome
    }

    /// Runs the retransmission and rate timers.
    pub fn on_timer(&mut self, now: Instant) -> Result<TimerOutcome, DtcpError> {
        let mut outcome = TimerOutcome::default();
        if let Some(rate) = self.rate.as_mut() {
            outcome.window_opened = rate.on_timer(now);
        }
        if let Some(rtx) = self.rtx.as_mut() {
            outcome.retransmit = rtx.expired(now)?;
        }
        Ok(outcome)
    }

    /// Number of unacknowledged PDUs.
    pub fn outstanding(&self) -> usize {
        self.rtx.as_ref().map(RetransmissionControl::len).unwrap_or(0)
    }

    /// Returns `true` when every sent PDU was acknowledged.
    pub fn is_quiescent(&self) -> bool {
        self.rtx
            .as_ref()
            .map(RetransmissionControl::is_empty)
            .unwrap_or(true)
    }

    /// Drops every unacknowledged PDU, returns how many were dropped.
    pub fn take_outstanding(&mut self) -> usize {
        let dropped = self.rtx.as_mut().map(RetransmissionControl::clear).unwrap_or(0);
        if dropped > 0 {
            debug!("dropped {} unacknowledged pdus", dropped);
        }
        dropped
    }
}
