//! # Data Transfer Protocol
//! The per connection half of EFCP that moves user data. A `Dtp` fragments
//! SDUs written by the user into PDUs, numbers them and hands them to the
//! RMT. On the receive side it orders incoming PDUs, reassembles SDUs and
//! delivers them upwards in sequence number order.
//!
//! ## Data runs
//! The first PDU of a run carries the DRF flag. The receiver starts its run
//! at that PDU. After `2(MPL + R + A)` without sending, the sender starts a
//! new run; after `3(MPL + R + A)` without receiving, the receiver forgets
//! its run.
//!
//! ## Gaps
//! PDUs more than `max_gap` beyond the next expected sequence number are
//! dropped. Without an A-timer a gap is resolved immediately, with an
//! A-timer received PDUs are held until it expires. Gaps are then reported
//! to DTCP for retransmission, skipped or, without DTCP, dropped together
//! with everything held beyond them.
//!
//! ## States
//! `New -> Active -> Draining -> Closed`. A connection becomes active once
//! the peer CEP-id is known. Closing stops new writes; PDUs still queued or
//! unacknowledged are served until DTCP reports quiescence.
#![deny(missing_docs)]
mod config;
mod connection;
mod dtp;
mod receive;
mod stats;

pub use crate::config::DtpConfig;
pub use crate::connection::Connection;
pub use crate::dtp::Dtp;
pub use crate::stats::DtpCounters;
use dtcp::DtcpError;
use failure::Fail;
use naming::{CepId, PortId};
use pdu::{PduError, PduType, Sdu, SinkError};

/// State of a DTP instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DtpState {
    /// Waiting for the peer CEP-id.
    New,
    /// Transferring data.
    Active,
    /// Closing, no new writes accepted.
    Draining,
    /// Closed.
    Closed,
}

/// DTP error.
#[derive(Debug, Fail)]
pub enum DtpError {
    /// The operation is not allowed in the current state.
    #[fail(display = "connection is {:?}", _0)]
    NotActive(DtpState),
    /// The closed window queue is full, retry later.
    #[fail(display = "send window full")]
    Busy,
    /// SDU larger than the configured maximum.
    #[fail(display = "sdu of {} bytes exceeds {}", len, max)]
    SduTooLarge {
        /// Length of the SDU.
        len: usize,
        /// Maximum SDU size.
        max: usize,
    },
    /// PDU addressed to another CEP-id.
    #[fail(display = "pdu for cep-id {} received by {}", got, expected)]
    WrongCep {
        /// CEP-id of the instance.
        expected: CepId,
        /// CEP-id in the PCI.
        got: CepId,
    },
    /// The maximum PDU size leaves no room for data.
    #[fail(display = "max pdu size {} leaves no room for data", _0)]
    PduTooSmall(usize),
    /// PDU type not handled by DTP.
    #[fail(display = "unexpected {:?} pdu", _0)]
    Unexpected(PduType),
    /// Malformed PDU.
    #[fail(display = "{}", _0)]
    BadPdu(#[cause] PduError),
    /// The RMT refused a PDU.
    #[fail(display = "{}", _0)]
    Sink(#[cause] SinkError),
    /// Unrecoverable DTCP error.
    #[fail(display = "{}", _0)]
    Dtcp(#[cause] DtcpError),
}

impl From<PduError> for DtpError {
    fn from(err: PduError) -> Self {
        DtpError::BadPdu(err)
    }
}

impl From<SinkError> for DtpError {
    fn from(err: SinkError) -> Self {
        DtpError::Sink(err)
    }
}

impl From<DtcpError> for DtpError {
    fn from(err: DtcpError) -> Self {
        DtpError::Dtcp(err)
    }
}

/// Upward seam between a DTP and the user of its flow.
///
/// Called with DTP locks held; implementations must not call back into the
/// DTP.
pub trait SduSink: Send + Sync {
    /// Delivers a complete SDU.
    fn deliver(&self, port: PortId, sdu: Sdu);

    /// The closed window queue drained, writes may succeed again.
    fn writable(&self, port: PortId);

    /// The connection failed. Called at most once.
    fn flow_down(&self, port: PortId);
}
