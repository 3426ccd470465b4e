//! # Protocol data units
//! Defines the PCI wire format shared by every IPC process of a DIF, the
//! SDU/PDU buffer model and sequence number arithmetic.
//!
//! Buffers are reference counted `Bytes`. Fragmenting an SDU produces
//! slices sharing the SDU's storage; contiguous bytes are only produced when
//! a PDU is handed to an N-1 flow.
#![deny(missing_docs)]
mod packet;
mod sdu;
mod seq;

pub use crate::packet::{
    Pci, Pdu, PduError, PduType, FLAG_DRF, FLAG_ECN, FLAG_FIRST, FLAG_LAST, HEADER_LEN, VERSION,
};
pub use crate::sdu::Sdu;
pub use crate::seq::{SeqNum, SeqSpace};
use failure::Fail;
use naming::Address;

/// Error handing a PDU to the layer below.
#[derive(Debug, Fail)]
pub enum SinkError {
    /// The output queue is full, the caller may retry later.
    #[fail(display = "output queue full")]
    QueueFull,
    /// No N-1 flow leads to the destination.
    #[fail(display = "no route to {}", _0)]
    NoRoute(Address),
    /// The sink is shutting down.
    #[fail(display = "sink closed")]
    Closed,
}

/// Egress seam between EFCP and the relaying and multiplexing task.
///
/// Implementations must not call back into the submitting DTP.
pub trait PduSink: Send + Sync {
    /// Queues a PDU for transmission without blocking.
    fn send_pdu(&self, pdu: Pdu) -> Result<(), SinkError>;
}
