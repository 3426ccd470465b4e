//! Defines the payload of DTCP control PDUs.
//!
//! The PCI sequence number of a control PDU is the control sequence number
//! of the sender, the payload carries the feedback:
//!
//! ```text
//! ControlAck:      ack: u64
//! ControlFlow:     rwe: u64
//! ControlAckFlow:  ack: u64 | rwe: u64
//! SelectiveAck:    ack: u64 | rwe: u64 | count: u32 | missing: u64 * count
//! ```
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use pdu::{PduError, PduType, SeqNum};

/// Feedback sent from a receiver to a sender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMsg {
    /// Every sequence number below `ack` was received.
    Ack {
        /// Next expected sequence number.
        ack: SeqNum,
    },
    /// The sender may transmit sequence numbers below `rwe`.
    Flow {
        /// Right window edge.
        rwe: SeqNum,
    },
    /// Combined acknowledgement and flow control.
    AckFlow {
        /// Next expected sequence number.
        ack: SeqNum,
        /// Right window edge.
        rwe: SeqNum,
    },
    /// Acknowledgement listing the sequence numbers missing above `ack`.
    SelectiveAck {
        /// Next expected sequence number.
        ack: SeqNum,
        /// Right window edge.
        rwe: SeqNum,
        /// Sequence numbers the receiver is waiting for.
        missing: Vec<SeqNum>,
    },
}

impl ControlMsg {
    /// PDU type carrying the message.
    pub fn pdu_type(&self) -> PduType {
        match self {
            ControlMsg::Ack { .. } => PduType::ControlAck,
            ControlMsg::Flow { .. } => PduType::ControlFlow,
            ControlMsg::AckFlow { .. } => PduType::ControlAckFlow,
            ControlMsg::SelectiveAck { .. } => PduType::SelectiveAck,
        }
    }

    /// Cumulative acknowledgement, if any.
    pub fn ack(&self) -> Option<SeqNum> {
        match self {
            ControlMsg::Ack { ack }
            | ControlMsg::AckFlow { ack, .. }
            | ControlMsg::SelectiveAck { ack, .. } => Some(*ack),
            ControlMsg::Flow { .. } => None,
        }
    }

    /// Right window edge, if any.
    pub fn rwe(&self) -> Option<SeqNum> {
        match self {
            ControlMsg::Flow { rwe }
            | ControlMsg::AckFlow { rwe, .. }
            | ControlMsg::SelectiveAck { rwe, .. } => Some(*rwe),
            ControlMsg::Ack { .. } => None,
        }
    }

    /// Encodes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20);
        match self {
            ControlMsg::Ack { ack } => buf.put_u64(*ack),
            ControlMsg::Flow { rwe } => buf.put_u64(*rwe),
            ControlMsg::AckFlow { ack, rwe } => {
                buf.put_u64(*ack);
                buf.put_u64(*rwe);
            }
            ControlMsg::SelectiveAck { ack, rwe, missing } => {
                buf.reserve(missing.len() * 8);
                buf.put_u64(*ack);
                buf.put_u64(*rwe);
                buf.put_u32(missing.len() as u32);
                for seq in missing {
                    buf.put_u64(*seq);
                }
            }
        }
        buf.freeze()
    }

    /// Decodes the payload of a control PDU.
    pub fn decode(ty: PduType, payload: &[u8]) -> Result<Self, PduError> {
        let field = |i: usize| -> Result<u64, PduError> {
            payload
                .get(i * 8..i * 8 + 8)
                .map(BigEndian::read_u64)
                .ok_or(PduError::BadControl)
        };
        Ok(match ty {
            PduType::ControlAck => ControlMsg::Ack { ack: field(0)? },
            PduType::ControlFlow => ControlMsg::Flow { rwe: field(0)? },
            PduType::ControlAckFlow => ControlMsg::AckFlow {
                ack: field(0)?,
                rwe: field(1)?,
            },
            PduType::SelectiveAck => {
                let ack = field(0)?;
                let rwe = field(1)?;
                let count = payload
                    .get(16..20)
                    .map(BigEndian::read_u32)
                    .ok_or(PduError::BadControl)? as usize;
                let list = &payload[20..];
                if list.len() != count * 8 {
                    return Err(PduError::BadControl);
                }
                let missing = list.chunks(8).map(BigEndian::read_u64).collect();
                ControlMsg::SelectiveAck { ack, rwe, missing }
            }
            PduType::Data | PduType::Management => return Err(PduError::BadControl),
        })
    }
}
