//! PCI wire format.
//!
//! ```text
//! 0       8       16      24      32
//! +-------+-------+-------+-------+
//! | ver   | destination address   |
//! +-------+-------+-------+-------+
//! |       | source address        |
//! +-------+-------+-------+-------+
//! |       | qos-id        | dst   |
//! +-------+-------+-------+-------+
//! | cep-id                | src   |
//! +-------+-------+-------+-------+
//! | cep-id                | type  |
//! +-------+-------+-------+-------+
//! | flags | sequence number       |
//! +-------+                       +
//! |                               |
//! +       +-------+-------+-------+
//! |       | length                |
//! +-------+-------+-------+-------+
//! |       | payload ...
//! +-------+-------
//! ```
//!
//! All multi-byte fields are big endian. `length` is the payload length.
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use failure::Fail;
use naming::{Address, CepId, QosId};

/// Supported PCI version.
pub const VERSION: u8 = 1;
/// Length of the PCI.
pub const HEADER_LEN: usize = naming::PCI_LEN as usize;

/// Data run flag, set on the first PDU of a run.
pub const FLAG_DRF: u8 = 0b1000_0000;
/// Explicit congestion notification.
pub const FLAG_ECN: u8 = 0b0100_0000;
/// PDU carries the first fragment of an SDU.
pub const FLAG_FIRST: u8 = 0b0000_0010;
/// PDU carries the last fragment of an SDU.
pub const FLAG_LAST: u8 = 0b0000_0001;

const VERSION_OFFSET: usize = 0;
const DEST_ADDR: usize = 1;
const SRC_ADDR: usize = 5;
const QOS_ID: usize = 9;
const DEST_CEP: usize = 11;
const SRC_CEP: usize = 15;
const PDU_TYPE: usize = 19;
const FLAGS: usize = 20;
const SEQ_NUM: usize = 21;
const LENGTH: usize = 29;

/// Error parsing a PDU.
#[derive(Debug, Fail)]
pub enum PduError {
    /// Buffer shorter than the PCI.
    #[fail(display = "truncated pdu of {} bytes", _0)]
    Truncated(usize),
    /// Unsupported PCI version.
    #[fail(display = "unsupported pci version {}", _0)]
    BadVersion(u8),
    /// Unknown PDU type code.
    #[fail(display = "unknown pdu type {:#04x}", _0)]
    UnknownType(u8),
    /// Length field disagrees with the buffer.
    #[fail(display = "pdu length {} but {} payload bytes", declared, actual)]
    LengthMismatch {
        /// Length announced in the PCI.
        declared: usize,
        /// Payload bytes present.
        actual: usize,
    },
    /// Malformed control payload.
    #[fail(display = "malformed control payload")]
    BadControl,
}

/// Type of PDU.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum PduType {
    /// User data.
    Data = 0x80,
    /// Flow control.
    ControlFlow = 0xC0,
    /// Acknowledgement.
    ControlAck = 0xC1,
    /// Acknowledgement and flow control.
    ControlAckFlow = 0xCC,
    /// Selective acknowledgement.
    SelectiveAck = 0xC4,
    /// Layer management.
    Management = 0x40,
}

impl PduType {
    /// Decodes a type code.
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x80 => PduType::Data,
            0xC0 => PduType::ControlFlow,
            0xC1 => PduType::ControlAck,
            0xCC => PduType::ControlAckFlow,
            0xC4 => PduType::SelectiveAck,
            0x40 => PduType::Management,
            _ => return None,
        })
    }

    /// Returns `true` for DTCP PDUs.
    pub fn is_control(self) -> bool {
        (self as u8) & 0xC0 == 0xC0
    }
}

/// Protocol control information.
#[derive(Clone, PartialEq, Eq)]
pub struct Pci {
    data: BytesMut,
}

impl Pci {
    /// Creates a PCI of the given type with all other fields zero.
    pub fn new(ty: PduType) -> Self {
        let mut data = BytesMut::with_capacity(HEADER_LEN);
        data.put_bytes(0, HEADER_LEN);
        data[VERSION_OFFSET] = VERSION;
        data[PDU_TYPE] = ty as u8;
        Self { data }
    }

    /// Parses and validates a PCI.
    pub fn parse(bytes: &[u8]) -> Result<Self, PduError> {
        if bytes.len() < HEADER_LEN {
            return Err(PduError::Truncated(bytes.len()));
        }
        if bytes[VERSION_OFFSET] != VERSION {
            return Err(PduError::BadVersion(bytes[VERSION_OFFSET]));
        }
        if PduType::from_u8(bytes[PDU_TYPE]).is_none() {
            return Err(PduError::UnknownType(bytes[PDU_TYPE]));
        }
        Ok(Self {
            data: BytesMut::from(&bytes[..HEADER_LEN]),
        })
    }

    /// Encoded PCI.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Version.
    pub fn version(&self) -> u8 {
        self.data[VERSION_OFFSET]
    }

    /// Destination address.
    pub fn dest_addr(&self) -> Address {
        BigEndian::read_u32(&self.data[DEST_ADDR..SRC_ADDR])
    }

    /// Set destination address.
    pub fn set_dest_addr(&mut self, addr: Address) {
        BigEndian::write_u32(&mut self.data[DEST_ADDR..SRC_ADDR], addr);
    }

    /// Source address.
    pub fn src_addr(&self) -> Address {
        BigEndian::read_u32(&self.data[SRC_ADDR..QOS_ID])
    }

    /// Set source address.
    pub fn set_src_addr(&mut self, addr: Address) {
        BigEndian::write_u32(&mut self.data[SRC_ADDR..QOS_ID], addr);
    }

    /// QoS-id.
    pub fn qos_id(&self) -> QosId {
        BigEndian::read_u16(&self.data[QOS_ID..DEST_CEP])
    }

    /// Set QoS-id.
    pub fn set_qos_id(&mut self, qos_id: QosId) {
        BigEndian::write_u16(&mut self.data[QOS_ID..DEST_CEP], qos_id);
    }

    /// Destination CEP-id.
    pub fn dest_cep(&self) -> CepId {
        BigEndian::read_u32(&self.data[DEST_CEP..SRC_CEP])
    }

    /// Set destination CEP-id.
    pub fn set_dest_cep(&mut self, cep: CepId) {
        BigEndian::write_u32(&mut self.data[DEST_CEP..SRC_CEP], cep);
    }

    /// Source CEP-id.
    pub fn src_cep(&self) -> CepId {
        BigEndian::read_u32(&self.data[SRC_CEP..PDU_TYPE])
    }

    /// Set source CEP-id.
    pub fn set_src_cep(&mut self, cep: CepId) {
        BigEndian::write_u32(&mut self.data[SRC_CEP..PDU_TYPE], cep);
    }

    /// Type of PDU.
    pub fn pdu_type(&self) -> PduType {
        match PduType::from_u8(self.data[PDU_TYPE]) {
            Some(ty) => ty,
            None => unreachable!("pdu type validated on construction"),
        }
    }

    /// Raw flags.
    pub fn flags(&self) -> u8 {
        self.data[FLAGS]
    }

    /// Set raw flags.
    pub fn set_flags(&mut self, flags: u8) {
        self.data[FLAGS] = flags;
    }

    fn flag(&self, flag: u8) -> bool {
        self.data[FLAGS] & flag > 0
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.data[FLAGS] |= flag;
        } else {
            self.data[FLAGS] &= !flag;
        }
    }

    /// Data run flag.
    pub fn drf(&self) -> bool {
        self.flag(FLAG_DRF)
    }

    /// Set data run flag.
    pub fn set_drf(&mut self, drf: bool) {
        self.set_flag(FLAG_DRF, drf)
    }

    /// Explicit congestion notification.
    pub fn ecn(&self) -> bool {
        self.flag(FLAG_ECN)
    }

    /// Set explicit congestion notification.
    pub fn set_ecn(&mut self, ecn: bool) {
        self.set_flag(FLAG_ECN, ecn)
    }

    /// Carries the first fragment of an SDU.
    pub fn first_fragment(&self) -> bool {
        self.flag(FLAG_FIRST)
    }

    /// Carries the last fragment of an SDU.
    pub fn last_fragment(&self) -> bool {
        self.flag(FLAG_LAST)
    }

    /// Set fragment delimiters.
    pub fn set_fragment(&mut self, first: bool, last: bool) {
        self.set_flag(FLAG_FIRST, first);
        self.set_flag(FLAG_LAST, last);
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        BigEndian::read_u64(&self.data[SEQ_NUM..LENGTH])
    }

    /// Set sequence number.
    pub fn set_seq(&mut self, seq: u64) {
        BigEndian::write_u64(&mut self.data[SEQ_NUM..LENGTH], seq);
    }

    /// Payload length.
    pub fn length(&self) -> u32 {
        BigEndian::read_u32(&self.data[LENGTH..HEADER_LEN])
    }

    fn set_length(&mut self, len: u32) {
        BigEndian::write_u32(&mut self.data[LENGTH..HEADER_LEN], len);
    }
}

impl std::fmt::Debug for Pci {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Pci")
            .field("version", &self.version())
            .field("dest_addr", &self.dest_addr())
            .field("src_addr", &self.src_addr())
            .field("qos_id", &self.qos_id())
            .field("dest_cep", &self.dest_cep())
            .field("src_cep", &self.src_cep())
            .field("type", &self.pdu_type())
            .field("drf", &self.drf())
            .field("first", &self.first_fragment())
            .field("last", &self.last_fragment())
            .field("seq", &self.seq())
            .field("length", &self.length())
            .finish()
    }
}

/// A PCI and its payload.
///
/// The two never overlap; a parsed PDU's payload is a slice of the received
/// buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    pci: Pci,
    payload: Bytes,
}

impl Pdu {
    /// Creates a PDU, filling in the length field.
    pub fn new(mut pci: Pci, payload: Bytes) -> Self {
        pci.set_length(payload.len() as u32);
        Self { pci, payload }
    }

    /// Parses a received buffer.
    pub fn parse(mut bytes: Bytes) -> Result<Self, PduError> {
        let pci = Pci::parse(&bytes)?;
        let payload = bytes.split_off(HEADER_LEN);
        let declared = pci.length() as usize;
        if declared != payload.len() {
            return Err(PduError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        Ok(Self { pci, payload })
    }

    /// Protocol control information.
    pub fn pci(&self) -> &Pci {
        &self.pci
    }

    /// Mutable protocol control information.
    pub fn pci_mut(&mut self) -> &mut Pci {
        &mut self.pci
    }

    /// User data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Owned user data, sharing storage with the PDU.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Type of PDU.
    pub fn pdu_type(&self) -> PduType {
        self.pci.pdu_type()
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        self.pci.seq()
    }

    /// Length on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serializes the PDU into contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.encoded_len());
        bytes.put_slice(self.pci.as_bytes());
        bytes.put_slice(&self.payload);
        bytes.freeze()
    }
}
