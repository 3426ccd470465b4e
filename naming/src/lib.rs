//! # Naming and addressing
//! Names identify applications, IPC processes and DIFs. Addresses, port-ids
//! and CEP-ids are plain integers that are only meaningful relative to the
//! DIF or IPC process that handed them out.
//!
//! The identifier widths on the wire are fixed, but the data transfer
//! constants of a DIF (`DtCons`) further restrict the range of values an
//! IPC process may use.
#![deny(missing_docs)]
mod dif;
mod name;

pub use crate::dif::{ConfigEntry, ConfigError, DifConfig, DifInfo, DtCons, FlowSpec};
pub use crate::name::{Name, NONE};

/// Length of the PCI on the wire. A PDU must be larger to carry data.
pub const PCI_LEN: u32 = 33;

/// Address of an IPC process within a DIF.
pub type Address = u32;
/// Connection endpoint identifier, scoping a DTP/DTCP instance.
pub type CepId = u32;
/// Flow handle exposed to applications.
pub type PortId = u32;
/// Quality of service cube identifier.
pub type QosId = u16;
