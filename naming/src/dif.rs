//! DIF and IPC process configuration records.
use crate::name::Name;
use crate::PCI_LEN;
use failure::Fail;
use log::debug;
use std::str::FromStr;
use std::time::Duration;

/// Configuration error.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[fail(display = "invalid value {:?} for {}", value, key)]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Offending value.
        value: String,
    },
    /// The data transfer constants are not usable.
    #[fail(display = "invalid data transfer constants: {}", _0)]
    InvalidDtCons(&'static str),
    /// Both ends of a DIF must agree on the data transfer constants.
    #[fail(display = "data transfer constants disagree on {}", _0)]
    Incompatible(&'static str),
}

fn width_max(len: u8) -> u64 {
    if len >= 8 {
        u64::max_value()
    } else {
        (1u64 << (8 * u32::from(len))) - 1
    }
}

/// Data transfer constants of a DIF.
///
/// Field widths are in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DtCons {
    /// Width of an address.
    pub address_length: u8,
    /// Width of a CEP-id.
    pub cep_id_length: u8,
    /// Width of a port-id.
    pub port_id_length: u8,
    /// Width of a QoS-id.
    pub qos_id_length: u8,
    /// Width of a sequence number, either 4 or 8.
    pub seq_num_length: u8,
    /// Width of the length field.
    pub length_length: u8,
    /// Largest PDU including the PCI.
    pub max_pdu_size: u32,
    /// Largest SDU accepted from a user.
    pub max_sdu_size: u32,
    /// Maximum PDU lifetime (MPL).
    pub max_pdu_lifetime: Duration,
}

impl Default for DtCons {
    fn default() -> Self {
        Self {
            address_length: 4,
            cep_id_length: 4,
            port_id_length: 4,
            qos_id_length: 2,
            seq_num_length: 8,
            length_length: 4,
            max_pdu_size: 1500,
            max_sdu_size: 65535,
            max_pdu_lifetime: Duration::from_secs(2),
        }
    }
}

impl DtCons {
    /// Checks that the constants fit the PCI layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address_length == 0 || self.address_length > 4 {
            return Err(ConfigError::InvalidDtCons("address length"));
        }
        if self.cep_id_length == 0 || self.cep_id_length > 4 {
            return Err(ConfigError::InvalidDtCons("cep-id length"));
        }
        if self.port_id_length == 0 || self.port_id_length > 4 {
            return Err(ConfigError::InvalidDtCons("port-id length"));
        }
        if self.qos_id_length == 0 || self.qos_id_length > 2 {
            return Err(ConfigError::InvalidDtCons("qos-id length"));
        }
        if self.seq_num_length != 4 && self.seq_num_length != 8 {
            return Err(ConfigError::InvalidDtCons("sequence number length"));
        }
        if self.length_length == 0 || self.length_length > 4 {
            return Err(ConfigError::InvalidDtCons("length length"));
        }
        if self.max_pdu_size <= PCI_LEN {
            return Err(ConfigError::InvalidDtCons("max pdu size"));
        }
        if self.max_sdu_size == 0 {
            return Err(ConfigError::InvalidDtCons("max sdu size"));
        }
        Ok(())
    }

    /// Checks that a peer uses the same constants.
    pub fn check_compatible(&self, other: &DtCons) -> Result<(), ConfigError> {
        let mismatch = if self.address_length != other.address_length {
            Some("address length")
        } else if self.cep_id_length != other.cep_id_length {
            Some("cep-id length")
        } else if self.port_id_length != other.port_id_length {
            Some("port-id length")
        } else if self.qos_id_length != other.qos_id_length {
            Some("qos-id length")
        } else if self.seq_num_length != other.seq_num_length {
            Some("sequence number length")
        } else if self.length_length != other.length_length {
            Some("length length")
        } else if self.max_pdu_size != other.max_pdu_size {
            Some("max pdu size")
        } else if self.max_pdu_lifetime != other.max_pdu_lifetime {
            Some("max pdu lifetime")
        } else {
            None
        };
        match mismatch {
            Some(field) => Err(ConfigError::Incompatible(field)),
            None => Ok(()),
        }
    }

    /// Largest usable address.
    pub fn max_address(&self) -> u32 {
        width_max(self.address_length) as u32
    }

    /// Largest usable CEP-id.
    pub fn max_cep_id(&self) -> u32 {
        width_max(self.cep_id_length) as u32
    }

    /// Largest usable port-id.
    pub fn max_port_id(&self) -> u32 {
        width_max(self.port_id_length) as u32
    }

    /// Largest usable QoS-id.
    pub fn max_qos_id(&self) -> u16 {
        width_max(self.qos_id_length) as u16
    }

    /// Number of bits of the sequence number space.
    pub fn seq_num_bits(&self) -> u32 {
        8 * u32::from(self.seq_num_length)
    }

    /// Time a released CEP-id stays out of circulation.
    pub fn guard_interval(&self) -> Duration {
        self.max_pdu_lifetime * 2
    }
}

/// A single `(key, value)` configuration pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigEntry {
    /// Key.
    pub name: String,
    /// Value.
    pub value: String,
}

/// Configuration of a DIF: policy parameters plus data transfer constants.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DifConfig {
    entries: Vec<ConfigEntry>,
    /// Data transfer constants.
    pub dt_cons: DtCons,
}

impl DifConfig {
    /// Creates an empty configuration.
    pub fn new(dt_cons: DtCons) -> Self {
        Self {
            entries: Vec::new(),
            dt_cons,
        }
    }

    /// Sets a value, replacing a previous one.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.value = value.to_owned(),
            None => self.entries.push(ConfigEntry {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Builder variant of `set`.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the raw value of a key.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Parses the value of a key.
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                key: name.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Removes a key, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let i = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(i).value)
    }

    /// Iterates over all entries.
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.iter()
    }
}

/// Everything an IPC process needs to know to join a DIF.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DifInfo {
    /// Type of the DIF, e.g. `normal-ipc` or a shim type.
    pub dif_type: String,
    /// Name of the DIF.
    pub dif_name: Name,
    /// Configuration of the DIF.
    pub configuration: DifConfig,
}

impl DifInfo {
    /// Creates a DIF description.
    pub fn new(dif_type: &str, dif_name: Name, configuration: DifConfig) -> Self {
        debug!("dif info for {} ({})", dif_name, dif_type);
        Self {
            dif_type: dif_type.to_owned(),
            dif_name,
            configuration,
        }
    }
}

/// Characteristics requested by a flow allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowSpec {
    /// Average bandwidth in bytes/s, 0 means don't care.
    pub average_bandwidth: u64,
    /// Maximum delay in milliseconds, 0 means don't care.
    pub delay: u32,
    /// Maximum jitter in milliseconds, 0 means don't care.
    pub jitter: u32,
    /// Largest tolerated gap in SDUs, 0 requires reliable delivery and a
    /// negative value tolerates any loss.
    pub max_allowable_gap: i32,
    /// Largest SDU, 0 means the DIF default.
    pub max_sdu_size: u32,
    /// SDUs must be delivered in order.
    pub ordered_delivery: bool,
    /// Partial SDUs may be delivered.
    pub partial_delivery: bool,
}

impl Default for FlowSpec {
    fn default() -> Self {
        Self {
            average_bandwidth: 0,
            delay: 0,
            jitter: 0,
            max_allowable_gap: -1,
            max_sdu_size: 0,
            ordered_delivery: false,
            partial_delivery: false,
        }
    }
}

impl FlowSpec {
    /// A spec asking for reliable in-order delivery.
    pub fn reliable() -> Self {
        Self {
            max_allowable_gap: 0,
            ordered_delivery: true,
            ..Self::default()
        }
    }

    /// Returns `true` if no loss is tolerated.
    pub fn is_reliable(&self) -> bool {
        self.max_allowable_gap == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt_cons_widths() {
        let mut cons = DtCons::default();
        cons.validate().unwrap();
        assert_eq!(cons.max_address(), u32::max_value());
        assert_eq!(cons.seq_num_bits(), 64);
        cons.cep_id_length = 1;
        cons.seq_num_length = 4;
        cons.validate().unwrap();
        assert_eq!(cons.max_cep_id(), 255);
        assert_eq!(cons.seq_num_bits(), 32);
        cons.seq_num_length = 2;
        assert!(cons.validate().is_err());
        cons.seq_num_length = 4;
        cons.max_pdu_size = PCI_LEN;
        match cons.validate() {
            Err(ConfigError::InvalidDtCons(field)) => assert_eq!(field, "max pdu size"),
            other => panic!("unexpected {:?}", other),
        }
        cons.max_pdu_size = PCI_LEN + 1;
        cons.validate().unwrap();
        assert_eq!(cons.guard_interval(), cons.max_pdu_lifetime * 2);
    }

    #[test]
    fn test_dt_cons_compatible() {
        let a = DtCons::default();
        let mut b = DtCons::default();
        a.check_compatible(&b).unwrap();
        b.max_pdu_size = 9000;
        match a.check_compatible(&b) {
            Err(ConfigError::Incompatible(field)) => assert_eq!(field, "max pdu size"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dif_config() {
        let mut cfg = DifConfig::new(DtCons::default())
            .with("dtp.max-gap", "8")
            .with("dtcp.rto-ms", "fast");
        assert_eq!(cfg.get("dtp.max-gap"), Some("8"));
        assert_eq!(cfg.parse::<u64>("dtp.max-gap").unwrap(), Some(8));
        assert_eq!(cfg.parse::<u64>("missing").unwrap(), None);
        assert!(cfg.parse::<u64>("dtcp.rto-ms").is_err());
        cfg.set("dtp.max-gap", "16");
        assert_eq!(cfg.entries().count(), 2);
        assert_eq!(cfg.remove("dtp.max-gap"), Some("16".to_string()));
        assert_eq!(cfg.get("dtp.max-gap"), None);
    }

    #[test]
    fn test_dif_info() {
        let info = DifInfo::new(
            "normal-ipc",
            Name::process("normal.DIF"),
            DifConfig::default(),
        );
        let copy = info.clone();
        assert_eq!(copy, info);
        assert!(copy.dif_name.is_valid());
    }

    #[test]
    fn test_flow_spec() {
        assert!(FlowSpec::reliable().is_reliable());
        assert!(!FlowSpec::default().is_reliable());
    }
}
