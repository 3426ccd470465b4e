use crate::config::DtpConfig;
use naming::{Address, CepId, QosId};

/// Endpoints and policies of an EFCP connection.
///
/// Immutable once established, except for the destination CEP-id which is
/// learned from the peer after the connection was created.
#[derive(Clone, Debug)]
pub struct Connection {
    /// Address of the local IPC process.
    pub source_address: Address,
    /// Address of the peer IPC process.
    pub dest_address: Address,
    /// Local CEP-id, assigned by the EFCP container.
    pub source_cep_id: CepId,
    /// Peer CEP-id, if known.
    pub dest_cep_id: Option<CepId>,
    /// QoS cube of the connection.
    pub qos_id: QosId,
    /// Policies.
    pub policies: DtpConfig,
}

impl Connection {
    /// Creates a connection whose CEP-ids are not yet known.
    pub fn new(
        source_address: Address,
        dest_address: Address,
        qos_id: QosId,
        policies: DtpConfig,
    ) -> Self {
        Self {
            source_address,
            dest_address,
            source_cep_id: 0,
            dest_cep_id: None,
            qos_id,
            policies,
        }
    }

    /// Sets the peer CEP-id.
    pub fn with_dest_cep(mut self, dest_cep_id: CepId) -> Self {
        self.dest_cep_id = Some(dest_cep_id);
        self
    }
}
