//! # RINA IPC process data transfer
//! An IPC process (IPCP) is a member of a Distributed IPC Facility (DIF).
//! This crate ties together the data transfer machinery of one IPCP:
//!
//! - `kfa`: port-ids handed to applications and the flows bound to them.
//! - `efcp`: one DTP instance (plus optional DTCP) per connection, keyed by
//!   CEP-id.
//! - `rmt`: forwarding to and reading from the N-1 flows the IPCP runs on.
//!
//! Flow allocation, enrollment and routing are out of scope. `create_flow`
//! and `activate_flow` stand in for the flow allocator: the two IPCPs
//! exchange CEP-ids out of band.
//!
//! ## Data path
//! Writes on a port-id go through the KFA into the DTP of the bound
//! connection, which numbers and fragments the SDU and hands the PDUs to the
//! RMT. An egress worker per N-1 port writes them out. An ingress worker per
//! N-1 port parses incoming frames and the EFCP dispatches them by CEP-id to
//! their DTP, which reassembles and delivers SDUs in order to the KFA queue
//! of the port.
//!
//! ## Timers
//! A single timer task drives the A-timer, DTCP retransmission and rate
//! timers and the inactivity timers of all connections.
//!
//! ## References
//! [0]: http://nes.fit.vutbr.cz/ivesely/specs/uploads/RINA/EFCPSpec140124.pdf
#![deny(missing_docs)]
use async_std::task::{self, JoinHandle};
use channel::Channel;
use efcp::{Efcp, EfcpError};
use failure::Fail;
use kfa::{Kfa, KfaError};
use log::{debug, warn};
use naming::{Address, CepId, ConfigError, DifInfo, FlowSpec, PortId, QosId};
use pdu::Sdu;
use rmt::{Dispatcher, Rmt, RmtError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use dtp::{Connection, DtpConfig, DtpCounters, DtpState};
pub use efcp::{EfcpCounters, ErrorKind};
pub use rmt::RmtCounters;

/// Default number of ports of the KFA.
pub const DEFAULT_MAX_PORTS: usize = 1024;
/// Default number of SDUs queued per port for reading.
pub const DEFAULT_RX_QUEUE_LEN: usize = 256;

/// Runtime error.
#[derive(Debug, Fail)]
pub enum RuntimeError {
    /// Invalid DIF configuration.
    #[fail(display = "{}", _0)]
    Config(#[cause] ConfigError),
    /// N-1 port error.
    #[fail(display = "{}", _0)]
    Rmt(#[cause] RmtError),
    /// Flow error.
    #[fail(display = "{}", _0)]
    Efcp(#[cause] EfcpError),
}

impl RuntimeError {
    /// Kind of a flow error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Config(_) | RuntimeError::Rmt(_) => ErrorKind::InvalidArg,
            RuntimeError::Efcp(err) => err.kind(),
        }
    }
}

impl From<ConfigError> for RuntimeError {
    fn from(err: ConfigError) -> Self {
        RuntimeError::Config(err)
    }
}

impl From<RmtError> for RuntimeError {
    fn from(err: RmtError) -> Self {
        RuntimeError::Rmt(err)
    }
}

impl From<EfcpError> for RuntimeError {
    fn from(err: EfcpError) -> Self {
        RuntimeError::Efcp(err)
    }
}

impl From<KfaError> for RuntimeError {
    fn from(err: KfaError) -> Self {
        RuntimeError::Efcp(err.into())
    }
}

/// A flow of this IPCP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Flow {
    /// Port-id the application uses.
    pub port: PortId,
    /// Local CEP-id of the connection.
    pub cep_id: CepId,
    /// Address of the peer IPCP.
    pub dest: Address,
    /// QoS cube.
    pub qos_id: QosId,
}

/// The data transfer part of one IPC process.
pub struct Runtime {
    dif: DifInfo,
    rmt: Arc<Rmt>,
    kfa: Arc<Kfa>,
    efcp: Arc<Efcp>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Creates the IPCP with address `address` in the DIF `dif`.
    ///
    /// Reads `kfa.max-ports` and `kfa.rx-queue-len` besides the keys read by
    /// the RMT and the connections.
    pub fn new(dif: DifInfo, address: Address) -> Result<Self, RuntimeError> {
        let config = &dif.configuration;
        let max_ports = config
            .parse("kfa.max-ports")?
            .unwrap_or(DEFAULT_MAX_PORTS)
            .min(config.dt_cons.max_port_id() as usize);
        let rx_queue_len = config
            .parse("kfa.rx-queue-len")?
            .unwrap_or(DEFAULT_RX_QUEUE_LEN);
        let rmt = Arc::new(Rmt::from_config(address, config)?);
        let kfa = Arc::new(Kfa::new(max_ports, rx_queue_len));
        let efcp = Arc::new(Efcp::new(config, rmt.clone(), kfa.clone())?);
        let dispatcher: Arc<dyn Dispatcher> = efcp.clone();
        rmt.set_dispatcher(Arc::downgrade(&dispatcher));
        debug!("ipcp {} in {} ({})", address, dif.dif_name, dif.dif_type);
        Ok(Self {
            dif,
            rmt,
            kfa,
            efcp,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// DIF the IPCP is a member of.
    pub fn dif(&self) -> &DifInfo {
        &self.dif
    }

    /// Address of the IPCP.
    pub fn address(&self) -> Address {
        self.rmt.address()
    }

    /// Relaying and multiplexing task.
    pub fn rmt(&self) -> &Arc<Rmt> {
        &self.rmt
    }

    /// Port table.
    pub fn kfa(&self) -> &Arc<Kfa> {
        &self.kfa
    }

    /// EFCP container.
    pub fn efcp(&self) -> &Arc<Efcp> {
        &self.efcp
    }

    /// Attaches an N-1 flow and starts its workers.
    pub fn add_n1_port(&self, id: PortId, channel: Arc<dyn Channel>) -> Result<(), RuntimeError> {
        self.rmt.add_port(id, channel)?;
        let egress = self.rmt.clone();
        let ingress = self.rmt.clone();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(task::spawn(async move {
            if let Err(err) = egress.run_egress(id).await {
                warn!("egress {} failed: {}", id, err);
            }
        }));
        tasks.push(task::spawn(async move {
            if let Err(err) = ingress.run_ingress(id).await {
                debug!("ingress {} stopped: {}", id, err);
            }
        }));
        Ok(())
    }

    /// Routes PDUs for `dest` through the N-1 port `port`.
    pub fn add_route(&self, dest: Address, qos_id: Option<QosId>, port: PortId) {
        self.rmt.add_route(dest, qos_id, port);
    }

    /// Starts the timer task.
    pub fn start_timers(&self, period: Duration) {
        let timer = self.efcp.spawn_timer(period);
        self.tasks.lock().unwrap().push(timer);
    }

    /// Creates the local end of a flow to `dest`.
    ///
    /// The flow carries data once the peer CEP-id is known, either passed
    /// here or later to `activate_flow`.
    pub fn create_flow(
        &self,
        dest: Address,
        qos_id: QosId,
        spec: &FlowSpec,
        dest_cep: Option<CepId>,
    ) -> Result<Flow, RuntimeError> {
        let policies = self.efcp.policies(spec)?;
        self.create_flow_with(dest, qos_id, policies, dest_cep)
    }

    /// Creates the local end of a flow with explicit policies.
    pub fn create_flow_with(
        &self,
        dest: Address,
        qos_id: QosId,
        policies: DtpConfig,
        dest_cep: Option<CepId>,
    ) -> Result<Flow, RuntimeError> {
        let mut conn = Connection::new(self.address(), dest, qos_id, policies);
        conn.dest_cep_id = dest_cep;
        let cep_id = self.efcp.connection_create(conn)?;
        let port = match self.kfa.allocate_port() {
            Ok(port) => port,
            Err(err) => {
                self.abandon_flow(None, cep_id);
                return Err(err.into());
            }
        };
        let flow = Flow {
            port,
            cep_id,
            dest,
            qos_id,
        };
        if dest_cep.is_some() {
            if let Err(err) = self.efcp.bind(port, cep_id) {
                self.abandon_flow(Some(port), cep_id);
                return Err(err.into());
            }
        }
        debug!("ipcp {} flow {:?}", self.address(), flow);
        Ok(flow)
    }

    /// Releases the port and connection of a flow that failed to set up.
    fn abandon_flow(&self, port: Option<PortId>, cep_id: CepId) {
        if let Some(port) = port {
            if let Err(err) = self.kfa.close(port) {
                debug!("ipcp {} failed to release port {}: {}", self.address(), port, err);
            }
        }
        if let Err(err) = self.efcp.connection_destroy(cep_id) {
            debug!("ipcp {} failed to release cep {}: {}", self.address(), cep_id, err);
        }
    }

    /// Sets the peer CEP-id of a flow and binds its port.
    pub fn activate_flow(&self, flow: &Flow, dest_cep: CepId) -> Result<(), RuntimeError> {
        self.efcp.connection_update(flow.cep_id, dest_cep)?;
        self.efcp.bind(flow.port, flow.cep_id)?;
        Ok(())
    }

    /// Writes an SDU on a flow.
    pub fn write(&self, flow: &Flow, sdu: Sdu) -> Result<(), RuntimeError> {
        self.efcp.write(flow.port, sdu)?;
        Ok(())
    }

    /// Writes an SDU, waiting up to `timeout` while the flow is busy.
    pub fn write_timeout(&self, flow: &Flow, sdu: Sdu, timeout: Duration) -> Result<(), RuntimeError> {
        self.kfa.write_timeout(flow.port, sdu, timeout)?;
        Ok(())
    }

    /// Reads an SDU, waiting up to `timeout`.
    pub fn read_timeout(&self, flow: &Flow, timeout: Duration) -> Result<Option<Sdu>, RuntimeError> {
        Ok(self.kfa.read_timeout(flow.port, timeout)?)
    }

    /// Tears a flow down. Returns the number of buffers dropped by the
    /// connection.
    pub fn destroy_flow(&self, flow: &Flow) -> Result<usize, RuntimeError> {
        let released = self.efcp.connection_destroy(flow.cep_id)?;
        self.kfa.close(flow.port)?;
        Ok(released)
    }

    /// Stops the workers and the timer task.
    pub async fn shutdown(&self) {
        self.rmt.close();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in tasks {
            handle.cancel().await;
        }
        debug!("ipcp {} shut down", self.address());
    }
}
