//! # Relaying and multiplexing task
//! Moves PDUs between the EFCP instances of an IPC process and its N-1
//! ports.
//!
//! Egress looks up the N-1 port of a PDU in the forwarding table by
//! destination address and QoS id and queues it on that port. Each port has
//! its own output queue with a pluggable scheduling discipline and an egress
//! worker writing the queue to the port's channel.
//!
//! Ingress workers read frames from the N-1 channels, parse the PCI and hand
//! the PDU to the dispatcher, usually the EFCP container. PDUs for another
//! address are relayed, management PDUs go to a dedicated handler.
#![deny(missing_docs)]
mod forwarding;
mod port;
mod scheduler;

pub use crate::forwarding::ForwardingTable;
pub use crate::scheduler::{Fifo, QosPriority, Scheduler, SchedulerKind};
use crate::port::OutputPort;
use bytes::Bytes;
use channel::Channel;
use failure::Fail;
use log::{debug, trace, warn};
use naming::{Address, ConfigError, DifConfig, PortId, QosId};
use pdu::{Pci, Pdu, PduSink, PduType, Sdu, SinkError};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Default number of PDUs an output queue holds.
pub const DEFAULT_QUEUE_LEN: usize = 256;

/// RMT error.
#[derive(Debug, Fail)]
pub enum RmtError {
    /// An N-1 port with this id exists already.
    #[fail(display = "n-1 port {} exists", _0)]
    PortExists(PortId),
    /// No N-1 port with this id.
    #[fail(display = "no n-1 port {}", _0)]
    NoPort(PortId),
}

/// Receives the PDUs addressed to this IPC process.
pub trait Dispatcher: Send + Sync {
    /// Handles a data or control PDU. Errors are counted and logged, they
    /// never stop an ingress worker.
    fn dispatch(&self, pdu: Pdu) -> Result<(), failure::Error>;
}

/// Receives management SDUs addressed to this IPC process.
pub trait MgmtHandler: Send + Sync {
    /// Handles a management SDU sent by `src`.
    fn handle(&self, src: Address, sdu: Sdu);
}

/// Counters of an RMT.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RmtCounters {
    /// PDUs queued for transmission.
    pub queued: u64,
    /// PDUs written to an N-1 channel.
    pub tx_pdus: u64,
    /// Failed channel writes.
    pub tx_errors: u64,
    /// Frames read from an N-1 channel.
    pub rx_pdus: u64,
    /// Frames that did not parse.
    pub bad_pdus: u64,
    /// PDUs forwarded to another IPC process.
    pub relayed: u64,
    /// PDUs without a route.
    pub no_route: u64,
    /// PDUs refused by a full output queue.
    pub queue_full: u64,
    /// Management PDUs received.
    pub mgmt_rx: u64,
    /// PDUs the dispatcher refused or that had no receiver.
    pub undeliverable: u64,
}

#[derive(Default)]
struct RmtStats {
    queued: AtomicU64,
    tx_pdus: AtomicU64,
    tx_errors: AtomicU64,
    rx_pdus: AtomicU64,
    bad_pdus: AtomicU64,
    relayed: AtomicU64,
    no_route: AtomicU64,
    queue_full: AtomicU64,
    mgmt_rx: AtomicU64,
    undeliverable: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RmtStats {
    fn snapshot(&self) -> RmtCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RmtCounters {
            queued: get(&self.queued),
            tx_pdus: get(&self.tx_pdus),
            tx_errors: get(&self.tx_errors),
            rx_pdus: get(&self.rx_pdus),
            bad_pdus: get(&self.bad_pdus),
            relayed: get(&self.relayed),
            no_route: get(&self.no_route),
            queue_full: get(&self.queue_full),
            mgmt_rx: get(&self.mgmt_rx),
            undeliverable: get(&self.undeliverable),
        }
    }
}

/// Relaying and multiplexing task of one IPC process.
pub struct Rmt {
    address: Address,
    queue_len: usize,
    scheduler: SchedulerKind,
    ports: RwLock<HashMap<PortId, Arc<OutputPort>>>,
    forwarding: RwLock<ForwardingTable>,
    dispatcher: RwLock<Option<Weak<dyn Dispatcher>>>,
    mgmt: RwLock<Option<Arc<dyn MgmtHandler>>>,
    stats: RmtStats,
    closed: AtomicBool,
}

impl Rmt {
    /// Creates an RMT for the IPC process with address `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            queue_len: DEFAULT_QUEUE_LEN,
            scheduler: SchedulerKind::default(),
            ports: RwLock::new(HashMap::new()),
            forwarding: RwLock::new(ForwardingTable::default()),
            dispatcher: RwLock::new(None),
            mgmt: RwLock::new(None),
            stats: RmtStats::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates an RMT reading `rmt.queue-len` and `rmt.scheduler` from the
    /// DIF configuration.
    pub fn from_config(address: Address, dif: &DifConfig) -> Result<Self, ConfigError> {
        let mut rmt = Self::new(address);
        if let Some(len) = dif.parse("rmt.queue-len")? {
            rmt.queue_len = len;
        }
        if let Some(kind) = dif.parse("rmt.scheduler")? {
            rmt.scheduler = kind;
        }
        debug!(
            "rmt {} queue length {} scheduler {:?}",
            address, rmt.queue_len, rmt.scheduler
        );
        Ok(rmt)
    }

    /// Address of the IPC process.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Output queue length.
    pub fn queue_len(&self) -> usize {
        self.queue_len
    }

    /// Sets the receiver of PDUs addressed to this IPC process.
    pub fn set_dispatcher(&self, dispatcher: Weak<dyn Dispatcher>) {
        *self.dispatcher.write().unwrap() = Some(dispatcher);
    }

    /// Sets the receiver of management SDUs.
    pub fn set_mgmt_handler(&self, handler: Arc<dyn MgmtHandler>) {
        *self.mgmt.write().unwrap() = Some(handler);
    }

    /// Adds an N-1 port using the configured scheduler.
    pub fn add_port(&self, id: PortId, channel: Arc<dyn Channel>) -> Result<(), RmtError> {
        self.add_port_with(id, channel, self.scheduler.build())
    }

    /// Adds an N-1 port with its own scheduler.
    pub fn add_port_with(
        &self,
        id: PortId,
        channel: Arc<dyn Channel>,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<(), RmtError> {
        let mut ports = self.ports.write().unwrap();
        if ports.contains_key(&id) {
            return Err(RmtError::PortExists(id));
        }
        let port = OutputPort::new(id, channel, scheduler, self.queue_len);
        ports.insert(id, Arc::new(port));
        debug!("rmt {} added n-1 port {}", self.address, id);
        Ok(())
    }

    /// Removes an N-1 port and the routes through it. Its egress worker
    /// stops once the queue is empty.
    pub fn remove_port(&self, id: PortId) -> Result<(), RmtError> {
        let port = self
            .ports
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(RmtError::NoPort(id))?;
        port.close();
        let routes = self.forwarding.write().unwrap().remove_port(id);
        debug!("rmt {} removed n-1 port {} and {} routes", self.address, id, routes);
        Ok(())
    }

    /// N-1 port ids.
    pub fn ports(&self) -> Vec<PortId> {
        let mut ports: Vec<_> = self.ports.read().unwrap().keys().copied().collect();
        ports.sort();
        ports
    }

    /// Routes PDUs for `dest` through `port`, for one QoS id or all.
    pub fn add_route(&self, dest: Address, qos_id: Option<QosId>, port: PortId) {
        self.forwarding.write().unwrap().add(dest, qos_id, port);
        debug!("rmt {} route {} qos {:?} via {}", self.address, dest, qos_id, port);
    }

    /// Removes a route.
    pub fn remove_route(&self, dest: Address, qos_id: Option<QosId>) -> Option<PortId> {
        self.forwarding.write().unwrap().remove(dest, qos_id)
    }

    /// N-1 port used for a destination.
    pub fn route(&self, dest: Address, qos_id: QosId) -> Option<PortId> {
        self.forwarding.read().unwrap().lookup(dest, qos_id)
    }

    fn port(&self, id: PortId) -> Option<Arc<OutputPort>> {
        self.ports.read().unwrap().get(&id).cloned()
    }

    /// Number of PDUs queued on an N-1 port.
    pub fn queued(&self, id: PortId) -> usize {
        self.port(id).map(|port| port.len()).unwrap_or(0)
    }

    /// Takes the next PDU from the output queue of an N-1 port.
    pub fn pop(&self, id: PortId) -> Option<Pdu> {
        self.port(id)?.pop()
    }

    /// Queues a PDU on the N-1 port leading to its destination.
    pub fn send(&self, pdu: Pdu) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let dest = pdu.pci().dest_addr();
        let port = self
            .route(dest, pdu.pci().qos_id())
            .and_then(|id| self.port(id));
        let port = match port {
            Some(port) => port,
            None => {
                inc(&self.stats.no_route);
                debug!("rmt {} no route to {}", self.address, dest);
                return Err(SinkError::NoRoute(dest));
            }
        };
        match port.push(pdu) {
            Ok(()) => {
                inc(&self.stats.queued);
                Ok(())
            }
            Err(SinkError::QueueFull) => {
                inc(&self.stats.queue_full);
                trace!("rmt {} n-1 port {} full", self.address, port.id);
                Err(SinkError::QueueFull)
            }
            Err(err) => Err(err),
        }
    }

    /// Sends a management SDU to the IPC process `dest`.
    pub fn mgmt_write(&self, dest: Address, sdu: Sdu) -> Result<(), SinkError> {
        let mut pci = Pci::new(PduType::Management);
        pci.set_dest_addr(dest);
        pci.set_src_addr(self.address);
        pci.set_fragment(true, true);
        self.send(Pdu::new(pci, sdu.into_bytes()))
    }

    /// Handles a frame read from the N-1 port `from`.
    pub fn receive(&self, from: PortId, frame: Bytes) {
        inc(&self.stats.rx_pdus);
        let pdu = match Pdu::parse(frame) {
            Ok(pdu) => pdu,
            Err(err) => {
                inc(&self.stats.bad_pdus);
                debug!("rmt {} dropped frame: {}", self.address, err);
                return;
            }
        };
        let dest = pdu.pci().dest_addr();
        if dest != self.address {
            if self.route(dest, pdu.pci().qos_id()) == Some(from) {
                inc(&self.stats.undeliverable);
                debug!(
                    "rmt {} refused to relay {} back through n-1 port {}",
                    self.address, dest, from
                );
                return;
            }
            match self.send(pdu) {
                Ok(()) => inc(&self.stats.relayed),
                Err(err) => debug!("rmt {} failed to relay to {}: {}", self.address, dest, err),
            }
            return;
        }
        if pdu.pdu_type() == PduType::Management {
            inc(&self.stats.mgmt_rx);
            let handler = self.mgmt.read().unwrap().clone();
            match handler {
                Some(handler) => {
                    let src = pdu.pci().src_addr();
                    handler.handle(src, Sdu::new(pdu.into_payload()));
                }
                None => {
                    inc(&self.stats.undeliverable);
                    debug!("rmt {} no management handler", self.address);
                }
            }
            return;
        }
        let dispatcher = self
            .dispatcher
            .read()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        match dispatcher {
            Some(dispatcher) => {
                if let Err(err) = dispatcher.dispatch(pdu) {
                    inc(&self.stats.undeliverable);
                    debug!("rmt {} dispatch failed: {}", self.address, err);
                }
            }
            None => {
                inc(&self.stats.undeliverable);
                debug!("rmt {} no dispatcher", self.address);
            }
        }
    }

    /// Writes the output queue of an N-1 port to its channel until the port
    /// is removed or the RMT closed.
    pub async fn run_egress(self: Arc<Self>, id: PortId) -> io::Result<()> {
        let port = self
            .port(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, RmtError::NoPort(id).to_string()))?;
        while port.ready().await {
            while let Some(pdu) = port.pop() {
                let seq = pdu.seq();
                match port.channel.send(pdu.to_bytes()).await {
                    Ok(()) => {
                        inc(&self.stats.tx_pdus);
                        trace!("rmt {} n-1 port {} sent {}", self.address, id, seq);
                    }
                    Err(err) => {
                        inc(&self.stats.tx_errors);
                        warn!("rmt {} n-1 port {} write failed: {}", self.address, id, err);
                    }
                }
            }
        }
        debug!("rmt {} egress {} stopped", self.address, id);
        Ok(())
    }

    /// Reads frames from an N-1 port until its channel fails.
    pub async fn run_ingress(self: Arc<Self>, id: PortId) -> io::Result<()> {
        let channel = self
            .port(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, RmtError::NoPort(id).to_string()))?
            .channel
            .clone();
        loop {
            let frame = match channel.recv().await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("rmt {} ingress {} stopped: {}", self.address, id, err);
                    return Err(err);
                }
            };
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            self.receive(id, frame);
        }
    }

    /// Refuses further PDUs and stops the egress workers once their queues
    /// are empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for port in self.ports.read().unwrap().values() {
            port.close();
        }
        debug!("rmt {} closed", self.address);
    }

    /// Counters.
    pub fn counters(&self) -> RmtCounters {
        self.stats.snapshot()
    }
}

impl PduSink for Rmt {
    fn send_pdu(&self, pdu: Pdu) -> Result<(), SinkError> {
        self.send(pdu)
    }
}
