//! # Error and flow control protocol
//! The EFCP container of an IPC process. It owns one DTP instance per
//! connection, keyed by the local CEP-id, creates and destroys connections
//! and dispatches the PDUs handed up by the RMT to the right instance.
//!
//! ## CEP-ids
//! CEP-ids come from a wrapping counter. A CEP-id is not reused within
//! `2 MPL` of its connection being destroyed, so late PDUs of the old
//! connection cannot reach a new one.
//!
//! ## Teardown
//! Destroying a connection unbinds its port, lets the DTP drain until it is
//! quiescent or the drain timeout passes and then closes it, dropping
//! whatever is still queued. Lookups hold a reference to the DTP, so a PDU
//! being received while the connection is destroyed never sees a freed
//! instance; once `connection_destroy` returned the CEP-id is unknown.
//!
//! ## Ingress
//! PDUs handed up by the RMT wait in a bounded queue per connection and are
//! fed to the DTP by a task of their own, so ingress never waits for a
//! connection. A PDU finding the queue full is dropped and its loss
//! reported to DTCP.
//!
//! ## Timers
//! `tick` drives the A-timer, DTCP timers and inactivity timers of every
//! connection and reaps connections that failed. `spawn_timer` runs it
//! periodically.
#![deny(missing_docs)]
mod cep;
mod error;

pub use crate::cep::CepIdAllocator;
pub use crate::error::{EfcpError, ErrorKind};
use async_std::channel::{bounded, Receiver, Sender, TrySendError};
use async_std::task::{self, JoinHandle};
use dtp::{Connection, Dtp, DtpConfig, DtpError, DtpState};
use futures_timer::Delay;
use kfa::Kfa;
use log::{debug, trace, warn};
use naming::{Address, CepId, DifConfig, DtCons, FlowSpec, PortId};
use pdu::{Pdu, Sdu};
use rmt::{Dispatcher, Rmt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

/// Default number of PDUs waiting for a connection on ingress.
pub const DEFAULT_RX_QUEUE_LEN: usize = 256;

/// Counters of an EFCP container.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EfcpCounters {
    /// Connections created.
    pub created: u64,
    /// Connections destroyed.
    pub destroyed: u64,
    /// Failed connections removed by the timer.
    pub reaped: u64,
    /// PDUs for an unknown CEP-id.
    pub unknown_cep: u64,
    /// PDUs refused by their connection.
    pub bad_pdus: u64,
    /// Buffers released by closing connections.
    pub released: u64,
    /// PDUs dropped by a full receive queue.
    pub rx_overflow: u64,
}

#[derive(Default)]
struct EfcpStats {
    created: AtomicU64,
    destroyed: AtomicU64,
    reaped: AtomicU64,
    unknown_cep: AtomicU64,
    bad_pdus: AtomicU64,
    released: AtomicU64,
    rx_overflow: AtomicU64,
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

struct Cep {
    dtp: Arc<Dtp>,
    ingress: Sender<Pdu>,
}

/// Feeds the PDUs queued on ingress to a connection until the connection
/// is removed.
async fn run_ingress(dtp: Weak<Dtp>, queue: Receiver<Pdu>, stats: Arc<EfcpStats>) {
    while let Ok(pdu) = queue.recv().await {
        let dtp = match dtp.upgrade() {
            Some(dtp) => dtp,
            None => break,
        };
        if let Err(err) = dtp.receive(pdu) {
            add(&stats.bad_pdus, 1);
            debug!("cep {} dropped pdu: {}", dtp.cep_id(), err);
        }
        dtp.report_overflow();
    }
}

/// EFCP container.
pub struct Efcp {
    address: Address,
    dif: DifConfig,
    rx_queue_len: usize,
    ceps: RwLock<HashMap<CepId, Cep>>,
    allocator: Mutex<CepIdAllocator>,
    destroying: Mutex<HashSet<CepId>>,
    rmt: Arc<Rmt>,
    kfa: Arc<Kfa>,
    stats: Arc<EfcpStats>,
}

impl Efcp {
    /// Creates the container of the IPC process served by `rmt`, reading
    /// `efcp.rx-queue-len` from the DIF configuration.
    pub fn new(dif: &DifConfig, rmt: Arc<Rmt>, kfa: Arc<Kfa>) -> Result<Self, EfcpError> {
        dif.dt_cons.validate()?;
        let cons = &dif.dt_cons;
        if rmt.address() > cons.max_address() {
            return Err(EfcpError::InvalidArg("address exceeds address length"));
        }
        let rx_queue_len = dif
            .parse("efcp.rx-queue-len")?
            .unwrap_or(DEFAULT_RX_QUEUE_LEN);
        if rx_queue_len == 0 {
            return Err(EfcpError::InvalidArg("empty receive queue"));
        }
        let allocator = CepIdAllocator::new(cons.max_cep_id(), cons.guard_interval());
        Ok(Self {
            address: rmt.address(),
            dif: dif.clone(),
            rx_queue_len,
            ceps: RwLock::new(HashMap::new()),
            allocator: Mutex::new(allocator),
            destroying: Mutex::new(HashSet::new()),
            rmt,
            kfa,
            stats: Arc::new(EfcpStats::default()),
        })
    }

    /// Address of the IPC process.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Data transfer constants of the DIF.
    pub fn dt_cons(&self) -> &DtCons {
        &self.dif.dt_cons
    }

    /// Policies for a flow with the given characteristics, overridden by
    /// the DIF configuration.
    pub fn policies(&self, spec: &FlowSpec) -> Result<DtpConfig, EfcpError> {
        let mut config = DtpConfig::from_flow_spec(&self.dif.dt_cons, spec);
        config.apply(&self.dif)?;
        Ok(config)
    }

    /// Creates a connection and returns its CEP-id.
    ///
    /// The connection is active at once if the peer CEP-id is known.
    pub fn connection_create(&self, mut conn: Connection) -> Result<CepId, EfcpError> {
        let cons = &self.dif.dt_cons;
        if conn.dest_address > cons.max_address() || conn.source_address > cons.max_address() {
            return Err(EfcpError::InvalidArg("address exceeds address length"));
        }
        if conn.qos_id > cons.max_qos_id() {
            return Err(EfcpError::InvalidArg("qos-id exceeds qos-id length"));
        }
        if conn.policies.max_pdu_size() > cons.max_pdu_size as usize {
            return Err(EfcpError::InvalidArg("pdu size exceeds max pdu size"));
        }
        if let Some(dest_cep) = conn.dest_cep_id {
            if dest_cep > cons.max_cep_id() {
                return Err(EfcpError::InvalidArg("cep-id exceeds cep-id length"));
            }
        }
        let cep_id = self
            .allocator
            .lock()
            .unwrap()
            .allocate(Instant::now())
            .ok_or(EfcpError::Exhausted)?;
        conn.source_cep_id = cep_id;
        debug!(
            "cep {} created: {} -> {} qos {}",
            cep_id, conn.source_address, conn.dest_address, conn.qos_id
        );
        let dtp = Arc::new(Dtp::new(conn, self.rmt.clone()));
        let (ingress, queue) = bounded(self.rx_queue_len);
        task::spawn(run_ingress(Arc::downgrade(&dtp), queue, self.stats.clone()));
        self.ceps
            .write()
            .unwrap()
            .insert(cep_id, Cep { dtp, ingress });
        add(&self.stats.created, 1);
        Ok(cep_id)
    }

    /// Sets the peer CEP-id learned after the connection was created.
    pub fn connection_update(&self, cep_id: CepId, dest_cep_id: CepId) -> Result<(), EfcpError> {
        if dest_cep_id > self.dif.dt_cons.max_cep_id() {
            return Err(EfcpError::InvalidArg("cep-id exceeds cep-id length"));
        }
        let dtp = self.dtp(cep_id).ok_or(EfcpError::UnknownCep(cep_id))?;
        dtp.update_dest_cep(dest_cep_id)?;
        Ok(())
    }

    /// Destroys a connection. Returns the number of buffers released.
    pub fn connection_destroy(&self, cep_id: CepId) -> Result<usize, EfcpError> {
        let dtp = self.dtp(cep_id).ok_or(EfcpError::UnknownCep(cep_id))?;
        if !self.destroying.lock().unwrap().insert(cep_id) {
            return Err(EfcpError::UnknownCep(cep_id));
        }
        if let Some(port) = self.kfa.port_of(cep_id) {
            self.kfa.unbind(port);
        }
        dtp.close();
        let timeout = dtp.config().drain_timeout();
        if !dtp.wait_quiescent(timeout) {
            debug!("cep {} not drained after {:?}", cep_id, timeout);
        }
        let removed = self.ceps.write().unwrap().remove(&cep_id).is_some();
        let released = dtp.force_close();
        if removed {
            self.allocator
                .lock()
                .unwrap()
                .release(cep_id, Instant::now());
        }
        self.destroying.lock().unwrap().remove(&cep_id);
        add(&self.stats.destroyed, 1);
        add(&self.stats.released, released as u64);
        debug!("cep {} destroyed, released {} buffers", cep_id, released);
        Ok(released)
    }

    /// Queues a PDU for the connection it is addressed to without waiting
    /// for the connection. A PDU finding the queue full is dropped and its
    /// loss reported to DTCP.
    pub fn enqueue_pdu(&self, pdu: Pdu) -> Result<(), EfcpError> {
        let cep_id = pdu.pci().dest_cep();
        let (dtp, ingress) = match self.ceps.read().unwrap().get(&cep_id) {
            Some(cep) => (cep.dtp.clone(), cep.ingress.clone()),
            None => {
                add(&self.stats.unknown_cep, 1);
                trace!("pdu for unknown cep {}", cep_id);
                return Err(EfcpError::UnknownCep(cep_id));
            }
        };
        match ingress.try_send(pdu) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(pdu)) => {
                add(&self.stats.rx_overflow, 1);
                trace!("cep {} receive queue full, dropped {}", cep_id, pdu.seq());
                dtp.overflowed(&pdu);
                Err(EfcpError::QueueFull(cep_id))
            }
            Err(TrySendError::Closed(_)) => Err(DtpError::NotActive(dtp.state()).into()),
        }
    }

    /// Hands a PDU to the connection it is addressed to and processes it
    /// on the calling thread.
    pub fn receive_pdu(&self, pdu: Pdu) -> Result<(), EfcpError> {
        let cep_id = pdu.pci().dest_cep();
        let dtp = match self.dtp(cep_id) {
            Some(dtp) => dtp,
            None => {
                add(&self.stats.unknown_cep, 1);
                trace!("pdu for unknown cep {}", cep_id);
                return Err(EfcpError::UnknownCep(cep_id));
            }
        };
        dtp.receive(pdu).map_err(|err| {
            add(&self.stats.bad_pdus, 1);
            debug!("cep {} dropped pdu: {}", cep_id, err);
            err.into()
        })
    }

    /// Writes an SDU to the connection bound to a port.
    pub fn write(&self, port: PortId, sdu: Sdu) -> Result<(), EfcpError> {
        let guard = self.kfa.begin_write(port)?;
        guard.dtp().write(sdu)?;
        Ok(())
    }

    /// Binds a port to a connection.
    pub fn bind(&self, port: PortId, cep_id: CepId) -> Result<(), EfcpError> {
        let dtp = self.dtp(cep_id).ok_or(EfcpError::UnknownCep(cep_id))?;
        self.kfa.bind(port, &dtp)?;
        Ok(())
    }

    /// DTP instance of a connection.
    pub fn dtp(&self, cep_id: CepId) -> Option<Arc<Dtp>> {
        self.ceps
            .read()
            .unwrap()
            .get(&cep_id)
            .map(|cep| cep.dtp.clone())
    }

    /// CEP-ids of all connections.
    pub fn ceps(&self) -> Vec<CepId> {
        let mut ceps: Vec<_> = self.ceps.read().unwrap().keys().copied().collect();
        ceps.sort();
        ceps
    }

    /// Runs the timers of every connection and removes failed ones.
    /// Returns the number of connections removed.
    pub fn tick(&self, now: Instant) -> usize {
        let dtps: Vec<_> = self
            .ceps
            .read()
            .unwrap()
            .values()
            .map(|cep| cep.dtp.clone())
            .collect();
        let mut closed = Vec::new();
        for dtp in dtps {
            dtp.report_overflow();
            if let Err(err) = dtp.on_timer(now) {
                warn!("cep {} failed: {}", dtp.cep_id(), err);
            }
            if dtp.state() == DtpState::Closed {
                closed.push(dtp);
            }
        }
        let mut reaped = 0;
        for dtp in closed {
            let cep_id = dtp.cep_id();
            if self.destroying.lock().unwrap().contains(&cep_id) {
                continue;
            }
            if let Some(port) = self.kfa.port_of(cep_id) {
                self.kfa.unbind(port);
            }
            if self.ceps.write().unwrap().remove(&cep_id).is_none() {
                continue;
            }
            let released = dtp.force_close();
            self.allocator.lock().unwrap().release(cep_id, now);
            add(&self.stats.reaped, 1);
            add(&self.stats.released, released as u64);
            debug!("cep {} reaped, released {} buffers", cep_id, released);
            reaped += 1;
        }
        reaped
    }

    /// Runs `tick` every `period` until the container is dropped.
    pub fn spawn_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let efcp = Arc::downgrade(self);
        task::spawn(async move {
            loop {
                Delay::new(period).await;
                match efcp.upgrade() {
                    Some(efcp) => {
                        efcp.tick(Instant::now());
                    }
                    None => break,
                }
            }
        })
    }

    /// Counters.
    pub fn counters(&self) -> EfcpCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EfcpCounters {
            created: get(&self.stats.created),
            destroyed: get(&self.stats.destroyed),
            reaped: get(&self.stats.reaped),
            unknown_cep: get(&self.stats.unknown_cep),
            bad_pdus: get(&self.stats.bad_pdus),
            released: get(&self.stats.released),
            rx_overflow: get(&self.stats.rx_overflow),
        }
    }
}

impl Dispatcher for Efcp {
    fn dispatch(&self, pdu: Pdu) -> Result<(), failure::Error> {
        self.enqueue_pdu(pdu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::Loopback;
    use dtcp::DtcpConfig;
    use kfa::KfaError;

    struct Ipcp {
        rmt: Arc<Rmt>,
        kfa: Arc<Kfa>,
        efcp: Arc<Efcp>,
    }

    fn ipcp(address: Address, peer: Address, dif: &DifConfig) -> Ipcp {
        let rmt = Arc::new(Rmt::from_config(address, dif).unwrap());
        rmt.add_port(1, Arc::new(Loopback::default())).unwrap();
        rmt.add_route(peer, None, 1);
        let kfa = Arc::new(Kfa::new(16, 64));
        let efcp = Arc::new(Efcp::new(dif, rmt.clone(), kfa.clone()).unwrap());
        let dispatcher: Arc<dyn Dispatcher> = efcp.clone();
        rmt.set_dispatcher(Arc::downgrade(&dispatcher));
        Ipcp { rmt, kfa, efcp }
    }

    /// Moves the PDUs queued on `from` to `to`.
    fn pump(from: &Ipcp, to: &Ipcp) -> usize {
        let mut n = 0;
        while let Some(pdu) = from.rmt.pop(1) {
            to.rmt.receive(1, pdu.to_bytes());
            n += 1;
        }
        n
    }

    fn flow(a: &Ipcp, b: &Ipcp, config: DtpConfig) -> (PortId, CepId, PortId, CepId) {
        let conn = Connection::new(a.efcp.address(), b.efcp.address(), 0, config.clone());
        let cep_a = a.efcp.connection_create(conn).unwrap();
        let conn = Connection::new(b.efcp.address(), a.efcp.address(), 0, config)
            .with_dest_cep(cep_a);
        let cep_b = b.efcp.connection_create(conn).unwrap();
        a.efcp.connection_update(cep_a, cep_b).unwrap();
        let port_a = a.kfa.allocate_port().unwrap();
        let port_b = b.kfa.allocate_port().unwrap();
        a.efcp.bind(port_a, cep_a).unwrap();
        b.efcp.bind(port_b, cep_b).unwrap();
        (port_a, cep_a, port_b, cep_b)
    }

    #[test]
    fn test_connection_lifecycle() {
        let dif = DifConfig::default();
        let a = ipcp(1, 2, &dif);
        let b = ipcp(2, 1, &dif);
        let (port_a, cep_a, port_b, cep_b) = flow(&a, &b, DtpConfig::default());
        assert_eq!(a.efcp.ceps(), vec![cep_a]);

        a.efcp.write(port_a, "hello".into()).unwrap();
        assert_eq!(pump(&a, &b), 1);
        let sdu = b.kfa.read_timeout(port_b, Duration::from_secs(5)).unwrap();
        assert_eq!(sdu.unwrap().as_bytes(), b"hello");

        assert_eq!(a.efcp.connection_destroy(cep_a).unwrap(), 0);
        assert!(a.efcp.dtp(cep_a).is_none());
        match a.efcp.write(port_a, "late".into()) {
            Err(err) => assert_eq!(err.kind(), ErrorKind::FlowDown),
            Ok(()) => panic!("write after destroy"),
        }

        // Late PDUs for the destroyed connection.
        b.efcp.write(port_b, "late".into()).unwrap();
        assert_eq!(pump(&b, &a), 1);
        assert_eq!(a.efcp.counters().unknown_cep, 1);
        let mut pci = pdu::Pci::new(pdu::PduType::Data);
        pci.set_dest_cep(cep_a);
        match a.efcp.receive_pdu(Pdu::new(pci, Default::default())) {
            Err(EfcpError::UnknownCep(cep)) => assert_eq!(cep, cep_a),
            other => panic!("unexpected {:?}", other),
        }

        // The CEP-id stays quarantined.
        let conn = Connection::new(1, 2, 0, DtpConfig::default());
        assert_ne!(a.efcp.connection_create(conn).unwrap(), cep_a);
        assert_eq!(a.efcp.counters().destroyed, 1);
    }

    #[test]
    fn test_admission() {
        let dif = DifConfig::default();
        let a = ipcp(1, 2, &dif);
        let conn = Connection::new(1, 2, 0, DtpConfig::default());
        let cep = a.efcp.connection_create(conn).unwrap();
        let port = a.kfa.allocate_port().unwrap();
        match a.efcp.bind(port, cep) {
            Err(EfcpError::Kfa(KfaError::NotActive(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        match a.efcp.bind(port, cep + 1) {
            Err(err) => assert_eq!(err.kind(), ErrorKind::UnknownCep),
            Ok(()) => panic!("bound unknown cep"),
        }
        match a.efcp.write(port, "sdu".into()) {
            Err(err) => assert_eq!(err.kind(), ErrorKind::NoFlow),
            Ok(()) => panic!("write on unbound port"),
        }
        let conn = Connection::new(1, 2, 0, DtpConfig::default().set_max_pdu_size(9000));
        assert_eq!(
            a.efcp.connection_create(conn).unwrap_err().kind(),
            ErrorKind::InvalidArg
        );
    }

    #[test]
    fn test_destroy_releases_buffers() {
        let dif = DifConfig::default().with("dtp.drain-timeout-ms", "10");
        let a = ipcp(1, 2, &dif);
        let b = ipcp(2, 1, &dif);
        let config = a
            .efcp
            .policies(&FlowSpec::reliable())
            .unwrap()
            .set_dtcp(DtcpConfig::new().set_window(1).set_rtx(Duration::from_secs(10)));
        let (port_a, cep_a, _, _) = flow(&a, &b, config);
        for _ in 0..3 {
            a.efcp.write(port_a, "sdu".into()).unwrap();
        }
        assert_eq!(a.efcp.connection_destroy(cep_a).unwrap(), 3);
        assert_eq!(a.efcp.counters().released, 3);
        assert_eq!(a.kfa.cep_id(port_a), None);
    }

    #[test]
    fn test_receive_queue_overflow() {
        let dif = DifConfig::default().with("efcp.rx-queue-len", "1");
        let a = ipcp(1, 2, &dif);
        let b = ipcp(2, 1, &dif);
        let config = DtpConfig::default()
            .set_max_gap(1000)
            .set_dtcp(DtcpConfig::new().no_rtx());
        let (port_a, _, port_b, cep_b) = flow(&a, &b, config);
        for _ in 0..50 {
            a.efcp.write(port_a, "sdu".into()).unwrap();
        }
        let mut queued = 0;
        let mut full = 0;
        while let Some(pdu) = a.rmt.pop(1) {
            match b.efcp.enqueue_pdu(pdu) {
                Ok(()) => queued += 1,
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::WindowFull);
                    full += 1;
                }
            }
        }
        assert_eq!(queued + full, 50);
        assert_eq!(b.efcp.counters().rx_overflow, full);
        let dtp = b.efcp.dtp(cep_b).unwrap();
        assert_eq!(dtp.counters().rx_overflow, full);

        for _ in 0..queued {
            assert!(b.kfa.read_timeout(port_b, Duration::from_secs(5)).unwrap().is_some());
        }
        // Losses not reported by the ingress task are reported by the timer.
        b.efcp.tick(Instant::now());
        let deadline = Instant::now() + Duration::from_secs(5);
        while dtp.lost_reported() < full && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(dtp.lost_reported(), full);
        assert_eq!(dtp.counters().rx_pdus, queued);
    }

    #[test]
    fn test_tick_reaps_failed_connection() {
        let dif = DifConfig::default();
        let a = ipcp(1, 2, &dif);
        let b = ipcp(2, 1, &dif);
        let rto = Duration::from_millis(10);
        let config = DtpConfig::default().set_dtcp(DtcpConfig::new().set_rtx(rto).set_max_rtx(0));
        let (port_a, cep_a, _, _) = flow(&a, &b, config);
        a.efcp.write(port_a, "sdu".into()).unwrap();
        let now = Instant::now();
        assert_eq!(a.efcp.tick(now), 0);
        assert_eq!(a.efcp.tick(now + rto * 2), 1);
        assert!(a.efcp.dtp(cep_a).is_none());
        match a.kfa.read(port_a) {
            Err(KfaError::FlowDown(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.efcp.counters().reaped, 1);
    }
}
