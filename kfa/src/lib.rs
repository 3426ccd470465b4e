//! # Kernel flow allocator
//! The port table of an IPC process. Applications address flows by port-id;
//! the KFA binds each port-id to the DTP instance of a connection, admits
//! writes into it and queues the SDUs it delivers until they are read.
//!
//! Unbinding a port waits for writes already admitted to return, so a DTP
//! is never written to after its port was unbound.
#![deny(missing_docs)]
mod port;

use crate::port::{Binding, Port, PortState};
pub use crate::port::WriteGuard;
use dtp::{Dtp, DtpError, DtpState, SduSink};
use failure::Fail;
use log::{debug, trace, warn};
use naming::{CepId, PortId};
use pdu::Sdu;
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// KFA error.
#[derive(Debug, Fail)]
pub enum KfaError {
    /// The port is not allocated or not bound.
    #[fail(display = "no flow on port {}", _0)]
    NoFlow(PortId),
    /// The connection of the port went down.
    #[fail(display = "flow on port {} is down", _0)]
    FlowDown(PortId),
    /// The port is bound already.
    #[fail(display = "port {} is already bound", _0)]
    AlreadyBound(PortId),
    /// The connection is not active.
    #[fail(display = "connection {} is not active", _0)]
    NotActive(CepId),
    /// The connection cannot take the SDU now.
    #[fail(display = "flow busy")]
    Busy,
    /// No port-id left.
    #[fail(display = "port-ids exhausted")]
    Exhausted,
    /// The connection refused the SDU.
    #[fail(display = "{}", _0)]
    Dtp(#[cause] DtpError),
}

/// Port table.
pub struct Kfa {
    ports: RwLock<Slab<Arc<Port>>>,
    max_ports: usize,
    rx_capacity: usize,
    rx_dropped: AtomicU64,
}

fn key(port: PortId) -> Option<usize> {
    (port as usize).checked_sub(1)
}

impl Kfa {
    /// Creates a port table of `max_ports` ports, each queueing up to
    /// `rx_capacity` received SDUs.
    pub fn new(max_ports: usize, rx_capacity: usize) -> Self {
        Self {
            ports: RwLock::new(Slab::new()),
            max_ports,
            rx_capacity,
            rx_dropped: AtomicU64::new(0),
        }
    }

    fn port(&self, port: PortId) -> Option<Arc<Port>> {
        let ports = self.ports.read().unwrap();
        ports.get(key(port)?).cloned()
    }

    /// Allocates a port-id.
    pub fn allocate_port(&self) -> Result<PortId, KfaError> {
        let mut ports = self.ports.write().unwrap();
        if ports.len() >= self.max_ports {
            return Err(KfaError::Exhausted);
        }
        let entry = ports.vacant_entry();
        let id = entry.key() as PortId + 1;
        entry.insert(Arc::new(Port::new(id)));
        debug!("allocated port {}", id);
        Ok(id)
    }

    /// Binds a port to the DTP instance of an active connection.
    pub fn bind(self: &Arc<Self>, port: PortId, dtp: &Arc<Dtp>) -> Result<(), KfaError> {
        let entry = self.port(port).ok_or(KfaError::NoFlow(port))?;
        {
            let mut inner = entry.lock();
            match inner.state {
                PortState::Allocated => {}
                PortState::Closed => return Err(KfaError::NoFlow(port)),
                PortState::Bound | PortState::Down => return Err(KfaError::AlreadyBound(port)),
            }
            if dtp.state() != DtpState::Active {
                return Err(KfaError::NotActive(dtp.cep_id()));
            }
            inner.binding = Some(Binding {
                cep_id: dtp.cep_id(),
                dtp: Arc::downgrade(dtp),
            });
            inner.state = PortState::Bound;
        }
        let sink: Arc<dyn SduSink> = self.clone();
        dtp.attach(port, Arc::downgrade(&sink));
        debug!("bound port {} to cep {}", port, dtp.cep_id());
        Ok(())
    }

    /// Unbinds a port once admitted writes returned.
    ///
    /// Unbinding an unbound or unknown port does nothing. The port stays
    /// allocated, further writes fail with `FlowDown`.
    pub fn unbind(&self, port: PortId) {
        let entry = match self.port(port) {
            Some(entry) => entry,
            None => return,
        };
        let binding = {
            let mut inner = entry.lock();
            if inner.state == PortState::Bound {
                inner.state = PortState::Down;
            }
            while inner.in_flight > 0 {
                inner = entry.wait_forever(inner);
            }
            inner.binding.take()
        };
        entry.notify();
        if let Some(binding) = binding {
            if let Some(dtp) = binding.dtp.upgrade() {
                dtp.detach();
            }
            debug!("unbound port {} from cep {}", port, binding.cep_id);
        }
    }

    /// Admits a write on a port.
    pub fn begin_write(&self, port: PortId) -> Result<WriteGuard, KfaError> {
        let entry = self.port(port).ok_or(KfaError::NoFlow(port))?;
        let dtp = {
            let mut inner = entry.lock();
            match inner.state {
                PortState::Bound => {}
                PortState::Allocated => return Err(KfaError::NoFlow(port)),
                PortState::Down | PortState::Closed => return Err(KfaError::FlowDown(port)),
            }
            let dtp = inner
                .binding
                .as_ref()
                .and_then(|binding| binding.dtp.upgrade())
                .ok_or(KfaError::FlowDown(port))?;
            inner.in_flight += 1;
            dtp
        };
        Ok(WriteGuard { port: entry, dtp })
    }

    /// Writes an SDU to the connection bound to a port.
    ///
    /// The flow does not deduplicate: writing the same SDU twice sends it
    /// twice.
    pub fn write(&self, port: PortId, sdu: Sdu) -> Result<(), KfaError> {
        let guard = self.begin_write(port)?;
        guard.dtp.write(sdu).map_err(|err| match err {
            DtpError::Busy => KfaError::Busy,
            DtpError::NotActive(_) => KfaError::FlowDown(port),
            err => KfaError::Dtp(err),
        })
    }

    /// Writes an SDU, waiting up to `timeout` while the connection is busy.
    pub fn write_timeout(&self, port: PortId, sdu: Sdu, timeout: Duration) -> Result<(), KfaError> {
        let deadline = Instant::now() + timeout;
        loop {
            let entry = self.port(port).ok_or(KfaError::NoFlow(port))?;
            let epoch = entry.lock().writable;
            match self.write(port, sdu.clone()) {
                Err(KfaError::Busy) => {}
                res => return res,
            }
            let mut inner = entry.lock();
            while inner.writable == epoch && inner.state == PortState::Bound {
                let now = Instant::now();
                if now >= deadline {
                    return Err(KfaError::Busy);
                }
                inner = entry.wait(inner, deadline - now);
            }
        }
    }

    /// Reads an SDU if one is queued.
    ///
    /// Fails with `FlowDown` once the flow is down and the queue is empty.
    pub fn read(&self, port: PortId) -> Result<Option<Sdu>, KfaError> {
        let entry = self.port(port).ok_or(KfaError::NoFlow(port))?;
        let mut inner = entry.lock();
        if let Some(sdu) = inner.rx.pop_front() {
            return Ok(Some(sdu));
        }
        match inner.state {
            PortState::Down | PortState::Closed => Err(KfaError::FlowDown(port)),
            _ => Ok(None),
        }
    }

    /// Reads an SDU, waiting up to `timeout` for one to arrive.
    pub fn read_timeout(&self, port: PortId, timeout: Duration) -> Result<Option<Sdu>, KfaError> {
        let deadline = Instant::now() + timeout;
        let entry = self.port(port).ok_or(KfaError::NoFlow(port))?;
        let mut inner = entry.lock();
        loop {
            if let Some(sdu) = inner.rx.pop_front() {
                return Ok(Some(sdu));
            }
            match inner.state {
                PortState::Down | PortState::Closed => return Err(KfaError::FlowDown(port)),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            inner = entry.wait(inner, deadline - now);
        }
    }

    /// Unbinds and deallocates a port.
    pub fn close(&self, port: PortId) -> Result<(), KfaError> {
        let id = key(port).ok_or(KfaError::NoFlow(port))?;
        if self.port(port).is_none() {
            return Err(KfaError::NoFlow(port));
        }
        self.unbind(port);
        let entry = {
            let mut ports = self.ports.write().unwrap();
            if !ports.contains(id) {
                return Err(KfaError::NoFlow(port));
            }
            ports.remove(id)
        };
        let dropped = {
            let mut inner = entry.lock();
            inner.state = PortState::Closed;
            let dropped = inner.rx.len();
            inner.rx.clear();
            dropped
        };
        entry.notify();
        debug!("closed port {}, {} unread sdus", port, dropped);
        Ok(())
    }

    /// CEP-id a port is bound to.
    pub fn cep_id(&self, port: PortId) -> Option<CepId> {
        let entry = self.port(port)?;
        let inner = entry.lock();
        inner.binding.as_ref().map(|binding| binding.cep_id)
    }

    /// Port bound to a CEP-id.
    pub fn port_of(&self, cep_id: CepId) -> Option<PortId> {
        let ports = self.ports.read().unwrap();
        ports
            .iter()
            .map(|(_, entry)| entry)
            .find(|entry| {
                let inner = entry.lock();
                inner.binding.as_ref().map(|b| b.cep_id) == Some(cep_id)
            })
            .map(|entry| entry.id)
    }

    /// Allocated port-ids.
    pub fn ports(&self) -> Vec<PortId> {
        let ports = self.ports.read().unwrap();
        ports.iter().map(|(_, entry)| entry.id).collect()
    }

    /// Number of SDUs waiting to be read.
    pub fn pending(&self, port: PortId) -> usize {
        match self.port(port) {
            Some(entry) => entry.lock().rx.len(),
            None => 0,
        }
    }

    /// SDUs dropped because a receive queue was full.
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }
}

impl SduSink for Kfa {
    fn deliver(&self, port: PortId, sdu: Sdu) {
        let entry = match self.port(port) {
            Some(entry) => entry,
            None => return,
        };
        {
            let mut inner = entry.lock();
            if inner.rx.len() >= self.rx_capacity {
                warn!("port {} receive queue full", port);
                self.rx_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            trace!("port {} received {} bytes", port, sdu.len());
            inner.rx.push_back(sdu);
        }
        entry.notify();
    }

    fn writable(&self, port: PortId) {
        if let Some(entry) = self.port(port) {
            entry.lock().writable += 1;
            entry.notify();
        }
    }

    fn flow_down(&self, port: PortId) {
        if let Some(entry) = self.port(port) {
            {
                let mut inner = entry.lock();
                if inner.state == PortState::Bound {
                    inner.state = PortState::Down;
                }
            }
            warn!("flow on port {} went down", port);
            entry.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtcp::DtcpConfig;
    use dtp::{Connection, DtpConfig};
    use pdu::{Pdu, PduSink, SinkError};
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Wire(Mutex<Vec<Pdu>>);

    impl PduSink for Wire {
        fn send_pdu(&self, pdu: Pdu) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    fn endpoint(cep: CepId, config: DtpConfig) -> (Arc<Wire>, Arc<Dtp>) {
        let wire = Arc::new(Wire::default());
        let mut conn = Connection::new(1, 2, 0, config).with_dest_cep(cep + 100);
        conn.source_cep_id = cep;
        (wire.clone(), Arc::new(Dtp::new(conn, wire)))
    }

    #[test]
    fn test_admission() {
        let kfa = Arc::new(Kfa::new(2, 16));
        let p1 = kfa.allocate_port().unwrap();
        let p2 = kfa.allocate_port().unwrap();
        assert_eq!((p1, p2), (1, 2));
        match kfa.allocate_port() {
            Err(KfaError::Exhausted) => {}
            other => panic!("unexpected {:?}", other),
        }

        let (wire, dtp) = endpoint(7, DtpConfig::default());
        match kfa.write(p1, "sdu".into()) {
            Err(KfaError::NoFlow(1)) => {}
            other => panic!("unexpected {:?}", other),
        }
        kfa.bind(p1, &dtp).unwrap();
        match kfa.bind(p1, &dtp) {
            Err(KfaError::AlreadyBound(1)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(kfa.cep_id(p1), Some(7));
        assert_eq!(kfa.port_of(7), Some(p1));

        kfa.write(p1, "sdu".into()).unwrap();
        assert_eq!(wire.0.lock().unwrap().len(), 1);

        kfa.unbind(p1);
        kfa.unbind(p1);
        match kfa.write(p1, "sdu".into()) {
            Err(KfaError::FlowDown(1)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dtp.port(), None);

        let mut conn = Connection::new(1, 2, 0, DtpConfig::default());
        conn.source_cep_id = 8;
        let inactive = Arc::new(Dtp::new(conn, wire));
        match kfa.bind(p2, &inactive) {
            Err(KfaError::NotActive(8)) => {}
            other => panic!("unexpected {:?}", other),
        }

        kfa.close(p1).unwrap();
        assert_eq!(kfa.ports(), vec![p2]);
        assert!(kfa.close(p1).is_err());
        assert_eq!(kfa.allocate_port().unwrap(), p1);
    }

    #[test]
    fn test_delivery() {
        let kfa = Arc::new(Kfa::new(4, 2));
        let port = kfa.allocate_port().unwrap();
        let (_, dtp) = endpoint(3, DtpConfig::default());
        kfa.bind(port, &dtp).unwrap();
        for sdu in &["a", "b", "c"] {
            kfa.deliver(port, (*sdu).into());
        }
        assert_eq!(kfa.pending(port), 2);
        assert_eq!(kfa.rx_dropped(), 1);
        assert_eq!(kfa.read(port).unwrap().unwrap().as_bytes(), b"a");
        assert_eq!(kfa.read(port).unwrap().unwrap().as_bytes(), b"b");
        assert!(kfa.read(port).unwrap().is_none());

        let reader = {
            let kfa = kfa.clone();
            thread::spawn(move || kfa.read_timeout(port, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        kfa.deliver(port, "d".into());
        let sdu = reader.join().unwrap().unwrap().unwrap();
        assert_eq!(sdu.as_bytes(), b"d");

        kfa.flow_down(port);
        match kfa.read(port) {
            Err(KfaError::FlowDown(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unbind_waits_for_writes() {
        let kfa = Arc::new(Kfa::new(4, 2));
        let port = kfa.allocate_port().unwrap();
        let (_, dtp) = endpoint(3, DtpConfig::default());
        kfa.bind(port, &dtp).unwrap();

        let guard = kfa.begin_write(port).unwrap();
        let unbinder = {
            let kfa = kfa.clone();
            thread::spawn(move || kfa.unbind(port))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(kfa.cep_id(port), Some(3));
        guard.dtp().write("late".into()).unwrap();
        drop(guard);
        unbinder.join().unwrap();
        assert_eq!(kfa.cep_id(port), None);
    }

    #[test]
    fn test_write_timeout() {
        let config = DtpConfig::default()
            .set_closed_window_queue(0)
            .set_dtcp(DtcpConfig::new().set_window(1).no_rtx());
        let kfa = Arc::new(Kfa::new(4, 2));
        let port = kfa.allocate_port().unwrap();
        let (_, dtp) = endpoint(3, config);
        kfa.bind(port, &dtp).unwrap();
        kfa.write(port, "one".into()).unwrap();
        match kfa.write(port, "two".into()) {
            Err(KfaError::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        match kfa.write_timeout(port, "two".into(), Duration::from_millis(20)) {
            Err(KfaError::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
