use dtp::Dtp;
use naming::{CepId, PortId};
use pdu::Sdu;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PortState {
    /// Allocated, not bound yet.
    Allocated,
    /// Bound to a connection.
    Bound,
    /// The connection went down or is being unbound.
    Down,
    /// Removed from the table.
    Closed,
}

pub(crate) struct Binding {
    pub cep_id: CepId,
    pub dtp: Weak<Dtp>,
}

pub(crate) struct PortInner {
    pub state: PortState,
    pub binding: Option<Binding>,
    /// Writes that passed admission and have not returned yet.
    pub in_flight: usize,
    /// SDUs waiting to be read.
    pub rx: VecDeque<Sdu>,
    /// Bumped whenever the connection reports it is writable again.
    pub writable: u64,
}

pub(crate) struct Port {
    pub id: PortId,
    inner: Mutex<PortInner>,
    changed: Condvar,
}

impl Port {
    pub fn new(id: PortId) -> Self {
        Self {
            id,
            inner: Mutex::new(PortInner {
                state: PortState::Allocated,
                binding: None,
                in_flight: 0,
                rx: VecDeque::new(),
                writable: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<PortInner> {
        self.inner.lock().unwrap()
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PortInner>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, PortInner> {
        self.changed.wait_timeout(guard, timeout).unwrap().0
    }

    pub fn wait_forever<'a>(&self, guard: MutexGuard<'a, PortInner>) -> MutexGuard<'a, PortInner> {
        self.changed.wait(guard).unwrap()
    }
}

/// An admitted write.
///
/// While a guard is alive, unbinding the port waits.
pub struct WriteGuard {
    pub(crate) port: Arc<Port>,
    pub(crate) dtp: Arc<Dtp>,
}

impl WriteGuard {
    /// Port written to.
    pub fn port(&self) -> PortId {
        self.port.id
    }

    /// Connection the port is bound to.
    pub fn dtp(&self) -> &Arc<Dtp> {
        &self.dtp
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut inner = self.port.lock();
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            self.port.notify();
        }
    }
}
