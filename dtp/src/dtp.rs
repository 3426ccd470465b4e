use crate::config::DtpConfig;
use crate::connection::Connection;
use crate::receive::{Delivery, RecvState};
use crate::stats::{add, DtpCounters, DtpStats};
use crate::{DtpError, DtpState, SduSink};
use crossbeam::atomic::AtomicCell;
use crossbeam::queue::SegQueue;
use dtcp::{ControlMsg, Dtcp};
use log::{debug, trace, warn};
use naming::{CepId, PortId};
use pdu::{Pci, Pdu, PduSink, PduType, Sdu, SeqNum, SinkError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Number of SDUs kept for a user that is not attached yet.
const MAX_UNDELIVERED: usize = 256;

struct SendState {
    /// PDUs waiting for the send window to open.
    closed_window: VecDeque<Pdu>,
    /// Next PDU starts a data run.
    drf: bool,
    last_tx: Instant,
}

struct User {
    port: PortId,
    sink: Weak<dyn SduSink>,
}

/// A DTP instance.
///
/// Locks are taken in the order send, receive, DTCP, user.
pub struct Dtp {
    conn: Connection,
    dest_cep: AtomicCell<Option<CepId>>,
    state: AtomicCell<DtpState>,
    next_seq: AtomicU64,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    dtcp: Option<Mutex<Dtcp>>,
    rmt: Arc<dyn PduSink>,
    user: Mutex<Option<User>>,
    stats: DtpStats,
    failed: AtomicBool,
    drained: Condvar,
    /// Data PDUs dropped by a full receive queue, not yet reported.
    overflow: SegQueue<SeqNum>,
}

impl Dtp {
    /// Creates a DTP instance for a connection.
    ///
    /// The instance is active if the peer CEP-id is known.
    pub fn new(conn: Connection, rmt: Arc<dyn PduSink>) -> Self {
        let now = Instant::now();
        let config = &conn.policies;
        let dtcp = config
            .dtcp()
            .map(|dtcp| Mutex::new(dtcp.build(config.seq_space(), config.initial_seq(), now)));
        let state = match conn.dest_cep_id {
            Some(_) => DtpState::Active,
            None => DtpState::New,
        };
        Self {
            dest_cep: AtomicCell::new(conn.dest_cep_id),
            state: AtomicCell::new(state),
            next_seq: AtomicU64::new(config.initial_seq()),
            send: Mutex::new(SendState {
                closed_window: VecDeque::new(),
                drf: true,
                last_tx: now,
            }),
            recv: Mutex::new(RecvState::new(config)),
            dtcp,
            rmt,
            user: Mutex::new(None),
            stats: DtpStats::default(),
            failed: AtomicBool::new(false),
            drained: Condvar::new(),
            overflow: SegQueue::new(),
            conn,
        }
    }

    /// Local CEP-id.
    pub fn cep_id(&self) -> CepId {
        self.conn.source_cep_id
    }

    /// Peer CEP-id.
    pub fn dest_cep_id(&self) -> Option<CepId> {
        self.dest_cep.load()
    }

    /// The connection served by this instance.
    pub fn connection(&self) -> Connection {
        let mut conn = self.conn.clone();
        conn.dest_cep_id = self.dest_cep.load();
        conn
    }

    /// Policies.
    pub fn config(&self) -> &DtpConfig {
        &self.conn.policies
    }

    /// Current state.
    pub fn state(&self) -> DtpState {
        self.state.load()
    }

    /// Sequence number of the next data PDU.
    pub fn next_seq(&self) -> SeqNum {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Counters.
    pub fn counters(&self) -> DtpCounters {
        self.stats.snapshot()
    }

    /// Number of PDUs waiting for the send window.
    pub fn closed_window_len(&self) -> usize {
        self.send.lock().unwrap().closed_window.len()
    }

    /// Number of unacknowledged PDUs.
    pub fn outstanding(&self) -> usize {
        match self.dtcp.as_ref() {
            Some(dtcp) => dtcp.lock().unwrap().outstanding(),
            None => 0,
        }
    }

    /// Port of the attached user.
    pub fn port(&self) -> Option<PortId> {
        self.user.lock().unwrap().as_ref().map(|user| user.port)
    }

    /// Sets the peer CEP-id, activating a new connection.
    pub fn update_dest_cep(&self, dest_cep: CepId) -> Result<(), DtpError> {
        match self.state.load() {
            DtpState::New | DtpState::Active => {}
            state => return Err(DtpError::NotActive(state)),
        }
        self.dest_cep.store(Some(dest_cep));
        if self
            .state
            .compare_exchange(DtpState::New, DtpState::Active)
            .is_ok()
        {
            debug!("cep {} active, peer cep {}", self.cep_id(), dest_cep);
        }
        Ok(())
    }

    /// Attaches the user SDUs are delivered to.
    ///
    /// SDUs completed before the user attached are delivered now.
    pub fn attach(&self, port: PortId, sink: Weak<dyn SduSink>) {
        let mut recv = self.recv.lock().unwrap();
        *self.user.lock().unwrap() = Some(User {
            port,
            sink: sink.clone(),
        });
        if let Some(sink) = sink.upgrade() {
            for sdu in recv.undelivered.drain(..) {
                add(&self.stats.rx_sdus, 1);
                sink.deliver(port, sdu);
            }
        }
    }

    /// Detaches the user.
    pub fn detach(&self) {
        self.user.lock().unwrap().take();
    }

    fn user(&self) -> Option<(PortId, Arc<dyn SduSink>)> {
        let user = self.user.lock().unwrap();
        let user = user.as_ref()?;
        Some((user.port, user.sink.upgrade()?))
    }

    fn pci(&self, ty: PduType, dest_cep: CepId) -> Pci {
        let mut pci = Pci::new(ty);
        pci.set_dest_addr(self.conn.dest_address);
        pci.set_src_addr(self.conn.source_address);
        pci.set_qos_id(self.conn.qos_id);
        pci.set_dest_cep(dest_cep);
        pci.set_src_cep(self.conn.source_cep_id);
        pci
    }

    /// Writes an SDU.
    ///
    /// Fails with `Busy` without consuming sequence numbers if the PDUs
    /// cannot be queued. A PDU refused by the RMT fails the write, fragments
    /// sent before it are not recalled.
    pub fn write(&self, sdu: Sdu) -> Result<(), DtpError> {
        let config = &self.conn.policies;
        if sdu.len() > config.max_sdu_size() {
            return Err(DtpError::SduTooLarge {
                len: sdu.len(),
                max: config.max_sdu_size(),
            });
        }
        if config.max_payload() == 0 {
            return Err(DtpError::PduTooSmall(config.max_pdu_size()));
        }
        let fragments = sdu.fragments(config.max_payload());
        let count = fragments.len();
        let space = config.seq_space();
        let now = Instant::now();

        let mut send = self.send.lock().unwrap();
        let state = self.state.load();
        let dest_cep = match (state, self.dest_cep.load()) {
            (DtpState::Active, Some(dest_cep)) => dest_cep,
            _ => return Err(DtpError::NotActive(state)),
        };
        let mut dtcp = self.dtcp.as_ref().map(|dtcp| dtcp.lock().unwrap());

        let first = self.next_seq.load(Ordering::Relaxed);
        let blocked = !send.closed_window.is_empty()
            || dtcp
                .as_ref()
                .map_or(false, |dtcp| !dtcp.admits(first, count as u64));
        if blocked && send.closed_window.len() + count > config.max_closed_window_queue() {
            trace!("cep {} closed window queue full", self.cep_id());
            return Err(DtpError::Busy);
        }

        if now.saturating_duration_since(send.last_tx) >= config.sender_inactivity() {
            send.drf = true;
        }
        for (i, payload) in fragments.into_iter().enumerate() {
            let seq = self.next_seq.load(Ordering::Relaxed);
            self.next_seq.store(space.add(seq, 1), Ordering::Relaxed);
            let mut pci = self.pci(PduType::Data, dest_cep);
            pci.set_seq(seq);
            pci.set_fragment(i == 0, i + 1 == count);
            if send.drf {
                pci.set_drf(true);
                send.drf = false;
            }
            let pdu = Pdu::new(pci, payload);
            let open = send.closed_window.is_empty()
                && dtcp.as_ref().map_or(true, |dtcp| dtcp.window_open(seq));
            if open {
                self.transmit(dtcp.as_deref_mut(), pdu, now)?;
            } else {
                trace!("cep {} queue {}", self.cep_id(), seq);
                add(&self.stats.queued, 1);
                send.closed_window.push_back(pdu);
            }
        }
        send.last_tx = now;
        add(&self.stats.tx_sdus, 1);
        Ok(())
    }

    fn transmit(&self, dtcp: Option<&mut Dtcp>, pdu: Pdu, now: Instant) -> Result<(), SinkError> {
        if let Some(dtcp) = dtcp {
            dtcp.on_sent(&pdu, now);
        }
        let seq = pdu.seq();
        match self.rmt.send_pdu(pdu) {
            Ok(()) => {
                trace!("cep {} sent {}", self.cep_id(), seq);
                add(&self.stats.tx_pdus, 1);
                Ok(())
            }
            Err(err) => {
                warn!("cep {} failed to send {}: {}", self.cep_id(), seq, err);
                add(&self.stats.sink_errors, 1);
                Err(err)
            }
        }
    }

    fn retransmit(&self, pdu: Pdu) {
        let seq = pdu.seq();
        match self.rmt.send_pdu(pdu) {
            Ok(()) => {
                trace!("cep {} retransmitted {}", self.cep_id(), seq);
                add(&self.stats.retransmitted, 1);
            }
            Err(err) => {
                debug!("cep {} failed to retransmit {}: {}", self.cep_id(), seq, err);
                add(&self.stats.sink_errors, 1);
            }
        }
    }

    fn control_pdu(&self, dtcp: &mut Dtcp, msg: ControlMsg) -> Option<Pdu> {
        let dest_cep = self.dest_cep.load()?;
        let mut pci = self.pci(msg.pdu_type(), dest_cep);
        pci.set_seq(dtcp.next_ctrl_seq());
        Some(Pdu::new(pci, msg.encode()))
    }

    fn send_control(&self, pdus: Vec<Pdu>) {
        for pdu in pdus {
            let ty = pdu.pdu_type();
            match self.rmt.send_pdu(pdu) {
                Ok(()) => add(&self.stats.control_tx, 1),
                Err(err) => {
                    debug!("cep {} failed to send {:?}: {}", self.cep_id(), ty, err);
                    add(&self.stats.sink_errors, 1);
                }
            }
        }
    }

    /// Sends queued PDUs while the window is open.
    fn drain(&self, send: &mut SendState, dtcp: &mut Dtcp, now: Instant) -> usize {
        let mut drained = 0;
        while let Some(seq) = send.closed_window.front().map(Pdu::seq) {
            if !dtcp.window_open(seq) {
                break;
            }
            let pdu = match send.closed_window.pop_front() {
                Some(pdu) => pdu,
                None => break,
            };
            drained += 1;
            if self.transmit(Some(&mut *dtcp), pdu, now).is_err() {
                break;
            }
        }
        drained
    }

    /// Sends PDUs from the closed window queue after DTCP opened the
    /// window. Returns the number of PDUs sent.
    pub fn rcv_flow_ctl(&self) -> usize {
        let dtcp = match self.dtcp.as_ref() {
            Some(dtcp) => dtcp,
            None => return 0,
        };
        let drained = {
            let mut send = self.send.lock().unwrap();
            let mut dtcp = dtcp.lock().unwrap();
            let drained = self.drain(&mut send, &mut dtcp, Instant::now());
            if send.closed_window.is_empty() && dtcp.is_quiescent() {
                self.drained.notify_all();
            }
            drained
        };
        if drained > 0 {
            self.notify_writable();
        }
        drained
    }

    /// Processes a PDU addressed to this instance.
    pub fn receive(&self, pdu: Pdu) -> Result<(), DtpError> {
        let got = pdu.pci().dest_cep();
        if got != self.cep_id() {
            return Err(DtpError::WrongCep {
                expected: self.cep_id(),
                got,
            });
        }
        let state = self.state.load();
        if state == DtpState::Closed {
            return Err(DtpError::NotActive(state));
        }
        match pdu.pdu_type() {
            PduType::Data => {
                self.data_receive(pdu, Instant::now());
                Ok(())
            }
            ty if ty.is_control() => self.control_receive(pdu),
            ty => Err(DtpError::Unexpected(ty)),
        }
    }

    /// Records a PDU dropped because the receive queue was full. Takes no
    /// lock, the loss reaches DTCP with the next `report_overflow`.
    pub fn overflowed(&self, pdu: &Pdu) {
        add(&self.stats.rx_overflow, 1);
        if pdu.pdu_type() == PduType::Data {
            self.overflow.push(pdu.seq());
        }
    }

    /// Reports the data PDUs dropped by a full receive queue to DTCP.
    /// Returns the number of PDUs reported.
    pub fn report_overflow(&self) -> usize {
        let mut lost = Vec::new();
        while let Some(seq) = self.overflow.pop() {
            lost.push(seq);
        }
        let count = lost.len();
        let dtcp = match self.dtcp.as_ref() {
            Some(dtcp) if count > 0 => dtcp,
            _ => return count,
        };
        let mut control = Vec::new();
        {
            let recv = self.recv.lock().unwrap();
            let mut dtcp = dtcp.lock().unwrap();
            if let Some(msg) = dtcp.report_lost(recv.next_expected(), lost) {
                control.extend(self.control_pdu(&mut dtcp, msg));
            }
        }
        debug!("cep {} reported {} pdus lost on ingress", self.cep_id(), count);
        self.send_control(control);
        count
    }

    /// Number of sequence numbers reported lost on ingress to DTCP.
    pub fn lost_reported(&self) -> u64 {
        self.dtcp
            .as_ref()
            .map_or(0, |dtcp| dtcp.lock().unwrap().lost_reported())
    }

    fn account(&self, d: &Delivery) {
        add(&self.stats.dropped, d.dropped);
        add(&self.stats.lost, d.lost);
        add(&self.stats.discarded, d.discarded);
    }

    fn deliver(&self, recv: &mut RecvState, sdus: Vec<Sdu>) {
        if sdus.is_empty() {
            return;
        }
        match self.user() {
            Some((port, sink)) => {
                for sdu in sdus {
                    add(&self.stats.rx_sdus, 1);
                    sink.deliver(port, sdu);
                }
            }
            None => {
                for sdu in sdus {
                    if recv.undelivered.len() < MAX_UNDELIVERED {
                        recv.undelivered.push_back(sdu);
                    } else {
                        add(&self.stats.dropped, 1);
                    }
                }
            }
        }
    }

    fn data_receive(&self, pdu: Pdu, now: Instant) {
        add(&self.stats.rx_pdus, 1);
        trace!("cep {} received {}", self.cep_id(), pdu.seq());
        let mut control = Vec::new();
        {
            let mut recv = self.recv.lock().unwrap();
            let d = recv.receive(pdu, now);
            self.account(&d);
            let feedback = d.accepted || d.duplicate;
            let Delivery { sdus, missing, .. } = d;
            self.deliver(&mut recv, sdus);
            if let (Some(dtcp), Some(next)) = (self.dtcp.as_ref(), recv.next_expected()) {
                let mut dtcp = dtcp.lock().unwrap();
                let msg = match missing {
                    Some(missing) => Some(dtcp.selective_ack(next, missing)),
                    None if feedback => dtcp.feedback(next),
                    None => None,
                };
                if let Some(msg) = msg {
                    control.extend(self.control_pdu(&mut dtcp, msg));
                }
            }
        }
        self.send_control(control);
    }

    fn control_receive(&self, pdu: Pdu) -> Result<(), DtpError> {
        let dtcp = match self.dtcp.as_ref() {
            Some(dtcp) => dtcp,
            None => return Err(DtpError::Unexpected(pdu.pdu_type())),
        };
        let msg = ControlMsg::decode(pdu.pdu_type(), pdu.payload())?;
        add(&self.stats.control_rx, 1);
        trace!("cep {} control {} {:?}", self.cep_id(), pdu.seq(), msg);
        let now = Instant::now();
        let drained = {
            let mut send = self.send.lock().unwrap();
            let mut dtcp = dtcp.lock().unwrap();
            let outcome = dtcp.control_receive(pdu.seq(), &msg, now);
            if outcome.stale {
                return Ok(());
            }
            for pdu in outcome.retransmit {
                self.retransmit(pdu);
            }
            let drained = if outcome.window_opened {
                self.drain(&mut send, &mut dtcp, now)
            } else {
                0
            };
            if send.closed_window.is_empty() && dtcp.is_quiescent() {
                self.drained.notify_all();
            }
            drained
        };
        if drained > 0 {
            self.notify_writable();
        }
        self.close_if_drained();
        Ok(())
    }

    fn notify_writable(&self) {
        if let Some((port, sink)) = self.user() {
            sink.writable(port);
        }
    }

    fn fail(&self, err: DtpError) -> DtpError {
        warn!("cep {} failed: {}", self.cep_id(), err);
        self.state.store(DtpState::Closed);
        if !self.failed.swap(true, Ordering::SeqCst) {
            if let Some((port, sink)) = self.user() {
                sink.flow_down(port);
            }
        }
        self.drained.notify_all();
        err
    }

    fn close_if_drained(&self) {
        if self.state.load() == DtpState::Draining && self.is_quiescent() {
            self.state.store(DtpState::Closed);
            debug!("cep {} drained", self.cep_id());
        }
    }

    /// Runs the A-timer, the DTCP timers and the inactivity timer.
    ///
    /// An error is unrecoverable: the connection is closed and the user
    /// notified once.
    pub fn on_timer(&self, now: Instant) -> Result<(), DtpError> {
        if self.state.load() == DtpState::Closed {
            return Ok(());
        }

        let mut control = Vec::new();
        {
            let mut recv = self.recv.lock().unwrap();
            let d = recv.expire(now);
            self.account(&d);
            let Delivery { sdus, missing, .. } = d;
            self.deliver(&mut recv, sdus);
            if let (Some(missing), Some(dtcp), Some(next)) =
                (missing, self.dtcp.as_ref(), recv.next_expected())
            {
                let mut dtcp = dtcp.lock().unwrap();
                let msg = dtcp.selective_ack(next, missing);
                control.extend(self.control_pdu(&mut dtcp, msg));
            }
        }
        self.send_control(control);

        if let Some(dtcp) = self.dtcp.as_ref() {
            let result = {
                let mut send = self.send.lock().unwrap();
                let mut dtcp = dtcp.lock().unwrap();
                dtcp.on_timer(now).map(|outcome| {
                    for pdu in outcome.retransmit {
                        self.retransmit(pdu);
                    }
                    if outcome.window_opened {
                        self.drain(&mut send, &mut dtcp, now)
                    } else {
                        0
                    }
                })
            };
            match result {
                Ok(drained) if drained > 0 => self.notify_writable(),
                Ok(_) => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        }

        if self.state.load() == DtpState::Draining {
            let idle = {
                let send = self.send.lock().unwrap();
                now.saturating_duration_since(send.last_tx) >= self.config().sender_inactivity()
            };
            if idle {
                debug!("cep {} inactive while draining", self.cep_id());
                self.state.store(DtpState::Closed);
                self.drained.notify_all();
            } else {
                self.close_if_drained();
            }
        }
        Ok(())
    }

    /// Deadline of the A-timer, if running.
    pub fn a_timer_deadline(&self) -> Option<Instant> {
        self.recv.lock().unwrap().a_deadline()
    }

    fn quiescent(&self, send: &SendState) -> bool {
        send.closed_window.is_empty()
            && self
                .dtcp
                .as_ref()
                .map_or(true, |dtcp| dtcp.lock().unwrap().is_quiescent())
    }

    /// Returns `true` if no PDU is queued or unacknowledged.
    pub fn is_quiescent(&self) -> bool {
        let send = self.send.lock().unwrap();
        self.quiescent(&send)
    }

    /// Stops accepting writes. Queued and unacknowledged PDUs are still
    /// served.
    pub fn close(&self) {
        let draining = self
            .state
            .compare_exchange(DtpState::Active, DtpState::Draining)
            .or_else(|_| {
                self.state
                    .compare_exchange(DtpState::New, DtpState::Draining)
            })
            .is_ok();
        if draining {
            debug!("cep {} draining", self.cep_id());
            self.close_if_drained();
        }
    }

    /// Waits until no PDU is queued or unacknowledged, or the connection
    /// closed. Returns `false` if the timeout elapsed first.
    pub fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut send = self.send.lock().unwrap();
        loop {
            if self.state.load() == DtpState::Closed || self.quiescent(&send) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            send = self.drained.wait_timeout(send, deadline - now).unwrap().0;
        }
    }

    /// Closes the connection, dropping everything queued, unacknowledged
    /// or held for reassembly. Returns the number of buffers released.
    pub fn force_close(&self) -> usize {
        self.state.store(DtpState::Closed);
        let mut released = 0;
        {
            let mut send = self.send.lock().unwrap();
            released += send.closed_window.len();
            send.closed_window.clear();
            if let Some(dtcp) = self.dtcp.as_ref() {
                released += dtcp.lock().unwrap().take_outstanding();
            }
        }
        {
            let mut recv = self.recv.lock().unwrap();
            released += recv.clear();
            released += recv.undelivered.len();
            recv.undelivered.clear();
        }
        self.drained.notify_all();
        debug!("cep {} closed, released {} buffers", self.cep_id(), released);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dtcp::DtcpConfig;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Wire(Mutex<Vec<Pdu>>);

    impl PduSink for Wire {
        fn send_pdu(&self, pdu: Pdu) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    impl Wire {
        fn take(&self) -> Vec<Pdu> {
            std::mem::replace(&mut *self.0.lock().unwrap(), Vec::new())
        }
    }

    #[derive(Default)]
    struct App {
        sdus: Mutex<Vec<Sdu>>,
        writable: AtomicUsize,
        down: AtomicUsize,
    }

    impl SduSink for App {
        fn deliver(&self, _port: PortId, sdu: Sdu) {
            self.sdus.lock().unwrap().push(sdu);
        }

        fn writable(&self, _port: PortId) {
            self.writable.fetch_add(1, Ordering::SeqCst);
        }

        fn flow_down(&self, _port: PortId) {
            self.down.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl App {
        fn received(&self) -> Vec<Sdu> {
            std::mem::replace(&mut *self.sdus.lock().unwrap(), Vec::new())
        }
    }

    fn endpoint(src: CepId, dst: CepId, config: &DtpConfig) -> (Arc<Wire>, Dtp, Arc<App>) {
        let wire = Arc::new(Wire::default());
        let mut conn = Connection::new(src, dst, 0, config.clone()).with_dest_cep(dst);
        conn.source_cep_id = src;
        let dtp = Dtp::new(conn, wire.clone());
        let app = Arc::new(App::default());
        let sink: Arc<dyn SduSink> = app.clone();
        dtp.attach(src, Arc::downgrade(&sink));
        (wire, dtp, app)
    }

    fn deliver_all(pdus: Vec<Pdu>, dtp: &Dtp) {
        for pdu in pdus {
            dtp.receive(pdu).unwrap();
        }
    }

    #[test]
    fn test_unreliable_sdu() {
        let config = DtpConfig::default();
        let (wire, a, _) = endpoint(1, 2, &config);
        let (_, b, app) = endpoint(2, 1, &config);

        let sdu: Vec<u8> = (0..4096).map(|i| i as u8).collect();
        a.write(sdu.clone().into()).unwrap();
        let pdus = wire.take();
        let seqs: Vec<_> = pdus.iter().map(Pdu::seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(pdus[0].pci().drf());
        assert!(pdus[0].pci().first_fragment());
        assert!(pdus[2].pci().last_fragment());
        assert_eq!(pdus[1].pci().src_cep(), 1);
        assert_eq!(pdus[1].pci().dest_cep(), 2);

        deliver_all(pdus, &b);
        let received = app.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_bytes(), &sdu[..]);
        assert_eq!(b.counters().rx_pdus, 3);
    }

    #[test]
    fn test_pdu_too_small() {
        let mut cons = naming::DtCons::default();
        cons.max_pdu_size = 20;
        let (wire, a, _) = endpoint(1, 2, &DtpConfig::from_dt_cons(&cons));
        match a.write(vec![1; 4].into()) {
            Err(DtpError::PduTooSmall(20)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.next_seq(), 0);
        assert!(wire.take().is_empty());
    }

    #[test]
    fn test_window_backpressure() {
        let config = DtpConfig::default()
            .set_closed_window_queue(2)
            .set_dtcp(DtcpConfig::new().set_window(2).no_rtx());
        let (wire, a, app) = endpoint(1, 2, &config);
        for _ in 0..4 {
            a.write("sdu".into()).unwrap();
        }
        assert_eq!(wire.take().len(), 2);
        assert_eq!(a.closed_window_len(), 2);
        match a.write("sdu".into()) {
            Err(DtpError::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.next_seq(), 4);

        // Flow control PDU from the peer opens the window.
        let mut pci = Pci::new(PduType::ControlFlow);
        pci.set_dest_cep(1);
        let msg = ControlMsg::Flow { rwe: 6 };
        a.receive(Pdu::new(pci, msg.encode())).unwrap();
        let seqs: Vec<_> = wire.take().iter().map(Pdu::seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(app.writable.load(Ordering::SeqCst), 1);
        assert_eq!(a.closed_window_len(), 0);
        assert_eq!(a.rcv_flow_ctl(), 0);
        a.write("sdu".into()).unwrap();
        assert_eq!(wire.take()[0].seq(), 4);
    }

    #[test]
    fn test_rate_limited_fragments() {
        let rate = DtcpConfig::new()
            .no_window()
            .no_rtx()
            .set_rate(1, Duration::from_secs(3600));
        let config = DtpConfig::default()
            .set_max_pdu_size(pdu::HEADER_LEN + 4)
            .set_closed_window_queue(2)
            .set_dtcp(rate);
        let (wire, a, _) = endpoint(1, 2, &config);

        // Four fragments, only one fits the rate.
        match a.write(vec![0; 16].into()) {
            Err(DtpError::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.next_seq(), 0);
        assert!(wire.take().is_empty());

        a.write(vec![0; 8].into()).unwrap();
        assert_eq!(wire.take().len(), 1);
        assert_eq!(a.closed_window_len(), 1);
        a.write(vec![0; 4].into()).unwrap();
        assert_eq!(a.closed_window_len(), 2);
        match a.write(vec![0; 4].into()) {
            Err(DtpError::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.closed_window_len() <= 2);
    }

    #[test]
    fn test_receive_queue_overflow() {
        let config = DtpConfig::default().set_dtcp(DtcpConfig::new());
        let (wire_a, a, _) = endpoint(1, 2, &config);
        let (wire_b, b, app) = endpoint(2, 1, &config);
        for i in 0..4u8 {
            a.write(vec![i].into()).unwrap();
        }
        let mut pdus = wire_a.take();
        b.receive(pdus.remove(0)).unwrap();
        b.overflowed(&pdus.remove(1));
        assert_eq!(b.counters().rx_overflow, 1);
        assert_eq!(b.counters().rx_pdus, 1);
        wire_b.take();

        assert_eq!(b.report_overflow(), 1);
        assert_eq!(b.lost_reported(), 1);
        assert_eq!(b.report_overflow(), 0);
        let control = wire_b.take();
        assert_eq!(control.len(), 1);
        match ControlMsg::decode(control[0].pdu_type(), control[0].payload()).unwrap() {
            ControlMsg::SelectiveAck { ack, missing, .. } => {
                assert_eq!(ack, 1);
                assert_eq!(missing, vec![2]);
            }
            other => panic!("unexpected {:?}", other),
        }

        deliver_all(control, &a);
        let resent = wire_a.take();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].seq(), 2);
        deliver_all(pdus, &b);
        deliver_all(resent, &b);
        assert_eq!(app.received().len(), 4);
    }

    #[test]
    fn test_a_timer() {
        let a_timer = Duration::from_millis(50);
        let config = DtpConfig::default().set_a_timer(a_timer);
        let (wire, a, _) = endpoint(1, 2, &config);
        let (_, b, app) = endpoint(2, 1, &config);
        for _ in 0..4 {
            a.write("sdu".into()).unwrap();
        }
        let mut pdus = wire.take();
        pdus.remove(1);
        deliver_all(pdus, &b);
        assert!(app.received().is_empty());
        let deadline = b.a_timer_deadline().unwrap();
        b.on_timer(deadline - a_timer / 2).unwrap();
        assert!(app.received().is_empty());
        b.on_timer(deadline).unwrap();
        assert_eq!(app.received().len(), 1);
        let counters = b.counters();
        assert_eq!(counters.lost, 1);
        assert_eq!(counters.dropped, 2);
    }

    #[test]
    fn test_selective_retransmission() {
        let config = DtpConfig::default().set_dtcp(
            DtcpConfig::new()
                .set_window(16)
                .set_rtx(Duration::from_secs(10)),
        );
        let (wire_a, a, _) = endpoint(1, 2, &config);
        let (wire_b, b, app) = endpoint(2, 1, &config);
        for i in 0..4u8 {
            a.write(vec![i].into()).unwrap();
        }
        let mut pdus = wire_a.take();
        let lost = pdus.remove(1);
        assert_eq!(lost.seq(), 1);
        deliver_all(pdus, &b);
        assert_eq!(app.received().len(), 1);

        // Ack for 0, selective ack for the gap, ack for 3.
        let control = wire_b.take();
        assert!(control
            .iter()
            .any(|pdu| pdu.pdu_type() == PduType::SelectiveAck));
        deliver_all(control, &a);
        let resent = wire_a.take();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].seq(), 1);
        assert_eq!(a.counters().retransmitted, 1);

        deliver_all(resent, &b);
        let received: Vec<_> = app.received().iter().map(|s| s.as_bytes()[0]).collect();
        assert_eq!(received, vec![1, 2, 3]);
        deliver_all(wire_b.take(), &a);
        assert!(a.is_quiescent());
    }

    #[test]
    fn test_reliable_sequence_wrap() {
        let mut cons = naming::DtCons::default();
        cons.seq_num_length = 4;
        let config = DtpConfig::from_dt_cons(&cons)
            .set_initial_seq(0xffff_fffd)
            .set_dtcp(
                DtcpConfig::new()
                    .set_window(4)
                    .set_rtx(Duration::from_secs(10)),
            );
        let (wire_a, a, _) = endpoint(1, 2, &config);
        let (wire_b, b, app) = endpoint(2, 1, &config);
        for i in 0..5u8 {
            a.write(vec![i].into()).unwrap();
        }
        assert_eq!(a.next_seq(), 2);
        assert_eq!(a.closed_window_len(), 1);
        let mut pdus = wire_a.take();
        let seqs: Vec<_> = pdus.iter().map(Pdu::seq).collect();
        assert_eq!(seqs, vec![0xffff_fffd, 0xffff_fffe, 0xffff_ffff, 0]);
        let lost = pdus.remove(2);
        assert_eq!(lost.seq(), 0xffff_ffff);
        deliver_all(pdus, &b);
        assert_eq!(app.received().len(), 2);

        // Acks open the window across the wrap, the selective ack recovers
        // the lost PDU.
        deliver_all(wire_b.take(), &a);
        let resent = wire_a.take();
        let mut seqs: Vec<_> = resent.iter().map(Pdu::seq).collect();
        seqs.sort();
        assert_eq!(seqs, vec![1, 0xffff_ffff]);
        assert_eq!(a.counters().retransmitted, 1);
        assert_eq!(a.closed_window_len(), 0);

        deliver_all(resent, &b);
        let received: Vec<_> = app.received().iter().map(|s| s.as_bytes()[0]).collect();
        assert_eq!(received, vec![2, 3, 4]);
        deliver_all(wire_b.take(), &a);
        assert!(a.is_quiescent());
    }

    #[test]
    fn test_retransmission_limit() {
        let rto = Duration::from_millis(10);
        let config =
            DtpConfig::default().set_dtcp(DtcpConfig::new().set_rtx(rto).set_max_rtx(1));
        let (wire, a, app) = endpoint(1, 2, &config);
        a.write("sdu".into()).unwrap();
        let now = Instant::now();
        a.on_timer(now + rto).unwrap();
        assert_eq!(wire.take().len(), 2);
        assert!(a.on_timer(now + rto * 3).is_err());
        assert!(a.on_timer(now + rto * 4).is_ok());
        assert_eq!(a.state(), DtpState::Closed);
        assert_eq!(app.down.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close() {
        let config = DtpConfig::default().set_dtcp(DtcpConfig::new().set_window(1));
        let (_, a, _) = endpoint(1, 2, &config);
        for _ in 0..3 {
            a.write("sdu".into()).unwrap();
        }
        assert_eq!(a.outstanding(), 1);
        assert_eq!(a.closed_window_len(), 2);
        a.close();
        assert_eq!(a.state(), DtpState::Draining);
        match a.write("sdu".into()) {
            Err(DtpError::NotActive(DtpState::Draining)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(!a.wait_quiescent(Duration::from_millis(10)));
        assert_eq!(a.force_close(), 3);
        assert!(a.wait_quiescent(Duration::from_millis(10)));
    }

    #[test]
    fn test_activation() {
        let wire = Arc::new(Wire::default());
        let mut conn = Connection::new(1, 2, 0, DtpConfig::default());
        conn.source_cep_id = 5;
        let dtp = Dtp::new(conn, wire.clone());
        assert_eq!(dtp.state(), DtpState::New);
        assert!(dtp.write("sdu".into()).is_err());

        let mut pci = Pci::new(PduType::Data);
        pci.set_dest_cep(6);
        match dtp.receive(Pdu::new(pci, Bytes::new())) {
            Err(DtpError::WrongCep { expected: 5, got: 6 }) => {}
            other => panic!("unexpected {:?}", other),
        }

        // Data arriving before the user attached is kept.
        let mut pci = Pci::new(PduType::Data);
        pci.set_dest_cep(5);
        pci.set_drf(true);
        pci.set_fragment(true, true);
        dtp.receive(Pdu::new(pci, Bytes::from_static(b"early"))).unwrap();

        dtp.update_dest_cep(9).unwrap();
        assert_eq!(dtp.state(), DtpState::Active);
        assert_eq!(dtp.connection().dest_cep_id, Some(9));
        dtp.write("sdu".into()).unwrap();
        assert_eq!(wire.take()[0].pci().dest_cep(), 9);

        let app = Arc::new(App::default());
        let sink: Arc<dyn SduSink> = app.clone();
        dtp.attach(3, Arc::downgrade(&sink));
        assert_eq!(dtp.port(), Some(3));
        assert_eq!(app.received()[0].as_bytes(), b"early");
    }
}
