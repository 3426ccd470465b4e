use dtcp::DtcpConfig;
use log::debug;
use naming::{ConfigError, DifConfig, DtCons, FlowSpec};
use pdu::{SeqNum, SeqSpace, HEADER_LEN};
use std::time::Duration;

/// Policies of a connection.
#[derive(Clone, Debug)]
pub struct DtpConfig {
    /// Largest PDU including the PCI.
    max_pdu_size: usize,
    /// Largest SDU accepted for writing.
    max_sdu_size: usize,
    /// Largest distance above the next expected sequence number that is
    /// accepted out of order.
    max_gap: u64,
    /// Time received PDUs are held before being delivered. Zero delivers
    /// in order PDUs immediately and tolerates no reordering unless PDUs are
    /// retransmitted.
    a_timer: Duration,
    /// Number of PDUs that may wait for the send window to open.
    max_closed_window_queue: usize,
    /// Sequence number space.
    seq_space: SeqSpace,
    /// Sequence number of the first data PDU sent.
    initial_seq: SeqNum,
    /// Maximum PDU lifetime.
    mpl: Duration,
    /// Time a closing connection waits for its PDUs to be acknowledged.
    drain_timeout: Duration,
    /// DTCP policies, DTCP is absent if `None`.
    dtcp: Option<DtcpConfig>,
}

impl Default for DtpConfig {
    fn default() -> Self {
        Self::from_dt_cons(&DtCons::default())
    }
}

impl DtpConfig {
    /// Creates a best effort configuration from the data transfer constants.
    pub fn from_dt_cons(cons: &DtCons) -> Self {
        Self {
            max_pdu_size: cons.max_pdu_size as usize,
            max_sdu_size: cons.max_sdu_size as usize,
            max_gap: 16,
            a_timer: Duration::from_millis(0),
            max_closed_window_queue: 64,
            seq_space: SeqSpace::new(cons.seq_num_bits()),
            initial_seq: 0,
            mpl: cons.max_pdu_lifetime,
            drain_timeout: Duration::from_secs(1),
            dtcp: None,
        }
    }

    /// Derives the policies of a flow.
    ///
    /// A flow that tolerates no gap gets DTCP with retransmission control.
    pub fn from_flow_spec(cons: &DtCons, spec: &FlowSpec) -> Self {
        let mut config = Self::from_dt_cons(cons);
        if spec.max_sdu_size > 0 {
            config.max_sdu_size = config.max_sdu_size.min(spec.max_sdu_size as usize);
        }
        if spec.is_reliable() {
            config.dtcp = Some(DtcpConfig::new());
        } else if spec.max_allowable_gap > 0 {
            config.max_gap = spec.max_allowable_gap as u64;
        }
        config
    }

    /// Overrides policies from the DIF configuration.
    pub fn apply(&mut self, dif: &DifConfig) -> Result<(), ConfigError> {
        if let Some(max_gap) = dif.parse("dtp.max-gap")? {
            self.max_gap = max_gap;
        }
        if let Some(ms) = dif.parse("dtp.a-timer-ms")? {
            self.a_timer = Duration::from_millis(ms);
        }
        if let Some(len) = dif.parse("dtp.closed-window-queue")? {
            self.max_closed_window_queue = len;
        }
        if let Some(size) = dif.parse::<usize>("dtp.max-sdu-size")? {
            self.max_sdu_size = self.max_sdu_size.min(size);
        }
        if let Some(ms) = dif.parse("dtp.drain-timeout-ms")? {
            self.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(seq) = dif.parse("dtp.initial-seq")? {
            self.initial_seq = self.seq_space.wrap(seq);
        }
        if let Some(mut dtcp) = self.dtcp.take() {
            if let Some(credit) = dif.parse::<u64>("dtcp.window-credit")? {
                dtcp = if credit == 0 {
                    dtcp.no_window()
                } else {
                    dtcp.set_window(credit)
                };
            }
            if let Some(ms) = dif.parse("dtcp.rto-ms")? {
                dtcp = dtcp.set_rtx(Duration::from_millis(ms));
            }
            if let Some(max_rtx) = dif.parse("dtcp.max-rtx")? {
                dtcp = dtcp.set_max_rtx(max_rtx);
            }
            if let Some(pdus) = dif.parse::<u64>("dtcp.rate-pdus")? {
                let ms = dif.parse("dtcp.rate-period-ms")?.unwrap_or(1000);
                if pdus > 0 {
                    dtcp = dtcp.set_rate(pdus, Duration::from_millis(ms));
                }
            }
            self.dtcp = Some(dtcp);
        }
        debug!("connection policies {:?}", self);
        Ok(())
    }

    /// Largest PDU including the PCI.
    pub fn set_max_pdu_size(mut self, size: usize) -> Self {
        assert!(size > HEADER_LEN);
        self.max_pdu_size = size;
        self
    }

    /// Largest SDU accepted for writing.
    pub fn set_max_sdu_size(mut self, size: usize) -> Self {
        self.max_sdu_size = size;
        self
    }

    /// Largest tolerated gap.
    pub fn set_max_gap(mut self, max_gap: u64) -> Self {
        self.max_gap = max_gap;
        self
    }

    /// Time received PDUs are held before delivery.
    pub fn set_a_timer(mut self, a_timer: Duration) -> Self {
        self.a_timer = a_timer;
        self
    }

    /// Number of PDUs that may wait for the send window.
    pub fn set_closed_window_queue(mut self, len: usize) -> Self {
        self.max_closed_window_queue = len;
        self
    }

    /// Sequence number of the first data PDU, reduced into the sequence
    /// number space.
    pub fn set_initial_seq(mut self, seq: SeqNum) -> Self {
        self.initial_seq = self.seq_space.wrap(seq);
        self
    }

    /// Time a closing connection waits for acknowledgements.
    pub fn set_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Enables DTCP.
    pub fn set_dtcp(mut self, dtcp: DtcpConfig) -> Self {
        self.dtcp = Some(dtcp);
        self
    }

    /// Disables DTCP.
    pub fn no_dtcp(mut self) -> Self {
        self.dtcp = None;
        self
    }

    /// Largest PDU including the PCI.
    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }

    /// Largest payload of a single PDU.
    pub fn max_payload(&self) -> usize {
        self.max_pdu_size.saturating_sub(HEADER_LEN)
    }

    /// Largest SDU.
    pub fn max_sdu_size(&self) -> usize {
        self.max_sdu_size
    }

    /// Largest tolerated gap.
    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    /// A-timer.
    pub fn a_timer(&self) -> Duration {
        self.a_timer
    }

    /// Closed window queue length.
    pub fn max_closed_window_queue(&self) -> usize {
        self.max_closed_window_queue
    }

    /// Sequence number space.
    pub fn seq_space(&self) -> SeqSpace {
        self.seq_space
    }

    /// Sequence number of the first data PDU.
    pub fn initial_seq(&self) -> SeqNum {
        self.initial_seq
    }

    /// Maximum PDU lifetime.
    pub fn mpl(&self) -> Duration {
        self.mpl
    }

    /// Drain timeout.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// DTCP policies.
    pub fn dtcp(&self) -> Option<&DtcpConfig> {
        self.dtcp.as_ref()
    }

    /// MPL + R + A, the base of the inactivity timers.
    fn lifetime(&self) -> Duration {
        let r = match self.dtcp.as_ref().and_then(DtcpConfig::rto) {
            Some(rto) => rto * self.dtcp.as_ref().map(DtcpConfig::max_rtx).unwrap_or(0),
            None => Duration::from_millis(0),
        };
        self.mpl + r + self.a_timer
    }

    /// Idle time after which the sender starts a new data run.
    pub fn sender_inactivity(&self) -> Duration {
        self.lifetime() * 2
    }

    /// Idle time after which the receiver forgets the data run.
    pub fn receiver_inactivity(&self) -> Duration {
        self.lifetime() * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flow_spec() {
        let cons = DtCons::default();
        let config = DtpConfig::from_flow_spec(&cons, &FlowSpec::reliable());
        assert!(config.dtcp().unwrap().is_reliable());
        assert_eq!(config.max_payload(), 1500 - HEADER_LEN);

        let mut spec = FlowSpec::default();
        spec.max_allowable_gap = 4;
        spec.max_sdu_size = 1000;
        let config = DtpConfig::from_flow_spec(&cons, &spec);
        assert!(config.dtcp().is_none());
        assert_eq!(config.max_gap(), 4);
        assert_eq!(config.max_sdu_size(), 1000);
    }

    #[test]
    fn test_apply() {
        let dif = DifConfig::default()
            .with("dtp.max-gap", "8")
            .with("dtp.a-timer-ms", "50")
            .with("dtcp.window-credit", "4")
            .with("dtcp.rto-ms", "20")
            .with("dtcp.rate-pdus", "100")
            .with("dtp.initial-seq", "7");
        let mut config = DtpConfig::default().set_dtcp(DtcpConfig::new());
        config.apply(&dif).unwrap();
        assert_eq!(config.max_gap(), 8);
        assert_eq!(config.a_timer(), Duration::from_millis(50));
        assert_eq!(config.initial_seq(), 7);
        let dtcp = config.dtcp().unwrap();
        assert_eq!(dtcp.window(), Some(4));
        assert_eq!(dtcp.rto(), Some(Duration::from_millis(20)));
        assert_eq!(dtcp.rate(), Some((100, Duration::from_millis(1000))));

        let dif = DifConfig::default().with("dtp.max-gap", "many");
        match DtpConfig::default().apply(&dif) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "dtp.max-gap"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inactivity() {
        let config = DtpConfig::default().set_a_timer(Duration::from_secs(1));
        assert_eq!(config.sender_inactivity(), Duration::from_secs(6));
        assert_eq!(config.receiver_inactivity(), Duration::from_secs(9));
    }
}
