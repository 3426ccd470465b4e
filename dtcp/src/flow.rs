use pdu::{SeqNum, SeqSpace};
use std::time::{Duration, Instant};

/// Sliding window flow control.
pub struct WindowFlowControl {
    space: SeqSpace,
    /// Number of PDUs the receiver accepts beyond the next expected one.
    credit: u64,
    /// Largest sequence number (exclusive) the receiver accepts.
    send_window_end: SeqNum,
}

impl WindowFlowControl {
    pub fn new(space: SeqSpace, first: SeqNum, credit: u64) -> Self {
        Self {
            space,
            credit,
            send_window_end: space.add(first, credit),
        }
    }

    pub fn window_open(&self, seq: SeqNum) -> bool {
        self.space.lt(seq, self.send_window_end)
    }

    pub fn send_window_end(&self) -> SeqNum {
        self.send_window_end
    }

    /// Moves the right window edge forward, returns `true` if it moved.
    pub fn update(&mut self, rwe: SeqNum) -> bool {
        if self.space.gt(rwe, self.send_window_end) {
            self.send_window_end = rwe;
            return true;
        }
        false
    }

    /// Right window edge advertised by a receiver expecting `next`.
    pub fn receive_window_end(&self, next: SeqNum) -> SeqNum {
        self.space.add(next, self.credit)
    }
}

/// Rate based flow control.
pub struct RateFlowControl {
    /// Number of PDUs that can be sent per time unit.
    sending_rate: u64,
    /// Unit of time over which the rate is computed.
    time_unit: Duration,
    /// Number of sent PDUs in the current time slice.
    pdus_sent_in_time_unit: u64,
    slice_start: Instant,
}

impl RateFlowControl {
    pub fn new(sending_rate: u64, time_unit: Duration, now: Instant) -> Self {
        Self {
            sending_rate,
            time_unit,
            pdus_sent_in_time_unit: 0,
            slice_start: now,
        }
    }

    pub fn window_open(&self) -> bool {
        self.pdus_sent_in_time_unit < self.sending_rate
    }

    /// PDUs that may still be sent in the current time slice.
    pub fn remaining(&self) -> u64 {
        self.sending_rate.saturating_sub(self.pdus_sent_in_time_unit)
    }

    pub fn register_pdu(&mut self) {
        self.pdus_sent_in_time_unit += 1;
    }

    /// Starts a new time slice once the current one elapsed. Returns `true`
    /// if the rate was fulfilled and sending may resume.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.slice_start) < self.time_unit {
            return false;
        }
        let fulfilled = !self.window_open();
        self.pdus_sent_in_time_unit = 0;
        self.slice_start = now;
        fulfilled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window() {
        let mut window = WindowFlowControl::new(SeqSpace::default(), 0, 4);
        assert!(window.window_open(3));
        assert!(!window.window_open(4));
        assert!(!window.update(2));
        assert!(window.update(6));
        assert!(window.window_open(5));
        assert_eq!(window.receive_window_end(10), 14);

        let space = SeqSpace::new(32);
        let mut window = WindowFlowControl::new(space, 0xffff_fffe, 4);
        assert_eq!(window.send_window_end(), 2);
        assert!(window.window_open(0xffff_ffff));
        assert!(window.window_open(1));
        assert!(!window.window_open(2));
        assert!(window.update(3));
    }

    #[test]
    fn test_rate() {
        let now = Instant::now();
        let mut rate = RateFlowControl::new(2, Duration::from_millis(100), now);
        rate.register_pdu();
        assert!(rate.window_open());
        assert_eq!(rate.remaining(), 1);
        rate.register_pdu();
        assert!(!rate.window_open());
        assert_eq!(rate.remaining(), 0);
        assert!(!rate.on_timer(now + Duration::from_millis(50)));
        assert!(rate.on_timer(now + Duration::from_millis(100)));
        assert!(rate.window_open());
    }
}
