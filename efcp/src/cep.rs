use naming::CepId;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Hands out CEP-ids.
///
/// Ids are drawn from a counter that wraps from `max` back to `1`. A
/// released id is not handed out again before the guard interval passed.
#[derive(Debug)]
pub struct CepIdAllocator {
    next: CepId,
    max: CepId,
    guard: Duration,
    in_use: HashSet<CepId>,
    quarantine: HashMap<CepId, Instant>,
}

impl CepIdAllocator {
    /// Creates an allocator for the ids `1..=max`.
    pub fn new(max: CepId, guard: Duration) -> Self {
        assert!(max > 0);
        Self {
            next: 1,
            max,
            guard,
            in_use: HashSet::new(),
            quarantine: HashMap::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        let guard = self.guard;
        self.quarantine
            .retain(|_, released| now.saturating_duration_since(*released) < guard);
    }

    /// Allocates an id. Returns `None` if every id is in use or quarantined.
    pub fn allocate(&mut self, now: Instant) -> Option<CepId> {
        self.expire(now);
        // One of the next `taken + 1` candidates is free unless all are taken.
        let taken = self.in_use.len() + self.quarantine.len();
        if taken >= self.max as usize {
            return None;
        }
        for _ in 0..=taken {
            let id = self.next;
            self.next = if self.next == self.max { 1 } else { self.next + 1 };
            if !self.in_use.contains(&id) && !self.quarantine.contains_key(&id) {
                self.in_use.insert(id);
                return Some(id);
            }
        }
        None
    }

    /// Releases an id into quarantine.
    pub fn release(&mut self, id: CepId, now: Instant) {
        if self.in_use.remove(&id) {
            self.quarantine.insert(id, now);
        }
    }

    /// Returns `true` if the id was released less than the guard interval
    /// ago.
    pub fn is_quarantined(&self, id: CepId, now: Instant) -> bool {
        match self.quarantine.get(&id) {
            Some(released) => now.saturating_duration_since(*released) < self.guard,
            None => false,
        }
    }

    /// Number of ids in use.
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let now = Instant::now();
        let mut ceps = CepIdAllocator::new(100, Duration::from_secs(1));
        let ids: Vec<_> = (0..3).map(|_| ceps.allocate(now).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        ceps.release(2, now);
        assert_eq!(ceps.allocate(now), Some(4));
        assert_eq!(ceps.in_use(), 3);
    }

    #[test]
    fn test_guard_interval() {
        let guard = Duration::from_secs(4);
        let now = Instant::now();
        let mut ceps = CepIdAllocator::new(3, guard);
        for id in 1..=3 {
            assert_eq!(ceps.allocate(now), Some(id));
        }
        assert_eq!(ceps.allocate(now), None);

        ceps.release(2, now);
        assert!(ceps.is_quarantined(2, now + guard / 2));
        assert_eq!(ceps.allocate(now + guard / 2), None);
        assert!(!ceps.is_quarantined(2, now + guard));
        assert_eq!(ceps.allocate(now + guard), Some(2));
    }

    #[test]
    fn test_wrap() {
        let now = Instant::now();
        let mut ceps = CepIdAllocator::new(2, Duration::from_millis(0));
        assert_eq!(ceps.allocate(now), Some(1));
        assert_eq!(ceps.allocate(now), Some(2));
        ceps.release(1, now);
        ceps.release(2, now);
        assert_eq!(ceps.allocate(now), Some(1));
        assert_eq!(ceps.allocate(now), Some(2));
    }
}
