use naming::{Address, PortId, QosId};
use std::collections::HashMap;

/// Maps destination addresses to N-1 ports.
///
/// An entry may be specific to a QoS id; lookups fall back to the entry
/// without one.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    entries: HashMap<(Address, Option<QosId>), PortId>,
}

impl ForwardingTable {
    /// Adds or replaces an entry.
    pub fn add(&mut self, dest: Address, qos_id: Option<QosId>, port: PortId) -> Option<PortId> {
        self.entries.insert((dest, qos_id), port)
    }

    /// Removes an entry.
    pub fn remove(&mut self, dest: Address, qos_id: Option<QosId>) -> Option<PortId> {
        self.entries.remove(&(dest, qos_id))
    }

    /// Removes every entry leading to `port`.
    pub fn remove_port(&mut self, port: PortId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, p| *p != port);
        before - self.entries.len()
    }

    /// N-1 port for a destination.
    pub fn lookup(&self, dest: Address, qos_id: QosId) -> Option<PortId> {
        self.entries
            .get(&(dest, Some(qos_id)))
            .or_else(|| self.entries.get(&(dest, None)))
            .copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut table = ForwardingTable::default();
        table.add(5, None, 1);
        table.add(5, Some(2), 2);
        table.add(6, Some(1), 2);
        assert_eq!(table.lookup(5, 0), Some(1));
        assert_eq!(table.lookup(5, 2), Some(2));
        assert_eq!(table.lookup(6, 1), Some(2));
        assert_eq!(table.lookup(6, 0), None);
        assert_eq!(table.lookup(7, 0), None);

        assert_eq!(table.remove_port(2), 2);
        assert_eq!(table.lookup(5, 2), Some(1));
        assert_eq!(table.remove(5, None), Some(1));
        assert!(table.is_empty());
    }
}
