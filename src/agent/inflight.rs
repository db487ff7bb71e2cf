//! Commands awaiting a broker acknowledgement, keyed by packet identifier

use super::command::{Command, CommandKind};

/// In-flight table plus the packet-identifier counter.
///
/// Identifiers in the table are unique and never zero. Entries keep
/// insertion order so retransmission after a reconnect preserves the
/// original send order.
#[derive(Debug)]
pub struct InFlightTable {
    entries: Vec<Command>,
    capacity: usize,
    last_packet_id: u16,
}

impl InFlightTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            last_packet_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.iter().any(|c| c.packet_id == packet_id)
    }

    /// Next free identifier: increment, skip zero on wrap, step past
    /// identifiers still in flight. `None` only when every identifier is taken.
    pub fn allocate_packet_id(&mut self) -> Option<u16> {
        let mut candidate = self.last_packet_id;
        for _ in 0..u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !self.contains(candidate) {
                self.last_packet_id = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Record a command that already carries its packet identifier.
    ///
    /// Hands the command back if its identifier is zero or already in use.
    pub fn insert(&mut self, command: Command) -> Result<(), Command> {
        if command.packet_id == 0 || self.contains(command.packet_id) {
            return Err(command);
        }
        self.entries.push(command);
        Ok(())
    }

    /// Remove the entry for `packet_id` if it is of the expected kind.
    pub fn take(&mut self, packet_id: u16, kind: CommandKind) -> Option<Command> {
        let index = self
            .entries
            .iter()
            .position(|c| c.packet_id == packet_id && c.kind == kind)?;
        Some(self.entries.remove(index))
    }

    /// Drop agent-internal entries of `kind`. They carry no completion and
    /// hold no pool record. Returns how many were dropped.
    pub fn discard_internal(&mut self, kind: CommandKind) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|c| !(c.kind == kind && c.pool_id().is_none()));
        before - self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.entries.get(index)
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.entries.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::command::CommandPayload;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn command_with_id(kind: CommandKind, packet_id: u16) -> Command {
        let mut command = Command::unpooled(kind, CommandPayload::Empty);
        command.packet_id = packet_id;
        command
    }

    #[test]
    fn test_allocation_starts_at_one_and_increments() {
        let mut table = InFlightTable::new(4);
        assert_eq!(table.allocate_packet_id(), Some(1));
        assert_eq!(table.allocate_packet_id(), Some(2));
    }

    #[test]
    fn test_allocation_wraps_and_skips_zero() {
        let mut table = InFlightTable::new(4);
        table.last_packet_id = u16::MAX - 1;
        assert_eq!(table.allocate_packet_id(), Some(u16::MAX));
        assert_eq!(table.allocate_packet_id(), Some(1));
    }

    #[test]
    fn test_allocation_skips_in_flight_ids() {
        let mut table = InFlightTable::new(4);
        table
            .insert(command_with_id(CommandKind::Publish, 1))
            .unwrap();
        table
            .insert(command_with_id(CommandKind::Publish, 2))
            .unwrap();
        assert_eq!(table.allocate_packet_id(), Some(3));
    }

    #[test]
    fn test_insert_rejects_zero_and_duplicates() {
        let mut table = InFlightTable::new(4);
        assert!(table.insert(command_with_id(CommandKind::Publish, 0)).is_err());
        table
            .insert(command_with_id(CommandKind::Publish, 5))
            .unwrap();
        assert!(table
            .insert(command_with_id(CommandKind::Subscribe, 5))
            .is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_requires_matching_kind() {
        let mut table = InFlightTable::new(4);
        table
            .insert(command_with_id(CommandKind::Subscribe, 9))
            .unwrap();

        assert!(table.take(9, CommandKind::Publish).is_none());
        assert!(table.take(10, CommandKind::Subscribe).is_none());
        let taken = table.take(9, CommandKind::Subscribe).unwrap();

        assert_eq!(taken.packet_id(), 9);
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_preserves_insertion_order() {
        let mut table = InFlightTable::new(4);
        for id in [7, 3, 5] {
            table
                .insert(command_with_id(CommandKind::Publish, id))
                .unwrap();
        }
        let order: Vec<u16> = table.drain().map(|c| c.packet_id()).collect();
        assert_eq!(order, vec![7, 3, 5]);
    }

    #[test]
    fn test_discard_internal_keeps_pooled_commands() {
        // Arrange
        let mut table = InFlightTable::new(4);
        table
            .insert(command_with_id(CommandKind::Subscribe, 1))
            .unwrap();
        let mut pooled = Command::pooled(3);
        pooled.kind = CommandKind::Subscribe;
        pooled.packet_id = 2;
        table.insert(pooled).unwrap();
        table
            .insert(command_with_id(CommandKind::Publish, 3))
            .unwrap();

        // Act
        let dropped = table.discard_internal(CommandKind::Subscribe);

        // Assert
        assert_eq!(dropped, 1);
        let remaining: Vec<u16> = table.drain().map(|c| c.packet_id()).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    proptest! {
        #[test]
        fn allocated_ids_are_unique_and_non_zero(
            start in any::<u16>(),
            ops in prop::collection::vec(any::<bool>(), 1..200),
        ) {
            let mut table = InFlightTable::new(16);
            table.last_packet_id = start;
            for allocate in ops {
                if allocate && !table.is_full() {
                    let id = table.allocate_packet_id().unwrap();
                    prop_assert_ne!(id, 0);
                    prop_assert!(table.insert(command_with_id(CommandKind::Publish, id)).is_ok());
                } else if let Some(first) = table.get(0).map(|c| c.packet_id()) {
                    table.take(first, CommandKind::Publish);
                }
                let ids: HashSet<u16> = table.entries.iter().map(|c| c.packet_id()).collect();
                prop_assert_eq!(ids.len(), table.len());
            }
        }
    }
}
