//! Registry of the remote workers and their work-order backpressure state.

use crate::bus::ClientId;
use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone)]
struct ShiftbossEntry {
    client_id: ClientId,
    capacity: usize,
    num_queued: usize,
}

/// Per-worker capacity bookkeeping. Deliberately not synchronized: only the
/// Foreman task touches it, which keeps the hot dispatch path lock-free.
/// Registration is append-only; worker removal and fault detection are out of
/// scope.
#[derive(Debug, Default)]
pub struct ShiftbossDirectory {
    entries: Vec<ShiftbossEntry>,
}

impl ShiftbossDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, returning its assigned index.
    pub fn add_shiftboss(&mut self, client_id: ClientId, capacity: usize) -> usize {
        self.entries.push(ShiftbossEntry {
            client_id,
            capacity,
            num_queued: 0,
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn client_id(&self, index: usize) -> Result<ClientId> {
        self.entries
            .get(index)
            .map(|e| e.client_id)
            .ok_or(SchedulerError::UnknownShiftboss(index))
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.entries.iter().map(|e| e.client_id).collect()
    }

    pub fn capacity(&self, index: usize) -> Result<usize> {
        self.entries
            .get(index)
            .map(|e| e.capacity)
            .ok_or(SchedulerError::UnknownShiftboss(index))
    }

    pub fn num_queued(&self, index: usize) -> Result<usize> {
        self.entries
            .get(index)
            .map(|e| e.num_queued)
            .ok_or(SchedulerError::UnknownShiftboss(index))
    }

    /// The sole backpressure check: queued-count has caught up with capacity.
    pub fn has_reached_capacity(&self, index: usize) -> Result<bool> {
        self.entries
            .get(index)
            .map(|e| e.num_queued >= e.capacity)
            .ok_or(SchedulerError::UnknownShiftboss(index))
    }

    pub fn increment_queued(&mut self, index: usize) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(SchedulerError::UnknownShiftboss(index))?;
        entry.num_queued += 1;
        Ok(())
    }

    pub fn decrement_queued(&mut self, index: usize) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(SchedulerError::UnknownShiftboss(index))?;
        if entry.num_queued == 0 {
            return Err(SchedulerError::QueuedCountUnderflow(index));
        }
        entry.num_queued -= 1;
        Ok(())
    }

    /// Credit a worker with `count` queued work orders at once, as announced
    /// in a rebuild-initiation response.
    pub fn add_queued(&mut self, index: usize, count: usize) -> Result<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(SchedulerError::UnknownShiftboss(index))?;
        entry.num_queued += count;
        Ok(())
    }

    /// True if any worker can take another work order.
    pub fn has_available_capacity(&self) -> bool {
        self.entries.iter().any(|e| e.num_queued < e.capacity)
    }

    /// Index of the least-loaded worker that is still below capacity.
    pub fn least_loaded_below_capacity(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.num_queued < e.capacity)
            .min_by_key(|(_, e)| e.num_queued)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_loaded_skips_full_workers() {
        let mut directory = ShiftbossDirectory::new();
        directory.add_shiftboss(10, 1);
        directory.add_shiftboss(11, 3);

        directory.increment_queued(0).unwrap();
        assert!(directory.has_reached_capacity(0).unwrap());
        assert_eq!(directory.least_loaded_below_capacity(), Some(1));

        directory.increment_queued(1).unwrap();
        directory.increment_queued(1).unwrap();
        directory.increment_queued(1).unwrap();
        assert!(!directory.has_available_capacity());
        assert_eq!(directory.least_loaded_below_capacity(), None);
    }

    #[test]
    fn unknown_index_is_an_error() {
        let mut directory = ShiftbossDirectory::new();
        assert!(matches!(
            directory.decrement_queued(3),
            Err(SchedulerError::UnknownShiftboss(3))
        ));
    }
}
