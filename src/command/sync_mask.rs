//! Global queue indices and masks used to declare dependencies between command buffers.
//!
//! Every queue of the device is assigned a global index `queue_type * MAX_QUEUES_PER_TYPE +
//! queue_index`. A sync mask has one bit per global index.

use crate::device::queue::QueueType;

pub const MAX_QUEUES_PER_TYPE: u32 = 8;

pub const MAX_UNIQUE_QUEUES: u32 = MAX_QUEUES_PER_TYPE * QueueType::COUNT as u32;

static_assertions::const_assert!(MAX_UNIQUE_QUEUES <= u32::BITS);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct SyncMask(u32);

impl SyncMask {
    pub const NONE: SyncMask = SyncMask(0);
    pub const ALL: SyncMask = SyncMask(u32::MAX >> (u32::BITS - MAX_UNIQUE_QUEUES));

    pub const fn from_raw(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn get_raw(&self) -> u32 {
        self.0
    }

    /// Mask with the bit of a single queue set.
    pub fn for_queue(queue_type: QueueType, queue_index: u32) -> Self {
        Self(1u32 << global_queue_idx(queue_type, queue_index))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains_queue(&self, queue_type: QueueType, queue_index: u32) -> bool {
        (self.0 & Self::for_queue(queue_type, queue_index).0) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: SyncMask) -> SyncMask {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: SyncMask) -> SyncMask {
        Self(self.0 & !other.0)
    }

    /// Iterates the (queue type, queue index) pairs referenced by this mask.
    pub fn iter_queues(&self) -> impl Iterator<Item = (QueueType, u32)> + '_ {
        QueueType::ALL.iter().flat_map(move |ty| {
            (0..MAX_QUEUES_PER_TYPE).filter_map(move |idx| {
                if self.contains_queue(*ty, idx) {
                    Some((*ty, idx))
                } else {
                    None
                }
            })
        })
    }
}

/// Returns the global index of a queue.
pub fn global_queue_idx(queue_type: QueueType, queue_index: u32) -> u32 {
    assert!(queue_index < MAX_QUEUES_PER_TYPE, "Queue index {} out of range", queue_index);
    (queue_type as u32) * MAX_QUEUES_PER_TYPE + queue_index
}

/// Inverse of [`global_queue_idx`].
pub fn queue_from_global_idx(global_idx: u32) -> (QueueType, u32) {
    assert!(global_idx < MAX_UNIQUE_QUEUES, "Global queue index {} out of range", global_idx);
    (QueueType::ALL[(global_idx / MAX_QUEUES_PER_TYPE) as usize], global_idx % MAX_QUEUES_PER_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_idx() {
        assert_eq!(global_queue_idx(QueueType::Graphics, 0), 0);
        assert_eq!(global_queue_idx(QueueType::Compute, 1), 9);
        assert_eq!(global_queue_idx(QueueType::Transfer, 7), 23);
        assert_eq!(queue_from_global_idx(9), (QueueType::Compute, 1));
        assert_eq!(queue_from_global_idx(23), (QueueType::Transfer, 7));
    }

    #[test]
    #[should_panic]
    fn test_queue_index_out_of_range() {
        global_queue_idx(QueueType::Graphics, MAX_QUEUES_PER_TYPE);
    }

    #[test]
    fn test_mask() {
        let mask = SyncMask::for_queue(QueueType::Graphics, 0).union(SyncMask::for_queue(QueueType::Transfer, 2));
        assert_eq!(mask.count(), 2);
        assert!(mask.contains_queue(QueueType::Transfer, 2));
        assert!(!mask.contains_queue(QueueType::Compute, 2));

        let queues: Vec<_> = mask.iter_queues().collect();
        assert_eq!(queues, vec![(QueueType::Graphics, 0), (QueueType::Transfer, 2)]);

        let mask = mask.without(SyncMask::for_queue(QueueType::Graphics, 0));
        assert_eq!(mask.count(), 1);
        assert_eq!(SyncMask::ALL.count(), MAX_UNIQUE_QUEUES);
    }
}
