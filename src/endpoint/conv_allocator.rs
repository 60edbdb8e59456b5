use bit_set::BitSet;
use tracing::trace;
use crate::protocol::{conv_for_index, index_of_conv, KCP_MAX_CONV};

/// Hands out conv values for one server socket. A linear scan over a fixed size bit set is
///  plenty for 256 indexes.
pub struct ConvAllocator {
    used: BitSet,
}

impl Default for ConvAllocator {
    fn default() -> Self {
        ConvAllocator::new()
    }
}

impl ConvAllocator {
    pub fn new() -> ConvAllocator {
        let mut used = BitSet::with_capacity(KCP_MAX_CONV);
        // index 0 would produce the bare control flag
        used.insert(0);
        ConvAllocator { used }
    }

    /// The lowest free conv, or None if all are in use
    pub fn allocate(&mut self) -> Option<u32> {
        let index = (1..KCP_MAX_CONV).find(|index| !self.used.contains(*index))?;
        self.used.insert(index);

        let conv = conv_for_index(index);
        trace!("allocated conv {:#x}", conv);
        Some(conv)
    }

    /// Returns a conv to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, conv: u32) -> bool {
        match index_of_conv(conv) {
            Some(index) => {
                let released = self.used.remove(index);
                if released {
                    trace!("released conv {:#x}", conv);
                }
                released
            }
            None => false,
        }
    }

    pub fn is_allocated(&self, conv: u32) -> bool {
        index_of_conv(conv)
            .map(|index| self.used.contains(index))
            .unwrap_or(false)
    }

    pub fn num_allocated(&self) -> usize {
        self.used.len() - 1
    }

    pub fn capacity(&self) -> usize {
        KCP_MAX_CONV - 1
    }
}
