//! The contract between the harness and the queue-pair kernel driver.
//!
//! Implemented by the dnvme ioctl backend and by the emulated device. Every method maps onto one
//! driver call; none of them retries or sleeps.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{DataDirection, SQ_ENTRY_SIZE};
use crate::error::DriverError;

/// Result of one bounded drain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStatus {
    /// Entries copied into the caller's buffer.
    pub reaped: u32,
    /// Entries still waiting in the CQ after this call.
    pub remaining: u32,
    /// Interrupts observed on the CQ's vector since the previous call.
    pub isr_count: u32,
}

/// Host memory attached to a command for the lifetime of the command.
///
/// The backing allocation is fixed at construction so its address stays stable while the device
/// owns it. Clones share the same memory.
#[derive(Debug, Clone, Default)]
pub struct DmaBuffer(Arc<Mutex<Vec<u8>>>);

impl DmaBuffer {
    pub fn zeroed(len: usize) -> Self {
        DmaBuffer(Arc::new(Mutex::new(vec![0u8; len])))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        DmaBuffer(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Locks the buffer for direct access. The slice length never changes.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panic while holding the lock leaves plain bytes behind; keep using them.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub trait QueuePairDriver {
    /// Allocates ring memory for an I/O submission queue ahead of the Create I/O SQ command.
    fn prepare_sq(
        &mut self,
        sq_id: u16,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
    ) -> Result<(), DriverError>;

    /// Allocates ring memory for an I/O completion queue ahead of the Create I/O CQ command.
    fn prepare_cq(
        &mut self,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
        irq_vector: Option<u16>,
    ) -> Result<(), DriverError>;

    /// Writes one raw entry into `sq_id` and returns the command identifier the driver assigned.
    /// Does not ring the doorbell.
    fn submit_command(
        &mut self,
        sq_id: u16,
        entry: &[u8; SQ_ENTRY_SIZE],
        data: Option<&DmaBuffer>,
        direction: DataDirection,
    ) -> Result<u16, DriverError>;

    fn ring_doorbell(&mut self, sq_id: u16) -> Result<(), DriverError>;

    /// Copies at most `requested` 16-byte completion records from `cq_id` into `buf`.
    fn reap(&mut self, cq_id: u16, requested: u32, buf: &mut [u8])
        -> Result<ReapStatus, DriverError>;

    /// Number of completions currently ready on `cq_id`.
    fn inquiry(&mut self, cq_id: u16) -> Result<u32, DriverError>;

    fn read_register(&mut self, offset: u32) -> Result<u32, DriverError>;

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), DriverError>;
}

impl<D: QueuePairDriver + ?Sized> QueuePairDriver for &mut D {
    fn prepare_sq(
        &mut self,
        sq_id: u16,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
    ) -> Result<(), DriverError> {
        (**self).prepare_sq(sq_id, cq_id, elements, contiguous)
    }

    fn prepare_cq(
        &mut self,
        cq_id: u16,
        elements: u32,
        contiguous: bool,
        irq_vector: Option<u16>,
    ) -> Result<(), DriverError> {
        (**self).prepare_cq(cq_id, elements, contiguous, irq_vector)
    }

    fn submit_command(
        &mut self,
        sq_id: u16,
        entry: &[u8; SQ_ENTRY_SIZE],
        data: Option<&DmaBuffer>,
        direction: DataDirection,
    ) -> Result<u16, DriverError> {
        (**self).submit_command(sq_id, entry, data, direction)
    }

    fn ring_doorbell(&mut self, sq_id: u16) -> Result<(), DriverError> {
        (**self).ring_doorbell(sq_id)
    }

    fn reap(
        &mut self,
        cq_id: u16,
        requested: u32,
        buf: &mut [u8],
    ) -> Result<ReapStatus, DriverError> {
        (**self).reap(cq_id, requested, buf)
    }

    fn inquiry(&mut self, cq_id: u16) -> Result<u32, DriverError> {
        (**self).inquiry(cq_id)
    }

    fn read_register(&mut self, offset: u32) -> Result<u32, DriverError> {
        (**self).read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), DriverError> {
        (**self).write_register(offset, value)
    }
}

/// Controller register offsets used by the harness.
pub mod regs {
    pub const CAP: u32 = 0x00;
    pub const CAP_HI: u32 = 0x04;
    pub const VS: u32 = 0x08;
    pub const CC: u32 = 0x14;
    pub const CSTS: u32 = 0x1c;

    /// CAP.AMS bit for Weighted Round Robin with Urgent Priority Class.
    pub const CAP_AMS_WRRU: u32 = 1 << 17;
    pub const CC_AMS_SHIFT: u32 = 11;
    pub const CC_AMS_MASK: u32 = 0x7 << CC_AMS_SHIFT;
    pub const CC_AMS_ROUND_ROBIN: u32 = 0b000;
    pub const CC_AMS_WRRU: u32 = 0b001;
    pub const CC_EN: u32 = 1 << 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_buffer_clones_share_memory() {
        let buf = DmaBuffer::zeroed(8);
        let alias = buf.clone();
        alias.lock()[3] = 0xaa;
        assert_eq!(buf.to_vec()[3], 0xaa);
        assert_eq!(buf.len(), 8);
        assert!(!buf.is_empty());
    }
}
