use qpair_harness::command::{DataDirection, SubmissionEntry};
use qpair_harness::completion::{CompletionEntry, Status, CQ_ENTRY_SIZE};
use qpair_harness::{DmaBuffer, Priority};

/// A command slot in a submission ring, with the host memory the driver mapped for it.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub entry: SubmissionEntry,
    pub data: Option<DmaBuffer>,
    pub direction: DataDirection,
}

#[derive(Debug)]
pub(crate) struct SubmissionQueue {
    pub id: u16,
    pub cqid: u16,
    pub size: u16,
    pub priority: Priority,
    slots: Vec<Option<Slot>>,
    /// Device consumer index.
    pub head: u16,
    /// Tail published by the last doorbell write.
    pub tail: u16,
    /// Tail the driver has written entries up to.
    pub shadow_tail: u16,
    next_cid: u16,
}

impl SubmissionQueue {
    pub fn new(id: u16, cqid: u16, size: u16, priority: Priority) -> Self {
        SubmissionQueue {
            id,
            cqid,
            size,
            priority,
            slots: vec![None; usize::from(size)],
            head: 0,
            tail: 0,
            shadow_tail: 0,
            next_cid: 0,
        }
    }

    fn advance(&self, idx: u16) -> u16 {
        (idx + 1) % self.size
    }

    pub fn is_full(&self) -> bool {
        self.advance(self.shadow_tail) == self.head
    }

    /// Writes an entry at the shadow tail, assigning the next command identifier.
    pub fn push(
        &mut self,
        mut entry: SubmissionEntry,
        data: Option<DmaBuffer>,
        direction: DataDirection,
    ) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        entry.cid = cid;
        self.slots[usize::from(self.shadow_tail)] = Some(Slot {
            entry,
            data,
            direction,
        });
        self.shadow_tail = self.advance(self.shadow_tail);
        Some(cid)
    }

    pub fn ring(&mut self) {
        self.tail = self.shadow_tail;
    }

    /// Commands published to the device and not yet fetched.
    pub fn pending(&self) -> u16 {
        (self.tail + self.size - self.head) % self.size
    }

    pub fn pop(&mut self) -> Option<Slot> {
        if self.head == self.tail {
            return None;
        }
        let slot = self.slots[usize::from(self.head)].take();
        self.head = self.advance(self.head);
        slot
    }

    /// Removes a published, not yet fetched command, keeping the ring order of the rest.
    pub fn remove_pending(&mut self, cid: u16) -> Option<Slot> {
        let mut idx = self.head;
        let mut found = None;
        while idx != self.tail {
            let hit = self.slots[usize::from(idx)]
                .as_ref()
                .is_some_and(|s| s.entry.cid == cid);
            if hit {
                found = Some(idx);
                break;
            }
            idx = self.advance(idx);
        }
        let found = found?;
        let slot = self.slots[usize::from(found)].take();
        // Close the gap by shifting the older entries forward one slot.
        let mut idx = found;
        while idx != self.head {
            let prev = (idx + self.size - 1) % self.size;
            self.slots[usize::from(idx)] = self.slots[usize::from(prev)].take();
            idx = prev;
        }
        self.head = self.advance(self.head);
        slot
    }

    /// Drops every published and unpublished command, returning the published ones.
    pub fn drain_all(&mut self) -> Vec<Slot> {
        let mut out = Vec::new();
        while let Some(slot) = self.pop() {
            out.push(slot);
        }
        self.slots.iter_mut().for_each(|s| *s = None);
        self.shadow_tail = self.tail;
        out
    }
}

#[derive(Debug)]
pub(crate) struct CompletionQueue {
    pub id: u16,
    pub size: u16,
    ring: Vec<[u8; CQ_ENTRY_SIZE]>,
    /// Host consumer index, advanced by reaping.
    pub head: u16,
    pub tail: u16,
    pub phase: bool,
    pub irq_vector: Option<u16>,
    /// Interrupts raised since the last reap.
    pub isr_count: u32,
    pub dropped: u32,
}

impl CompletionQueue {
    pub fn new(id: u16, size: u16, irq_vector: Option<u16>) -> Self {
        CompletionQueue {
            id,
            size,
            ring: vec![[0u8; CQ_ENTRY_SIZE]; usize::from(size)],
            head: 0,
            tail: 0,
            phase: true,
            irq_vector,
            isr_count: 0,
            dropped: 0,
        }
    }

    pub fn available(&self) -> u32 {
        u32::from((self.tail + self.size - self.head) % self.size)
    }

    /// Posts a completion with the current phase tag. Returns false if the ring is full.
    pub fn post(
        &mut self,
        sq_id: u16,
        sq_head: u16,
        cid: u16,
        status: Status,
        result: u32,
    ) -> bool {
        let next_tail = (self.tail + 1) % self.size;
        if next_tail == self.head {
            self.dropped += 1;
            tracing::warn!(cq_id = self.id, sq_id, cid, "completion queue full, entry dropped");
            return false;
        }
        let entry = CompletionEntry {
            command_identifier: cid,
            result,
            phase_bit: self.phase,
            sq_head_pointer: sq_head,
            sq_identifier: sq_id,
            status_field: status.to_field(),
        };
        self.ring[usize::from(self.tail)] = entry.encode();
        self.tail = next_tail;
        if self.tail == 0 {
            self.phase = !self.phase;
        }
        if self.irq_vector.is_some() {
            self.isr_count += 1;
        }
        true
    }

    /// Copies up to `max` entries into `buf` and releases them to the device.
    pub fn take(&mut self, max: u32, buf: &mut [u8]) -> u32 {
        let fit = (buf.len() / CQ_ENTRY_SIZE) as u32;
        let n = self.available().min(max).min(fit);
        for i in 0..n as usize {
            buf[i * CQ_ENTRY_SIZE..(i + 1) * CQ_ENTRY_SIZE]
                .copy_from_slice(&self.ring[usize::from(self.head)]);
            self.head = (self.head + 1) % self.size;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpair_harness::decode_completions;

    #[test]
    fn phase_toggles_on_wrap() {
        let mut cq = CompletionQueue::new(1, 2, None);
        let mut buf = [0u8; 16];

        assert!(cq.post(1, 1, 10, Status::SUCCESS, 0));
        // Ring of two holds one entry until the host consumes it.
        assert!(!cq.post(1, 1, 11, Status::SUCCESS, 0));
        assert_eq!(cq.dropped, 1);
        assert_eq!(cq.take(4, &mut buf), 1);
        assert!(decode_completions(&buf)[0].phase_bit);

        assert!(cq.post(1, 0, 12, Status::SUCCESS, 0));
        assert_eq!(cq.take(4, &mut buf), 1);
        let e = decode_completions(&buf)[0];
        assert_eq!(e.command_identifier, 12);
        // Second slot of the first pass still carries phase 1; the wrap happens after it.
        assert!(e.phase_bit);

        assert!(cq.post(1, 1, 13, Status::SUCCESS, 0));
        assert_eq!(cq.take(4, &mut buf), 1);
        assert!(!decode_completions(&buf)[0].phase_bit);
    }

    #[test]
    fn submission_ring_publishes_on_doorbell() {
        let mut sq = SubmissionQueue::new(1, 1, 4, Priority::High);
        for _ in 0..3 {
            assert!(sq
                .push(SubmissionEntry::default(), None, DataDirection::None)
                .is_some());
        }
        assert!(sq.is_full());
        assert_eq!(sq.pending(), 0);
        sq.ring();
        assert_eq!(sq.pending(), 3);

        let removed = sq.remove_pending(1).unwrap();
        assert_eq!(removed.entry.cid, 1);
        assert_eq!(sq.pending(), 2);
        assert_eq!(sq.pop().unwrap().entry.cid, 0);
        assert_eq!(sq.pop().unwrap().entry.cid, 2);
        assert!(sq.pop().is_none());
    }
}
