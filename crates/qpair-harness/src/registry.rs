//! Bookkeeping for the admin queue and every active I/O queue pair.
//!
//! The registry is the harness's own view of what it created on the device. It never blocks a
//! submission to an id it does not know about: sending commands to a deleted queue is one of the
//! behaviours under test, and the driver is the authority that accepts or rejects them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved id of the admin submission/completion queue pair.
pub const ADMIN_QUEUE_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueRole {
    Submission,
    Completion,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRole::Submission => write!(f, "sq"),
            QueueRole::Completion => write!(f, "cq"),
        }
    }
}

/// Submission queue priority (`QPRIO` in the Create I/O SQ command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// The weighted classes serviced after the urgent class, in tie-break order.
    pub const WEIGHTED: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn qprio(self) -> u32 {
        self as u32
    }

    pub fn from_qprio(value: u32) -> Priority {
        match value & 0x3 {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn as_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Urgent => write!(f, "urgent"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Metadata for one registered queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub role: QueueRole,
    pub id: u16,
    /// CQ id for a submission queue; for a completion queue, the first SQ bound to it (if any).
    pub paired_id: Option<u16>,
    /// Number of entries (1-based).
    pub size: u32,
    /// `None` for completion queues.
    pub priority: Option<Priority>,
    pub irq_vector: Option<u16>,
    pub outstanding: u32,
}

impl Queue {
    pub fn submission(id: u16, cq_id: u16, size: u32, priority: Priority) -> Self {
        Queue {
            role: QueueRole::Submission,
            id,
            paired_id: Some(cq_id),
            size,
            priority: Some(priority),
            irq_vector: None,
            outstanding: 0,
        }
    }

    pub fn completion(id: u16, size: u32, irq_vector: Option<u16>) -> Self {
        Queue {
            role: QueueRole::Completion,
            id,
            paired_id: None,
            size,
            priority: None,
            irq_vector,
            outstanding: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePairRegistry {
    sqs: BTreeMap<u16, Queue>,
    cqs: BTreeMap<u16, Queue>,
    max_sq_id: u16,
    max_cq_id: u16,
}

impl QueuePairRegistry {
    /// Creates a registry holding only the admin queue pair.
    pub fn new(admin_depth: u32, max_sq_id: u16, max_cq_id: u16) -> Self {
        let mut sqs = BTreeMap::new();
        let mut cqs = BTreeMap::new();
        let mut admin_sq = Queue::submission(
            ADMIN_QUEUE_ID,
            ADMIN_QUEUE_ID,
            admin_depth,
            Priority::Urgent,
        );
        // Admin commands are arbitrated ahead of every I/O class; no QPRIO applies.
        admin_sq.priority = None;
        let mut admin_cq = Queue::completion(ADMIN_QUEUE_ID, admin_depth, Some(0));
        admin_cq.paired_id = Some(ADMIN_QUEUE_ID);
        sqs.insert(ADMIN_QUEUE_ID, admin_sq);
        cqs.insert(ADMIN_QUEUE_ID, admin_cq);
        QueuePairRegistry {
            sqs,
            cqs,
            max_sq_id,
            max_cq_id,
        }
    }

    pub fn max_sq_id(&self) -> u16 {
        self.max_sq_id
    }

    pub fn max_cq_id(&self) -> u16 {
        self.max_cq_id
    }

    fn map(&self, role: QueueRole) -> &BTreeMap<u16, Queue> {
        match role {
            QueueRole::Submission => &self.sqs,
            QueueRole::Completion => &self.cqs,
        }
    }

    fn map_mut(&mut self, role: QueueRole) -> &mut BTreeMap<u16, Queue> {
        match role {
            QueueRole::Submission => &mut self.sqs,
            QueueRole::Completion => &mut self.cqs,
        }
    }

    pub fn register_queue(&mut self, queue: Queue) -> Result<()> {
        let role = queue.role;
        let id = queue.id;
        if self.map(role).contains_key(&id) {
            return Err(Error::DuplicateQueueId { role, id });
        }
        if role == QueueRole::Submission {
            if let Some(cq) = queue.paired_id.and_then(|cq_id| self.cqs.get_mut(&cq_id)) {
                cq.paired_id.get_or_insert(id);
            }
        }
        tracing::debug!(
            %role,
            id,
            size = queue.size,
            priority = ?queue.priority,
            "queue registered"
        );
        self.map_mut(role).insert(id, queue);
        Ok(())
    }

    pub fn unregister_queue(&mut self, role: QueueRole, id: u16) -> Result<Queue> {
        let queue = self
            .map_mut(role)
            .remove(&id)
            .ok_or(Error::UnknownQueueId { role, id })?;
        if queue.outstanding != 0 {
            tracing::warn!(
                %role,
                id,
                outstanding = queue.outstanding,
                "queue unregistered with commands outstanding"
            );
        }
        Ok(queue)
    }

    pub fn lookup(&self, role: QueueRole, id: u16) -> Option<&Queue> {
        self.map(role).get(&id)
    }

    pub fn get(&self, role: QueueRole, id: u16) -> Result<&Queue> {
        self.lookup(role, id).ok_or(Error::UnknownQueueId { role, id })
    }

    /// Registered priority of the submission queue that produced a completion.
    pub fn sq_priority(&self, sq_id: u16) -> Option<Priority> {
        self.sqs.get(&sq_id).and_then(|sq| sq.priority)
    }

    pub fn note_submitted(&mut self, sq_id: u16) {
        if let Some(sq) = self.sqs.get_mut(&sq_id) {
            sq.outstanding = sq.outstanding.saturating_add(1);
        }
    }

    pub fn note_completed(&mut self, sq_id: u16) {
        if let Some(sq) = self.sqs.get_mut(&sq_id) {
            sq.outstanding = sq.outstanding.saturating_sub(1);
        }
    }

    /// Ids of registered I/O completion queues, ascending (the round-robin scan order).
    pub fn active_io_cq_ids(&self) -> Vec<u16> {
        self.cqs
            .keys()
            .copied()
            .filter(|&id| id != ADMIN_QUEUE_ID)
            .collect()
    }

    pub fn io_submission_queues(&self) -> impl Iterator<Item = &Queue> {
        self.sqs.values().filter(|sq| sq.id != ADMIN_QUEUE_ID)
    }

    /// Submission queues bound to `cq_id`.
    pub fn sqs_for_cq(&self, cq_id: u16) -> Vec<u16> {
        self.sqs
            .values()
            .filter(|sq| sq.id != ADMIN_QUEUE_ID && sq.paired_id == Some(cq_id))
            .map(|sq| sq.id)
            .collect()
    }
}

impl Default for QueuePairRegistry {
    fn default() -> Self {
        QueuePairRegistry::new(64, 64, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_pair_is_preregistered() {
        let reg = QueuePairRegistry::new(32, 8, 8);
        assert_eq!(reg.get(QueueRole::Submission, 0).unwrap().size, 32);
        assert_eq!(reg.get(QueueRole::Completion, 0).unwrap().irq_vector, Some(0));
        assert!(reg.active_io_cq_ids().is_empty());
    }

    #[test]
    fn sq_and_cq_ids_are_separate_namespaces() {
        let mut reg = QueuePairRegistry::default();
        reg.register_queue(Queue::completion(1, 64, Some(1))).unwrap();
        reg.register_queue(Queue::submission(1, 1, 64, Priority::High))
            .unwrap();

        let err = reg
            .register_queue(Queue::submission(1, 1, 64, Priority::Low))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateQueueId {
                role: QueueRole::Submission,
                id: 1
            }
        ));
        assert_eq!(reg.lookup(QueueRole::Completion, 1).unwrap().paired_id, Some(1));
        assert_eq!(reg.sqs_for_cq(1), vec![1]);
    }

    #[test]
    fn unregistered_ids_fail_lookup() {
        let mut reg = QueuePairRegistry::default();
        reg.register_queue(Queue::completion(3, 16, None)).unwrap();
        reg.register_queue(Queue::submission(3, 3, 16, Priority::Medium))
            .unwrap();

        reg.unregister_queue(QueueRole::Submission, 3).unwrap();
        reg.unregister_queue(QueueRole::Completion, 3).unwrap();

        for role in [QueueRole::Submission, QueueRole::Completion] {
            assert!(reg.lookup(role, 3).is_none());
            assert!(matches!(
                reg.get(role, 3),
                Err(Error::UnknownQueueId { id: 3, .. })
            ));
            assert!(matches!(
                reg.unregister_queue(role, 3),
                Err(Error::UnknownQueueId { id: 3, .. })
            ));
        }
    }

    #[test]
    fn outstanding_counts_track_submissions() {
        let mut reg = QueuePairRegistry::default();
        reg.register_queue(Queue::completion(2, 16, None)).unwrap();
        reg.register_queue(Queue::submission(2, 2, 16, Priority::Urgent))
            .unwrap();

        reg.note_submitted(2);
        reg.note_submitted(2);
        reg.note_completed(2);
        // Unknown ids are ignored rather than rejected.
        reg.note_submitted(9);

        assert_eq!(reg.get(QueueRole::Submission, 2).unwrap().outstanding, 1);
        assert_eq!(reg.sq_priority(2), Some(Priority::Urgent));
        assert_eq!(reg.sq_priority(9), None);
    }

    #[test]
    fn qprio_round_trips_through_cdw11_encoding() {
        for prio in [
            Priority::Urgent,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ] {
            assert_eq!(Priority::from_qprio(prio.qprio()), prio);
        }
    }
}
