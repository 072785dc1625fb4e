//! Controller state machine behind the emulated driver: queues, registers, command execution.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use qpair_harness::command::{
    opcode, DataDirection, SubmissionEntry, FEATURE_ARBITRATION, SQ_ENTRY_SIZE,
};
use qpair_harness::driver::regs;
use qpair_harness::{
    ArbitrationFeature, DmaBuffer, DriverError, Priority, ReapStatus, Status, ADMIN_QUEUE_ID,
};

use crate::arbiter::{Arbiter, ArbiterMode, Candidates};
use crate::namespace::Namespace;
use crate::queue::{CompletionQueue, Slot, SubmissionQueue};

pub mod errno {
    pub const EIO: i32 = 5;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

const FEATURE_NUMBER_OF_QUEUES: u8 = 0x07;
const FEATURE_INTERRUPT_COALESCING: u8 = 0x08;
const ALL_NAMESPACES: u32 = 0xffff_ffff;
const MAX_RING_ENTRIES: u32 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Largest I/O queue (entries) the controller accepts; reported in CAP.MQES.
    pub max_queue_entries: u32,
    pub max_io_queues: u16,
    pub irq_vectors: u16,
    pub admin_queue_depth: u16,
    pub nsid: u32,
    pub namespace_blocks: u64,
    pub block_size: usize,
    pub wrru_supported: bool,
    /// I/O commands executed per device tick.
    pub commands_per_tick: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            max_queue_entries: 4096,
            max_io_queues: 64,
            irq_vectors: 64,
            admin_queue_depth: 64,
            nsid: 1,
            namespace_blocks: 8192,
            block_size: 512,
            wrru_supported: true,
            commands_per_tick: 1,
        }
    }
}

/// Misbehaviour the emulated device can be told to exhibit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    pub arbiter: ArbiterMode,
    /// Every I/O command fetched from the SQ completes with this status.
    pub inject_status: HashMap<u16, Status>,
    /// Reap calls after this many succeed fail with EIO.
    pub fail_reap_after: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct PreparedSq {
    cq_id: u16,
    elements: u32,
}

#[derive(Debug, Clone, Copy)]
struct PreparedCq {
    elements: u32,
    irq_vector: Option<u16>,
}

#[derive(Debug)]
pub struct SimController {
    config: SimConfig,
    pub(crate) faults: SimFaults,

    cap: u64,
    vs: u32,
    cc: u32,
    csts: u32,

    arbitration: ArbitrationFeature,
    interrupt_coalescing: u32,
    arbiter: Arbiter,

    prepared_sqs: BTreeMap<u16, PreparedSq>,
    prepared_cqs: BTreeMap<u16, PreparedCq>,
    /// Includes the admin queue pair at id 0.
    sqs: BTreeMap<u16, SubmissionQueue>,
    cqs: BTreeMap<u16, CompletionQueue>,

    namespace: Namespace,

    pub(crate) reap_calls: u32,
    pub(crate) ticks: u64,
    pub(crate) elapsed: Duration,
    /// `(sq_id, cid)` of every I/O command in execution order.
    pub(crate) executed: Vec<(u16, u16)>,
}

fn driver_err(op: &'static str, errno: i32, detail: impl Into<String>) -> DriverError {
    DriverError::new(op, errno, detail)
}

fn missing(op: &'static str, kind: &str, id: u16) -> DriverError {
    driver_err(op, errno::EINVAL, format!("{kind} {id} does not exist"))
}

impl SimController {
    pub fn new(mut config: SimConfig) -> Self {
        // Ring indices are u16; keep twice the largest ring within range.
        config.max_queue_entries = config.max_queue_entries.min(MAX_RING_ENTRIES);
        let mqes = u64::from(config.max_queue_entries.saturating_sub(1).min(0xffff));
        let cqr = 1u64 << 16;
        let ams = if config.wrru_supported {
            u64::from(regs::CAP_AMS_WRRU)
        } else {
            0
        };
        let timeout = 0x14u64 << 24;
        let css_nvm = 1u64 << 37;
        let cap = mqes | cqr | ams | timeout | css_nvm;

        let mut sqs = BTreeMap::new();
        let mut cqs = BTreeMap::new();
        let depth = config.admin_queue_depth;
        sqs.insert(
            ADMIN_QUEUE_ID,
            SubmissionQueue::new(ADMIN_QUEUE_ID, ADMIN_QUEUE_ID, depth, Priority::Urgent),
        );
        cqs.insert(
            ADMIN_QUEUE_ID,
            CompletionQueue::new(ADMIN_QUEUE_ID, depth, Some(0)),
        );

        SimController {
            namespace: Namespace::new(config.namespace_blocks, config.block_size),
            config,
            faults: SimFaults::default(),
            cap,
            vs: 0x0001_0400,
            cc: regs::CC_EN,
            csts: 1,
            arbitration: ArbitrationFeature::default(),
            interrupt_coalescing: 0,
            arbiter: Arbiter::default(),
            prepared_sqs: BTreeMap::new(),
            prepared_cqs: BTreeMap::new(),
            sqs,
            cqs,
            reap_calls: 0,
            ticks: 0,
            elapsed: Duration::ZERO,
            executed: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn namespace_block_size(&self) -> usize {
        self.namespace.block_size()
    }

    pub fn read_blocks(&self, slba: u64, nlb: u32) -> Option<Vec<u8>> {
        let mut out = vec![0u8; nlb as usize * self.namespace.block_size()];
        self.namespace.read(slba, nlb, &mut out).ok()?;
        Some(out)
    }

    pub fn io_queue_ids(&self) -> (Vec<u16>, Vec<u16>) {
        let io = |id: &u16| *id != ADMIN_QUEUE_ID;
        (
            self.sqs.keys().copied().filter(io).collect(),
            self.cqs.keys().copied().filter(io).collect(),
        )
    }

    fn ams(&self) -> u32 {
        (self.cc & regs::CC_AMS_MASK) >> regs::CC_AMS_SHIFT
    }

    fn check_queue_shape(
        &self,
        op: &'static str,
        qid: u16,
        elements: u32,
    ) -> Result<(), DriverError> {
        if qid == ADMIN_QUEUE_ID {
            return Err(driver_err(op, errno::EINVAL, "queue id 0 is the admin queue"));
        }
        if elements < 2 || elements > self.config.max_queue_entries {
            return Err(driver_err(
                op,
                errno::EINVAL,
                format!("{elements} elements outside 2..={}", self.config.max_queue_entries),
            ));
        }
        Ok(())
    }

    pub fn prepare_sq(&mut self, sq_id: u16, cq_id: u16, elements: u32) -> Result<(), DriverError> {
        self.check_queue_shape("prepare_sq", sq_id, elements)?;
        if self.sqs.contains_key(&sq_id) || self.prepared_sqs.contains_key(&sq_id) {
            return Err(driver_err("prepare_sq", errno::EEXIST, format!("sq {sq_id} exists")));
        }
        self.prepared_sqs.insert(sq_id, PreparedSq { cq_id, elements });
        Ok(())
    }

    pub fn prepare_cq(
        &mut self,
        cq_id: u16,
        elements: u32,
        irq_vector: Option<u16>,
    ) -> Result<(), DriverError> {
        self.check_queue_shape("prepare_cq", cq_id, elements)?;
        if self.cqs.contains_key(&cq_id) || self.prepared_cqs.contains_key(&cq_id) {
            return Err(driver_err("prepare_cq", errno::EEXIST, format!("cq {cq_id} exists")));
        }
        self.prepared_cqs.insert(
            cq_id,
            PreparedCq {
                elements,
                irq_vector,
            },
        );
        Ok(())
    }

    pub fn submit(
        &mut self,
        sq_id: u16,
        raw: &[u8; SQ_ENTRY_SIZE],
        data: Option<&DmaBuffer>,
        direction: DataDirection,
    ) -> Result<u16, DriverError> {
        let entry = SubmissionEntry::parse(raw);
        if sq_id == ADMIN_QUEUE_ID {
            self.check_queue_creation(&entry)?;
        }
        let sq = self
            .sqs
            .get_mut(&sq_id)
            .ok_or_else(|| missing("submit", "sq", sq_id))?;
        let cid = sq
            .push(entry, data.cloned(), direction)
            .ok_or_else(|| driver_err("submit", errno::EBUSY, format!("sq {sq_id} is full")))?;
        tracing::trace!(sq_id, cid, opcode = entry.opc, "sim: entry written");
        Ok(cid)
    }

    /// The driver refuses queue creation commands for queues it has no memory for.
    fn check_queue_creation(&self, entry: &SubmissionEntry) -> Result<(), DriverError> {
        let qid = (entry.cdw10 & 0xffff) as u16;
        let elements = (entry.cdw10 >> 16) + 1;
        let prepared = match entry.opc {
            opcode::ADMIN_CREATE_IO_CQ => self.prepared_cqs.get(&qid).map(|p| p.elements),
            opcode::ADMIN_CREATE_IO_SQ => self.prepared_sqs.get(&qid).map(|p| p.elements),
            _ => return Ok(()),
        };
        match prepared {
            None => Err(driver_err(
                "submit",
                errno::EINVAL,
                format!("queue {qid} was not prepared"),
            )),
            Some(n) if n != elements => Err(driver_err(
                "submit",
                errno::EINVAL,
                format!("queue {qid} prepared with {n} elements, command asks for {elements}"),
            )),
            Some(_) => Ok(()),
        }
    }

    pub fn ring_doorbell(&mut self, sq_id: u16) -> Result<(), DriverError> {
        let sq = self
            .sqs
            .get_mut(&sq_id)
            .ok_or_else(|| missing("ring_doorbell", "sq", sq_id))?;
        sq.ring();
        if sq_id == ADMIN_QUEUE_ID {
            self.process_admin();
        }
        Ok(())
    }

    pub fn reap(
        &mut self,
        cq_id: u16,
        requested: u32,
        buf: &mut [u8],
    ) -> Result<ReapStatus, DriverError> {
        self.reap_calls += 1;
        if let Some(limit) = self.faults.fail_reap_after {
            if self.reap_calls > limit {
                return Err(driver_err("reap", errno::EIO, "injected reap failure"));
            }
        }
        let cq = self
            .cqs
            .get_mut(&cq_id)
            .ok_or_else(|| missing("reap", "cq", cq_id))?;
        let reaped = cq.take(requested, buf);
        let isr_count = std::mem::take(&mut cq.isr_count);
        Ok(ReapStatus {
            reaped,
            remaining: cq.available(),
            isr_count,
        })
    }

    pub fn inquiry(&self, cq_id: u16) -> Result<u32, DriverError> {
        self.cqs
            .get(&cq_id)
            .map(CompletionQueue::available)
            .ok_or_else(|| missing("inquiry", "cq", cq_id))
    }

    pub fn read_register(&self, offset: u32) -> Result<u32, DriverError> {
        if offset % 4 != 0 {
            return Err(driver_err("read_register", errno::EINVAL, "unaligned offset"));
        }
        Ok(match offset {
            regs::CAP => self.cap as u32,
            regs::CAP_HI => (self.cap >> 32) as u32,
            regs::VS => self.vs,
            regs::CC => self.cc,
            regs::CSTS => self.csts,
            _ => 0,
        })
    }

    pub fn write_register(&mut self, offset: u32, value: u32) -> Result<(), DriverError> {
        if offset % 4 != 0 {
            return Err(driver_err("write_register", errno::EINVAL, "unaligned offset"));
        }
        if offset != regs::CC {
            tracing::debug!(offset, value, "sim: write to unmodelled register ignored");
            return Ok(());
        }
        let mut value = value;
        if !self.config.wrru_supported {
            value &= !regs::CC_AMS_MASK;
        }
        let was_enabled = self.cc & regs::CC_EN != 0;
        self.cc = value;
        let enabled = value & regs::CC_EN != 0;
        if was_enabled && !enabled {
            self.reset();
        }
        self.csts = u32::from(enabled);
        tracing::debug!(cc = value, ams = self.ams(), "sim: CC written");
        Ok(())
    }

    /// Controller reset: every I/O queue is gone, the admin rings start over.
    fn reset(&mut self) {
        let depth = self.config.admin_queue_depth;
        self.sqs.clear();
        self.cqs.clear();
        self.prepared_sqs.clear();
        self.prepared_cqs.clear();
        self.sqs.insert(
            ADMIN_QUEUE_ID,
            SubmissionQueue::new(ADMIN_QUEUE_ID, ADMIN_QUEUE_ID, depth, Priority::Urgent),
        );
        self.cqs.insert(
            ADMIN_QUEUE_ID,
            CompletionQueue::new(ADMIN_QUEUE_ID, depth, Some(0)),
        );
        self.arbiter.reset();
        tracing::info!("sim: controller reset");
    }

    /// Advances device time: executes up to `commands_per_tick` I/O commands.
    pub fn tick(&mut self, interval: Duration) {
        self.ticks += 1;
        self.elapsed += interval;
        for _ in 0..self.config.commands_per_tick {
            if !self.execute_one_io() {
                break;
            }
        }
    }

    fn post(
        &mut self,
        cq_id: u16,
        sq_id: u16,
        sq_head: u16,
        cid: u16,
        status: Status,
        result: u32,
    ) {
        match self.cqs.get_mut(&cq_id) {
            Some(cq) => {
                cq.post(sq_id, sq_head, cid, status, result);
            }
            None => tracing::warn!(cq_id, sq_id, cid, "sim: completion for missing cq discarded"),
        }
    }

    fn process_admin(&mut self) {
        loop {
            let Some(sq) = self.sqs.get_mut(&ADMIN_QUEUE_ID) else {
                return;
            };
            let Some(slot) = sq.pop() else {
                return;
            };
            let head = sq.head;
            let (status, result) = self.execute_admin(&slot.entry);
            tracing::debug!(
                opcode = slot.entry.opc,
                cid = slot.entry.cid,
                %status,
                result,
                "sim: admin command executed"
            );
            self.post(ADMIN_QUEUE_ID, ADMIN_QUEUE_ID, head, slot.entry.cid, status, result);
        }
    }

    fn execute_admin(&mut self, cmd: &SubmissionEntry) -> (Status, u32) {
        match cmd.opc {
            opcode::ADMIN_CREATE_IO_CQ => (self.cmd_create_io_cq(cmd), 0),
            opcode::ADMIN_CREATE_IO_SQ => (self.cmd_create_io_sq(cmd), 0),
            opcode::ADMIN_DELETE_IO_SQ => (self.cmd_delete_io_sq(cmd), 0),
            opcode::ADMIN_DELETE_IO_CQ => (self.cmd_delete_io_cq(cmd), 0),
            opcode::ADMIN_GET_FEATURES => self.cmd_get_features(cmd),
            opcode::ADMIN_SET_FEATURES => self.cmd_set_features(cmd),
            opcode::ADMIN_ABORT => self.cmd_abort(cmd),
            opcode::ADMIN_KEEP_ALIVE => (Status::SUCCESS, 0),
            _ => (Status::INVALID_OPCODE.with_dnr(), 0),
        }
    }

    fn io_qid_in_range(&self, qid: u16) -> bool {
        qid != ADMIN_QUEUE_ID && qid <= self.config.max_io_queues
    }

    fn cmd_create_io_cq(&mut self, cmd: &SubmissionEntry) -> Status {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let size = (cmd.cdw10 >> 16) + 1;
        let ien = cmd.cdw11 & 0x2 != 0;
        let iv = (cmd.cdw11 >> 16) as u16;

        if !self.io_qid_in_range(qid) || self.cqs.contains_key(&qid) {
            return Status::INVALID_QUEUE_ID.with_dnr();
        }
        if size < 2 || size > self.config.max_queue_entries {
            return Status::INVALID_QUEUE_SIZE.with_dnr();
        }
        if ien && iv >= self.config.irq_vectors {
            return Status::INVALID_INTERRUPT_VECTOR.with_dnr();
        }
        let Some(prepared) = self.prepared_cqs.remove(&qid) else {
            return Status::INVALID_FIELD.with_dnr();
        };
        if prepared.irq_vector != ien.then_some(iv) {
            tracing::warn!(
                cq_id = qid,
                prepared = ?prepared.irq_vector,
                iv,
                ien,
                "sim: irq setup differs from prepare"
            );
        }
        self.cqs
            .insert(qid, CompletionQueue::new(qid, size as u16, ien.then_some(iv)));
        Status::SUCCESS
    }

    fn cmd_create_io_sq(&mut self, cmd: &SubmissionEntry) -> Status {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let size = (cmd.cdw10 >> 16) + 1;
        let cqid = (cmd.cdw11 >> 16) as u16;
        let priority = Priority::from_qprio(cmd.cdw11 >> 1);

        if !self.io_qid_in_range(qid) || self.sqs.contains_key(&qid) {
            return Status::INVALID_QUEUE_ID.with_dnr();
        }
        if size < 2 || size > self.config.max_queue_entries {
            return Status::INVALID_QUEUE_SIZE.with_dnr();
        }
        if cqid == ADMIN_QUEUE_ID || !self.cqs.contains_key(&cqid) {
            return Status::INVALID_CQ.with_dnr();
        }
        let Some(prepared) = self.prepared_sqs.remove(&qid) else {
            return Status::INVALID_FIELD.with_dnr();
        };
        if prepared.cq_id != cqid {
            tracing::warn!(
                sq_id = qid,
                prepared = prepared.cq_id,
                cqid,
                "sim: cq binding differs from prepare"
            );
        }
        self.sqs
            .insert(qid, SubmissionQueue::new(qid, cqid, size as u16, priority));
        Status::SUCCESS
    }

    fn cmd_delete_io_sq(&mut self, cmd: &SubmissionEntry) -> Status {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == ADMIN_QUEUE_ID {
            return Status::INVALID_QUEUE_ID.with_dnr();
        }
        let Some(mut sq) = self.sqs.remove(&qid) else {
            return Status::INVALID_QUEUE_ID.with_dnr();
        };
        for slot in sq.drain_all() {
            self.post(sq.cqid, qid, sq.head, slot.entry.cid, Status::ABORTED_SQ_DELETION, 0);
        }
        Status::SUCCESS
    }

    fn cmd_delete_io_cq(&mut self, cmd: &SubmissionEntry) -> Status {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == ADMIN_QUEUE_ID || !self.cqs.contains_key(&qid) {
            return Status::INVALID_QUEUE_ID.with_dnr();
        }
        if self.sqs.values().any(|sq| sq.id != ADMIN_QUEUE_ID && sq.cqid == qid) {
            return Status::INVALID_QUEUE_DELETION.with_dnr();
        }
        self.cqs.remove(&qid);
        Status::SUCCESS
    }

    fn number_of_queues(&self) -> u32 {
        let n = u32::from(self.config.max_io_queues.saturating_sub(1));
        n << 16 | n
    }

    fn cmd_get_features(&mut self, cmd: &SubmissionEntry) -> (Status, u32) {
        match (cmd.cdw10 & 0xff) as u8 {
            FEATURE_ARBITRATION => (Status::SUCCESS, self.arbitration.encode()),
            FEATURE_NUMBER_OF_QUEUES => (Status::SUCCESS, self.number_of_queues()),
            FEATURE_INTERRUPT_COALESCING => (Status::SUCCESS, self.interrupt_coalescing),
            _ => (Status::INVALID_FIELD.with_dnr(), 0),
        }
    }

    fn cmd_set_features(&mut self, cmd: &SubmissionEntry) -> (Status, u32) {
        match (cmd.cdw10 & 0xff) as u8 {
            FEATURE_ARBITRATION => {
                self.arbitration = ArbitrationFeature::decode(cmd.cdw11);
                self.arbiter.reset();
                (Status::SUCCESS, 0)
            }
            FEATURE_NUMBER_OF_QUEUES => (Status::SUCCESS, self.number_of_queues()),
            FEATURE_INTERRUPT_COALESCING => {
                self.interrupt_coalescing = cmd.cdw11 & 0xffff;
                (Status::SUCCESS, 0)
            }
            _ => (Status::INVALID_FIELD.with_dnr(), 0),
        }
    }

    fn cmd_abort(&mut self, cmd: &SubmissionEntry) -> (Status, u32) {
        let sq_id = (cmd.cdw10 & 0xffff) as u16;
        let cid = (cmd.cdw10 >> 16) as u16;
        if sq_id == ADMIN_QUEUE_ID {
            return (Status::SUCCESS, 1);
        }
        let Some(sq) = self.sqs.get_mut(&sq_id) else {
            return (Status::SUCCESS, 1);
        };
        let Some(slot) = sq.remove_pending(cid) else {
            return (Status::SUCCESS, 1);
        };
        let (cqid, head) = (sq.cqid, sq.head);
        self.post(cqid, sq_id, head, slot.entry.cid, Status::ABORTED_BY_REQUEST, 0);
        tracing::debug!(sq_id, cid, "sim: command aborted");
        (Status::SUCCESS, 0)
    }

    fn execute_one_io(&mut self) -> bool {
        let candidates: Candidates = self
            .sqs
            .iter()
            .filter(|(id, _)| **id != ADMIN_QUEUE_ID)
            .map(|(id, sq)| (*id, (sq.priority, sq.pending())))
            .collect();
        let wrru = self.ams() == regs::CC_AMS_WRRU;
        let Some(sq_id) = self
            .arbiter
            .pick(&candidates, wrru, self.faults.arbiter, &self.arbitration)
        else {
            return false;
        };
        let Some(sq) = self.sqs.get_mut(&sq_id) else {
            return false;
        };
        let Some(slot) = sq.pop() else {
            return false;
        };
        let (cqid, head) = (sq.cqid, sq.head);

        let mut status = self.execute_nvm(&slot);
        if let Some(injected) = self.faults.inject_status.get(&sq_id) {
            status = *injected;
        }
        tracing::trace!(
            sq_id,
            cid = slot.entry.cid,
            direction = ?slot.direction,
            %status,
            "sim: io executed"
        );
        self.executed.push((sq_id, slot.entry.cid));
        self.post(cqid, sq_id, head, slot.entry.cid, status, 0);
        true
    }

    fn execute_nvm(&mut self, slot: &Slot) -> Status {
        let cmd = &slot.entry;
        let nsid_ok = cmd.nsid == self.config.nsid;
        match cmd.opc {
            opcode::NVM_FLUSH => {
                if nsid_ok || cmd.nsid == ALL_NAMESPACES {
                    Status::SUCCESS
                } else {
                    Status::INVALID_NAMESPACE.with_dnr()
                }
            }
            opcode::NVM_READ | opcode::NVM_WRITE | opcode::NVM_COMPARE if !nsid_ok => {
                Status::INVALID_NAMESPACE.with_dnr()
            }
            opcode::NVM_READ => {
                let mut scratch = Vec::new();
                let result = match &slot.data {
                    Some(buf) => self.namespace.read(cmd.slba(), cmd.nlb(), &mut buf.lock()),
                    None => self.namespace.read(cmd.slba(), cmd.nlb(), &mut scratch),
                };
                result.map_or(Status::LBA_OUT_OF_RANGE.with_dnr(), |()| Status::SUCCESS)
            }
            opcode::NVM_WRITE => {
                let src = slot.data.as_ref().map(DmaBuffer::to_vec).unwrap_or_default();
                self.namespace
                    .write(cmd.slba(), cmd.nlb(), &src)
                    .map_or(Status::LBA_OUT_OF_RANGE.with_dnr(), |()| Status::SUCCESS)
            }
            opcode::NVM_COMPARE => {
                let other = slot.data.as_ref().map(DmaBuffer::to_vec).unwrap_or_default();
                match self.namespace.compare(cmd.slba(), cmd.nlb(), &other) {
                    Ok(true) => Status::SUCCESS,
                    Ok(false) => Status::COMPARE_FAILURE,
                    Err(_) => Status::LBA_OUT_OF_RANGE.with_dnr(),
                }
            }
            _ => Status::INVALID_OPCODE.with_dnr(),
        }
    }
}
