//! The explicit context every scenario runs against: one driver plus the harness's own state.

use crate::arbitration::{ArbitrationFeature, ArbitrationVerifier};
use crate::command::{Command, CommandKind, FEATURE_ARBITRATION};
use crate::completion::CompletionEntry;
use crate::config::HarnessConfig;
use crate::driver::{regs, DmaBuffer, QueuePairDriver};
use crate::error::{Error, Result};
use crate::reap::{CompletionReaper, ReapOutcome};
use crate::registry::{Priority, Queue, QueuePairRegistry, QueueRole, ADMIN_QUEUE_ID};
use crate::submit::CommandSubmitter;

pub struct Harness<D> {
    driver: D,
    registry: QueuePairRegistry,
    submitter: CommandSubmitter,
    reaper: CompletionReaper,
    nsid: u32,
}

impl<D: QueuePairDriver> Harness<D> {
    pub fn new(driver: D, config: &HarnessConfig) -> Self {
        Self::with_reaper(driver, config, CompletionReaper::new(config.reap_policy()))
    }

    pub fn with_reaper(driver: D, config: &HarnessConfig, reaper: CompletionReaper) -> Self {
        Harness {
            driver,
            registry: config.registry(),
            submitter: CommandSubmitter::new(),
            reaper,
            nsid: config.nsid,
        }
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn registry(&self) -> &QueuePairRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut QueuePairRegistry {
        &mut self.registry
    }

    pub fn submitter(&self) -> &CommandSubmitter {
        &self.submitter
    }

    pub fn reaper_mut(&mut self) -> &mut CompletionReaper {
        &mut self.reaper
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    pub fn submit(
        &mut self,
        sq_id: u16,
        command: &Command,
        buffer: Option<DmaBuffer>,
    ) -> Result<u16> {
        self.submitter
            .submit(&mut self.driver, &mut self.registry, sq_id, command, buffer)
    }

    pub fn ring_doorbell(&mut self, sq_id: u16) -> Result<()> {
        self.submitter.ring_doorbell(&mut self.driver, sq_id)
    }

    pub fn reap(&mut self, cq_id: u16, expected: u32) -> Result<ReapOutcome> {
        self.reaper
            .reap(&mut self.driver, &self.registry, cq_id, expected)
    }

    pub fn collect_round_robin(&mut self, cq_ids: &[u16], expected: u32) -> Result<ReapOutcome> {
        self.reaper
            .collect_round_robin(&mut self.driver, &self.registry, cq_ids, expected)
    }

    /// Collects completions from `cq_ids` into `verifier`. See
    /// [`ArbitrationVerifier::collect_and_verify`].
    pub fn verify_arbitration(
        &mut self,
        verifier: &mut ArbitrationVerifier,
        cq_ids: &[u16],
    ) -> Result<ReapOutcome> {
        verifier.collect_and_verify(&mut self.reaper, &mut self.driver, &self.registry, cq_ids)
    }

    /// Releases the commands completed by `entries`, returning the buffers that came back.
    pub fn retire(&mut self, entries: &[CompletionEntry]) -> Vec<DmaBuffer> {
        entries
            .iter()
            .filter_map(|entry| self.submitter.retire(&mut self.registry, entry))
            .collect()
    }

    /// Runs one admin command to completion and fails on a nonzero status.
    pub fn admin(&mut self, command: Command) -> Result<CompletionEntry> {
        let entry = self.admin_unchecked(command, None)?;
        if !entry.is_success() {
            return Err(Error::AdminCommandFailed {
                opcode: command.kind.opcode(),
                status: entry.status_field,
            });
        }
        Ok(entry)
    }

    /// Runs one admin command to completion and returns its entry whatever the status.
    pub fn admin_unchecked(
        &mut self,
        command: Command,
        buffer: Option<DmaBuffer>,
    ) -> Result<CompletionEntry> {
        let cid = self.submit(ADMIN_QUEUE_ID, &command, buffer)?;
        self.ring_doorbell(ADMIN_QUEUE_ID)?;
        let outcome = self.reap(ADMIN_QUEUE_ID, 1)?;
        self.retire(&outcome.entries);
        let entry = outcome
            .entries
            .into_iter()
            .next()
            .ok_or(Error::ReapTimeout {
                cq_id: ADMIN_QUEUE_ID,
                expected: 1,
                reaped: 0,
            })?;
        if entry.command_identifier != cid || entry.sq_identifier != ADMIN_QUEUE_ID {
            tracing::warn!(
                cid,
                got_cid = entry.command_identifier,
                got_sq = entry.sq_identifier,
                "admin completion does not match the submitted command"
            );
        }
        tracing::debug!(
            opcode = command.kind.opcode(),
            cid,
            status = %entry.status(),
            result = entry.result,
            "admin command complete"
        );
        Ok(entry)
    }

    pub fn create_io_cq(&mut self, qid: u16, size: u32, irq_vector: Option<u16>) -> Result<()> {
        self.driver
            .prepare_cq(qid, size, true, irq_vector)
            .map_err(|source| Error::PrepareFailed {
                role: QueueRole::Completion,
                id: qid,
                source,
            })?;
        self.admin(Command::admin(CommandKind::CreateIoCq {
            qid,
            size,
            contiguous: true,
            irq_vector,
        }))?;
        self.registry
            .register_queue(Queue::completion(qid, size, irq_vector))?;
        tracing::info!(cq_id = qid, size, ?irq_vector, "io cq created");
        Ok(())
    }

    pub fn create_io_sq(
        &mut self,
        qid: u16,
        cq_id: u16,
        size: u32,
        priority: Priority,
    ) -> Result<()> {
        self.driver
            .prepare_sq(qid, cq_id, size, true)
            .map_err(|source| Error::PrepareFailed {
                role: QueueRole::Submission,
                id: qid,
                source,
            })?;
        self.admin(Command::admin(CommandKind::CreateIoSq {
            qid,
            cq_id,
            size,
            contiguous: true,
            priority,
        }))?;
        self.registry
            .register_queue(Queue::submission(qid, cq_id, size, priority))?;
        tracing::info!(sq_id = qid, cq_id, size, %priority, "io sq created");
        Ok(())
    }

    /// Creates CQ `qid` (interrupt vector `qid`) and SQ `qid` bound to it.
    pub fn create_io_pair(&mut self, qid: u16, size: u32, priority: Priority) -> Result<()> {
        self.create_io_cq(qid, size, Some(qid))?;
        self.create_io_sq(qid, qid, size, priority)
    }

    pub fn delete_io_sq(&mut self, qid: u16) -> Result<()> {
        self.admin(Command::admin(CommandKind::DeleteIoSq { qid }))?;
        let abandoned = self.submitter.abandon_queue(qid);
        if abandoned != 0 {
            tracing::warn!(sq_id = qid, abandoned, "sq deleted with commands in flight");
        }
        // Deleting an id the harness never created is allowed; the device had the final word.
        match self.registry.unregister_queue(QueueRole::Submission, qid) {
            Ok(_) | Err(Error::UnknownQueueId { .. }) => {}
            Err(err) => return Err(err),
        }
        tracing::info!(sq_id = qid, "io sq deleted");
        Ok(())
    }

    pub fn delete_io_cq(&mut self, qid: u16) -> Result<()> {
        self.admin(Command::admin(CommandKind::DeleteIoCq { qid }))?;
        match self.registry.unregister_queue(QueueRole::Completion, qid) {
            Ok(_) | Err(Error::UnknownQueueId { .. }) => {}
            Err(err) => return Err(err),
        }
        tracing::info!(cq_id = qid, "io cq deleted");
        Ok(())
    }

    /// Deletes every registered I/O queue, submission queues first.
    pub fn delete_all_io_queues(&mut self) -> Result<()> {
        let sqs: Vec<u16> = self.registry.io_submission_queues().map(|q| q.id).collect();
        for sq in sqs {
            self.delete_io_sq(sq)?;
        }
        for cq in self.registry.active_io_cq_ids() {
            self.delete_io_cq(cq)?;
        }
        Ok(())
    }

    pub fn get_features(&mut self, fid: u8) -> Result<u32> {
        Ok(self
            .admin(Command::admin(CommandKind::GetFeatures { fid }))?
            .result)
    }

    pub fn set_features(&mut self, fid: u8, value: u32) -> Result<()> {
        self.admin(Command::admin(CommandKind::SetFeatures { fid, value }))?;
        Ok(())
    }

    pub fn get_arbitration(&mut self) -> Result<ArbitrationFeature> {
        let feature = ArbitrationFeature::decode(self.get_features(FEATURE_ARBITRATION)?);
        tracing::info!(
            high = feature.weight(Priority::High),
            medium = feature.weight(Priority::Medium),
            low = feature.weight(Priority::Low),
            burst = feature.burst,
            "arbitration feature"
        );
        Ok(feature)
    }

    pub fn set_arbitration(&mut self, feature: &ArbitrationFeature) -> Result<()> {
        self.set_features(FEATURE_ARBITRATION, feature.encode())
    }

    /// Aborts `cid` on `sq_id`. Returns true if the controller reports the command was not
    /// aborted (completion DW0 bit 0).
    pub fn abort(&mut self, sq_id: u16, cid: u16) -> Result<bool> {
        let entry = self.admin(Command::admin(CommandKind::Abort { sq_id, cid }))?;
        Ok(entry.result & 1 != 0)
    }

    pub fn keep_alive(&mut self) -> Result<()> {
        self.admin(Command::admin(CommandKind::KeepAlive))?;
        Ok(())
    }

    pub fn read_register(&mut self, offset: u32) -> Result<u32> {
        self.driver
            .read_register(offset)
            .map_err(|source| Error::RegisterAccess { offset, source })
    }

    pub fn write_register(&mut self, offset: u32, value: u32) -> Result<()> {
        self.driver
            .write_register(offset, value)
            .map_err(|source| Error::RegisterAccess { offset, source })
    }

    /// Selects Weighted Round Robin with Urgent Priority Class in CC.AMS.
    ///
    /// Returns whether the controller reads back the new selection. A controller that does not
    /// advertise the mechanism in CAP.AMS is still asked, with a warning.
    pub fn enable_wrru(&mut self) -> Result<bool> {
        let cap = self.read_register(regs::CAP)?;
        if cap & regs::CAP_AMS_WRRU == 0 {
            tracing::warn!(cap, "controller does not advertise WRRU");
        }
        let cc = self.read_register(regs::CC)?;
        let wanted = (cc & !regs::CC_AMS_MASK) | regs::CC_AMS_WRRU << regs::CC_AMS_SHIFT;
        self.write_register(regs::CC, wanted)?;
        let readback = self.read_register(regs::CC)?;
        let ams = (readback & regs::CC_AMS_MASK) >> regs::CC_AMS_SHIFT;
        tracing::info!(ams, "arbitration mechanism selected");
        Ok(ams == regs::CC_AMS_WRRU)
    }
}

impl<D> std::fmt::Debug for Harness<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("registry", &self.registry)
            .field("submitter", &self.submitter)
            .field("reaper", &self.reaper)
            .field("nsid", &self.nsid)
            .finish_non_exhaustive()
    }
}
