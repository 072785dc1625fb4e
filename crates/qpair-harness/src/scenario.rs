//! End-to-end arbitration run: program WRRU, build the queue pairs, load them, verify the order.

use serde::{Deserialize, Serialize};

use crate::arbitration::{
    ArbitrationFeature, ArbitrationParameters, ArbitrationReport, ArbitrationVerifier, VerifyMode,
};
use crate::command::Command;
use crate::driver::{DmaBuffer, QueuePairDriver};
use crate::error::{Error, Result};
use crate::harness::Harness;
use crate::reap::CompletionStatusError;
use crate::registry::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioQueue {
    pub qid: u16,
    pub priority: Priority,
    pub commands: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationScenario {
    pub queues: Vec<ScenarioQueue>,
    pub feature: ArbitrationFeature,
    pub mode: VerifyMode,
    pub queue_depth: u32,
    pub blocks_per_command: u32,
    pub block_size: usize,
}

impl ArbitrationScenario {
    /// One queue pair per class: low on 1, medium on 2, urgent on 3, high on 4.
    pub fn standard(feature: ArbitrationFeature, commands: [u32; 4], mode: VerifyMode) -> Self {
        let [urgent, high, medium, low] = commands;
        ArbitrationScenario {
            queues: vec![
                ScenarioQueue {
                    qid: 1,
                    priority: Priority::Low,
                    commands: low,
                },
                ScenarioQueue {
                    qid: 2,
                    priority: Priority::Medium,
                    commands: medium,
                },
                ScenarioQueue {
                    qid: 3,
                    priority: Priority::Urgent,
                    commands: urgent,
                },
                ScenarioQueue {
                    qid: 4,
                    priority: Priority::High,
                    commands: high,
                },
            ],
            feature,
            mode,
            queue_depth: 1024,
            blocks_per_command: 1,
            block_size: 512,
        }
    }

    pub fn commands_in(&self, class: Priority) -> u32 {
        self.queues
            .iter()
            .filter(|q| q.priority == class)
            .map(|q| q.commands)
            .sum()
    }

    pub fn total_commands(&self) -> u32 {
        self.queues.iter().map(|q| q.commands).sum()
    }

    /// Complete WRRU cycles before the first weighted class runs dry.
    pub fn full_cycles(&self, params: &ArbitrationParameters) -> u32 {
        Priority::WEIGHTED
            .iter()
            .map(|&class| self.commands_in(class) / params.weight(class).max(1))
            .min()
            .unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        for q in &self.queues {
            // A ring of N slots holds at most N - 1 commands.
            if q.commands >= self.queue_depth {
                return Err(Error::InvalidConfig(format!(
                    "queue {} holds at most {} commands, {} requested",
                    q.qid,
                    self.queue_depth - 1,
                    q.commands
                )));
            }
            if q.qid == 0 {
                return Err(Error::InvalidConfig("queue id 0 is the admin queue".into()));
            }
        }
        if self.blocks_per_command == 0 {
            return Err(Error::InvalidConfig("blocks_per_command must be nonzero".into()));
        }
        Ok(())
    }

    pub fn run<D: QueuePairDriver>(&self, harness: &mut Harness<D>) -> Result<ScenarioReport> {
        self.validate()?;

        let wrru_selected = harness.enable_wrru()?;
        if !wrru_selected {
            tracing::warn!("controller did not accept WRRU; order checks will likely fail");
        }
        harness.set_arbitration(&self.feature)?;
        let feature = harness.get_arbitration()?;
        if feature != self.feature {
            tracing::warn!(
                requested = self.feature.encode(),
                actual = feature.encode(),
                "arbitration feature read back differs; verifying against the device value"
            );
        }

        for q in &self.queues {
            harness.create_io_pair(q.qid, self.queue_depth, q.priority)?;
        }

        let mut submitted = 0u32;
        let nsid = harness.nsid();
        let bytes = self.blocks_per_command as usize * self.block_size;
        for q in &self.queues {
            for i in 0..q.commands {
                let slba = u64::from(i) * u64::from(self.blocks_per_command);
                let cmd = Command::read(nsid, slba, self.blocks_per_command);
                harness.submit(q.qid, &cmd, Some(DmaBuffer::zeroed(bytes)))?;
                submitted += 1;
            }
        }

        // Urgent queues go first so their commands are visible before the weighted ones.
        let mut doorbells: Vec<&ScenarioQueue> = self.queues.iter().collect();
        doorbells.sort_by_key(|q| (q.priority != Priority::Urgent, q.qid));
        for q in doorbells {
            harness.ring_doorbell(q.qid)?;
        }

        let urgent_count = self.commands_in(Priority::Urgent);
        let mut params = ArbitrationParameters::from_feature(urgent_count, &feature);
        params = params.with_cycle_target(self.full_cycles(&params));
        tracing::info!(
            urgent_count,
            order = ?params.priority_execution_order,
            cycles = ?params.cycle_target,
            submitted,
            "verifying arbitration"
        );

        let mut verifier = ArbitrationVerifier::new(params, self.mode, submitted);
        let cq_ids = harness.registry().active_io_cq_ids();
        let outcome = harness.verify_arbitration(&mut verifier, &cq_ids)?;
        harness.retire(&outcome.entries);
        let arbitration = verifier.report();

        harness.delete_all_io_queues()?;

        let report = ScenarioReport {
            wrru_selected,
            feature,
            submitted,
            reaped: outcome.reaped(),
            status_errors: outcome.status_errors,
            arbitration,
        };
        if report.passed() {
            tracing::info!(
                reaped = report.reaped,
                loops = report.arbitration.loops,
                "arbitration scenario passed"
            );
        } else {
            tracing::error!(
                reaped = report.reaped,
                mismatches = report.arbitration.mismatches.len(),
                status_errors = report.status_errors.len(),
                state = ?report.arbitration.state,
                "arbitration scenario failed"
            );
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub wrru_selected: bool,
    pub feature: ArbitrationFeature,
    pub submitted: u32,
    pub reaped: u32,
    pub status_errors: Vec<CompletionStatusError>,
    pub arbitration: ArbitrationReport,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.arbitration.passed() && self.status_errors.is_empty() && self.reaped == self.submitted
    }
}
