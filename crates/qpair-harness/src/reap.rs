//! Draining completion queues toward an expected count.
//!
//! The device posts completions on its own schedule, so a drain call that returns nothing is
//! normal. The reaper gives up only after `no_progress_limit` consecutive empty polls; any
//! forward progress resets that counter, however long the whole drain takes.

use std::time::Duration;

use serde::Serialize;

use crate::completion::{CompletionEntry, Status, CQ_ENTRY_SIZE};
use crate::driver::QueuePairDriver;
use crate::error::{Error, Result};
use crate::registry::QueuePairRegistry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(10);
pub const DEFAULT_NO_PROGRESS_LIMIT: u32 = 1_000_000;
/// Entries requested per drain call. One full ring at the largest queue depth.
pub const DEFAULT_MAX_BATCH: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Sleep between polls that made no progress.
    pub poll_interval: Duration,
    /// Consecutive empty polls tolerated before the reap times out.
    pub no_progress_limit: u32,
    /// Log every reaped entry at debug level. Nonzero status is always logged.
    pub log_entries: bool,
    /// Upper bound on entries requested by one drain call; sizes the staging buffer.
    pub max_batch: u32,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        ReapPolicy {
            poll_interval: DEFAULT_POLL_INTERVAL,
            no_progress_limit: DEFAULT_NO_PROGRESS_LIMIT,
            log_entries: true,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// The wait between two polls.
pub trait PollSleep {
    fn sleep(&mut self, interval: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl PollSleep for ThreadSleep {
    fn sleep(&mut self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

/// A reaped entry that carried a nonzero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionStatusError {
    pub cq_id: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: Status,
}

/// A drain call that returned entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSample {
    pub cq_id: u16,
    pub reaped: u32,
    /// Empty drain calls, on any queue, since the previous productive one.
    pub idle_before: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    pub expected: u32,
    /// Decoded entries in the order they were drained.
    pub entries: Vec<CompletionEntry>,
    pub status_errors: Vec<CompletionStatusError>,
    /// At most one per reaped entry; empty calls are only counted.
    pub samples: Vec<PollSample>,
    pub drain_calls: u64,
    pub max_no_progress: u32,
}

impl ReapOutcome {
    fn new(expected: u32) -> Self {
        ReapOutcome {
            expected,
            ..ReapOutcome::default()
        }
    }

    pub fn reaped(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Fully drained and every entry clean.
    pub fn success(&self) -> bool {
        self.reaped() == self.expected && self.status_errors.is_empty()
    }
}

pub struct CompletionReaper {
    policy: ReapPolicy,
    sleeper: Box<dyn PollSleep>,
    staging: Vec<u8>,
    partial: Option<ReapOutcome>,
}

impl std::fmt::Debug for CompletionReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionReaper")
            .field("policy", &self.policy)
            .field("staging_len", &self.staging.len())
            .finish()
    }
}

impl CompletionReaper {
    pub fn new(policy: ReapPolicy) -> Self {
        Self::with_sleeper(policy, Box::new(ThreadSleep))
    }

    pub fn with_sleeper(policy: ReapPolicy, sleeper: Box<dyn PollSleep>) -> Self {
        CompletionReaper {
            policy,
            sleeper,
            staging: Vec::new(),
            partial: None,
        }
    }

    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// Entries gathered by the last reap that ended in an error.
    pub fn take_partial(&mut self) -> Option<ReapOutcome> {
        self.partial.take()
    }

    fn check_cq(registry: &QueuePairRegistry, cq_id: u16) -> Result<()> {
        let max = registry.max_cq_id();
        if cq_id > max {
            tracing::error!(cq_id, max, "reap target out of range");
            return Err(Error::InvalidQueue { cq_id, max });
        }
        Ok(())
    }

    /// Drains `cq_id` until `expected` entries have been collected.
    pub fn reap<D: QueuePairDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        registry: &QueuePairRegistry,
        cq_id: u16,
        expected: u32,
    ) -> Result<ReapOutcome> {
        self.collect_round_robin(driver, registry, &[cq_id], expected)
    }

    /// Drains several CQs into one sequence, one drain call per queue per round, in the order
    /// given. Only a round in which no queue yielded anything counts as no progress.
    ///
    /// On timeout the error carries the last queue polled; the entries collected so far are
    /// available from [`CompletionReaper::take_partial`].
    pub fn collect_round_robin<D: QueuePairDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        registry: &QueuePairRegistry,
        cq_ids: &[u16],
        expected: u32,
    ) -> Result<ReapOutcome> {
        for &cq_id in cq_ids {
            Self::check_cq(registry, cq_id)?;
        }
        if cq_ids.is_empty() && expected > 0 {
            return Err(Error::InvalidCommand("no completion queue to reap"));
        }
        self.partial = None;

        let mut outcome = ReapOutcome::new(expected);
        let mut no_progress = 0u32;
        let mut idle = 0u32;
        let batch = self.policy.max_batch.max(1);
        let mut last_cq = cq_ids.first().copied().unwrap_or_default();

        while outcome.reaped() < expected {
            let mut round = 0u32;
            for &cq_id in cq_ids {
                let want = (expected - outcome.reaped()).min(batch);
                if want == 0 {
                    break;
                }
                last_cq = cq_id;
                let got = match self.drain_once(driver, cq_id, want, &mut outcome) {
                    Ok(got) => got,
                    Err(err) => {
                        self.partial = Some(outcome);
                        return Err(err);
                    }
                };
                outcome.drain_calls += 1;
                round += got;
                if got == 0 {
                    idle = idle.saturating_add(1);
                    continue;
                }
                outcome.samples.push(PollSample {
                    cq_id,
                    reaped: got,
                    idle_before: idle,
                });
                idle = 0;
            }

            if round > 0 {
                no_progress = 0;
                continue;
            }

            no_progress += 1;
            outcome.max_no_progress = outcome.max_no_progress.max(no_progress);
            if no_progress > self.policy.no_progress_limit {
                let reaped = outcome.reaped();
                tracing::error!(cq_id = last_cq, expected, reaped, "reap timed out");
                self.partial = Some(outcome);
                return Err(Error::ReapTimeout {
                    cq_id: last_cq,
                    expected,
                    reaped,
                });
            }
            self.sleeper.sleep(self.policy.poll_interval);
        }

        tracing::debug!(
            cqs = ?cq_ids,
            expected,
            status_errors = outcome.status_errors.len(),
            polls = outcome.drain_calls,
            "reap complete"
        );
        Ok(outcome)
    }

    fn drain_once<D: QueuePairDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        cq_id: u16,
        want: u32,
        outcome: &mut ReapOutcome,
    ) -> Result<u32> {
        let len = want as usize * CQ_ENTRY_SIZE;
        if self.staging.len() < len {
            self.staging.resize(len, 0);
        }
        let status = driver
            .reap(cq_id, want, &mut self.staging[..len])
            .map_err(|source| Error::ReapIoctlFailed { cq_id, source })?;

        let got = if status.reaped > want {
            tracing::warn!(
                cq_id,
                want,
                reaped = status.reaped,
                "driver over-reported reaped count"
            );
            want
        } else {
            status.reaped
        };

        for chunk in self.staging[..got as usize * CQ_ENTRY_SIZE].chunks_exact(CQ_ENTRY_SIZE) {
            let mut raw = [0u8; CQ_ENTRY_SIZE];
            raw.copy_from_slice(chunk);
            let entry = CompletionEntry::decode(&raw);
            if entry.is_success() {
                if self.policy.log_entries {
                    tracing::debug!(
                        cq_id,
                        sq_id = entry.sq_identifier,
                        cid = entry.command_identifier,
                        sq_head = entry.sq_head_pointer,
                        phase = entry.phase_bit,
                        "completion"
                    );
                }
            } else {
                tracing::warn!(
                    cq_id,
                    sq_id = entry.sq_identifier,
                    cid = entry.command_identifier,
                    status = %entry.status(),
                    "completion with error status"
                );
                outcome.status_errors.push(CompletionStatusError {
                    cq_id,
                    sq_id: entry.sq_identifier,
                    cid: entry.command_identifier,
                    status: entry.status(),
                });
            }
            outcome.entries.push(entry);
        }
        Ok(got)
    }
}

impl Default for CompletionReaper {
    fn default() -> Self {
        CompletionReaper::new(ReapPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::command::{DataDirection, SQ_ENTRY_SIZE};
    use crate::driver::{DmaBuffer, ReapStatus};
    use crate::error::DriverError;

    type DrvResult<T> = std::result::Result<T, DriverError>;

    /// Yields a scripted number of entries per drain call, then nothing.
    #[derive(Default)]
    struct ScriptedDriver {
        script: VecDeque<u32>,
        status_for_cid: Option<(u16, u16)>,
        next_cid: u16,
        calls: Vec<(u16, u32)>,
        fail: bool,
    }

    impl ScriptedDriver {
        fn new(script: &[u32]) -> Self {
            ScriptedDriver {
                script: script.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl QueuePairDriver for ScriptedDriver {
        fn prepare_sq(&mut self, _: u16, _: u16, _: u32, _: bool) -> DrvResult<()> {
            Ok(())
        }
        fn prepare_cq(&mut self, _: u16, _: u32, _: bool, _: Option<u16>) -> DrvResult<()> {
            Ok(())
        }
        fn submit_command(
            &mut self,
            _: u16,
            _: &[u8; SQ_ENTRY_SIZE],
            _: Option<&DmaBuffer>,
            _: DataDirection,
        ) -> DrvResult<u16> {
            Ok(0)
        }
        fn ring_doorbell(&mut self, _: u16) -> DrvResult<()> {
            Ok(())
        }
        fn reap(&mut self, cq_id: u16, requested: u32, buf: &mut [u8]) -> DrvResult<ReapStatus> {
            self.calls.push((cq_id, requested));
            if self.fail {
                return Err(DriverError::new("reap", 5, "io error"));
            }
            let n = self.script.pop_front().unwrap_or(0).min(requested);
            for i in 0..n as usize {
                let cid = self.next_cid;
                self.next_cid += 1;
                let status_field = match self.status_for_cid {
                    Some((bad, field)) if bad == cid => field,
                    _ => 0,
                };
                let entry = CompletionEntry {
                    command_identifier: cid,
                    result: 0,
                    phase_bit: true,
                    sq_head_pointer: cid,
                    sq_identifier: cq_id,
                    status_field,
                };
                buf[i * CQ_ENTRY_SIZE..(i + 1) * CQ_ENTRY_SIZE].copy_from_slice(&entry.encode());
            }
            Ok(ReapStatus {
                reaped: n,
                remaining: 0,
                isr_count: 0,
            })
        }
        fn inquiry(&mut self, _: u16) -> DrvResult<u32> {
            Ok(0)
        }
        fn read_register(&mut self, _: u32) -> DrvResult<u32> {
            Ok(0)
        }
        fn write_register(&mut self, _: u32, _: u32) -> DrvResult<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CountingSleep(Rc<RefCell<Vec<Duration>>>);

    impl PollSleep for CountingSleep {
        fn sleep(&mut self, interval: Duration) {
            self.0.borrow_mut().push(interval);
        }
    }

    fn reaper(limit: u32) -> (CompletionReaper, CountingSleep) {
        reaper_with(ReapPolicy {
            no_progress_limit: limit,
            ..ReapPolicy::default()
        })
    }

    fn reaper_with(policy: ReapPolicy) -> (CompletionReaper, CountingSleep) {
        let sleeps = CountingSleep::default();
        (
            CompletionReaper::with_sleeper(policy, Box::new(sleeps.clone())),
            sleeps,
        )
    }

    #[test]
    fn counter_resets_after_each_productive_call() {
        let mut drv = ScriptedDriver::new(&[4, 0, 6]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, sleeps) = reaper(3);

        let out = reaper.reap(&mut drv, &reg, 1, 10).unwrap();
        assert_eq!(out.reaped(), 10);
        assert!(out.success());
        assert_eq!(
            out.samples,
            vec![
                PollSample {
                    cq_id: 1,
                    reaped: 4,
                    idle_before: 0
                },
                PollSample {
                    cq_id: 1,
                    reaped: 6,
                    idle_before: 1
                },
            ]
        );
        assert_eq!(out.drain_calls, 3);
        assert_eq!(out.max_no_progress, 1);
        assert_eq!(drv.calls, vec![(1, 10), (1, 6), (1, 6)]);
        assert_eq!(*sleeps.0.borrow(), vec![DEFAULT_POLL_INTERVAL]);
    }

    #[test]
    fn out_of_range_cq_is_rejected_without_ioctl() {
        let mut drv = ScriptedDriver::new(&[1]);
        let reg = QueuePairRegistry::new(64, 4, 4);
        let (mut reaper, _) = reaper(3);

        let err = reaper.reap(&mut drv, &reg, 5, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidQueue { cq_id: 5, max: 4 }));
        assert!(drv.calls.is_empty());
    }

    #[test]
    fn times_out_on_progress_not_wall_clock() {
        let mut drv = ScriptedDriver::new(&[2]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, sleeps) = reaper(5);

        let err = reaper.reap(&mut drv, &reg, 2, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::ReapTimeout {
                cq_id: 2,
                expected: 4,
                reaped: 2
            }
        ));
        assert!(!err.is_infrastructure());
        // One productive call, then limit + 1 empty ones.
        assert_eq!(drv.calls.len(), 1 + 6);
        assert_eq!(sleeps.0.borrow().len(), 5);
        let partial = reaper.take_partial().unwrap();
        assert_eq!(partial.reaped(), 2);
        assert!(reaper.take_partial().is_none());
    }

    #[test]
    fn empty_polls_are_counted_not_stored() {
        let mut drv = ScriptedDriver::new(&[1]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, sleeps) = reaper(2_000);

        let err = reaper
            .collect_round_robin(&mut drv, &reg, &[1, 2, 3, 4], 8)
            .unwrap_err();
        assert!(matches!(err, Error::ReapTimeout { reaped: 1, .. }));
        let partial = reaper.take_partial().unwrap();
        assert_eq!(partial.samples.len(), 1);
        assert_eq!(partial.drain_calls, 4 * 2_002);
        assert_eq!(drv.calls.len(), 4 * 2_002);
        assert_eq!(partial.max_no_progress, 2_001);
        assert_eq!(sleeps.0.borrow().len(), 2_000);
    }

    #[test]
    fn drain_requests_are_capped_by_batch() {
        let mut drv = ScriptedDriver::new(&[4, 4, 4]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, _) = reaper_with(ReapPolicy {
            max_batch: 4,
            ..ReapPolicy::default()
        });

        let out = reaper.reap(&mut drv, &reg, 1, 10).unwrap();
        assert_eq!(out.reaped(), 10);
        assert_eq!(drv.calls, vec![(1, 4), (1, 4), (1, 2)]);
        assert!(reaper.staging.len() <= 4 * CQ_ENTRY_SIZE);

        // A huge expected count never asks the driver for more than one batch.
        let mut drv = ScriptedDriver::new(&[]);
        let (mut reaper, _) = self::reaper(0);
        assert!(reaper.reap(&mut drv, &reg, 1, u32::MAX).is_err());
        assert_eq!(drv.calls, vec![(1, DEFAULT_MAX_BATCH)]);
        assert_eq!(reaper.staging.len(), DEFAULT_MAX_BATCH as usize * CQ_ENTRY_SIZE);
    }

    #[test]
    fn nonzero_status_is_reported_without_aborting() {
        let mut drv = ScriptedDriver::new(&[3]);
        drv.status_for_cid = Some((1, 0x0002));
        let reg = QueuePairRegistry::default();
        let (mut reaper, _) = reaper(3);

        let out = reaper.reap(&mut drv, &reg, 1, 3).unwrap();
        assert_eq!(out.reaped(), 3);
        assert!(!out.success());
        assert_eq!(out.status_errors.len(), 1);
        assert_eq!(out.status_errors[0].cid, 1);
        assert_eq!(out.status_errors[0].status, Status::INVALID_FIELD);
    }

    #[test]
    fn ioctl_failure_is_hard() {
        let mut drv = ScriptedDriver::new(&[]);
        drv.fail = true;
        let reg = QueuePairRegistry::default();
        let (mut reaper, sleeps) = reaper(3);

        let err = reaper.reap(&mut drv, &reg, 1, 1).unwrap_err();
        assert!(matches!(err, Error::ReapIoctlFailed { cq_id: 1, .. }));
        assert!(err.is_infrastructure());
        assert!(sleeps.0.borrow().is_empty());
    }

    #[test]
    fn round_robin_polls_each_queue_once_per_round() {
        let mut drv = ScriptedDriver::new(&[1, 0, 2, 0, 0, 1]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, sleeps) = reaper(3);

        let out = reaper
            .collect_round_robin(&mut drv, &reg, &[1, 2, 3], 4)
            .unwrap();
        assert_eq!(out.reaped(), 4);
        assert_eq!(
            drv.calls.iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![1, 2, 3, 1, 2, 3]
        );
        // Both rounds made progress.
        assert!(sleeps.0.borrow().is_empty());
        assert_eq!(
            out.entries.iter().map(|e| e.sq_identifier).collect::<Vec<_>>(),
            vec![1, 3, 3, 3]
        );
    }

    #[test]
    fn zero_expected_makes_no_calls() {
        let mut drv = ScriptedDriver::new(&[1]);
        let reg = QueuePairRegistry::default();
        let (mut reaper, _) = reaper(3);
        let out = reaper.reap(&mut drv, &reg, 1, 0).unwrap();
        assert!(out.success());
        assert!(drv.calls.is_empty());
    }
}
