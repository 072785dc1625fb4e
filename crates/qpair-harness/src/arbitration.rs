//! Verification of completion order against Weighted Round Robin with Urgent Priority Class.
//!
//! Urgent completions come first. The weighted classes are then serviced in a fixed execution
//! order, each contributing a burst as long as its weight, cycling until the run is exhausted.
//! The order is derived once per run from the weights; a device that reorders classes mid-run
//! shows up as window mismatches.

use std::cmp::Reverse;

use serde::Serialize;

use crate::completion::CompletionEntry;
use crate::driver::QueuePairDriver;
use crate::error::{Error, Result};
use crate::reap::{CompletionReaper, ReapOutcome};
use crate::registry::{Priority, QueuePairRegistry};

/// `AB` value meaning no burst limit.
pub const ARBITRATION_BURST_UNLIMITED: u8 = 0b111;

/// Arbitration feature (FID 01h) value. Weights are stored zero's based, as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArbitrationFeature {
    pub burst: u8,
    pub low: u8,
    pub medium: u8,
    pub high: u8,
}

fn weight_field(weight: u32) -> Result<u8> {
    weight
        .checked_sub(1)
        .and_then(|w| u8::try_from(w).ok())
        .ok_or_else(|| Error::InvalidConfig(format!("arbitration weight {weight} outside 1..=256")))
}

impl ArbitrationFeature {
    /// Builds a feature value from 1-based weights and the burst exponent (`AB`).
    pub fn new(burst: u8, high: u32, medium: u32, low: u32) -> Result<Self> {
        if burst > ARBITRATION_BURST_UNLIMITED {
            return Err(Error::InvalidConfig(format!(
                "arbitration burst {burst} does not fit in 3 bits"
            )));
        }
        Ok(ArbitrationFeature {
            burst,
            low: weight_field(low)?,
            medium: weight_field(medium)?,
            high: weight_field(high)?,
        })
    }

    pub fn encode(&self) -> u32 {
        u32::from(self.burst & 0x7)
            | u32::from(self.low) << 8
            | u32::from(self.medium) << 16
            | u32::from(self.high) << 24
    }

    pub fn decode(value: u32) -> Self {
        ArbitrationFeature {
            burst: (value & 0x7) as u8,
            low: (value >> 8) as u8,
            medium: (value >> 16) as u8,
            high: (value >> 24) as u8,
        }
    }

    /// 1-based weight of a weighted class; zero for Urgent.
    pub fn weight(&self, class: Priority) -> u32 {
        match class {
            Priority::Urgent => 0,
            Priority::High => u32::from(self.high) + 1,
            Priority::Medium => u32::from(self.medium) + 1,
            Priority::Low => u32::from(self.low) + 1,
        }
    }

    /// Commands taken from one SQ per arbitration turn, `None` when unlimited.
    pub fn burst_len(&self) -> Option<u32> {
        (self.burst < ARBITRATION_BURST_UNLIMITED).then(|| 1u32 << self.burst)
    }
}

/// Execution order of the weighted classes: descending weight, ties High before Medium before
/// Low.
pub fn derive_order(high: u32, medium: u32, low: u32) -> [Priority; 3] {
    let weight = |p: &Priority| match p {
        Priority::High => high,
        Priority::Medium => medium,
        _ => low,
    };
    let mut order = Priority::WEIGHTED;
    order.sort_by_key(|p| Reverse(weight(p)));
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbitrationParameters {
    pub urgent_count: u32,
    pub weight_high: u32,
    pub weight_medium: u32,
    pub weight_low: u32,
    pub priority_execution_order: [Priority; 3],
    /// Overrides the cycle count otherwise implied by the expected total.
    pub cycle_target: Option<u32>,
}

impl ArbitrationParameters {
    pub fn new(urgent_count: u32, high: u32, medium: u32, low: u32) -> Result<Self> {
        for w in [high, medium, low] {
            weight_field(w)?;
        }
        Ok(ArbitrationParameters {
            urgent_count,
            weight_high: high,
            weight_medium: medium,
            weight_low: low,
            priority_execution_order: derive_order(high, medium, low),
            cycle_target: None,
        })
    }

    pub fn from_feature(urgent_count: u32, feature: &ArbitrationFeature) -> Self {
        let (high, medium, low) = (
            feature.weight(Priority::High),
            feature.weight(Priority::Medium),
            feature.weight(Priority::Low),
        );
        ArbitrationParameters {
            urgent_count,
            weight_high: high,
            weight_medium: medium,
            weight_low: low,
            priority_execution_order: derive_order(high, medium, low),
            cycle_target: None,
        }
    }

    pub fn with_cycle_target(mut self, cycles: u32) -> Self {
        self.cycle_target = Some(cycles);
        self
    }

    pub fn weight(&self, class: Priority) -> u32 {
        match class {
            Priority::Urgent => 0,
            Priority::High => self.weight_high,
            Priority::Medium => self.weight_medium,
            Priority::Low => self.weight_low,
        }
    }

    /// Entries in one full pass over the weighted classes.
    pub fn cycle_len(&self) -> u32 {
        self.weight_high + self.weight_medium + self.weight_low
    }

    pub fn cycle_target(&self, expected: u32) -> u32 {
        self.cycle_target.unwrap_or_else(|| {
            expected
                .saturating_sub(self.urgent_count)
                .checked_div(self.cycle_len())
                .unwrap_or(0)
        })
    }
}

/// Inclusive index range of the completion sequence expected to come from one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbitrationWindow {
    pub class: Priority,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifyMode {
    /// Positional check of every class window.
    Windowed,
    /// Urgent-first check plus per-class tallies.
    Coarse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifierState {
    AwaitingUrgent,
    InClassWindow(Priority),
    /// Coarse mode after the urgent window.
    Tallying,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassTally {
    /// Entries whose originating SQ is registered with this class.
    pub observed: u32,
    /// Mismatches in windows of this class.
    pub errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbitrationMismatch {
    pub position: u32,
    /// `None` in the coarse tail, where any weighted class is acceptable.
    pub expected: Option<Priority>,
    pub window: Option<ArbitrationWindow>,
    pub sq_id: u16,
    pub cid: u16,
    /// Registered priority of the originating SQ, `None` if it is not registered.
    pub actual: Option<Priority>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapShortfall {
    pub cq_id: u16,
    pub expected: u32,
    pub reaped: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitrationReport {
    pub mode: VerifyMode,
    pub state: VerifierState,
    pub parameters: ArbitrationParameters,
    pub expected: u32,
    pub consumed: u32,
    /// Entries seen after the run was complete; not checked.
    pub surplus: u32,
    pub loops: u32,
    pub cycle_target: u32,
    /// Indexed by [`Priority::as_index`].
    pub tallies: [ClassTally; 4],
    pub unknown_sq: u32,
    pub mismatches: Vec<ArbitrationMismatch>,
    pub reap_timeout: Option<ReapShortfall>,
}

impl ArbitrationReport {
    pub fn errors(&self, class: Priority) -> u32 {
        self.tallies[class.as_index()].errors
    }

    pub fn observed(&self, class: Priority) -> u32 {
        self.tallies[class.as_index()].observed
    }

    pub fn passed(&self) -> bool {
        self.state == VerifierState::Done
            && self.mismatches.is_empty()
            && self.reap_timeout.is_none()
    }
}

/// Streaming WRRU checker fed one completion at a time, in observed order.
#[derive(Debug, Clone)]
pub struct ArbitrationVerifier {
    params: ArbitrationParameters,
    mode: VerifyMode,
    expected: u32,
    target: u32,
    state: VerifierState,
    window: Option<ArbitrationWindow>,
    class_idx: usize,
    loops: u32,
    consumed: u32,
    surplus: u32,
    tallies: [ClassTally; 4],
    unknown_sq: u32,
    mismatches: Vec<ArbitrationMismatch>,
    reap_timeout: Option<ReapShortfall>,
}

impl ArbitrationVerifier {
    pub fn new(params: ArbitrationParameters, mode: VerifyMode, expected: u32) -> Self {
        let mut v = ArbitrationVerifier {
            params,
            mode,
            expected,
            target: params.cycle_target(expected),
            state: VerifierState::AwaitingUrgent,
            window: None,
            class_idx: 0,
            loops: 0,
            consumed: 0,
            surplus: 0,
            tallies: [ClassTally::default(); 4],
            unknown_sq: 0,
            mismatches: Vec::new(),
            reap_timeout: None,
        };
        if expected == 0 {
            v.state = VerifierState::Done;
        } else if params.urgent_count > 0 {
            v.window = Some(ArbitrationWindow {
                class: Priority::Urgent,
                left: 0,
                right: params.urgent_count - 1,
            });
        } else {
            v.leave_urgent(0);
        }
        tracing::debug!(
            urgent = params.urgent_count,
            order = ?params.priority_execution_order,
            expected,
            cycle_target = v.target,
            ?mode,
            "arbitration check started"
        );
        v
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    pub fn loops(&self) -> u32 {
        self.loops
    }

    /// Feeds the next completion and the registered priority of the SQ that produced it.
    pub fn observe(&mut self, entry: &CompletionEntry, registered: Option<Priority>) {
        if matches!(self.state, VerifierState::Done | VerifierState::Failed) {
            self.surplus += 1;
            return;
        }
        let position = self.consumed;
        self.consumed += 1;
        match registered {
            Some(class) => self.tallies[class.as_index()].observed += 1,
            None => self.unknown_sq += 1,
        }

        match (self.mode, self.state) {
            (_, VerifierState::AwaitingUrgent) | (VerifyMode::Windowed, _) => {
                if let Some(window) = self.window {
                    if registered != Some(window.class) {
                        self.mismatch(
                            position,
                            Some(window.class),
                            Some(window),
                            entry,
                            registered,
                        );
                    }
                    if position == window.right {
                        self.close_window(position);
                    }
                }
            }
            (VerifyMode::Coarse, _) => {
                if matches!(registered, None | Some(Priority::Urgent)) {
                    self.mismatch(position, None, None, entry, registered);
                }
            }
        }

        if self.consumed == self.expected && self.state != VerifierState::Done {
            self.state = VerifierState::Done;
        }
    }

    pub fn observe_all(&mut self, entries: &[CompletionEntry], registry: &QueuePairRegistry) {
        for entry in entries {
            self.observe(entry, registry.sq_priority(entry.sq_identifier));
        }
    }

    /// Marks the run as aborted by an infrastructure failure. Later entries are ignored.
    pub fn fail(&mut self, err: &Error) {
        tracing::error!(error = %err, consumed = self.consumed, "arbitration check aborted");
        self.state = VerifierState::Failed;
    }

    /// Collects the completion sequence by round-robin over `cq_ids` and checks it.
    ///
    /// A reap timeout is recorded in the report and whatever was drained is still checked. Any
    /// other error moves the verifier to [`VerifierState::Failed`] and is returned.
    pub fn collect_and_verify<D: QueuePairDriver + ?Sized>(
        &mut self,
        reaper: &mut CompletionReaper,
        driver: &mut D,
        registry: &QueuePairRegistry,
        cq_ids: &[u16],
    ) -> Result<ReapOutcome> {
        match reaper.collect_round_robin(driver, registry, cq_ids, self.expected) {
            Ok(outcome) => {
                self.observe_all(&outcome.entries, registry);
                Ok(outcome)
            }
            Err(Error::ReapTimeout {
                cq_id,
                expected,
                reaped,
            }) => {
                let partial = reaper.take_partial().unwrap_or_default();
                self.observe_all(&partial.entries, registry);
                self.reap_timeout = Some(ReapShortfall {
                    cq_id,
                    expected,
                    reaped,
                });
                Ok(partial)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    pub fn report(&self) -> ArbitrationReport {
        ArbitrationReport {
            mode: self.mode,
            state: self.state,
            parameters: self.params,
            expected: self.expected,
            consumed: self.consumed,
            surplus: self.surplus,
            loops: self.loops,
            cycle_target: self.target,
            tallies: self.tallies,
            unknown_sq: self.unknown_sq,
            mismatches: self.mismatches.clone(),
            reap_timeout: self.reap_timeout,
        }
    }

    fn mismatch(
        &mut self,
        position: u32,
        expected: Option<Priority>,
        window: Option<ArbitrationWindow>,
        entry: &CompletionEntry,
        actual: Option<Priority>,
    ) {
        if let Some(class) = expected.or(actual) {
            self.tallies[class.as_index()].errors += 1;
        }
        tracing::error!(
            position,
            expected = ?expected,
            left = ?window.map(|w| w.left),
            right = ?window.map(|w| w.right),
            sq_id = entry.sq_identifier,
            cid = entry.command_identifier,
            registered = ?actual,
            "arbitration order mismatch"
        );
        self.mismatches.push(ArbitrationMismatch {
            position,
            expected,
            window,
            sq_id: entry.sq_identifier,
            cid: entry.command_identifier,
            actual,
        });
    }

    fn leave_urgent(&mut self, next_left: u32) {
        self.class_idx = 0;
        match self.mode {
            VerifyMode::Coarse => {
                self.window = None;
                self.state = VerifierState::Tallying;
            }
            VerifyMode::Windowed => self.open_window(next_left),
        }
    }

    fn open_window(&mut self, left: u32) {
        let class = self.params.priority_execution_order[self.class_idx];
        let window = ArbitrationWindow {
            class,
            left,
            right: left + self.params.weight(class).max(1) - 1,
        };
        tracing::trace!(%class, left = window.left, right = window.right, "window opened");
        self.window = Some(window);
        self.state = VerifierState::InClassWindow(class);
    }

    fn close_window(&mut self, right: u32) {
        if self.state == VerifierState::AwaitingUrgent {
            self.leave_urgent(right + 1);
            return;
        }
        self.class_idx += 1;
        if self.class_idx == self.params.priority_execution_order.len() {
            self.class_idx = 0;
            self.loops += 1;
            // A zero target keeps windowing until the expected total is consumed.
            if self.target > 0 && self.loops >= self.target {
                self.window = None;
                self.state = VerifierState::Done;
                return;
            }
        }
        self.open_window(right + 1);
    }
}

/// Checks an already collected sequence.
pub fn verify_sequence(
    params: ArbitrationParameters,
    mode: VerifyMode,
    registry: &QueuePairRegistry,
    entries: &[CompletionEntry],
    expected: u32,
) -> ArbitrationReport {
    let mut v = ArbitrationVerifier::new(params, mode, expected);
    v.observe_all(entries, registry);
    v.report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Queue;

    const LOW: u16 = 1;
    const MEDIUM: u16 = 2;
    const URGENT: u16 = 3;
    const HIGH: u16 = 4;

    fn registry() -> QueuePairRegistry {
        let mut reg = QueuePairRegistry::default();
        for (id, prio) in [
            (LOW, Priority::Low),
            (MEDIUM, Priority::Medium),
            (URGENT, Priority::Urgent),
            (HIGH, Priority::High),
        ] {
            reg.register_queue(Queue::completion(id, 64, Some(id))).unwrap();
            reg.register_queue(Queue::submission(id, id, 64, prio)).unwrap();
        }
        reg
    }

    fn stream(sqs: &[u16]) -> Vec<CompletionEntry> {
        sqs.iter()
            .enumerate()
            .map(|(i, &sq)| CompletionEntry {
                command_identifier: i as u16,
                result: 0,
                phase_bit: true,
                sq_head_pointer: 0,
                sq_identifier: sq,
                status_field: 0,
            })
            .collect()
    }

    fn scenario_a() -> Vec<u16> {
        let mut sqs = vec![URGENT; 4];
        for _ in 0..2 {
            sqs.extend([HIGH, HIGH, HIGH, MEDIUM, MEDIUM, LOW]);
        }
        sqs
    }

    #[test]
    fn clean_two_cycle_stream_passes() {
        let params = ArbitrationParameters::new(4, 3, 2, 1).unwrap();
        assert_eq!(
            params.priority_execution_order,
            [Priority::High, Priority::Medium, Priority::Low]
        );
        let report = verify_sequence(
            params,
            VerifyMode::Windowed,
            &registry(),
            &stream(&scenario_a()),
            16,
        );
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.loops, 2);
        assert_eq!(report.cycle_target, 2);
        assert_eq!(report.consumed, 16);
        for class in [Priority::Urgent, Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(report.errors(class), 0);
        }
    }

    #[test]
    fn medium_low_swap_is_a_soft_mismatch() {
        let mut sqs = scenario_a();
        // First cycle: H H H M M L at positions 4..=9.
        sqs.swap(8, 9);
        let report = verify_sequence(
            ArbitrationParameters::new(4, 3, 2, 1).unwrap(),
            VerifyMode::Windowed,
            &registry(),
            &stream(&sqs),
            16,
        );
        assert_eq!(report.state, VerifierState::Done);
        assert_eq!(report.loops, 2);
        assert_eq!(report.errors(Priority::Low), 1);
        assert_eq!(report.errors(Priority::Medium), 1);
        assert_eq!(report.errors(Priority::Urgent), 0);
        assert_eq!(report.errors(Priority::High), 0);
        assert_eq!(report.observed(Priority::Urgent), 4);
        assert_eq!(report.observed(Priority::High), 6);
        let low = report
            .mismatches
            .iter()
            .find(|m| m.expected == Some(Priority::Low))
            .unwrap();
        assert_eq!(low.position, 9);
        assert_eq!(low.actual, Some(Priority::Medium));
        assert_eq!(
            low.window,
            Some(ArbitrationWindow {
                class: Priority::Low,
                left: 9,
                right: 9
            })
        );
        assert!(!report.passed());
    }

    #[test]
    fn late_urgent_entry_counts_against_the_urgent_window() {
        let mut sqs = scenario_a();
        sqs.swap(3, 4);
        let report = verify_sequence(
            ArbitrationParameters::new(4, 3, 2, 1).unwrap(),
            VerifyMode::Windowed,
            &registry(),
            &stream(&sqs),
            16,
        );
        assert_eq!(report.errors(Priority::Urgent), 1);
        assert_eq!(report.errors(Priority::High), 1);
        assert_eq!(report.state, VerifierState::Done);
    }

    #[test]
    fn exhausted_stream_is_not_done() {
        let sqs = &scenario_a()[..10];
        let report = verify_sequence(
            ArbitrationParameters::new(4, 3, 2, 1).unwrap(),
            VerifyMode::Windowed,
            &registry(),
            &stream(sqs),
            16,
        );
        assert_eq!(report.state, VerifierState::InClassWindow(Priority::High));
        assert_eq!(report.loops, 1);
        assert!(report.mismatches.is_empty());
        assert!(!report.passed());
    }

    #[test]
    fn cycle_target_stops_before_surplus_entries() {
        let mut sqs = scenario_a();
        sqs.extend([LOW, LOW]);
        let params = ArbitrationParameters::new(4, 3, 2, 1)
            .unwrap()
            .with_cycle_target(2);
        let report = verify_sequence(params, VerifyMode::Windowed, &registry(), &stream(&sqs), 18);
        assert!(report.passed());
        assert_eq!(report.surplus, 2);
        assert_eq!(report.consumed, 16);
    }

    #[test]
    fn zero_cycle_target_checks_every_entry() {
        let params = ArbitrationParameters::new(0, 3, 2, 1)
            .unwrap()
            .with_cycle_target(0);
        let reg = registry();

        let report = verify_sequence(
            params,
            VerifyMode::Windowed,
            &reg,
            &stream(&[LOW, LOW, HIGH, HIGH]),
            4,
        );
        assert_eq!(report.cycle_target, 0);
        assert_eq!(report.consumed, 4);
        assert_eq!(report.surplus, 0);
        assert_eq!(
            report.mismatches.iter().map(|m| m.position).collect::<Vec<_>>(),
            vec![0, 1, 3]
        );
        assert_eq!(report.errors(Priority::High), 2);
        assert!(!report.passed());

        let report = verify_sequence(
            params,
            VerifyMode::Windowed,
            &reg,
            &stream(&[HIGH, HIGH, HIGH, MEDIUM]),
            4,
        );
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.state, VerifierState::Done);
        assert_eq!(report.loops, 0);
        assert_eq!(report.surplus, 0);
    }

    #[test]
    fn coarse_mode_only_checks_urgent_prefix() {
        let mut sqs = vec![URGENT; 4];
        sqs.extend([LOW, HIGH, MEDIUM, HIGH, LOW, HIGH]);
        let reg = registry();
        let params = ArbitrationParameters::new(4, 3, 2, 1).unwrap();
        let report = verify_sequence(params, VerifyMode::Coarse, &reg, &stream(&sqs), 10);
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.observed(Priority::High), 3);
        assert_eq!(report.observed(Priority::Low), 2);

        sqs[1] = HIGH;
        sqs.push(URGENT);
        sqs.push(9);
        let report = verify_sequence(params, VerifyMode::Coarse, &reg, &stream(&sqs), 12);
        assert_eq!(report.state, VerifierState::Done);
        assert_eq!(report.errors(Priority::Urgent), 2);
        assert_eq!(report.unknown_sq, 1);
        assert_eq!(report.mismatches.len(), 3);
    }

    #[test]
    fn order_ties_break_high_medium_low() {
        assert_eq!(
            derive_order(2, 2, 2),
            [Priority::High, Priority::Medium, Priority::Low]
        );
        assert_eq!(
            derive_order(1, 4, 4),
            [Priority::Medium, Priority::Low, Priority::High]
        );
        assert_eq!(
            derive_order(3, 1, 8),
            [Priority::Low, Priority::High, Priority::Medium]
        );
    }

    #[test]
    fn feature_value_layout() {
        let f = ArbitrationFeature::new(2, 3, 2, 1).unwrap();
        assert_eq!(f.encode(), 2 << 24 | 1 << 16 | 0 << 8 | 2);
        assert_eq!(ArbitrationFeature::decode(f.encode()), f);
        assert_eq!(f.weight(Priority::High), 3);
        assert_eq!(f.burst_len(), Some(4));
        assert_eq!(
            ArbitrationFeature::new(7, 256, 1, 1).unwrap().burst_len(),
            None
        );
        assert!(ArbitrationFeature::new(0, 0, 1, 1).is_err());
        assert!(ArbitrationFeature::new(0, 257, 1, 1).is_err());
        assert!(ArbitrationFeature::new(8, 1, 1, 1).is_err());

        let p = ArbitrationParameters::from_feature(4, &f);
        assert_eq!(p, ArbitrationParameters::new(4, 3, 2, 1).unwrap());
        assert_eq!(p.cycle_target(16), 2);
        assert_eq!(p.cycle_target(3), 0);
    }
}
