//! Command arbitration across I/O submission queues.

use std::collections::BTreeMap;

use qpair_harness::{derive_order, ArbitrationFeature, Priority};

/// How the emulated controller picks the next submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbiterMode {
    /// Follow CC.AMS and the Arbitration feature.
    #[default]
    FollowController,
    /// Plain round robin regardless of CC.AMS.
    RoundRobin,
    /// WRRU with a fixed weighted class order instead of the weight-derived one.
    ForcedOrder([Priority; 3]),
}

/// Per-SQ view the arbiter needs: priority and number of fetchable commands.
pub(crate) type Candidates = BTreeMap<u16, (Priority, u16)>;

#[derive(Debug, Default)]
struct ClassCursor {
    current: Option<u16>,
    taken: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Arbiter {
    /// Index into the weighted class order.
    class_idx: usize,
    credit: u32,
    cursors: [ClassCursor; 4],
    rr_cursor: ClassCursor,
}

impl Arbiter {
    pub fn reset(&mut self) {
        *self = Arbiter::default();
    }

    /// The same class order the verifier expects.
    fn weighted_order(feature: &ArbitrationFeature) -> [Priority; 3] {
        derive_order(
            feature.weight(Priority::High),
            feature.weight(Priority::Medium),
            feature.weight(Priority::Low),
        )
    }

    pub fn pick(
        &mut self,
        candidates: &Candidates,
        wrru: bool,
        mode: ArbiterMode,
        feature: &ArbitrationFeature,
    ) -> Option<u16> {
        let burst = feature.burst_len();
        let order = match mode {
            ArbiterMode::RoundRobin => None,
            ArbiterMode::ForcedOrder(order) => Some(order),
            ArbiterMode::FollowController if wrru => Some(Self::weighted_order(feature)),
            ArbiterMode::FollowController => None,
        };
        let Some(order) = order else {
            return next_in(&mut self.rr_cursor, candidates, |_| true, burst);
        };

        if let Some(sq) = next_in(
            &mut self.cursors[Priority::Urgent.as_index()],
            candidates,
            |p| p == Priority::Urgent,
            burst,
        ) {
            return Some(sq);
        }

        // Visit each class at most once per call; a class with nothing to fetch forfeits its turn.
        for _ in 0..=order.len() {
            let class = order[self.class_idx];
            if self.credit == 0 {
                self.credit = feature.weight(class);
            }
            let picked = next_in(
                &mut self.cursors[class.as_index()],
                candidates,
                |p| p == class,
                burst,
            );
            match picked {
                Some(sq) => {
                    self.credit -= 1;
                    if self.credit == 0 {
                        self.class_idx = (self.class_idx + 1) % order.len();
                    }
                    return Some(sq);
                }
                None => {
                    self.credit = 0;
                    self.class_idx = (self.class_idx + 1) % order.len();
                }
            }
        }
        None
    }
}

/// Round robin with burst inside the set of queues accepted by `filter`.
fn next_in(
    cursor: &mut ClassCursor,
    candidates: &Candidates,
    filter: impl Fn(Priority) -> bool,
    burst: Option<u32>,
) -> Option<u16> {
    let ready = |sq: &u16| {
        candidates
            .get(sq)
            .is_some_and(|&(p, pending)| filter(p) && pending > 0)
    };

    if let Some(cur) = cursor.current {
        if ready(&cur) && burst.map_or(true, |b| cursor.taken < b) {
            cursor.taken += 1;
            return Some(cur);
        }
    }

    let after = cursor.current.map_or(0, |c| c.wrapping_add(1));
    let next = candidates
        .range(after..)
        .map(|(id, _)| *id)
        .chain(candidates.range(..after).map(|(id, _)| *id))
        .find(|id| ready(id))?;
    cursor.current = Some(next);
    cursor.taken = 1;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(queues: &[(u16, Priority, u16)]) -> Candidates {
        queues.iter().map(|&(id, p, n)| (id, (p, n))).collect()
    }

    /// Runs the arbiter to exhaustion and returns the SQ chosen for each command.
    fn drain(
        arb: &mut Arbiter,
        mut c: Candidates,
        wrru: bool,
        mode: ArbiterMode,
        f: &ArbitrationFeature,
    ) -> Vec<u16> {
        let mut out = Vec::new();
        while let Some(sq) = arb.pick(&c, wrru, mode, f) {
            out.push(sq);
            let entry = c.get_mut(&sq).unwrap();
            entry.1 -= 1;
        }
        out
    }

    #[test]
    fn wrru_serves_urgent_then_weighted_bursts() {
        let f = ArbitrationFeature::new(7, 3, 2, 1).unwrap();
        let c = candidates(&[
            (1, Priority::Low, 2),
            (2, Priority::Medium, 4),
            (3, Priority::Urgent, 2),
            (4, Priority::High, 6),
        ]);
        let order = drain(&mut Arbiter::default(), c, true, ArbiterMode::FollowController, &f);
        assert_eq!(order, vec![3, 3, 4, 4, 4, 2, 2, 1, 4, 4, 4, 2, 2, 1]);
    }

    #[test]
    fn equal_weights_follow_the_verifier_tie_break() {
        let f = ArbitrationFeature::new(7, 1, 4, 4).unwrap();
        assert_eq!(Arbiter::weighted_order(&f), derive_order(1, 4, 4));
        let c = candidates(&[
            (1, Priority::Low, 4),
            (2, Priority::Medium, 4),
            (4, Priority::High, 1),
        ]);
        let order = drain(&mut Arbiter::default(), c, true, ArbiterMode::FollowController, &f);
        assert_eq!(order, vec![2, 2, 2, 2, 1, 1, 1, 1, 4]);
    }

    #[test]
    fn dry_class_forfeits_its_turn() {
        let f = ArbitrationFeature::new(7, 2, 2, 2).unwrap();
        let c = candidates(&[(1, Priority::Low, 3), (4, Priority::High, 2)]);
        let order = drain(&mut Arbiter::default(), c, true, ArbiterMode::FollowController, &f);
        assert_eq!(order, vec![4, 4, 1, 1, 1]);
    }

    #[test]
    fn burst_limits_each_queue_within_a_class() {
        // AB = 0: one command per queue per turn.
        let f = ArbitrationFeature::new(0, 4, 1, 1).unwrap();
        let c = candidates(&[(4, Priority::High, 2), (5, Priority::High, 2)]);
        let order = drain(&mut Arbiter::default(), c, true, ArbiterMode::FollowController, &f);
        assert_eq!(order, vec![4, 5, 4, 5]);
    }

    #[test]
    fn round_robin_ignores_priority() {
        let f = ArbitrationFeature::new(0, 3, 2, 1).unwrap();
        let c = candidates(&[
            (1, Priority::Low, 2),
            (3, Priority::Urgent, 2),
            (4, Priority::High, 1),
        ]);
        let order = drain(&mut Arbiter::default(), c, false, ArbiterMode::FollowController, &f);
        assert_eq!(order, vec![1, 3, 4, 1, 3]);
        let c = candidates(&[(1, Priority::Low, 1), (3, Priority::Urgent, 1)]);
        let order = drain(&mut Arbiter::default(), c, true, ArbiterMode::RoundRobin, &f);
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn forced_order_overrides_weights() {
        let f = ArbitrationFeature::new(7, 2, 1, 1).unwrap();
        let c = candidates(&[
            (1, Priority::Low, 1),
            (2, Priority::Medium, 1),
            (4, Priority::High, 2),
        ]);
        let mode = ArbiterMode::ForcedOrder([Priority::Low, Priority::Medium, Priority::High]);
        let order = drain(&mut Arbiter::default(), c, true, mode, &f);
        assert_eq!(order, vec![1, 2, 4, 4]);
    }
}
