use crate::{
    decode_completions, derive_order, verify_sequence, ArbitrationParameters, CompletionEntry,
    Priority, Queue, QueuePairRegistry, Status, VerifyMode,
};
use proptest::prelude::*;

const MAX_RAW_RECORDS: usize = 64;

fn raw_buffer_strategy() -> impl Strategy<Value = Vec<u8>> {
    // Includes lengths that are not a multiple of the record size.
    prop::collection::vec(any::<u8>(), 0..=MAX_RAW_RECORDS * 16 + 15)
}

fn weight_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![1u32..=4, Just(1u32), 1u32..=256]
}

fn class_sq(class: Priority) -> u16 {
    match class {
        Priority::Low => 1,
        Priority::Medium => 2,
        Priority::Urgent => 3,
        Priority::High => 4,
    }
}

fn registry() -> QueuePairRegistry {
    let mut reg = QueuePairRegistry::default();
    for class in [
        Priority::Low,
        Priority::Medium,
        Priority::Urgent,
        Priority::High,
    ] {
        let id = class_sq(class);
        reg.register_queue(Queue::completion(id, 1024, Some(id)))
            .unwrap();
        reg.register_queue(Queue::submission(id, id, 1024, class))
            .unwrap();
    }
    reg
}

/// The completion order an ideal WRRU arbiter produces.
fn ideal_stream(params: &ArbitrationParameters, cycles: u32) -> Vec<CompletionEntry> {
    let mut sqs = vec![class_sq(Priority::Urgent); params.urgent_count as usize];
    for _ in 0..cycles {
        for class in params.priority_execution_order {
            sqs.extend(std::iter::repeat(class_sq(class)).take(params.weight(class) as usize));
        }
    }
    sqs.into_iter()
        .enumerate()
        .map(|(i, sq)| CompletionEntry {
            command_identifier: i as u16,
            result: 0,
            phase_bit: true,
            sq_head_pointer: 0,
            sq_identifier: sq,
            status_field: 0,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_decode_is_pure(raw in raw_buffer_strategy()) {
        let first = decode_completions(&raw);
        let second = decode_completions(&raw);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), raw.len() / 16);
        for (entry, chunk) in first.iter().zip(raw.chunks_exact(16)) {
            prop_assert_eq!(&entry.encode()[..4], &chunk[..4]);
            prop_assert_eq!(&entry.encode()[8..], &chunk[8..]);
        }
    }

    #[test]
    fn prop_status_field_round_trips(field in 0u16..0x8000) {
        prop_assert_eq!(Status::from_field(field).to_field(), field);
    }

    #[test]
    fn prop_order_is_descending_by_weight(
        h in weight_strategy(),
        m in weight_strategy(),
        l in weight_strategy(),
    ) {
        let order = derive_order(h, m, l);
        let weight = |p: Priority| match p {
            Priority::High => h,
            Priority::Medium => m,
            _ => l,
        };
        for pair in order.windows(2) {
            prop_assert!(weight(pair[0]) >= weight(pair[1]));
        }
        let mut sorted = order;
        sorted.sort();
        prop_assert_eq!(sorted, [Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn prop_ideal_wrru_stream_passes(
        urgent in 0u32..8,
        h in 1u32..=6,
        m in 1u32..=6,
        l in 1u32..=6,
        cycles in 1u32..5,
    ) {
        let params = ArbitrationParameters::new(urgent, h, m, l).unwrap();
        let stream = ideal_stream(&params, cycles);
        let expected = stream.len() as u32;
        let report = verify_sequence(params, VerifyMode::Windowed, &registry(), &stream, expected);
        prop_assert!(report.passed(), "{:?}", report);
        prop_assert_eq!(report.loops, cycles);

        let coarse = verify_sequence(params, VerifyMode::Coarse, &registry(), &stream, expected);
        prop_assert!(coarse.passed(), "{:?}", coarse);
    }
}
