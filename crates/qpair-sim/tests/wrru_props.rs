use proptest::prelude::*;
use qpair_harness::{ArbitrationFeature, ArbitrationScenario, HarnessConfig, Priority, VerifyMode};
use qpair_sim::SimDevice;

fn mode_strategy() -> impl Strategy<Value = VerifyMode> {
    prop_oneof![Just(VerifyMode::Windowed), Just(VerifyMode::Coarse)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_wrru_device_passes_its_own_check(
        weights in (1u32..=4, 1u32..=4, 1u32..=4),
        burst in 0u8..=7,
        urgent in 0u32..=3,
        cycles in 1u32..=3,
        extra in (0u32..=2, 0u32..=2, 0u32..=2),
        mode in mode_strategy(),
    ) {
        let (high, medium, low) = weights;
        let feature = ArbitrationFeature::new(burst, high, medium, low).unwrap();
        let commands = [
            urgent,
            high * cycles + extra.0,
            medium * cycles + extra.1,
            low * cycles + extra.2,
        ];
        let scenario = ArbitrationScenario::standard(feature, commands, mode);

        let device = SimDevice::default();
        let mut harness = device.harness(&HarnessConfig::default());
        let report = scenario.run(&mut harness).unwrap();

        prop_assert!(report.passed(), "{:#?}", report);
        prop_assert_eq!(report.reaped, commands.iter().sum::<u32>());
        prop_assert_eq!(report.arbitration.observed(Priority::Urgent), urgent);
        if mode == VerifyMode::Windowed {
            prop_assert!(report.arbitration.loops >= cycles);
        }
        prop_assert_eq!(device.executed().len() as u32, report.reaped);
    }
}
