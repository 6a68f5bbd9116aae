use oven_core::overtemp::{AlarmTransition, OverTempConfig, OverTempMonitor};

#[test]
fn alarm_enters_on_either_reading_and_clears_only_when_both_recover() {
    let mut monitor = OverTempMonitor::new(OverTempConfig::new(1500, 400, 0.75));

    let transitions = [
        monitor.observe(2000, 2000),
        monitor.observe(1400, 2000),
        monitor.observe(1600, 2000),
        monitor.observe(2000, 2000),
    ];

    assert_eq!(
        transitions,
        [
            AlarmTransition::Initialized,
            AlarmTransition::Entered,
            AlarmTransition::Unchanged,
            AlarmTransition::Cleared,
        ]
    );
    assert_eq!(monitor.in_alarm(), Some(false));
}

#[test]
fn steady_readings_produce_no_repeated_edges() {
    let mut monitor = OverTempMonitor::new(OverTempConfig::default());
    monitor.observe(2000, 2000);

    let mut edges = 0;
    for reading in [1200, 1300, 1250, 1800, 1850, 1899, 1950, 1960, 1970] {
        let transition = monitor.observe(reading, 2500);
        if matches!(
            transition,
            AlarmTransition::Entered | AlarmTransition::Cleared
        ) {
            edges += 1;
        }
    }

    assert_eq!(edges, 2, "expected exactly one entry and one exit");
    assert_eq!(monitor.in_alarm(), Some(false));
}

#[test]
fn second_thermistor_alone_can_hold_the_alarm() {
    let mut monitor = OverTempMonitor::new(OverTempConfig::default());
    monitor.observe(2000, 2000);
    assert_eq!(monitor.observe(2000, 1000), AlarmTransition::Entered);
    assert_eq!(monitor.observe(2500, 1800), AlarmTransition::Unchanged);
    assert_eq!(monitor.observe(2500, 1950), AlarmTransition::Cleared);
}
