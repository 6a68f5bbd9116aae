use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use oven_controller::manager::SequenceManager;
use oven_controller::runner::{RunnerPhase, ZoneOutput};
use oven_core::{SequenceCollection, Step, ZoneId};
use parking_lot::Mutex;

const POLL: Duration = Duration::from_millis(10);

type Log = Arc<Mutex<Vec<(ZoneId, u8, Instant)>>>;

fn zone(number: u8) -> ZoneId {
    ZoneId::new(number).expect("zone")
}

fn recording_output() -> (ZoneOutput, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (
        Arc::new(move |zone, power, _| sink.lock().push((zone, power, Instant::now()))),
        log,
    )
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn powers_for(log: &Log, zone: ZoneId) -> Vec<u8> {
    log.lock()
        .iter()
        .filter(|(logged, _, _)| *logged == zone)
        .map(|(_, power, _)| *power)
        .collect()
}

#[test]
fn cook_completes_after_the_longest_zone() {
    let mut program = SequenceCollection::zeroed();
    program
        .set_step(zone(1), 0, Step::new(40, 0.1))
        .expect("step");
    program
        .set_step(zone(2), 0, Step::new(70, 0.1))
        .expect("step");
    program
        .set_step(zone(2), 1, Step::new(20, 0.2))
        .expect("step");
    program
        .set_step(zone(6), 0, Step::new(100, 0.05))
        .expect("step");

    let (output, log) = recording_output();
    let manager = SequenceManager::from_plan(&program.plan(), &output, POLL);
    assert_eq!(manager.zone_count(), 3);

    let completed_at = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&completed_at);
    manager.set_on_all_complete(move || {
        *sink.lock() = Some(Instant::now());
    });

    let started = Instant::now();
    manager.start_all().expect("start");
    assert!(wait_for(Duration::from_secs(2), || completed_at.lock().is_some()));

    let finished = completed_at.lock().expect("completion time");
    assert!(finished.duration_since(started) >= Duration::from_millis(300));
    assert!(manager.is_complete());
    assert!(
        manager
            .status()
            .values()
            .all(|phase| *phase == RunnerPhase::Complete)
    );

    assert_eq!(powers_for(&log, zone(1)), vec![40, 0]);
    assert_eq!(powers_for(&log, zone(2)), vec![70, 20, 0]);
    assert_eq!(powers_for(&log, zone(6)), vec![100, 0]);
    assert!(powers_for(&log, zone(3)).is_empty());
}

#[test]
fn idle_steps_do_not_hold_a_zone() {
    let mut program = SequenceCollection::zeroed();
    program
        .set_step(zone(4), 0, Step::new(60, 0.05))
        .expect("step");
    program
        .set_step(zone(4), 1, Step::new(0, 5.0))
        .expect("step");
    program
        .set_step(zone(4), 2, Step::new(30, 0.05))
        .expect("step");

    let (output, log) = recording_output();
    let manager = SequenceManager::from_plan(&program.plan(), &output, POLL);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    manager.set_on_all_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.start_all().expect("start");
    assert!(wait_for(Duration::from_secs(1), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(powers_for(&log, zone(4)), vec![60, 30, 0]);
}

#[test]
fn throttled_cook_scales_every_zone() {
    let mut program = SequenceCollection::zeroed();
    for number in [1, 5, 8] {
        program
            .set_step(zone(number), 0, Step::new(80, 1.0))
            .expect("step");
    }

    let (output, log) = recording_output();
    let manager = SequenceManager::from_plan(&program.plan(), &output, POLL);
    manager.start_all().expect("start");
    assert!(wait_for(Duration::from_secs(1), || log.lock().len() >= 3));

    manager.set_power_scale(0.75);
    assert!(wait_for(Duration::from_millis(200), || {
        [1, 5, 8]
            .into_iter()
            .all(|number| powers_for(&log, zone(number)).last() == Some(&60))
    }));

    manager.stop_all();
    assert!(manager.join_all(Duration::from_secs(1)));
    for number in [1, 5, 8] {
        assert_eq!(powers_for(&log, zone(number)).last(), Some(&0));
    }
}
