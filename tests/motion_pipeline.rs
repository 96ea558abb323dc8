//! MotionCore end-to-end: the first frame seeds a baseline with no event,
//! a static repeat never fires an event, and a changed frame above
//! threshold produces a `changes` event with the expected pixel count.

use vtbus::motion::{MotionConfig, MotionCore};

fn frame(dx: usize, dy: usize, value: u8) -> Vec<u8> {
    vec![value; dx * dy]
}

#[test]
fn static_input_never_produces_an_event() {
    let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..MotionConfig::default() });
    let still = frame(8, 8, 128);

    let first = core.process(&still, 8, 8, 1_700_000_000).expect("first frame");
    assert!(first.event.is_none());

    for t in 1..5 {
        let outcome = core.process(&still, 8, 8, 1_700_000_000 + t).expect("repeat frame");
        assert!(outcome.event.is_none(), "identical frames must never produce a motion event");
        assert_eq!(outcome.count, 0);
    }
}

#[test]
fn a_changed_region_above_threshold_fires_an_event() {
    let mut core = MotionCore::new(MotionConfig { squelch: 5, threshold: 1, ..MotionConfig::default() });
    let dx = 4;
    let dy = 4;
    let baseline = frame(dx, dy, 0);
    core.process(&baseline, dx, dy, 1_700_000_000).expect("baseline");

    let mut changed = baseline.clone();
    changed[0] = 200;
    let outcome = core.process(&changed, dx, dy, 1_700_000_001).expect("changed frame");

    assert_eq!(outcome.count, 1);
    let event = outcome.event.expect("event fires once count >= threshold");
    assert_eq!(event.count, 1);
    assert_eq!(event.dx, dx);
    assert_eq!(event.dy, dy);
    assert_eq!(event.repeat, 0);
}

#[test]
fn repeat_event_increments_repeat_count_until_a_new_frame_clears_it() {
    let mut core = MotionCore::new(MotionConfig { squelch: 5, threshold: 1, ..MotionConfig::default() });
    let dx = 2;
    let dy = 2;
    core.process(&frame(dx, dy, 0), dx, dy, 1_700_000_000).expect("baseline");
    let mut changed = frame(dx, dy, 0);
    changed[0] = 255;
    core.process(&changed, dx, dy, 1_700_000_001).expect("changed frame");

    let first_repeat = core.repeat_event(1_700_000_002).expect("repeat after event");
    assert_eq!(first_repeat.repeat, 1);
    let second_repeat = core.repeat_event(1_700_000_003).expect("second repeat");
    assert_eq!(second_repeat.repeat, 2);

    core.process(&frame(dx, dy, 0), dx, dy, 1_700_000_004).expect("back to baseline");
    assert!(core.repeat_event(1_700_000_005).is_none(), "a non-triggering frame clears the repeat state");
}

#[test]
fn apply_command_updates_squelch_and_threshold_live() {
    let mut core = MotionCore::new(MotionConfig::default());
    core.apply_command("squelch=42;threshold=7");
    assert_eq!(core.config().squelch, 42);
    assert_eq!(core.config().threshold, 7);

    core.apply_command("equalise=on");
    assert!(core.config().equalise);
    core.apply_command("equalise=off");
    assert!(!core.config().equalise);

    // malformed and unknown tokens are skipped, not rejected wholesale
    core.apply_command("bogus;squelch=9");
    assert_eq!(core.config().squelch, 9);
}
