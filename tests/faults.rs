//! Collaborator faults must degrade to placeholders, never to panics or
//! hangs.

mod common;

use std::time::Duration;

use common::{SyntheticSource, TIMEOUT, frame_number_of, open_engine, wait_until};

#[test]
fn demux_fault_leaves_remaining_snapshots_as_placeholders() {
    common::init_logging();
    // Enough packets for the first few GOPs only.
    let source = SyntheticSource::default().failing_demux_after(60);
    let (mut engine, probe) = open_engine(source, 10.0, 25.0);
    let viewer = engine.create_viewer(0.0).expect("Failed to create viewer");

    assert!(wait_until(TIMEOUT, || {
        common::Probe::get(&probe.packets_read) >= 60 && engine.statistics().pending_frames == 0
    }));
    std::thread::sleep(Duration::from_millis(50));

    let snapshots = viewer.snapshots(0.0).expect("snapshots");
    assert_eq!(snapshots.len(), 26);
    assert!(snapshots.iter().any(|snapshot| !snapshot.is_ready()));
    assert!(snapshots[0].is_ready());
    for snapshot in snapshots.iter().filter(|snapshot| snapshot.is_ready()) {
        // The last ready index may hold the closest frame read before the fault.
        let frame = frame_number_of(&snapshot.image().expect("image"));
        assert!(frame.abs_diff(u64::from(snapshot.index()) * 10) <= 5, "frame {frame}");
    }

    // The viewer keeps working and the engine still shuts down.
    assert!(viewer.seek(30.0).expect("seek"));
    engine.close();
    assert!(!engine.is_opened());
}

#[test]
fn convert_fault_never_produces_snapshots() {
    let source = SyntheticSource::default().failing_convert();
    let (mut engine, probe) = open_engine(source, 10.0, 25.0);
    let viewer = engine.create_viewer(0.0).expect("Failed to create viewer");

    assert!(wait_until(TIMEOUT, || common::Probe::get(&probe.frames_decoded) > 0));
    std::thread::sleep(Duration::from_millis(50));

    let snapshots = viewer.snapshots(0.0).expect("snapshots");
    assert!(snapshots.iter().all(|snapshot| !snapshot.is_ready()));
    assert_eq!(engine.statistics().ready_snapshots, 0);
    assert_eq!(common::Probe::get(&probe.conversions), 0);

    engine.close();
    assert_eq!(engine.statistics().pending_frames, 0);
}

#[test]
fn decoding_stalls_while_frames_wait_for_conversion() {
    let source = SyntheticSource::default().failing_convert();
    let (engine, probe) = open_engine(source, 10.0, 25.0);
    let _viewer = engine.create_viewer(0.0).expect("Failed to create viewer");

    assert!(wait_until(TIMEOUT, || common::Probe::get(&probe.frames_decoded) > 0));
    std::thread::sleep(Duration::from_millis(100));
    let decoded = common::Probe::get(&probe.frames_decoded);
    std::thread::sleep(Duration::from_millis(100));

    // Without a converter the in-flight bound stops the decoder.
    assert_eq!(common::Probe::get(&probe.frames_decoded), decoded);
    assert!(decoded < 500, "decoded {decoded} frame(s)");
}
