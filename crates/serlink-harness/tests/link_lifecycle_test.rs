//! Link faults and host-initiated disconnects.

use std::time::Duration;

use serlink_core::{LinkConfig, LinkError, SessionEvent, SessionState};
use serlink_harness::{
    CaptureTransport, DeviceFaults,
    scenario::{Action, Scenario, Trigger, World, oracle},
};

fn small_chunks() -> LinkConfig {
    LinkConfig { max_payload: 300, ..Default::default() }
}

#[test]
fn link_error_mid_transfer_fails_transfer_then_device() {
    let mut world = World::new(small_chunks(), DeviceFaults::default(), 0).unwrap();
    world.run_until(Duration::from_millis(10), |world| world.connects() == 1);
    world.start_transfer(vec![0u8; 1000]).unwrap();
    world.step();

    world.link_error("device unplugged");

    let tail: Vec<SessionEvent> =
        world.events().iter().rev().take(2).rev().map(|(_, event)| event.clone()).collect();
    assert_eq!(
        tail,
        vec![SessionEvent::TransferComplete { success: false }, SessionEvent::DeviceConnected(false)]
    );
    assert_eq!(world.state(), SessionState::Disconnected);
    assert!(world.connection().is_closed());

    assert!(matches!(world.start_transfer(vec![1u8]), Err(LinkError::Closed)));
    assert!(matches!(world.start_handshake(), Err(LinkError::Closed)));
    assert!(world.cancel().is_ok());

    // Nothing moves once closed
    let events = world.events().len();
    world.run_for(Duration::from_secs(1));
    assert_eq!(world.events().len(), events);
}

#[test]
fn write_failure_closes_link() {
    let result = Scenario::new("adapter unplugged mid transfer")
        .config(small_chunks())
        .upload(vec![0u8; 1000])
        .on(Trigger::ChunksAcked(1), Action::Unplug)
        .run_for(Duration::from_secs(1))
        .oracle(oracle::all_of(vec![
            oracle::transfer_finished(false),
            oracle::final_state(SessionState::Disconnected),
            oracle::check(|world: &World| {
                if world.disconnects() != 1 {
                    return Err(format!("expected one disconnect, got {}", world.disconnects()));
                }
                match world.errors() {
                    [(_, error)] if error.starts_with("transport fault") => Ok(()),
                    errors => Err(format!("expected one transport fault, got {errors:?}")),
                }
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn disconnect_while_handshaking_reports_nothing() {
    let result = Scenario::new("disconnect before connect")
        .faults(DeviceFaults { ignore_probes: u64::MAX, ..Default::default() })
        .on(Trigger::At(Duration::from_millis(150)), Action::Disconnect)
        .run_for(Duration::from_secs(1))
        .oracle(oracle::all_of(vec![
            oracle::final_state(SessionState::Disconnected),
            oracle::no_errors(),
            oracle::check(|world: &World| {
                if !world.events().is_empty() {
                    return Err(format!("no events expected, got {:?}", world.events()));
                }
                if world.device().stats().probes != 2 {
                    return Err(format!("expected 2 probes, got {}", world.device().stats().probes));
                }
                Ok(())
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn disconnect_when_connected_reports_device_lost() {
    let result = Scenario::new("disconnect after connect")
        .on(Trigger::At(Duration::from_millis(50)), Action::Disconnect)
        .on(Trigger::At(Duration::from_millis(60)), Action::LinkError("late".to_string()))
        .run_for(Duration::from_millis(200))
        .oracle(oracle::all_of(vec![
            oracle::final_state(SessionState::Disconnected),
            oracle::check(|world: &World| {
                if world.connects() != 1 || world.disconnects() != 1 {
                    return Err(format!("unexpected events: {:?}", world.events()));
                }
                Ok(())
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn open_fails_when_first_write_fails() {
    let result = World::with_transport(
        LinkConfig::default(),
        DeviceFaults::default(),
        0,
        CaptureTransport::failing_after(0),
    );

    assert!(matches!(result, Err(LinkError::Transport(_))));
}

#[test]
fn bytes_written_are_counted() {
    let mut world = World::new(small_chunks(), DeviceFaults::default(), 0).unwrap();
    world.run_until(Duration::from_millis(10), |world| world.connects() == 1);
    world.start_transfer(vec![0u8; 1000]).unwrap();
    world.run_for(Duration::from_millis(50));

    let stats = world.connection().stats();
    assert_eq!(stats.bytes_written as usize, world.connection().transport().total_bytes());
    // Probe, size, four chunks
    assert_eq!(stats.frames_sent, 6);
    assert!(stats.bytes_written > 1000);
}
