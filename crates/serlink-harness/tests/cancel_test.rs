//! Cancel scenarios: late results after a cancel must be no-ops.

use std::time::Duration;

use serlink_core::{LinkConfig, SessionState};
use serlink_harness::{
    DeviceFaults,
    scenario::{Action, Scenario, Trigger, World, oracle},
};

fn file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

fn small_chunks() -> LinkConfig {
    LinkConfig { max_payload: 300, ..Default::default() }
}

#[test]
fn cancel_after_second_chunk() {
    let result = Scenario::new("cancel after chunk 2")
        .config(small_chunks())
        .upload(file(1000))
        .on(Trigger::ChunksAcked(2), Action::Cancel)
        .run_for(Duration::from_secs(1))
        .oracle(oracle::all_of(vec![
            oracle::progress(vec![300, 300]),
            oracle::transfer_finished(false),
            oracle::final_state(SessionState::Connected),
            oracle::no_errors(),
            oracle::check(|world: &World| {
                // The third chunk was already on the wire; its ack arrives
                // after the cancel and must change nothing
                if world.device().chunks_in_upload() != 3 {
                    return Err(format!(
                        "device should hold 3 chunks, got {}",
                        world.device().chunks_in_upload()
                    ));
                }
                Ok(())
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn cancel_sends_nothing_further() {
    let mut world = World::new(small_chunks(), DeviceFaults::default(), 0).unwrap();
    world.run_until(Duration::from_millis(10), |world| world.connects() == 1);
    world.start_transfer(file(1000)).unwrap();
    world.run_until(Duration::from_millis(10), |world| world.progress().len() == 2);

    world.cancel().unwrap();
    let frames_at_cancel = world.connection().stats().frames_sent;
    world.run_for(Duration::from_secs(10));

    assert_eq!(world.connection().stats().frames_sent, frames_at_cancel);
    assert_eq!(world.transfer_results(), vec![false]);
    assert_eq!(world.progress().len(), 2);
    assert_eq!(world.state(), SessionState::Connected);
}

#[test]
fn late_timeout_after_cancel_is_ignored() {
    // Device never acks chunk 2, so its query is still pending at cancel and
    // times out five seconds later
    let result = Scenario::new("timeout after cancel")
        .config(small_chunks())
        .faults(DeviceFaults { stop_acking_after: Some(2), ..Default::default() })
        .upload(file(1000))
        .on(Trigger::ChunksAcked(2), Action::Cancel)
        .run_for(Duration::from_secs(10))
        .oracle(oracle::all_of(vec![
            oracle::transfer_finished(false),
            oracle::final_state(SessionState::Connected),
            oracle::check(|world: &World| {
                let timeouts = world.connection().stats().queries.timeouts;
                if timeouts != 1 {
                    return Err(format!("stale chunk query should time out once, got {timeouts}"));
                }
                if world.events().len() != 4 {
                    return Err(format!("unexpected events: {:?}", world.events()));
                }
                Ok(())
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn new_upload_after_cancel_succeeds() {
    let second = file(450);
    let result = Scenario::new("upload again after cancel")
        .config(small_chunks())
        .upload(file(1000))
        .on(Trigger::ChunksAcked(1), Action::Cancel)
        .on(Trigger::At(Duration::from_millis(200)), Action::Upload(second.clone().into()))
        .run_for(Duration::from_secs(1))
        .oracle(oracle::all_of(vec![
            oracle::device_received(second),
            oracle::final_state(SessionState::Connected),
            oracle::check(|world: &World| {
                if world.transfer_results() != vec![false, true] {
                    return Err(format!("unexpected results: {:?}", world.transfer_results()));
                }
                if world.progress() != vec![300, 300, 150] {
                    return Err(format!("unexpected progress: {:?}", world.progress()));
                }
                Ok(())
            }),
        ]))
        .run();

    assert!(result.is_ok(), "scenario failed: {:?}", result);
}

#[test]
fn cancel_while_idle_is_a_no_op() {
    let mut world = World::new(small_chunks(), DeviceFaults::default(), 0).unwrap();
    world.run_until(Duration::from_millis(10), |world| world.connects() == 1);
    let events = world.events().len();

    world.cancel().unwrap();
    world.cancel().unwrap();

    assert_eq!(world.state(), SessionState::Connected);
    assert_eq!(world.events().len(), events);
}
