//! Reusable oracles.

use bytes::Bytes;
use serlink_core::SessionState;

use crate::scenario::{OracleFn, World};

/// Every oracle must pass.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world: &World| oracles.iter().try_for_each(|oracle| oracle(world)))
}

/// The device was reported connected exactly once.
pub fn connected_once() -> OracleFn {
    Box::new(|world: &World| match world.connects() {
        1 => Ok(()),
        n => Err(format!("expected one DeviceConnected(true), got {n}")),
    })
}

/// The session ended in `state`.
pub fn final_state(state: SessionState) -> OracleFn {
    Box::new(move |world: &World| {
        if world.state() == state {
            Ok(())
        } else {
            Err(format!("expected final state {state:?}, got {:?}", world.state()))
        }
    })
}

/// Exactly one transfer finished, with `success`.
pub fn transfer_finished(success: bool) -> OracleFn {
    Box::new(move |world: &World| match world.transfer_results().as_slice() {
        [result] if *result == success => Ok(()),
        results => Err(format!("expected one transfer with success={success}, got {results:?}")),
    })
}

/// The device holds exactly `data`, announced with its length.
pub fn device_received(data: impl Into<Bytes>) -> OracleFn {
    let data = data.into();
    Box::new(move |world: &World| {
        let device = world.device();
        if device.announced_size() != Some(data.len() as u32) {
            return Err(format!(
                "device announced {:?}, expected {}",
                device.announced_size(),
                data.len()
            ));
        }
        if device.file() != &data[..] {
            return Err(format!(
                "device holds {} bytes that differ from the {} uploaded",
                device.file().len(),
                data.len()
            ));
        }
        Ok(())
    })
}

/// Progress reported exactly these chunk sizes.
pub fn progress(expected: Vec<usize>) -> OracleFn {
    Box::new(move |world: &World| {
        let actual = world.progress();
        if actual == expected {
            Ok(())
        } else {
            Err(format!("expected progress {expected:?}, got {actual:?}"))
        }
    })
}

/// No host call failed.
pub fn no_errors() -> OracleFn {
    Box::new(|world: &World| match world.errors() {
        [] => Ok(()),
        errors => Err(format!("host calls failed: {errors:?}")),
    })
}

/// Wrap an ad-hoc check so it composes with [`all_of`].
pub fn check(f: impl Fn(&World) -> Result<(), String> + 'static) -> OracleFn {
    Box::new(f)
}
