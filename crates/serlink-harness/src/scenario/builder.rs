//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern: a scenario cannot run until it has an oracle.

use std::time::Duration;

use bytes::Bytes;
use serlink_core::LinkConfig;

use crate::{
    scenario::{OracleFn, World},
    sim_device::DeviceFaults,
};

/// Something the host does during a scenario.
#[derive(Debug, Clone)]
pub enum Action {
    /// Start uploading these bytes
    Upload(Bytes),
    /// Send a frame without waiting for an answer
    Send {
        /// Frame tag
        tag: u8,
        /// Frame payload
        payload: Bytes,
    },
    /// Cancel the transfer or handshake in progress
    Cancel,
    /// Restart the handshake
    Handshake,
    /// Report a link fault
    LinkError(String),
    /// Close the link
    Disconnect,
    /// Make the next write fail
    Unplug,
}

/// When an [`Action`] fires. Each action fires at most once.
#[derive(Debug, Clone, Copy)]
pub enum Trigger {
    /// At this virtual time
    At(Duration),
    /// As soon as the device is connected
    Connected,
    /// Once this many chunks have been acknowledged
    ChunksAcked(usize),
}

/// Scenario builder.
///
/// Configure the link and the device, schedule host actions, then call
/// `.oracle()` to get a [`RunnableScenario`]. Only a [`RunnableScenario`]
/// can run:
///
/// ```compile_fail
/// use serlink_harness::scenario::Scenario;
///
/// Scenario::new("no oracle").run();
/// ```
pub struct Scenario {
    name: String,
    config: LinkConfig,
    faults: DeviceFaults,
    seed: u64,
    duration: Duration,
    actions: Vec<(Trigger, Action)>,
}

impl Scenario {
    /// Create a scenario with default configuration, a well-behaved device
    /// and a 20 second run.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: LinkConfig::default(),
            faults: DeviceFaults::default(),
            seed: 0,
            duration: Duration::from_secs(20),
            actions: Vec::new(),
        }
    }

    /// Use a custom link configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject device faults.
    pub fn faults(mut self, faults: DeviceFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Seed for random faults.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Virtual time to simulate.
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Schedule an action.
    pub fn on(mut self, trigger: Trigger, action: Action) -> Self {
        self.actions.push((trigger, action));
        self
    }

    /// Upload `data` as soon as the device is connected.
    pub fn upload(self, data: impl Into<Bytes>) -> Self {
        self.on(Trigger::Connected, Action::Upload(data.into()))
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Opens the link, steps the world for the configured duration firing
    /// actions as their triggers match, then runs the oracle on the final
    /// world.
    pub fn run(self) -> Result<(), String> {
        let Scenario { name, config, faults, seed, duration, actions } = self.scenario;

        let mut world = World::new(config, faults, seed)
            .map_err(|e| format!("Scenario '{name}': open failed: {e}"))?;
        let mut pending: Vec<Option<(Trigger, Action)>> = actions.into_iter().map(Some).collect();

        while world.elapsed() < duration {
            for slot in &mut pending {
                let fire = slot.as_ref().is_some_and(|(trigger, _)| triggered(*trigger, &world));
                if !fire {
                    continue;
                }
                if let Some((_, action)) = slot.take() {
                    perform(&mut world, action)
                        .map_err(|e| format!("Scenario '{name}': action failed: {e}"))?;
                }
            }
            world.step();
        }

        (self.oracle)(&world).map_err(|e| format!("Scenario '{name}': {e}"))
    }
}

fn triggered(trigger: Trigger, world: &World) -> bool {
    match trigger {
        Trigger::At(at) => world.elapsed() >= at,
        Trigger::Connected => world.connection().is_connected(),
        Trigger::ChunksAcked(count) => world.progress().len() >= count,
    }
}

fn perform(world: &mut World, action: Action) -> Result<(), serlink_core::LinkError> {
    tracing::debug!(?action, at = ?world.elapsed(), "scenario action");
    match action {
        Action::Upload(data) => world.start_transfer(data),
        Action::Send { tag, payload } => world.send(tag, payload),
        Action::Cancel => world.cancel(),
        Action::Handshake => world.start_handshake(),
        Action::LinkError(reason) => {
            world.link_error(&reason);
            Ok(())
        },
        Action::Disconnect => {
            world.disconnect();
            Ok(())
        },
        Action::Unplug => {
            world.unplug();
            Ok(())
        },
    }
}
