//! Scenario testing with mandatory oracles.
//!
//! A scenario describes a link configuration, a device (possibly faulty) and
//! a schedule of host actions. Running it steps a [`World`] on a virtual clock
//! and hands the final world to an oracle that decides pass or fail.

mod builder;
pub mod oracle;
mod world;

pub use builder::{Action, RunnableScenario, Scenario, Trigger};
pub use world::World;

/// Verifies the final world state.
pub type OracleFn = Box<dyn Fn(&World) -> Result<(), String>>;
