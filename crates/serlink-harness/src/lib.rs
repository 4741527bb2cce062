//! Deterministic simulation harness for serlink.
//!
//! A simulated device, an in-memory host transport and a scenario runner on a
//! virtual clock, for reproducible tests of the link under scripted and
//! seeded faults.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capture;
pub mod scenario;
pub mod sim_device;

pub use capture::CaptureTransport;
pub use sim_device::{DeviceFaults, DeviceStats, SimDevice};
