//! World state for scenario execution.
//!
//! The World owns both ends of a simulated serial link (the host
//! [`Connection`] and a [`SimDevice`]) and a virtual clock. Each step moves
//! the bytes written so far across the line in both directions, then advances
//! the clock by one tick. Nothing sleeps; a ten second timeout costs ten
//! thousand steps of pure computation.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serlink_core::{Connection, LinkConfig, LinkError, SessionEvent, SessionState};
use serlink_proto::{Frame, Tag};

use crate::{
    capture::CaptureTransport,
    sim_device::{DeviceFaults, SimDevice},
};

/// World state: host, device and timeline.
#[derive(Debug)]
pub struct World {
    connection: Connection<CaptureTransport>,
    device: SimDevice,
    start: Instant,
    now: Instant,
    tick: Duration,
    events: Vec<(Duration, SessionEvent)>,
    unclaimed: Vec<(Duration, Frame)>,
    errors: Vec<(Duration, String)>,
}

impl World {
    /// Open a link to a device injecting `faults`.
    ///
    /// The host writes its first probe immediately; it reaches the device on
    /// the first step.
    pub fn new(config: LinkConfig, faults: DeviceFaults, seed: u64) -> Result<Self, LinkError> {
        Self::with_transport(config, faults, seed, CaptureTransport::new())
    }

    /// Like [`Self::new`], with a specific host transport.
    pub fn with_transport(
        config: LinkConfig,
        faults: DeviceFaults,
        seed: u64,
        transport: CaptureTransport,
    ) -> Result<Self, LinkError> {
        let start = Instant::now();
        let tick = config.tick_interval;
        let device = SimDevice::with_faults(config.tags, faults, seed);
        let connection = Connection::open(transport, config, start)?;

        Ok(Self {
            connection,
            device,
            start,
            now: start,
            tick,
            events: Vec::new(),
            unclaimed: Vec::new(),
            errors: Vec::new(),
        })
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Virtual time since the world was created.
    pub fn elapsed(&self) -> Duration {
        self.now.duration_since(self.start)
    }

    /// One tick: exchange bytes, advance the clock, tick the host.
    pub fn step(&mut self) {
        self.exchange();
        self.now += self.tick;
        if !self.connection.is_closed() {
            let result = self.connection.tick(self.now);
            self.record(result);
        }
        self.collect_events();
    }

    /// Step until `duration` of virtual time has passed.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.step();
        }
    }

    /// Step until `done` holds or `limit` passes. Returns whether `done` held.
    pub fn run_until(&mut self, limit: Duration, done: impl Fn(&World) -> bool) -> bool {
        let until = self.now + limit;
        while self.now < until {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Ask the host to upload `data`.
    pub fn start_transfer(&mut self, data: impl Into<Bytes>) -> Result<(), LinkError> {
        let result = self.connection.start_transfer(data, self.now);
        self.collect_events();
        result
    }

    /// Send a fire-and-forget frame from the host.
    pub fn send(&mut self, tag: Tag, payload: impl Into<Bytes>) -> Result<(), LinkError> {
        let result = self.connection.send(tag, payload, self.now);
        self.collect_events();
        result
    }

    /// Cancel whatever the host is doing.
    pub fn cancel(&mut self) -> Result<(), LinkError> {
        let result = self.connection.cancel(self.now);
        self.collect_events();
        result
    }

    /// Restart the handshake after a cancel.
    pub fn start_handshake(&mut self) -> Result<(), LinkError> {
        let result = self.connection.start_handshake(self.now);
        self.collect_events();
        result
    }

    /// Report a link fault to the host.
    pub fn link_error(&mut self, reason: &str) {
        self.connection.link_error(reason);
        self.collect_events();
    }

    /// Close the host side.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        self.collect_events();
    }

    /// Make the host's next write fail.
    pub fn unplug(&mut self) {
        self.connection.transport_mut().unplug();
    }

    /// Host connection.
    pub fn connection(&self) -> &Connection<CaptureTransport> {
        &self.connection
    }

    /// Simulated device.
    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    /// Host session state.
    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    /// Every event the host emitted, stamped with virtual time.
    pub fn events(&self) -> &[(Duration, SessionEvent)] {
        &self.events
    }

    /// Inbound frames nobody on the host claimed, stamped with virtual time.
    pub fn unclaimed(&self) -> &[(Duration, Frame)] {
        &self.unclaimed
    }

    /// Errors returned by host calls during stepping.
    pub fn errors(&self) -> &[(Duration, String)] {
        &self.errors
    }

    /// `DeviceConnected(true)` events so far.
    pub fn connects(&self) -> usize {
        self.count(|event| *event == SessionEvent::DeviceConnected(true))
    }

    /// `DeviceConnected(false)` events so far.
    pub fn disconnects(&self) -> usize {
        self.count(|event| *event == SessionEvent::DeviceConnected(false))
    }

    /// Acknowledged chunk sizes, in order.
    pub fn progress(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                SessionEvent::TransferProgress { chunk_len, .. } => Some(*chunk_len),
                _ => None,
            })
            .collect()
    }

    /// Outcomes of finished transfers, in order.
    pub fn transfer_results(&self) -> Vec<bool> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                SessionEvent::TransferComplete { success } => Some(*success),
                _ => None,
            })
            .collect()
    }

    /// Virtual time of the first event matching `pred`.
    pub fn first_event_at(&self, pred: impl Fn(&SessionEvent) -> bool) -> Option<Duration> {
        self.events.iter().find(|(_, event)| pred(event)).map(|(at, _)| *at)
    }

    fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.iter().filter(|(_, event)| pred(event)).count()
    }

    fn exchange(&mut self) {
        if self.connection.is_closed() {
            return;
        }

        let host_bytes = self.connection.transport_mut().take();
        if !host_bytes.is_empty() {
            self.device.receive(&host_bytes);
        }

        let reply = self.device.take_output();
        if !reply.is_empty() {
            let result = self.connection.receive(&reply, self.now);
            self.record(result);
        }
        self.collect_events();
    }

    fn record(&mut self, result: Result<(), LinkError>) {
        if let Err(error) = result {
            tracing::debug!(%error, "host call failed");
            self.errors.push((self.elapsed(), error.to_string()));
        }
    }

    fn collect_events(&mut self) {
        let at = self.elapsed();
        for event in self.connection.drain_events() {
            self.events.push((at, event));
        }
        for frame in self.connection.drain_unclaimed() {
            self.unclaimed.push((at, frame));
        }
    }
}
