//! Digital-port backed odor bank and shock pin.
//!
//! The rig drives its valves through serializer boards (8 lines each) and the
//! shocker through a single pin of a bit-bang port. Both sit behind the
//! [`DigitalPort`] seam; the concrete port (serial, USB bit-bang, ...) is
//! supplied by whoever builds the device set.
//!
//! Opening and closing a port may block for a noticeable time and is run on
//! the blocking pool. Line writes are a few bytes and happen inline.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::hardware::{odor_line, ChannelStates, Device, DeviceCore, SHOCKER_CHANNEL};

/// Bits per port write for the shocker pin device.
const PIN_PORT_WIDTH: usize = 8;

/// Raw boolean output port.
pub trait DigitalPort: Send {
    fn open(&mut self) -> Result<()>;

    /// Writes one level per line, line 0 first.
    fn write_bits(&mut self, bits: &[bool]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// A port shared between the infrastructure channel that opens it and the
/// output devices writing to it.
pub type SharedPort = Arc<Mutex<Box<dyn DigitalPort>>>;

pub fn share_port(port: Box<dyn DigitalPort>) -> SharedPort {
    Arc::new(Mutex::new(port))
}

async fn run_blocking<F>(port: &SharedPort, what: &'static str, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn DigitalPort) -> Result<()> + Send + 'static,
{
    let port = port.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = port.lock();
        f(guard.as_mut())
    })
    .await
    .with_context(|| format!("{} task panicked", what))?
}

// =============================================================================
// PortChannel - infrastructure
// =============================================================================

/// Opens and closes a shared port. Started before and stopped after the
/// devices that write to it.
pub struct PortChannel {
    core: DeviceCore,
    port: SharedPort,
}

impl PortChannel {
    pub fn new(name: &str, port: SharedPort) -> Self {
        Self {
            core: DeviceCore::new(name, ChannelStates::default()),
            port,
        }
    }
}

#[async_trait]
impl Device for PortChannel {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        run_blocking(&self.port, "port open", |p| p.open()).await?;
        info!("{}: port open", self.core.name());
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        run_blocking(&self.port, "port close", |p| p.close()).await?;
        info!("{}: port closed", self.core.name());
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        Ok(())
    }

    fn activate(&self, _owner: &str) -> Result<()> {
        Err(anyhow!("{} is not an activatable device", self.core.name()))
    }

    fn deactivate(&self, _owner: &str) -> Result<()> {
        Ok(())
    }

    fn is_activated(&self) -> bool {
        false
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        self.core.apply(high, low).map(|_| ())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

// =============================================================================
// SerializerOdorBank
// =============================================================================

/// Odor valve bank driven through chained serializer boards.
pub struct SerializerOdorBank {
    core: DeviceCore,
    lines: Vec<String>,
    port: SharedPort,
}

impl SerializerOdorBank {
    pub fn new(name: &str, num_lines: usize, port: SharedPort) -> Self {
        let lines: Vec<String> = (0..num_lines).map(odor_line).collect();
        Self {
            core: DeviceCore::new(name, ChannelStates::with_channels(lines.clone())),
            lines,
            port,
        }
    }

    fn bits(&self, states: &ChannelStates) -> Vec<bool> {
        self.lines.iter().map(|l| states.is_high(l)).collect()
    }

    fn write(&self, states: &ChannelStates) -> Result<()> {
        let bits = self.bits(states);
        self.port
            .lock()
            .write_bits(&bits)
            .with_context(|| format!("{}: line write failed", self.core.name()))
    }
}

#[async_trait]
impl Device for SerializerOdorBank {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        let bits = self.bits(&self.core.all_low());
        run_blocking(&self.port, "odor reset", move |p| p.write_bits(&bits)).await
    }

    async fn stop_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        let bits = self.bits(&self.core.all_low());
        run_blocking(&self.port, "odor reset", move |p| p.write_bits(&bits)).await
    }

    fn activate(&self, owner: &str) -> Result<()> {
        self.core.add_owner(owner);
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        self.core.remove_owner(owner);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        let states = self.core.apply(high, low)?;
        debug!("{}: high={:?}", self.core.name(), states.high_channels());
        self.write(&states)
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

// =============================================================================
// PinShocker
// =============================================================================

/// Shock output on one pin of a bit-bang port.
pub struct PinShocker {
    core: DeviceCore,
    pin: usize,
    port: SharedPort,
}

impl PinShocker {
    pub fn new(name: &str, pin: u8, port: SharedPort) -> Result<Self> {
        let pin = pin as usize;
        if pin >= PIN_PORT_WIDTH {
            return Err(anyhow!("shocker pin {} exceeds port width {}", pin, PIN_PORT_WIDTH));
        }
        Ok(Self {
            core: DeviceCore::new(name, ChannelStates::with_channels([SHOCKER_CHANNEL])),
            pin,
            port,
        })
    }

    /// Port levels with only the shocker pin (`1 << pin`) possibly set.
    fn bits(&self, high: bool) -> Vec<bool> {
        (0..PIN_PORT_WIDTH).map(|i| high && i == self.pin).collect()
    }
}

#[async_trait]
impl Device for PinShocker {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        self.core.all_low();
        let bits = self.bits(false);
        run_blocking(&self.port, "pin reset", move |p| p.write_bits(&bits)).await
    }

    async fn stop_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        self.core.all_low();
        let bits = self.bits(false);
        run_blocking(&self.port, "pin reset", move |p| p.write_bits(&bits)).await
    }

    fn activate(&self, owner: &str) -> Result<()> {
        self.core.add_owner(owner);
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        self.core.remove_owner(owner);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        let states = self.core.apply(high, low)?;
        let level = states.is_high(SHOCKER_CHANNEL);
        debug!("{}: shocker={}", self.core.name(), level);
        self.port
            .lock()
            .write_bits(&self.bits(level))
            .with_context(|| format!("{}: pin write failed", self.core.name()))
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}
