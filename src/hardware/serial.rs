//! Serial-port [`DigitalPort`].
//!
//! Line levels are packed LSB first, eight lines per byte, and written as a
//! single frame. Requires the `instrument_serial` feature.

use anyhow::{anyhow, Context, Result};
use serialport::SerialPort;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

use crate::hardware::ftdi::DigitalPort;

pub struct SerialDigitalPort {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialDigitalPort {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }
}

/// Packs line levels into bytes, line 0 in the lowest bit of the first byte.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, high)| if *high { acc | (1 << i) } else { acc })
        })
        .collect()
}

impl DigitalPort for SerialDigitalPort {
    fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    self.port_name, self.baud_rate
                )
            })?;
        self.port = Some(port);
        debug!("Serial port '{}' opened at {} baud", self.port_name, self.baud_rate);
        Ok(())
    }

    fn write_bits(&mut self, bits: &[bool]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("serial port '{}' is not open", self.port_name))?;
        port.write_all(&pack_bits(bits))
            .context("Failed to write to serial port")?;
        port.flush().context("Failed to flush serial port")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
        Ok(())
    }
}
