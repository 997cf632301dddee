//! Port abstraction for the serial link to the modem.
//!
//! The protocol layers never touch a device handle directly. They go through
//! [`Port`], whose operations all carry an explicit time budget:
//!
//! ```text
//! +----------------------+      +----------------------+
//! |  SerialTransport     |      |  receive loop thread |
//! |  (write, drain)      |      |  (read → RingBuffer) |
//! +----------+-----------+      +----------+-----------+
//!            |                             |
//!            v                             v
//! +----------+-----------------------------+-----------+
//! |                     Port trait                     |
//! +----------+-----------------------------------------+
//!            |
//!            v
//! +----------+-----------+
//! |  NativePort          |
//! |  (serialport crate)  |
//! +----------------------+
//! ```
//!
//! The receive loop owns a second handle obtained with
//! [`Port::try_clone_port`], so reads and writes never contend for one lock.

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB2", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-call read timeout applied when the port is opened.
    ///
    /// Kept short so a read returns promptly on partial data instead of
    /// waiting for a full buffer.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
    /// Assert DTR after opening.
    pub dtr: bool,
    /// Assert RTS after opening. Ignored with hardware flow control.
    pub rts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(50),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr: true,
            rts: true,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Timed, cancellable access to a serial device.
pub trait Port: Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Read whatever arrives within `timeout`.
    ///
    /// Fails with the soft [`Error::ReadTimeout`](crate::Error::ReadTimeout)
    /// when nothing arrived; callers poll again.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `data` within `timeout`.
    ///
    /// On timeout the in-flight output is cancelled and
    /// [`Error::WriteTimeout`](crate::Error::WriteTimeout) is returned. If the
    /// device stops accepting bytes the write fails with
    /// [`Error::WriteShort`](crate::Error::WriteShort).
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Discard queued output and abort a read blocked in the driver.
    fn cancel_pending(&mut self) -> Result<()>;

    /// Number of bytes written but not yet transmitted.
    fn pending_output(&mut self) -> Result<u32>;

    /// Open a second handle to the same device for the receive loop.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        (**self).write(data, timeout)
    }

    fn cancel_pending(&mut self) -> Result<()> {
        (**self).cancel_pending()
    }

    fn pending_output(&mut self) -> Result<u32> {
        (**self).pending_output()
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        (**self).try_clone_port()
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
        assert!(config.dtr);
        assert!(config.rts);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB2", 921600)
            .with_timeout(Duration::from_millis(20))
            .with_flow_control(FlowControl::Hardware);

        assert_eq!(config.port_name, "/dev/ttyUSB2");
        assert_eq!(config.baud_rate, 921600);
        assert_eq!(config.timeout, Duration::from_millis(20));
        assert_eq!(config.flow_control, FlowControl::Hardware);
    }
}
