//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).
//!
//! On Windows a cloned handle shares the device's `COMMTIMEOUTS` with the
//! original, so a timeout set by the writer also governs the receive
//! thread's reads. Every read and write therefore programs its own timeout,
//! and [`Port::cancel_pending`] purges both directions to release a read
//! blocked in the driver.

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, FlowControl, Parity, Port, SerialConfig, StopBits},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, ErrorKind},
    std::{
        io::{self, Read, Write},
        time::{Duration, Instant},
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    ///
    /// DTR and RTS are asserted as the configuration asks. A device that
    /// cannot be opened yields [`Error::PortUnavailable`]; a device that
    /// rejects the line settings yields [`Error::ConfigurationRejected`].
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let mut port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(
                config
                    .data_bits
                    .into(),
            )
            .parity(
                config
                    .parity
                    .into(),
            )
            .stop_bits(
                config
                    .stop_bits
                    .into(),
            )
            .flow_control(
                config
                    .flow_control
                    .into(),
            )
            .open()
            .map_err(|e| open_error(&config.port_name, e))?;

        trace!("Setting DTR to {}", config.dtr);
        port.write_data_terminal_ready(config.dtr)
            .map_err(|e| Error::ConfigurationRejected(format!("DTR: {e}")))?;

        if config.flow_control != FlowControl::Hardware {
            trace!("Setting RTS to {}", config.rts);
            port.write_request_to_send(config.rts)
                .map_err(|e| Error::ConfigurationRejected(format!("RTS: {e}")))?;
        }

        debug!(
            "Opened {} at {} baud",
            config.port_name, config.baud_rate
        );

        Ok(Self {
            port,
            name: config
                .port_name
                .clone(),
        })
    }
}

fn open_error(port: &str, e: serialport::Error) -> Error {
    match e.kind() {
        ErrorKind::InvalidInput => Error::ConfigurationRejected(e.to_string()),
        _ => Error::PortUnavailable {
            port: port.to_string(),
            reason: e.to_string(),
        },
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port
            .set_timeout(timeout)?;
        match self
            .port
            .read(buf)
        {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Err(Error::ReadTimeout)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < data.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cancel_pending()?;
                return Err(Error::WriteTimeout(timeout));
            }
            self.port
                .set_timeout(remaining)?;

            match self
                .port
                .write(&data[written..])
            {
                Ok(0) => {
                    return Err(Error::WriteShort {
                        written,
                        expected: data.len(),
                    });
                },
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    debug!("Write stalled after {written}/{} bytes", data.len());
                    self.cancel_pending()?;
                    return Err(Error::WriteTimeout(timeout));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn cancel_pending(&mut self) -> Result<()> {
        trace!("Purging pending I/O on {}", self.name);
        self.port
            .clear(ClearBuffer::All)?;
        Ok(())
    }

    fn pending_output(&mut self) -> Result<u32> {
        Ok(self
            .port
            .bytes_to_write()?)
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        let port = self
            .port
            .try_clone()?;
        Ok(Box::new(Self {
            port,
            name: self
                .name
                .clone(),
        }))
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let config = SerialConfig::new("/dev/atlink-does-not-exist", 115200);
        match NativePort::open(&config) {
            Err(Error::PortUnavailable { port, .. }) => {
                assert_eq!(port, "/dev/atlink-does-not-exist");
            },
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing device must fail"),
        }
    }

    #[test]
    fn test_invalid_input_maps_to_configuration_rejected() {
        let err = open_error(
            "COM9",
            serialport::Error::new(ErrorKind::InvalidInput, "bad baud"),
        );
        assert!(matches!(err, Error::ConfigurationRejected(_)));

        let err = open_error("COM9", serialport::Error::new(ErrorKind::NoDevice, "gone"));
        assert!(matches!(err, Error::PortUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_cloned_handle_keeps_its_own_read_timeout() {
        let (mut modem, device) = serialport::TTYPort::pair().unwrap();
        let mut port = NativePort {
            port: Box::new(device),
            name: "pty".to_string(),
        };
        let mut rx = port
            .try_clone_port()
            .unwrap();

        port.write(b"AT+CGMR\r\n", Duration::from_secs(30))
            .unwrap();

        let mut buf = [0u8; 16];
        let begin = Instant::now();
        assert!(matches!(
            rx.read(&mut buf, Duration::from_millis(50)),
            Err(Error::ReadTimeout)
        ));
        assert!(begin.elapsed() < Duration::from_secs(5));

        modem
            .write_all(b"OK\r\n")
            .unwrap();
        assert_eq!(rx.read(&mut buf, Duration::from_secs(2)).unwrap(), 4);
        assert_eq!(&buf[..4], b"OK\r\n");

        port.cancel_pending()
            .unwrap();
    }

    #[test]
    fn test_type_conversions() {
        assert_eq!(
            serialport::DataBits::from(DataBits::Eight),
            serialport::DataBits::Eight
        );
        assert_eq!(
            serialport::Parity::from(Parity::Even),
            serialport::Parity::Even
        );
        assert_eq!(
            serialport::StopBits::from(StopBits::Two),
            serialport::StopBits::Two
        );
        assert_eq!(
            serialport::FlowControl::from(FlowControl::Software),
            serialport::FlowControl::Software
        );
    }
}
