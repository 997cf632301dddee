//! Serial transport: owns the port, the receive thread and the ring buffer.
//!
//! A single background thread copies every received byte into the shared
//! [`RingBuffer`]. The caller's thread writes commands and payloads directly
//! and reads responses back through a [`FrameReader`].

use {
    crate::{
        cancel::CancelToken,
        error::{Error, Result},
        frame::{FrameReader, PollConfig},
        port::Port,
        ring::{DEFAULT_CAPACITY, RingBuffer},
    },
    log::{debug, info, trace, warn},
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};

/// Tuning for the transport and its receive thread.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ring buffer capacity in bytes.
    pub capacity: usize,
    /// Largest single read handed to the port.
    pub read_chunk: usize,
    /// Bounded wait of one receive-loop read; also bounds shutdown latency.
    pub receive_wait: Duration,
    /// Back-off while the ring buffer is full.
    pub full_backoff: Duration,
    /// Poll interval while draining the output queue.
    pub drain_poll: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            read_chunk: 256,
            receive_wait: Duration::from_millis(500),
            full_backoff: Duration::from_millis(1),
            drain_poll: Duration::from_millis(10),
        }
    }
}

/// An open serial link with its receive thread running.
pub struct SerialTransport {
    port: Box<dyn Port>,
    ring: Arc<RingBuffer>,
    cancel: CancelToken,
    receiver: Option<JoinHandle<()>>,
    config: TransportConfig,
}

impl SerialTransport {
    /// Start the receive thread on a cloned handle of `port`.
    ///
    /// `cancel` stops the receive loop; cancelling it from elsewhere (e.g. a
    /// Ctrl-C handler) also makes every pending wait fail with
    /// [`Error::Cancelled`].
    pub fn start(port: Box<dyn Port>, config: TransportConfig, cancel: CancelToken) -> Result<Self> {
        let reader = port.try_clone_port()?;
        let ring = Arc::new(RingBuffer::new(config.capacity));

        let receiver = {
            let ring = Arc::clone(&ring);
            let cancel = cancel.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("atlink-rx:{}", port.name()))
                .spawn(move || receive_loop(reader, &ring, &cancel, &config))?
        };

        debug!("Receive thread started for {}", port.name());

        Ok(Self {
            port,
            ring,
            cancel,
            receiver: Some(receiver),
            config,
        })
    }

    /// Open a native serial port and start the receive thread.
    #[cfg(feature = "native")]
    pub fn open(serial: &SerialConfig, config: TransportConfig, cancel: CancelToken) -> Result<Self> {
        let port = NativePort::open(serial)?;
        info!(
            "Connected to {} at {} baud",
            serial.port_name, serial.baud_rate
        );
        Self::start(Box::new(port), config, cancel)
    }

    /// Port name.
    pub fn name(&self) -> &str {
        self.port
            .name()
    }

    /// The receive buffer.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Build a reader over this transport's receive buffer.
    pub fn frame_reader(&self, poll: PollConfig) -> FrameReader {
        FrameReader::new(Arc::clone(&self.ring), poll, self.cancel.clone())
    }

    /// Whether the receive thread is still running.
    pub fn is_running(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Write raw bytes within `timeout`.
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        self.cancel
            .check()?;
        trace!("TX {} bytes", data.len());
        self.port
            .write(data, timeout)
    }

    /// Send one AT command, terminated with CR LF.
    pub fn send_command(&mut self, command: &str, timeout: Duration) -> Result<()> {
        debug!(">> {command}");
        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.write(&line, timeout)
    }

    /// Wait until the driver has transmitted everything written so far.
    pub fn drain_output_queue(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            self.cancel
                .check()?;
            let pending = self
                .port
                .pending_output()?;
            if pending == 0 {
                trace!("Output drained in {:?}", start.elapsed());
                return Ok(());
            }
            if start.elapsed() >= timeout {
                warn!("Output queue still holds {pending} bytes after {timeout:?}");
                return Err(Error::DrainTimeout { timeout, pending });
            }
            thread::sleep(self.config.drain_poll);
        }
    }

    /// Stop the receive thread and release the port.
    ///
    /// Returns once the thread has exited, which takes at most one
    /// [`TransportConfig::receive_wait`]. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(handle) = self
            .receiver
            .take()
        else {
            return;
        };

        self.cancel
            .cancel();
        if let Err(e) = self
            .port
            .cancel_pending()
        {
            debug!("Cancelling pending I/O failed: {e}");
        }
        if handle
            .join()
            .is_err()
        {
            warn!("Receive thread panicked");
        }
        debug!("Transport on {} closed", self.port.name());
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(mut port: Box<dyn Port>, ring: &RingBuffer, cancel: &CancelToken, config: &TransportConfig) {
    let mut scratch = vec![0u8; config.read_chunk.max(1)];
    let mut failing = false;

    while !cancel.is_cancelled() {
        match port.read(&mut scratch, config.receive_wait) {
            Ok(0) => {},
            Err(e) if e.is_transient() => {},
            Ok(n) => {
                failing = false;
                trace!("RX {n} bytes");
                store(ring, &scratch[..n], cancel, config.full_backoff);
            },
            Err(e) => {
                if !failing {
                    warn!("Serial read failed: {e}");
                    failing = true;
                }
                thread::sleep(Duration::from_millis(1));
            },
        }
    }
    trace!("Receive loop exiting");
}

/// Push all of `data`, backing off while the buffer is full.
fn store(ring: &RingBuffer, mut data: &[u8], cancel: &CancelToken, backoff: Duration) {
    while !data.is_empty() {
        let n = ring.put_bulk(data);
        data = &data[n..];
        if n == 0 {
            if cancel.is_cancelled() {
                debug!("Dropping {} received bytes at shutdown", data.len());
                return;
            }
            thread::yield_now();
            thread::sleep(backoff);
        }
    }
}
