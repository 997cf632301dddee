//! In-memory port for tests.
//!
//! Bytes queued with [`MockPort::feed`] are returned by reads. A responder
//! closure sees every successful write and may queue a reply, which is how
//! tests script a modem.

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    },
};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct State {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    responder: Option<Responder>,
    stall_writes: bool,
    pending_output: u32,
    cancels: usize,
}

/// Cloneable handle; every clone shares the same device state.
#[derive(Clone, Default)]
pub(crate) struct MockPort {
    state: Arc<Mutex<State>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Port whose responder is called for each written buffer.
    pub(crate) fn with_responder(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        let port = Self::new();
        port.state
            .lock()
            .unwrap()
            .responder = Some(Box::new(responder));
        port
    }

    pub(crate) fn feed(&self, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .extend(bytes);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .written
            .clone()
    }

    /// Writes block for their whole budget, like a peer that stopped reading.
    pub(crate) fn stall_writes(&self) {
        self.state
            .lock()
            .unwrap()
            .stall_writes = true;
    }

    pub(crate) fn set_pending_output(&self, pending: u32) {
        self.state
            .lock()
            .unwrap()
            .pending_output = pending;
    }

    pub(crate) fn cancels(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .cancels
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        "mock"
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self
                    .state
                    .lock()
                    .unwrap();
                if !state
                    .incoming
                    .is_empty()
                {
                    let n = buf
                        .len()
                        .min(
                            state
                                .incoming
                                .len(),
                        );
                    for (slot, byte) in buf
                        .iter_mut()
                        .zip(
                            state
                                .incoming
                                .drain(..n),
                        )
                    {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::ReadTimeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let stall = self
            .state
            .lock()
            .unwrap()
            .stall_writes;
        if stall {
            thread::sleep(timeout);
            self.cancel_pending()?;
            return Err(Error::WriteTimeout(timeout));
        }

        let mut guard = self
            .state
            .lock()
            .unwrap();
        let state = &mut *guard;
        state
            .written
            .extend_from_slice(data);
        if let Some(responder) = state
            .responder
            .as_mut()
        {
            let reply = responder(data);
            state
                .incoming
                .extend(reply);
        }
        Ok(())
    }

    fn cancel_pending(&mut self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state.cancels += 1;
        state.pending_output = 0;
        Ok(())
    }

    fn pending_output(&mut self) -> Result<u32> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        let pending = state.pending_output;
        // Each poll observes the queue shrinking by one 512 byte block,
        // unless the peer has stalled.
        if !state.stall_writes {
            state.pending_output = pending.saturating_sub(512);
        }
        Ok(pending)
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(self.clone()))
    }
}
