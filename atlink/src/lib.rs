//! # atlink
//!
//! A library for driving cellular modems over their AT-command serial
//! interface, including binary transfers embedded in the text protocol.
//!
//! This crate provides:
//!
//! - A thread-safe byte [`RingBuffer`] fed by a background receive loop
//! - [`SerialTransport`] with bounded writes, output draining and clean shutdown
//! - [`FrameReader`] for CR LF lines, pattern waits and binary segments
//! - [`TransferController`] for chunked downloads with per-offset retries and
//!   single-shot uploads
//! - [`UpdateMonitor`] for firmware update progress after a module reset
//! - [`Session`] to run declarative [`Script`]s of the above
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for scripts
//!
//! ## Example
//!
//! ```rust,no_run
//! use atlink::{CancelToken, FileStorage, LogObserver, Script, Session, SessionConfig};
//!
//! fn run(script: &Script) -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let serial = atlink::SerialConfig::new("/dev/ttyUSB2", 115200);
//!         let transport = atlink::SerialTransport::open(
//!             &serial,
//!             atlink::TransportConfig::default(),
//!             CancelToken::new(),
//!         )?;
//!
//!         let mut storage = FileStorage::new(".");
//!         let mut observer = LogObserver;
//!         let mut session =
//!             Session::new(transport, SessionConfig::default(), &mut storage, &mut observer);
//!         session.set_var("url", "http://example.com/update.bin");
//!         session.set_var("file", "update.bin");
//!
//!         let report = session.run(script)?;
//!         println!("downloaded {} bytes", report.downloaded);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod event;
pub mod frame;
pub mod port;
pub mod ring;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod update;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    cancel::CancelToken,
    error::{Error, Result, UpdatePhase},
    event::{Event, LogObserver, Observer},
    frame::{FrameReader, PollConfig, Response, WaitOutcome},
    port::{DataBits, FlowControl, Parity, Port, SerialConfig, StopBits},
    ring::RingBuffer,
    session::{
        Action, CommandStep, DelayStep, DownloadStep, FileStorage, MonitorStep, QueryStep, Script,
        Session, SessionConfig, SessionReport, Step, Storage, UploadStep,
    },
    transfer::{DownloadConfig, DownloadReport, TransferController, UploadConfig},
    transport::{SerialTransport, TransportConfig},
    update::{LineKind, UpdateConfig, UpdateMonitor, UpdateReport, UpdateState},
};
