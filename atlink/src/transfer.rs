//! Chunked downloads and single-shot uploads over an AT link.
//!
//! Download wire format, one request per chunk:
//!
//! ```text
//! >> AT+HTTPREAD=<offset>,<size>
//! << OK
//! << +HTTPREAD: <n>          control line announcing n binary bytes
//! << <n raw bytes>
//! << +HTTPREAD: 0            end of chunk
//! ```
//!
//! A chunk may arrive as several announced segments. A line containing the
//! error marker aborts the chunk, which is then requested again from the
//! current offset while the retry budget lasts.

use {
    crate::{
        error::{Error, Result},
        event::{Event, Observer},
        frame::{DEFAULT_MAX_LINE, FrameReader, Response},
        transport::SerialTransport,
    },
    log::{debug, info, warn},
    std::{io::Write, time::Duration},
};

/// Chunk size used by default, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Retries allowed at one offset before the download is abandoned.
pub const DEFAULT_MAX_OFFSET_RETRIES: u32 = 5;

/// Download parameters.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Request template; `{offset}` and `{size}` are substituted.
    pub request: String,
    /// Largest chunk requested at once.
    pub chunk_size: usize,
    /// Marker of a control line announcing a binary segment.
    pub data_prefix: String,
    /// Marker of a failed chunk.
    pub error_marker: String,
    /// Retries allowed at one offset.
    pub max_offset_retries: u32,
    /// Longest wait for the next control line.
    pub chunk_timeout: Duration,
    /// Longest silence inside an announced segment.
    pub segment_watchdog: Duration,
    /// Write budget for each request.
    pub command_timeout: Duration,
    /// Longest accepted control line.
    pub max_line: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request: "AT+HTTPREAD={offset},{size}".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            data_prefix: "+HTTPREAD:".to_string(),
            error_marker: "ERROR".to_string(),
            max_offset_retries: DEFAULT_MAX_OFFSET_RETRIES,
            chunk_timeout: Duration::from_secs(10),
            segment_watchdog: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

impl DownloadConfig {
    /// Render the request for one chunk.
    pub fn request_for(&self, offset: u64, size: u64) -> String {
        self.request
            .replace("{offset}", &offset.to_string())
            .replace("{size}", &size.to_string())
    }

    fn classify(&self, line: &str) -> ControlLine {
        if let Some(at) = line.find(&self.data_prefix) {
            let rest = line[at + self.data_prefix.len()..].trim_start();
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            return match rest[..end].parse::<usize>() {
                Ok(0) => ControlLine::EndOfData,
                Ok(n) => ControlLine::Segment(n),
                Err(_) if line.contains(&self.error_marker) => ControlLine::Failed,
                Err(_) => ControlLine::Malformed,
            };
        }
        if !self
            .error_marker
            .is_empty()
            && line.contains(&self.error_marker)
        {
            return ControlLine::Failed;
        }
        ControlLine::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlLine {
    Segment(usize),
    EndOfData,
    Failed,
    Malformed,
    Other,
}

/// Upload parameters.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Budget for handing the payload to the driver.
    pub write_timeout: Duration,
    /// Budget for the driver to transmit it.
    pub drain_timeout: Duration,
    /// Acknowledgement expected afterwards.
    pub ack: String,
    /// Marker of a rejected upload.
    pub error_marker: String,
    /// Budget for the acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            ack: "OK".to_string(),
            error_marker: "ERROR".to_string(),
            ack_timeout: Duration::from_secs(20),
        }
    }
}

/// Summary of a completed download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes written to the sink.
    pub bytes: u64,
    /// Chunks completed.
    pub chunks: u32,
    /// Chunk retries performed.
    pub retries: u32,
}

/// Runs transfers on an open transport.
pub struct TransferController<'a> {
    transport: &'a mut SerialTransport,
    reader: &'a FrameReader,
    observer: &'a mut dyn Observer,
}

impl<'a> TransferController<'a> {
    /// Create a controller borrowing the session's transport and reader.
    pub fn new(
        transport: &'a mut SerialTransport,
        reader: &'a FrameReader,
        observer: &'a mut dyn Observer,
    ) -> Self {
        Self {
            transport,
            reader,
            observer,
        }
    }

    /// Fetch `total_size` bytes chunk by chunk into `sink`.
    ///
    /// Bytes reach the sink strictly in offset order and each one exactly
    /// once. A failed chunk is requested again from the current offset; the
    /// budget of [`DownloadConfig::max_offset_retries`] resets whenever the
    /// offset advances.
    pub fn download(&mut self, total_size: u64, sink: &mut dyn Write, config: &DownloadConfig) -> Result<DownloadReport> {
        if config.chunk_size == 0 {
            return Err(Error::script("download chunk size must be non-zero"));
        }

        info!("Downloading {total_size} bytes in chunks of {}", config.chunk_size);
        let mut report = DownloadReport::default();
        let mut offset = 0u64;
        let mut retries_remaining = config.max_offset_retries;

        while offset < total_size {
            let chunk_start = offset;
            let size = (total_size - offset).min(config.chunk_size as u64);
            let request = config.request_for(offset, size);
            self.transport
                .send_command(&request, config.command_timeout)?;
            self.observer
                .on_event(&Event::CommandSent { command: &request });

            match self.read_chunk(&mut offset, total_size, sink, config) {
                Ok(()) => {
                    report.chunks += 1;
                    retries_remaining = config.max_offset_retries;
                },
                Err(e) if e.is_transient() => {
                    let at = offset;
                    if offset != chunk_start {
                        retries_remaining = config.max_offset_retries;
                    }
                    if retries_remaining == 0 {
                        warn!("Giving up at offset {at}: {e}");
                        return Err(Error::RetryBudgetExhausted {
                            offset: at,
                            attempts: config.max_offset_retries + 1,
                        });
                    }
                    retries_remaining -= 1;
                    report.retries += 1;
                    let attempt = config.max_offset_retries - retries_remaining;
                    let reason = match &e {
                        Error::ChunkError { line, .. } => line.clone(),
                        other => other.to_string(),
                    };
                    warn!(
                        "Chunk at offset {at} failed ({reason}), retry {attempt}/{}",
                        config.max_offset_retries
                    );
                    self.observer
                        .on_event(&Event::Retry {
                            offset: at,
                            attempt,
                            max: config.max_offset_retries,
                            reason: &reason,
                        });
                },
                Err(e) => return Err(e),
            }
        }

        sink.flush()?;
        report.bytes = offset;
        info!(
            "Download complete: {} bytes, {} chunks, {} retries",
            report.bytes, report.chunks, report.retries
        );
        Ok(report)
    }

    /// Consume one chunk's response, advancing `offset` per segment.
    ///
    /// Each segment is flushed before `offset` moves past it, so a failed
    /// download leaves exactly the acknowledged bytes in the sink.
    fn read_chunk(&mut self, offset: &mut u64, total: u64, sink: &mut dyn Write, config: &DownloadConfig) -> Result<()> {
        let mut received = 0usize;
        loop {
            let Some(line) = self
                .reader
                .next_line(config.max_line, config.chunk_timeout)?
            else {
                return Err(Error::PatternTimeout {
                    pattern: config
                        .data_prefix
                        .clone(),
                    timeout: config.chunk_timeout,
                });
            };
            self.observer
                .on_event(&Event::LineReceived { line: &line });
            let text = String::from_utf8_lossy(&line);

            match config.classify(&text) {
                ControlLine::Segment(n) => {
                    if *offset + n as u64 > total {
                        return Err(Error::desync(format!(
                            "segment of {n} bytes at offset {offset} overruns {total}"
                        )));
                    }
                    let data = self
                        .reader
                        .read_binary_segment(n, config.segment_watchdog)?;
                    sink.write_all(&data)?;
                    sink.flush()?;
                    self.observer
                        .on_event(&Event::SegmentReceived {
                            offset: *offset,
                            data: &data,
                        });
                    *offset += n as u64;
                    received += n;
                    self.observer
                        .on_event(&Event::ChunkProgress {
                            received: *offset,
                            total,
                        });
                },
                ControlLine::EndOfData => {
                    if received == 0 {
                        return Err(Error::ChunkError {
                            offset: *offset,
                            line: "end of data before any payload".to_string(),
                        });
                    }
                    debug!("Chunk done, {received} bytes, offset now {offset}");
                    return Ok(());
                },
                ControlLine::Failed => {
                    return Err(Error::ChunkError {
                        offset: *offset,
                        line: text
                            .trim_end()
                            .to_string(),
                    });
                },
                ControlLine::Malformed => {
                    return Err(Error::desync(format!(
                        "unparseable segment length in {:?}",
                        text.trim_end()
                    )));
                },
                ControlLine::Other => {},
            }
        }
    }

    /// Send `payload` in one write, wait for it to leave, then for the ack.
    ///
    /// Any upload header (e.g. a size announcement and its `>` prompt) is
    /// the caller's business.
    pub fn upload(&mut self, payload: &[u8], config: &UploadConfig) -> Result<()> {
        info!("Uploading {} bytes", payload.len());
        self.transport
            .write(payload, config.write_timeout)?;
        self.observer
            .on_event(&Event::PayloadSent {
                bytes: payload.len(),
            });
        self.transport
            .drain_output_queue(config.drain_timeout)?;
        debug!("Payload drained, waiting for {:?}", config.ack);

        match self
            .reader
            .expect(
                &config.ack,
                Some(&config.error_marker),
                config.ack_timeout,
                &mut *self.observer,
            )? {
            Response::Matched(_) => {
                info!("Upload acknowledged");
                Ok(())
            },
            Response::Rejected(line) => Err(Error::CommandFailed {
                command: format!("<{} byte payload>", payload.len()),
                line: String::from_utf8_lossy(&line)
                    .trim_end()
                    .to_string(),
            }),
        }
    }
}
