//! Scripted AT sessions.
//!
//! A [`Script`] is an ordered list of steps: plain commands, queries that
//! capture a number into a variable, downloads, uploads, update monitoring
//! and delays. Text fields are templates; `{name}` is replaced with the
//! session variable `name` and `{{` produces a literal brace.
//!
//! The first failing step halts the session, which then tears the transport
//! down and returns the error.

use {
    crate::{
        error::{Error, Result},
        event::{Event, Observer},
        frame::{FrameReader, PollConfig, Response},
        transfer::{DownloadConfig, TransferController, UploadConfig},
        transport::SerialTransport,
        update::{UpdateConfig, UpdateMonitor},
    },
    log::{debug, info},
    std::{
        collections::{BTreeMap, BTreeSet},
        fs::File,
        io::{self, BufReader, BufWriter, Read, Write},
        path::PathBuf,
        thread,
        time::{Duration, Instant},
    },
};

/// A complete session description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Script {
    /// Short identifier.
    pub name: String,
    /// Human readable summary.
    pub description: String,
    /// Default variable values; caller-provided values win.
    pub vars: BTreeMap<String, String>,
    /// Steps in execution order.
    #[cfg_attr(feature = "serde", serde(rename = "step"))]
    pub steps: Vec<Step>,
}

/// One named step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Step {
    /// Label shown in progress output.
    pub name: String,
    /// What the step does.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub action: Action,
}

/// Step behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "action", rename_all = "snake_case"))]
pub enum Action {
    /// Send a command and wait for its response.
    Command(CommandStep),
    /// Send a command and capture a number from its response.
    Query(QueryStep),
    /// Chunked download into a sink.
    Download(DownloadStep),
    /// Single-shot payload upload.
    Upload(UploadStep),
    /// Watch a firmware update until the module is ready.
    Monitor(MonitorStep),
    /// Pause.
    Delay(DelayStep),
}

impl Action {
    /// Lower-case kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Query(_) => "query",
            Self::Download(_) => "download",
            Self::Upload(_) => "upload",
            Self::Monitor(_) => "monitor",
            Self::Delay(_) => "delay",
        }
    }
}

/// Send a command, then wait for `expect` or `reject`.
///
/// An empty `expect` sends without waiting for any response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CommandStep {
    /// Command template. When absent the step only waits.
    pub send: Option<String>,
    /// Pattern that completes the step.
    pub expect: String,
    /// Marker that fails the step. Empty disables.
    pub reject: String,
    /// Response budget in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CommandStep {
    fn default() -> Self {
        Self {
            send: None,
            expect: "OK".to_string(),
            reject: "ERROR".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// Send a command, capture the number after `prefix` into `store`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct QueryStep {
    /// Command template.
    pub send: Option<String>,
    /// Text preceding the number.
    pub prefix: String,
    /// Variable receiving the number.
    pub store: String,
    /// Optional terminator awaited after the number, e.g. `OK`.
    pub expect: Option<String>,
    /// Marker that fails the terminator wait. Empty disables.
    pub reject: String,
    /// Budget in milliseconds for each of the two waits.
    pub timeout_ms: u64,
}

impl Default for QueryStep {
    fn default() -> Self {
        Self {
            send: None,
            prefix: String::new(),
            store: String::new(),
            expect: None,
            reject: "ERROR".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// Chunked download. Unset fields use [`DownloadConfig::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DownloadStep {
    /// Template rendering to the total size, e.g. `{content_length}`.
    pub size: String,
    /// Template rendering to the sink name.
    pub sink: String,
    /// Request template with `{offset}` and `{size}`.
    pub request: Option<String>,
    /// Chunk size.
    pub chunk_size: Option<usize>,
    /// Control line marker.
    pub data_prefix: Option<String>,
    /// Chunk failure marker.
    pub error_marker: Option<String>,
    /// Retries per offset.
    pub max_retries: Option<u32>,
    /// Control line budget in milliseconds.
    pub chunk_timeout_ms: Option<u64>,
    /// Segment silence budget in milliseconds.
    pub segment_timeout_ms: Option<u64>,
}

impl DownloadStep {
    /// Engine configuration with this step's overrides applied.
    pub fn config(&self) -> DownloadConfig {
        let mut config = DownloadConfig::default();
        if let Some(request) = &self.request {
            config
                .request
                .clone_from(request);
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(prefix) = &self.data_prefix {
            config
                .data_prefix
                .clone_from(prefix);
        }
        if let Some(marker) = &self.error_marker {
            config
                .error_marker
                .clone_from(marker);
        }
        if let Some(retries) = self.max_retries {
            config.max_offset_retries = retries;
        }
        if let Some(ms) = self.chunk_timeout_ms {
            config.chunk_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.segment_timeout_ms {
            config.segment_watchdog = Duration::from_millis(ms);
        }
        config
    }
}

/// Single-shot upload. Unset fields use [`UploadConfig::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UploadStep {
    /// Template rendering to the source name.
    pub source: String,
    /// Template rendering to the expected size; checked before sending.
    pub size: Option<String>,
    /// Acknowledgement pattern.
    pub ack: Option<String>,
    /// Rejection marker.
    pub reject: Option<String>,
    /// Write budget in milliseconds.
    pub write_timeout_ms: Option<u64>,
    /// Drain budget in milliseconds.
    pub drain_timeout_ms: Option<u64>,
    /// Acknowledgement budget in milliseconds.
    pub ack_timeout_ms: Option<u64>,
}

impl UploadStep {
    /// Engine configuration with this step's overrides applied.
    pub fn config(&self) -> UploadConfig {
        let mut config = UploadConfig::default();
        if let Some(ack) = &self.ack {
            config
                .ack
                .clone_from(ack);
        }
        if let Some(reject) = &self.reject {
            config
                .error_marker
                .clone_from(reject);
        }
        if let Some(ms) = self.write_timeout_ms {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(ms);
        }
        config
    }
}

/// Update monitoring. Unset fields use [`UpdateConfig::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MonitorStep {
    /// Progress line prefix.
    pub progress_prefix: Option<String>,
    /// Success marker.
    pub success: Option<String>,
    /// Ready marker.
    pub ready: Option<String>,
    /// Overall ceiling in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl MonitorStep {
    /// Engine configuration with this step's overrides applied.
    pub fn config(&self) -> UpdateConfig {
        let mut config = UpdateConfig::default();
        if let Some(prefix) = &self.progress_prefix {
            config
                .progress_prefix
                .clone_from(prefix);
        }
        if let Some(success) = &self.success {
            config
                .success_marker
                .clone_from(success);
        }
        if let Some(ready) = &self.ready {
            config
                .ready_marker
                .clone_from(ready);
        }
        if let Some(ms) = self.timeout_ms {
            config.overall_timeout = Duration::from_millis(ms);
        }
        config
    }
}

/// Pause for `ms` milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DelayStep {
    /// Duration in milliseconds.
    pub ms: u64,
}

impl Script {
    /// Check the script is runnable with the given externally provided
    /// variables: required fields are set and every placeholder refers to a
    /// variable defined before use.
    pub fn validate<'a>(&self, provided: impl IntoIterator<Item = &'a str>) -> Result<()> {
        if self
            .steps
            .is_empty()
        {
            return Err(Error::script("script has no steps"));
        }

        let mut known: BTreeSet<String> = provided
            .into_iter()
            .map(str::to_string)
            .collect();
        known.extend(
            self.vars
                .keys()
                .cloned(),
        );

        for (index, step) in self
            .steps
            .iter()
            .enumerate()
        {
            let context = |msg: String| Error::script(format!("step {} [{}]: {msg}", index + 1, step.name));
            let check = |template: &str, known: &BTreeSet<String>| -> Result<()> {
                for name in placeholders(template).map_err(|e| context(e.to_string()))? {
                    if !known.contains(name) {
                        return Err(context(format!("variable {name:?} is not defined")));
                    }
                }
                Ok(())
            };

            match &step.action {
                Action::Command(cmd) => {
                    if let Some(send) = &cmd.send {
                        check(send, &known)?;
                    } else if cmd
                        .expect
                        .is_empty()
                    {
                        return Err(context("command needs send or expect".to_string()));
                    }
                    check(&cmd.expect, &known)?;
                },
                Action::Query(query) => {
                    if let Some(send) = &query.send {
                        check(send, &known)?;
                    }
                    if query
                        .prefix
                        .is_empty()
                        || query
                            .store
                            .is_empty()
                    {
                        return Err(context("query needs both prefix and store".to_string()));
                    }
                    known.insert(
                        query
                            .store
                            .clone(),
                    );
                },
                Action::Download(download) => {
                    if download
                        .size
                        .is_empty()
                        || download
                            .sink
                            .is_empty()
                    {
                        return Err(context("download needs both size and sink".to_string()));
                    }
                    check(&download.size, &known)?;
                    check(&download.sink, &known)?;
                    if download.chunk_size == Some(0) {
                        return Err(context("chunk_size must be non-zero".to_string()));
                    }
                },
                Action::Upload(upload) => {
                    if upload
                        .source
                        .is_empty()
                    {
                        return Err(context("upload needs a source".to_string()));
                    }
                    check(&upload.source, &known)?;
                    if let Some(size) = &upload.size {
                        check(size, &known)?;
                    }
                },
                Action::Monitor(_) | Action::Delay(_) => {},
            }
        }
        Ok(())
    }
}

/// Variable names referenced by `template`, in order.
pub fn placeholders(template: &str) -> Result<Vec<&str>> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        if let Some(stripped) = after.strip_prefix('{') {
            rest = stripped;
            continue;
        }
        let close = after
            .find('}')
            .ok_or_else(|| Error::script(format!("unterminated placeholder in {template:?}")))?;
        names.push(&after[..close]);
        rest = &after[close + 1..];
    }
    Ok(names)
}

/// Substitute `{name}` placeholders from `vars`.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        if let Some(stripped) = after.strip_prefix('{') {
            out.push('{');
            rest = stripped;
            continue;
        }
        let close = after
            .find('}')
            .ok_or_else(|| Error::script(format!("unterminated placeholder in {template:?}")))?;
        let name = &after[..close];
        let value = vars
            .get(name)
            .ok_or_else(|| Error::script(format!("variable {name:?} is not defined")))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Where downloads go and uploads come from.
pub trait Storage {
    /// Open a writer for a download.
    fn create_sink(&mut self, name: &str) -> io::Result<Box<dyn Write>>;

    /// Open a reader for an upload.
    fn open_source(&mut self, name: &str) -> io::Result<Box<dyn Read>>;
}

/// Local filesystem storage; names are paths relative to `root`.
#[derive(Debug, Clone, Default)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Resolve names against `root`. Absolute names are used as-is.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for FileStorage {
    fn create_sink(&mut self, name: &str) -> io::Result<Box<dyn Write>> {
        let path = self
            .root
            .join(name);
        debug!("Writing download to {}", path.display());
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn open_source(&mut self, name: &str) -> io::Result<Box<dyn Read>> {
        let path = self
            .root
            .join(name);
        debug!("Reading upload from {}", path.display());
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Write budget for each AT command.
    pub command_timeout: Duration,
    /// Receive buffer polling.
    pub poll: PollConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            poll: PollConfig::default(),
        }
    }
}

/// Summary of a completed session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Steps completed.
    pub steps: usize,
    /// Bytes downloaded.
    pub downloaded: u64,
    /// Bytes uploaded.
    pub uploaded: u64,
    /// Last update progress, if an update was monitored.
    pub update_progress: Option<i32>,
    /// Variables at the end of the session.
    pub vars: BTreeMap<String, String>,
    /// Wall time.
    pub elapsed: Duration,
}

/// Executes a [`Script`] on an open transport.
pub struct Session<'a> {
    transport: SerialTransport,
    reader: FrameReader,
    storage: &'a mut dyn Storage,
    observer: &'a mut dyn Observer,
    vars: BTreeMap<String, String>,
    config: SessionConfig,
    report: SessionReport,
}

impl<'a> Session<'a> {
    /// Create a session owning `transport`.
    pub fn new(
        transport: SerialTransport,
        config: SessionConfig,
        storage: &'a mut dyn Storage,
        observer: &'a mut dyn Observer,
    ) -> Self {
        let reader = transport.frame_reader(config.poll);
        Self {
            transport,
            reader,
            storage,
            observer,
            vars: BTreeMap::new(),
            config,
            report: SessionReport::default(),
        }
    }

    /// Set a variable; wins over the script's defaults.
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars
            .insert(name.into(), value.into());
    }

    /// Current variables.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Run every step, then shut the transport down.
    pub fn run(mut self, script: &Script) -> Result<SessionReport> {
        let start = Instant::now();
        script.validate(
            self.vars
                .keys()
                .map(String::as_str),
        )?;
        for (name, value) in &script.vars {
            self.vars
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        info!(
            "Running {} ({} steps) on {}",
            if script
                .name
                .is_empty()
            {
                "script"
            } else {
                script
                    .name
                    .as_str()
            },
            script
                .steps
                .len(),
            self.transport
                .name()
        );

        let outcome = self.run_steps(script);
        self.transport
            .shutdown();

        match outcome {
            Ok(()) => {
                self.report.vars = std::mem::take(&mut self.vars);
                self.report.elapsed = start.elapsed();
                Ok(self.report)
            },
            Err(e) => {
                let message = e.to_string();
                self.observer
                    .on_event(&Event::Error { message: &message });
                Err(e)
            },
        }
    }

    fn run_steps(&mut self, script: &Script) -> Result<()> {
        for (index, step) in script
            .steps
            .iter()
            .enumerate()
        {
            let began = Instant::now();
            self.observer
                .on_event(&Event::StepStarted {
                    index,
                    name: &step.name,
                });
            self.run_step(&step.action)?;
            self.report.steps += 1;
            self.observer
                .on_event(&Event::StepFinished {
                    index,
                    name: &step.name,
                    elapsed: began.elapsed(),
                });
        }
        Ok(())
    }

    fn run_step(&mut self, action: &Action) -> Result<()> {
        match action {
            Action::Command(cmd) => self.run_command(cmd),
            Action::Query(query) => self.run_query(query),
            Action::Download(download) => self.run_download(download),
            Action::Upload(upload) => self.run_upload(upload),
            Action::Monitor(monitor) => {
                let report = UpdateMonitor::new(monitor.config()).run(&self.reader, &mut *self.observer)?;
                self.report.update_progress = Some(report.last_progress);
                Ok(())
            },
            Action::Delay(delay) => self.delay(Duration::from_millis(delay.ms)),
        }
    }

    fn send(&mut self, template: &str) -> Result<String> {
        let command = render(template, &self.vars)?;
        self.transport
            .send_command(&command, self.config.command_timeout)?;
        self.observer
            .on_event(&Event::CommandSent { command: &command });
        Ok(command)
    }

    fn run_command(&mut self, cmd: &CommandStep) -> Result<()> {
        let command = match &cmd.send {
            Some(template) => self.send(template)?,
            None => String::new(),
        };
        if cmd
            .expect
            .is_empty()
        {
            return Ok(());
        }
        let expect = render(&cmd.expect, &self.vars)?;
        let reject = (!cmd
            .reject
            .is_empty())
        .then_some(cmd.reject.as_str());

        match self
            .reader
            .expect(
                &expect,
                reject,
                Duration::from_millis(cmd.timeout_ms),
                &mut *self.observer,
            )? {
            Response::Matched(_) => Ok(()),
            Response::Rejected(line) => Err(Error::CommandFailed {
                command,
                line: String::from_utf8_lossy(&line)
                    .trim_end()
                    .to_string(),
            }),
        }
    }

    fn run_query(&mut self, query: &QueryStep) -> Result<()> {
        let command = match &query.send {
            Some(template) => self.send(template)?,
            None => String::new(),
        };
        let timeout = Duration::from_millis(query.timeout_ms);
        let value = self
            .reader
            .wait_for_number(&query.prefix, timeout, &mut *self.observer)?;
        debug!("{} = {value}", query.store);
        self.vars
            .insert(
                query
                    .store
                    .clone(),
                value.to_string(),
            );

        if let Some(expect) = &query.expect {
            let reject = (!query
                .reject
                .is_empty())
            .then_some(query.reject.as_str());
            if let Response::Rejected(line) = self
                .reader
                .expect(expect, reject, timeout, &mut *self.observer)?
            {
                return Err(Error::CommandFailed {
                    command,
                    line: String::from_utf8_lossy(&line)
                        .trim_end()
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    fn run_download(&mut self, step: &DownloadStep) -> Result<()> {
        let size_text = render(&step.size, &self.vars)?;
        let total: u64 = size_text
            .trim()
            .parse()
            .map_err(|_| Error::script(format!("download size {size_text:?} is not a number")))?;
        let sink_name = render(&step.sink, &self.vars)?;
        let mut sink = self
            .storage
            .create_sink(&sink_name)?;

        let report = TransferController::new(&mut self.transport, &self.reader, &mut *self.observer).download(
            total,
            &mut *sink,
            &step.config(),
        )?;
        self.report.downloaded += report.bytes;
        Ok(())
    }

    fn run_upload(&mut self, step: &UploadStep) -> Result<()> {
        let source_name = render(&step.source, &self.vars)?;
        let mut payload = Vec::new();
        self.storage
            .open_source(&source_name)?
            .read_to_end(&mut payload)?;

        if let Some(size) = &step.size {
            let size_text = render(size, &self.vars)?;
            let expected: u64 = size_text
                .trim()
                .parse()
                .map_err(|_| Error::script(format!("upload size {size_text:?} is not a number")))?;
            let actual = payload.len() as u64;
            if actual != expected {
                return Err(Error::SourceMismatch { expected, actual });
            }
        }

        TransferController::new(&mut self.transport, &self.reader, &mut *self.observer)
            .upload(&payload, &step.config())?;
        self.report.uploaded += payload.len() as u64;
        Ok(())
    }

    fn delay(&self, duration: Duration) -> Result<()> {
        let slice = Duration::from_millis(50);
        let start = Instant::now();
        loop {
            self.transport
                .cancel_token()
                .check()?;
            let remaining = duration.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(slice));
        }
    }
}
