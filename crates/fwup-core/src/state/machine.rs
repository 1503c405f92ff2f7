//! Transfer state machine.
//!
//! The machine performs no I/O. It hands out [`Request`]s, and the driver
//! feeds each outcome back as a [`Completion`]. The device is authoritative
//! for the next offset: after every acknowledged chunk the machine re-reads
//! it rather than advancing a local counter, which makes a fresh session
//! resume wherever the device left off.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::NotificationDispatcher;
use crate::endpoints::{Endpoint, SetupError};
use crate::events::{LogLevel, UpdateEvent, UpdateObserver, VersionSource};
use crate::protocol::{CHUNK_SIZE, Chunk, DEFAULT_REQUEST_TIMEOUT_MS, WireError, decode_u32};
use crate::source::{ChunkSource, FirmwareLocation, SourceError};
use crate::transport::{ChangedFields, TransportError};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// Not started.
    #[default]
    Idle,
    /// Waiting for the initial version read.
    VersionRequested,
    /// Waiting for boot notifications to be enabled.
    NotifyEnabling,
    /// Waiting for the device offset.
    OffsetQuery,
    /// Building the next chunk.
    ChunkSend,
    /// Waiting for the chunk write to be acknowledged.
    AckWait,
    /// Image fully transferred.
    Complete,
    /// Session stopped on an error.
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => write!(f, "IDLE"),
            TransferState::VersionRequested => write!(f, "VERSION_REQUESTED"),
            TransferState::NotifyEnabling => write!(f, "NOTIFY_ENABLING"),
            TransferState::OffsetQuery => write!(f, "OFFSET_QUERY"),
            TransferState::ChunkSend => write!(f, "CHUNK_SEND"),
            TransferState::AckWait => write!(f, "ACK_WAIT"),
            TransferState::Complete => write!(f, "COMPLETE"),
            TransferState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    EnableNotify,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
            OperationKind::EnableNotify => write!(f, "enable-notify"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write(Vec<u8>),
    EnableNotify,
}

/// A request the driver must perform on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub endpoint: Endpoint,
    pub op: Operation,
}

impl Request {
    pub fn read(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            op: Operation::Read,
        }
    }

    pub fn write(endpoint: Endpoint, data: Vec<u8>) -> Self {
        Self {
            endpoint,
            op: Operation::Write(data),
        }
    }

    pub fn enable_notify(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            op: Operation::EnableNotify,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.op {
            Operation::Read => OperationKind::Read,
            Operation::Write(_) => OperationKind::Write,
            Operation::EnableNotify => OperationKind::EnableNotify,
        }
    }
}

/// Outcome of a request, reported back by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Read { endpoint: Endpoint, value: Vec<u8> },
    Written { endpoint: Endpoint },
    NotifyEnabled { endpoint: Endpoint },
    Failed { endpoint: Endpoint, error: TransportError },
}

impl Completion {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Completion::Read { endpoint, .. }
            | Completion::Written { endpoint }
            | Completion::NotifyEnabled { endpoint }
            | Completion::Failed { endpoint, .. } => *endpoint,
        }
    }

    fn kind(&self) -> Option<OperationKind> {
        match self {
            Completion::Read { .. } => Some(OperationKind::Read),
            Completion::Written { .. } => Some(OperationKind::Write),
            Completion::NotifyEnabled { .. } => Some(OperationKind::EnableNotify),
            Completion::Failed { .. } => None,
        }
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Perform this request.
    Issue(Request),
    /// Nothing to do until another completion or notification arrives.
    Wait,
    /// Image fully transferred.
    Complete,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{endpoint} request failed: {source}")]
    Transport {
        endpoint: Endpoint,
        #[source]
        source: TransportError,
    },

    #[error("{endpoint} request timed out after {after_ms}ms")]
    Timeout { endpoint: Endpoint, after_ms: u64 },

    #[error("Malformed {endpoint} value: expected 4 bytes, got {len}")]
    MalformedValue { endpoint: Endpoint, len: usize },

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("Firmware source error: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid chunk: {0}")]
    Chunk(#[from] WireError),

    #[error("Firmware source returned no data at offset {offset} of {total}")]
    ShortRead { offset: u32, total: u32 },

    #[error("Cannot issue {kind} on {endpoint}: a {pending} request is still outstanding")]
    RequestInFlight {
        endpoint: Endpoint,
        kind: OperationKind,
        pending: OperationKind,
    },

    #[error("Session already finished")]
    Terminated,
}

/// The single sequenced request currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub endpoint: Endpoint,
    pub kind: OperationKind,
    pub deadline: Instant,
}

impl PendingRequest {
    fn matches(&self, completion: &Completion) -> bool {
        self.endpoint == completion.endpoint() && Some(self.kind) == completion.kind()
    }
}

enum SourceSlot {
    Unconfigured,
    Pending(FirmwareLocation),
    Open(Box<dyn ChunkSource>),
}

/// Totals for a finished (or failed) session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Offset the device reported on the first query.
    pub start_offset: Option<u32>,
    /// Last offset the device reported.
    pub offset: u32,
    pub total_size: Option<u32>,
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    /// Most recent version read from the device.
    pub version: Option<u32>,
}

/// One update session.
pub struct TransferMachine<O: UpdateObserver> {
    state: TransferState,
    pending: Option<PendingRequest>,
    /// Version reads triggered by boot notifications, outside Control sequencing.
    status_reads: u32,
    source: SourceSlot,
    dispatcher: NotificationDispatcher<Request>,
    request_timeout: Duration,
    observer: Arc<O>,
    summary: TransferSummary,
}

impl<O: UpdateObserver> TransferMachine<O> {
    pub fn new(observer: Arc<O>) -> Self {
        Self {
            state: TransferState::Idle,
            pending: None,
            status_reads: 0,
            source: SourceSlot::Unconfigured,
            dispatcher: NotificationDispatcher::new(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            observer,
            summary: TransferSummary::default(),
        }
    }

    /// Image to open the first time the device offset is known.
    pub fn with_location(mut self, location: FirmwareLocation) -> Self {
        self.source = SourceSlot::Pending(location);
        self
    }

    /// Use an already open image.
    pub fn with_source(mut self, source: Box<dyn ChunkSource>) -> Self {
        self.source = SourceSlot::Open(source);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn status_reads_outstanding(&self) -> u32 {
        self.status_reads
    }

    pub fn summary(&self) -> TransferSummary {
        self.summary
    }

    /// Begin the session by requesting the device version.
    pub fn start(&mut self) -> Result<Step, SessionError> {
        self.ensure_active()?;
        if self.state != TransferState::Idle {
            warn!(state = %self.state, "start() called on a running session");
            return Ok(Step::Wait);
        }
        self.goto_state(TransferState::VersionRequested);
        let step = self.issue(Request::read(Endpoint::VersionRead));
        self.guard(step)
    }

    /// Feed the outcome of a previously issued request.
    pub fn on_completion(&mut self, completion: Completion) -> Result<Step, SessionError> {
        self.ensure_active()?;
        let step = self.handle_completion(completion);
        self.guard(step)
    }

    /// Feed a "value changed" event from the transport.
    pub fn on_notification(
        &mut self,
        endpoint: Uuid,
        changed: &ChangedFields,
    ) -> Result<Step, SessionError> {
        self.ensure_active()?;
        match self.dispatcher.dispatch(endpoint, changed) {
            Some(request) => {
                debug!(%endpoint, "Boot notification, requesting version");
                self.status_reads += 1;
                Ok(Step::Issue(request))
            }
            None => Ok(Step::Wait),
        }
    }

    /// Fail the session if the outstanding request is past its deadline.
    pub fn expire(&mut self, now: Instant) -> Result<Step, SessionError> {
        self.ensure_active()?;
        match self.pending {
            Some(p) if now >= p.deadline => {
                let err = SessionError::Timeout {
                    endpoint: p.endpoint,
                    after_ms: self.request_timeout.as_millis() as u64,
                };
                Err(self.fail(err))
            }
            _ => Ok(Step::Wait),
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::Terminated);
        }
        Ok(())
    }

    fn guard(&mut self, step: Result<Step, SessionError>) -> Result<Step, SessionError> {
        step.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.pending = None;
        self.status_reads = 0;
        self.observer.on_event(&UpdateEvent::Error {
            message: err.to_string(),
        });
        self.goto_state(TransferState::Failed);
        err
    }

    fn goto_state(&mut self, new_state: TransferState) {
        if self.state == new_state {
            return;
        }
        info!(from = %self.state, to = %new_state, "State transition");
        if new_state.is_terminal() {
            self.dispatcher.unregister(Endpoint::BootNotify.uuid());
        }
        self.observer.on_event(&UpdateEvent::PhaseChanged {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
    }

    fn issue(&mut self, request: Request) -> Result<Step, SessionError> {
        if let Some(p) = &self.pending {
            return Err(SessionError::RequestInFlight {
                endpoint: request.endpoint,
                kind: request.kind(),
                pending: p.kind,
            });
        }
        self.pending = Some(PendingRequest {
            endpoint: request.endpoint,
            kind: request.kind(),
            deadline: Instant::now() + self.request_timeout,
        });
        Ok(Step::Issue(request))
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<Step, SessionError> {
        if let Completion::Failed { endpoint, error } = completion {
            return Err(match error {
                TransportError::Timeout { timeout_ms } => SessionError::Timeout {
                    endpoint,
                    after_ms: timeout_ms,
                },
                source => SessionError::Transport { endpoint, source },
            });
        }

        let sequenced = self.pending.is_some_and(|p| p.matches(&completion));
        if !sequenced {
            return self.handle_unsequenced(completion);
        }
        self.pending = None;

        match (self.state, completion) {
            (TransferState::VersionRequested, Completion::Read { endpoint, value }) => {
                let version = Self::decode(endpoint, &value)?;
                self.report_version(version, VersionSource::Initial);

                // Wire the consumer before the device is told to notify.
                self.dispatcher
                    .register(Endpoint::BootNotify.uuid(), |_value: &[u8]| {
                        Request::read(Endpoint::VersionRead)
                    });
                self.goto_state(TransferState::NotifyEnabling);
                self.issue(Request::enable_notify(Endpoint::BootNotify))
            }
            (TransferState::NotifyEnabling, Completion::NotifyEnabled { .. }) => {
                self.observer.on_event(&UpdateEvent::NotificationsEnabled);
                self.query_offset()
            }
            (TransferState::OffsetQuery, Completion::Read { endpoint, value }) => {
                let offset = Self::decode(endpoint, &value)?;
                self.on_offset(offset)
            }
            (TransferState::AckWait, Completion::Written { .. }) => self.query_offset(),
            (state, completion) => {
                // A matching pending request always corresponds to one of the
                // arms above; anything else is a protocol anomaly.
                warn!(%state, ?completion, "Completion does not fit current state");
                Ok(Step::Wait)
            }
        }
    }

    fn handle_unsequenced(&mut self, completion: Completion) -> Result<Step, SessionError> {
        match completion {
            Completion::Read {
                endpoint: Endpoint::VersionRead,
                value,
            } if self.status_reads > 0 => {
                self.status_reads -= 1;
                let version = Self::decode(Endpoint::VersionRead, &value)?;
                self.report_version(version, VersionSource::BootNotification);
                Ok(Step::Wait)
            }
            other => {
                warn!(state = %self.state, completion = ?other, "Ignoring unexpected completion");
                self.observer.on_event(&UpdateEvent::Log {
                    level: LogLevel::Warn,
                    message: format!("Unexpected completion on {}", other.endpoint()),
                });
                Ok(Step::Wait)
            }
        }
    }

    fn decode(endpoint: Endpoint, value: &[u8]) -> Result<u32, SessionError> {
        decode_u32(value).map_err(|_| SessionError::MalformedValue {
            endpoint,
            len: value.len(),
        })
    }

    fn report_version(&mut self, version: u32, source: VersionSource) {
        self.summary.version = Some(version);
        self.observer
            .on_event(&UpdateEvent::VersionReported { version, source });
    }

    fn query_offset(&mut self) -> Result<Step, SessionError> {
        self.goto_state(TransferState::OffsetQuery);
        self.issue(Request::read(Endpoint::Control))
    }

    fn open_source(&mut self) -> Result<&mut Box<dyn ChunkSource>, SessionError> {
        if let SourceSlot::Pending(location) = &self.source {
            let opened = location.open()?;
            self.source = SourceSlot::Open(opened);
        }
        match &mut self.source {
            SourceSlot::Open(source) => Ok(source),
            _ => Err(SetupError::MissingFirmware.into()),
        }
    }

    fn on_offset(&mut self, offset: u32) -> Result<Step, SessionError> {
        let total = self.open_source()?.size();
        self.summary.total_size = Some(total);
        self.summary.offset = offset;
        if self.summary.start_offset.is_none() {
            self.summary.start_offset = Some(offset);
            if offset > 0 && offset < total {
                info!(offset, total, "Resuming update");
            }
        }

        self.observer
            .on_event(&UpdateEvent::OffsetReported { offset, total });
        self.observer.on_event(&UpdateEvent::Progress {
            current: offset.min(total) as u64,
            total: total as u64,
        });

        if offset >= total {
            if offset > total {
                warn!(offset, total, "Device offset is past the end of the image");
            }
            self.goto_state(TransferState::Complete);
            self.observer.on_event(&UpdateEvent::Complete { total });
            return Ok(Step::Complete);
        }

        self.goto_state(TransferState::ChunkSend);
        let payload = self.open_source()?.read_at(offset, CHUNK_SIZE)?;
        if payload.is_empty() {
            return Err(SessionError::ShortRead { offset, total });
        }
        let chunk = Chunk::new(offset, payload)?;
        let len = chunk.payload.len();

        debug!(offset, len, "Sending chunk");
        self.summary.chunks_sent += 1;
        self.summary.bytes_sent += len as u64;
        self.observer.on_event(&UpdateEvent::ChunkSent { offset, len });

        self.goto_state(TransferState::AckWait);
        self.issue(Request::write(Endpoint::Control, chunk.to_bytes()))
    }
}

impl<O: UpdateObserver> fmt::Debug for TransferMachine<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferMachine")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("status_reads", &self.status_reads)
            .field("summary", &self.summary)
            .finish()
    }
}
