//! # Error Taxonomy
//!
//! Every failure the streaming core can observe falls into one of five kinds:
//!
//! | Kind | Recovery |
//! |------|----------|
//! | `TransportError` | retried automatically by the reconnect state machine |
//! | `ParseError` | message logged and dropped, connection stays open |
//! | `DispatchError` | isolated to the failing handler |
//! | `ResolutionError` | rendered as an in-place error placeholder |
//! | `MissingReferenceError` | rendered as an in-place missing placeholder |
//!
//! None of them is fatal. Components report what they swallow to an
//! [`ErrorSink`], the error-collection collaborator injected at construction.

use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Connection-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// An outbound message was offered while the connection was not open.
    #[error("connection is not open")]
    NotOpen,

    /// The configured endpoint could not be parsed.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    /// The handshake with the server failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Reading from or writing to an open socket failed.
    #[error("socket error: {0}")]
    Socket(String),

    /// An outbound payload could not be serialised.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

/// Malformed inbound data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The frame was not valid JSON (or not valid UTF-8).
    #[error("malformed message: {0}")]
    Json(String),

    /// Valid JSON that matches none of the known envelope shapes.
    #[error("unrecognised message shape: {0}")]
    UnknownShape(String),

    /// A section key string that does not follow `top-bottom_left-right`.
    #[error("invalid section key: {0}")]
    SectionKey(String),

    /// A widget reference that does not follow `pack@component`.
    #[error("invalid widget reference: {0}")]
    WidgetRef(String),

    /// A table chunk whose row range cannot be placed.
    #[error("table '{table_id}' chunk at offset {offset} rejected: {reason}")]
    TableRange {
        /// Table identifier.
        table_id: String,
        /// Offset announced by the chunk.
        offset: usize,
        /// Which bound the chunk broke.
        reason: String,
    },
}

/// A handler registered with the dispatch router failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler '{prefix}' failed on action '{action}': {reason}")]
pub struct DispatchError {
    /// Full action name that was being dispatched.
    pub action: String,
    /// Prefix of the handler that failed.
    pub prefix: String,
    /// Error message or panic payload.
    pub reason: String,
}

/// A registered widget failed to load.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("widget '{reference}' failed to load: {reason}")]
pub struct ResolutionError {
    /// The `pack@component` reference.
    pub reference: String,
    /// Why the loader failed.
    pub reason: String,
}

/// A widget reference has no registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("widget '{reference}' is not registered")]
pub struct MissingReferenceError {
    /// The reference as it was requested.
    pub reference: String,
}

/// Umbrella error carried through the [`ErrorSink`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`ParseError`].
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// See [`DispatchError`].
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// See [`ResolutionError`].
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// See [`MissingReferenceError`].
    #[error(transparent)]
    MissingReference(#[from] MissingReferenceError),
}

impl StreamError {
    /// Only transport failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short machine-friendly name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Parse(_) => "parse",
            Self::Dispatch(_) => "dispatch",
            Self::Resolution(_) => "resolution",
            Self::MissingReference(_) => "missing_reference",
        }
    }
}

/// Error-collection collaborator.
pub trait ErrorSink: Send + Sync {
    /// Records a non-fatal failure.
    fn report(&self, error: StreamError);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, error: StreamError) {
        match &error {
            StreamError::Transport(_) => log::warn!("[{}] {}", error.kind(), error),
            StreamError::MissingReference(_) => log::debug!("[{}] {}", error.kind(), error),
            _ => log::error!("[{}] {}", error.kind(), error),
        }
    }
}

/// Sink that keeps every reported error, for diagnostics panels and tests.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    errors: Mutex<Vec<StreamError>>,
}

impl CollectingErrorSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of reported errors.
    pub fn len(&self) -> usize {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` when nothing has been reported.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the collected errors.
    pub fn take(&self) -> Vec<StreamError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ErrorSink for CollectingErrorSink {
    fn report(&self, error: StreamError) {
        log::debug!("collected {} error: {}", error.kind(), error);
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).push(error);
    }
}
