// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public error taxonomy.
//!
//! Every fallible operation in the public API returns `Result<T, Error>`.
//! Internal plumbing is free to use `anyhow::Result` (state machines,
//! codecs reached only through an already-validated path) and convert into
//! [`Error::Internal`] at the public boundary.

use thiserror::Error;

/// Argument-level failures: the caller asked for something invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("tag handle {0} is invalid or has been destroyed")]
    InvalidHandle(u32),
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("offset {offset} + width {width} exceeds buffer length {len}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        len: usize,
    },
    #[error("operation not allowed in current state: {0}")]
    NotAllowed(String),
    #[error("duplicate attribute key: {0}")]
    Duplicate(String),
    #[error("buffer too small: need at least {need} bytes, have {have}")]
    TooSmall { need: usize, have: usize },
    #[error("value too large for field: {0}")]
    TooLarge(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Resource-level failures: the library itself could not proceed.
#[derive(Debug, Error, Clone)]
pub enum ResourceError {
    #[error("internal mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("failed to spawn or join background task: {0}")]
    Task(String),
    #[error("failed to create resource: {0}")]
    CreateFailed(String),
}

/// Transport-level failures: TCP/IP and framing.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("no data available")]
    NoData,
    #[error("partial frame received")]
    Partial,
    #[error("malformed reply: {0}")]
    BadReply(String),
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("failed to close connection: {0}")]
    Close(String),
    #[error("socket read error: {0}")]
    Read(String),
    #[error("socket write error: {0}")]
    Write(String),
    #[error("operation timed out")]
    Timeout,
    #[error("bad gateway address: {0}")]
    BadGateway(String),
    #[error("bad CIP connection: {0}")]
    BadConnection(String),
    #[error("unreachable or unresponsive device")]
    BadDevice,
}

/// Protocol-level failures: the PLC replied, but with an error status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("PLC returned error status 0x{0:02x}")]
    BadStatus(u8),
    #[error("tag or object not found")]
    NotFound,
    #[error("operation aborted")]
    Aborted,
    #[error("tag is busy with another operation")]
    Busy,
    #[error("operation still pending")]
    Pending,
    #[error("checksum mismatch")]
    BadCrc,
}

/// Top-level error returned by every public entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// True only for [`ProtocolError::Pending`], the sole non-terminal
    /// status a tag may carry.
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Protocol(ProtocolError::Pending))
    }

    pub fn bad_param(msg: impl Into<String>) -> Error {
        ArgumentError::BadParam(msg.into()).into()
    }

    /// A cloned copy suitable for fan-out to multiple waiters (e.g. a tag's
    /// status channel). `anyhow::Error` itself isn't `Clone`, so the
    /// `Internal` variant is flattened to its rendered message; every other
    /// variant clones structurally.
    pub fn shallow_clone(&self) -> Error {
        match self {
            Error::Argument(e) => Error::Argument(e.clone()),
            Error::Resource(e) => Error::Resource(e.clone()),
            Error::Transport(e) => Error::Transport(e.clone()),
            Error::Protocol(e) => Error::Protocol(e.clone()),
            Error::Internal(e) => Error::Resource(ResourceError::CreateFailed(e.to_string())),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Error::Transport(TransportError::Timeout),
            ErrorKind::UnexpectedEof => Error::Transport(TransportError::Partial),
            _ => Error::Transport(TransportError::Read(e.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
