// Parfetch Parallel Download Accelerator for S3 Compatible Object Storage
// Copyright 2025 Parfetch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error definitions for download operations

use crate::s3::error_response::S3ErrorResponse;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Low-level transport failure classes.
///
/// These mirror the classification used by the retry wrapper: every variant
/// except [`NetworkErrorKind::Other`] is considered transient and retriable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionReset,
    ConnectionRefused,
    HostUnreachable,
    BrokenPipe,
    SocketTimeout,
    GenericTimeout,
    NameNotFound,
    TransientNameServerFailure,
    ResourceBusy,
    /// The resolver returned an empty answer for the hostname.
    NoRecords,
    Other(String),
}

impl NetworkErrorKind {
    /// Maps an I/O error kind from the transport onto the retry
    /// classification. Unrecognized kinds land in `Other`.
    pub fn from_io_kind(kind: std::io::ErrorKind, msg: &str) -> Self {
        use std::io::ErrorKind::*;
        match kind {
            ConnectionReset => NetworkErrorKind::ConnectionReset,
            ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            HostUnreachable | NetworkUnreachable => NetworkErrorKind::HostUnreachable,
            BrokenPipe => NetworkErrorKind::BrokenPipe,
            TimedOut => NetworkErrorKind::SocketTimeout,
            ResourceBusy => NetworkErrorKind::ResourceBusy,
            _ => NetworkErrorKind::Other(msg.to_string()),
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, NetworkErrorKind::Other(_))
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::ConnectionReset => write!(f, "connection reset by peer"),
            NetworkErrorKind::ConnectionRefused => write!(f, "connection refused"),
            NetworkErrorKind::HostUnreachable => write!(f, "host unreachable"),
            NetworkErrorKind::BrokenPipe => write!(f, "broken pipe"),
            NetworkErrorKind::SocketTimeout => write!(f, "socket timed out"),
            NetworkErrorKind::GenericTimeout => write!(f, "operation timed out"),
            NetworkErrorKind::NameNotFound => write!(f, "hostname not found"),
            NetworkErrorKind::TransientNameServerFailure => {
                write!(f, "transient name server failure")
            }
            NetworkErrorKind::ResourceBusy => write!(f, "resource busy"),
            NetworkErrorKind::NoRecords => write!(f, "no address records for hostname"),
            NetworkErrorKind::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// The six independent request deadlines. Each maps to one field of
/// [`TimeoutProfile`](crate::s3::http::TimeoutProfile).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Resolve,
    Connection,
    Write,
    Read,
    Data,
    Request,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Resolve => write!(f, "DNS resolution"),
            TimeoutKind::Connection => write!(f, "connection establishment"),
            TimeoutKind::Write => write!(f, "request body write"),
            TimeoutKind::Read => write!(f, "response body read"),
            TimeoutKind::Data => write!(f, "response data gap"),
            TimeoutKind::Request => write!(f, "request"),
        }
    }
}

/// Errors detected while validating caller-supplied configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationErr {
    #[error("part size must be greater than zero, got {0} MB")]
    InvalidPartSize(u64),
    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("{0}")]
    UrlBuildError(String),
    #[error("download already consumed; read_stream/to_file may be called once")]
    AlreadyConsumed,
}

/// Error definitions
///
/// The enum is `Clone` so a single failure can be surfaced both through the
/// sink's error channel and through the memoized probe without re-running the
/// failed operation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A parsed S3 `<Error>` response body.
    #[error("{0}")]
    S3Error(S3ErrorResponse),

    /// A non-2xx response that did not carry a parseable XML error body.
    #[error("invalid response received; status code: {status_code}; content-type: {content_type}")]
    InvalidResponse {
        status_code: u16,
        content_type: String,
        body: Bytes,
    },

    /// A body that was expected to be XML but did not parse or did not match
    /// the `<Error>` document shape.
    #[error("unexpected XML response: {0}")]
    XmlError(String),

    /// The server answered a ranged request with a `Content-Range` that does
    /// not match the requested range.
    #[error("unexpected content range: {0}")]
    UnexpectedContentRange(String),

    #[error("network error: {0}")]
    Network(NetworkErrorKind),

    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    /// The download was aborted by the caller (or by an internal failure that
    /// carries its own cause).
    #[error("{}", .0.as_deref().unwrap_or("aborted"))]
    Cancelled(Option<String>),

    #[error(transparent)]
    Validation(#[from] ValidationErr),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub fn cancelled() -> Self {
        Error::Cancelled(None)
    }

    /// Returns the parsed S3 error response when this is a protocol error.
    pub fn as_s3_error(&self) -> Option<&S3ErrorResponse> {
        match self {
            Error::S3Error(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
