//! `postrow` error types.
use std::{fmt, io, str::Utf8Error, sync::Arc};

use crate::{
    connection::ParseError,
    postgres::{DbError, ProtocolError},
    types::DecodeError,
};

/// A specialized [`Result`] type for `postrow` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postrow` library.
///
/// `Error` is cheaply cloneable so the rows cursor can latch the first
/// failure while still returning it to the caller.
#[derive(Clone)]
pub struct Error {
    context: String,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        ErrorKind::Usage(message.into()).into()
    }

    /// A read deadline expired; the connection survives.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// The server reported SQLSTATE 57014 after a cancel request.
    pub fn is_canceled(&self) -> bool {
        matches!(&self.kind, ErrorKind::Database(db) if db.is_query_canceled())
    }

    /// Whether this failure must kill the connection.
    ///
    /// Framing violations and I/O failures are fatal; server errors,
    /// timeouts and decode failures are not.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Dead)
    }
}

/// All possible error kind from `postrow` library.
#[derive(Clone)]
pub enum ErrorKind {
    /// Framing, decoding or message shape violation. Fatal to the
    /// connection.
    Protocol(ProtocolError),
    /// Underlying socket failure. Fatal to the connection.
    Io(Arc<io::Error>),
    /// Error reported by the server. The connection survives.
    Database(DbError),
    /// Column value decoding failure outside a scan.
    Decode(DecodeError),
    /// Per column decode failure during a scan. Latches the cursor; the
    /// connection survives.
    Scan {
        col: usize,
        source: DecodeError,
    },
    /// `query_row` matched no rows.
    RowNotFound,
    /// A read deadline expired. Non fatal.
    Timeout,
    /// Caller misuse: wrong argument count, missing runtime parameters,
    /// oversized oid lists.
    Usage(String),
    /// A query is already in flight on this connection.
    Busy,
    /// The connection was killed by an earlier fatal error.
    Dead,
    /// The server requested an authentication scheme this crate does not
    /// implement.
    UnsupportedAuth,
    /// Connection string parsing failure.
    Config(ParseError),
    /// Postgres returned non utf8 text.
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { context: String::new(), kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(Arc::new(e)));
from!(<DbError>e => ErrorKind::Database(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<ParseError>e => ErrorKind::Config(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Scan { col, source } => write!(f, "can't scan into dest[{col}]: {source}"),
            Self::RowNotFound => write!(f, "no rows in result set"),
            Self::Timeout => write!(f, "timeout waiting for server response"),
            Self::Usage(msg) => f.write_str(msg),
            Self::Busy => write!(f, "connection busy: another query is in flight"),
            Self::Dead => write!(f, "connection is dead"),
            Self::UnsupportedAuth => write!(f, "authentication method not supported"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
