//! Protocol and server reported errors.
use bytes::Bytes;

use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres.
///
/// A protocol error is fatal to the connection it occurred on.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {}", tag_char(.0))]
    UnknownMessage(u8),
    #[error("unexpected message {} while {}", tag_char(.found), .phase)]
    Unexpected {
        found: u8,
        phase: &'static str,
    },
    #[error("expected message {}, found {}", tag_char(.expect), tag_char(.found))]
    Mismatch {
        expect: u8,
        found: u8,
    },
    #[error("unknown authentication method: {0}")]
    UnknownAuth(u32),
    #[error("unknown format code: {0}")]
    UnknownFormat(u16),
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("message length {0} exceeds buffer capacity")]
    Oversize(usize),
    #[error("Row description field count ({fields}) and data row field count ({values}) do not match")]
    RowFieldCount {
        fields: usize,
        values: usize,
    },
    #[error("unknown oid: {0}")]
    UnknownOid(u32),
}

fn tag_char(tag: &u8) -> char {
    char::from(*tag)
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::UnknownMessage(found)
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Mismatch { expect, found }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { found, phase }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth(auth)
    }

    pub(crate) fn unknown_format(code: u16) -> ProtocolError {
        Self::UnknownFormat(code)
    }

    pub(crate) fn malformed(msg: &'static str) -> ProtocolError {
        Self::Malformed(msg)
    }
}

/// Error or notice fields reported by the server.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator. Fields can appear in any order.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, Debug, Default)]
pub struct DbError {
    /// `ERROR`, `FATAL`, or `PANIC` (in an error message), or `WARNING`,
    /// `NOTICE`, `DEBUG`, `INFO`, or `LOG` (in a notice message).
    pub severity: ByteStr,
    /// The SQLSTATE code for the error. Not localizable.
    pub code: ByteStr,
    /// The primary human-readable error message.
    pub message: ByteStr,
    /// Optional secondary error message carrying more detail.
    pub detail: Option<ByteStr>,
    /// Optional suggestion what to do about the problem.
    pub hint: Option<ByteStr>,
    /// Error cursor position as an index into the original query string.
    pub position: Option<u32>,
    /// Source-code routine reporting the error.
    pub routine: Option<ByteStr>,
}

impl DbError {
    /// Decode the field list of an `ErrorResponse` or `NoticeResponse` body.
    ///
    /// Fields of unrecognized type are silently ignored, as the protocol
    /// requires of frontends.
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut err = DbError::default();
        loop {
            let Some(&field) = body.first() else {
                return Err(ProtocolError::malformed("ErrorResponse"));
            };
            bytes::Buf::advance(&mut body, 1);
            if field == 0 {
                break;
            }
            let value = body
                .get_nul_bytestr()
                .ok_or_else(|| ProtocolError::malformed("ErrorResponse"))?;
            match field {
                b'S' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'R' => err.routine = Some(value),
                _ => { }
            }
        }
        Ok(err)
    }

    /// SQLSTATE 57014, reported after a CancelRequest took effect.
    pub fn is_query_canceled(&self) -> bool {
        self.code == "57014"
    }
}

impl std::error::Error for DbError { }

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    use crate::ext::BufMutExt;

    fn error_body(fields: &[(u8, &str)]) -> Bytes {
        let mut buf = BytesMut::new();
        for (field, value) in fields {
            buf.put_u8(*field);
            buf.put_nul_string(value);
        }
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn parse_error_fields() {
        let body = error_body(&[
            (b'S', "ERROR"),
            (b'C', "42703"),
            (b'M', "column \"foo\" does not exist"),
            (b'P', "8"),
            (b'Z', "ignored unknown field"),
        ]);
        let err = DbError::parse(body).unwrap();
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42703");
        assert_eq!(err.message, "column \"foo\" does not exist");
        assert_eq!(err.position, Some(8));
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn canceled_code() {
        let body = error_body(&[(b'S', "ERROR"), (b'C', "57014"), (b'M', "canceling statement")]);
        assert!(DbError::parse(body).unwrap().is_query_canceled());
    }
}
