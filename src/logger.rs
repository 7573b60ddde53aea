//! Log levels and query argument redaction.
//!
//! Events are emitted through [`tracing`]; the connection's [`LogLevel`]
//! gates them before they reach the subscriber.
use std::fmt::Write;

use crate::{encode::Encoded, types::UUID, value::ValueRef};

/// Query logging level.
///
/// The values are chosen such that the zero value means that no log level
/// was specified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    #[default]
    Unset = 0,
    None = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Trace = 6,
}

impl LogLevel {
    /// Whether an event at `level` should be emitted under this setting.
    ///
    /// An unset level behaves as [`LogLevel::Info`].
    pub fn covers(self, level: LogLevel) -> bool {
        let effective = match self {
            LogLevel::Unset => LogLevel::Info,
            other => other,
        };
        effective >= level && level > LogLevel::None
    }
}

impl std::str::FromStr for LogLevel {
    type Err = InvalidLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "none" => Ok(Self::None),
            _ => Err(InvalidLogLevel),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
            Self::Unset => "unset",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid log level")]
pub struct InvalidLogLevel;

/// Maximum bytes of an argument rendered into a log event.
const REDACT_LIMIT: usize = 64;

/// Render query arguments for logging.
///
/// Byte arguments under 64 bytes are hex encoded, longer ones keep their
/// first 64 bytes of hex followed by a truncation note. Strings longer
/// than 64 bytes are truncated the same way. Sixteen-byte uuid arguments
/// are rendered in canonical uuid form.
pub fn redact_args(params: &[Encoded]) -> Vec<String> {
    params.iter().map(redact_arg).collect()
}

fn redact_arg(param: &Encoded) -> String {
    match param.value() {
        ValueRef::Null => "NULL".into(),
        ValueRef::Bool(b) => b.to_string(),
        ValueRef::Int2(n) => itoa::Buffer::new().format(*n).into(),
        ValueRef::Int4(n) => itoa::Buffer::new().format(*n).into(),
        ValueRef::Int8(n) => itoa::Buffer::new().format(*n).into(),
        ValueRef::Float4(n) => n.to_string(),
        ValueRef::Float8(n) => n.to_string(),
        ValueRef::Text(t) => redact_str(t),
        ValueRef::String(s) => redact_str(s),
        ValueRef::Slice(b) => redact_bytes(b, param.oid()),
        ValueRef::Bytes(b) => redact_bytes(b, param.oid()),
    }
}

fn redact_str(s: &str) -> String {
    if s.len() <= REDACT_LIMIT {
        return s.into();
    }
    let mut cut = REDACT_LIMIT;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{} (truncated {} bytes)", &s[..cut], s.len() - cut)
}

fn redact_bytes(b: &[u8], oid: u32) -> String {
    if oid == UUID {
        if let Ok(uuid) = <[u8; 16]>::try_from(b) {
            return uuid_string(&uuid);
        }
    }
    if b.len() <= REDACT_LIMIT {
        return hex(b);
    }
    format!("{} (truncated {} bytes)", hex(&b[..REDACT_LIMIT]), b.len() - REDACT_LIMIT)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a string");
    }
    out
}

/// Canonical `8-4-4-4-12` rendering.
pub(crate) fn uuid_string(b: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in b.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        write!(out, "{byte:02x}").expect("writing to a string");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::Encode;

    #[test]
    fn short_string_verbatim() {
        let args = [("hello").encode()];
        assert_eq!(redact_args(&args), ["hello"]);
    }

    #[test]
    fn long_string_truncated() {
        let long = "x".repeat(200);
        let args = [long.as_str().encode()];
        let rendered = &redact_args(&args)[0];
        assert_eq!(rendered, &format!("{} (truncated 136 bytes)", "x".repeat(64)));
    }

    #[test]
    fn short_bytes_hex() {
        let args = [(&b"\x01\xab"[..]).encode()];
        assert_eq!(redact_args(&args), ["01ab"]);
    }

    #[test]
    fn long_bytes_truncated() {
        let bytes = vec![0xffu8; 100];
        let args = [bytes.encode()];
        let rendered = &redact_args(&args)[0];
        assert_eq!(rendered, &format!("{} (truncated 36 bytes)", "ff".repeat(64)));
    }

    #[test]
    fn uuid_rendering() {
        let uuid: [u8; 16] = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0,
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0,
        ];
        let args = [uuid.encode()];
        assert_eq!(redact_args(&args), ["12345678-9abc-def0-1234-56789abcdef0"]);
    }

    #[test]
    fn level_order() {
        use std::str::FromStr;
        assert!(LogLevel::Info.covers(LogLevel::Error));
        assert!(!LogLevel::Error.covers(LogLevel::Info));
        assert!(!LogLevel::None.covers(LogLevel::Error));
        assert!(LogLevel::Unset.covers(LogLevel::Info));
        assert!(!LogLevel::Unset.covers(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }
}
