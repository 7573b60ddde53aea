//! Postgres Frontend and Backend Protocol
//!
//! docs here mostly quoted from the official postgres documentation
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>
//!
//! # Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a message identifies the message type,
//! and the next four bytes specify the length of the rest of the message (this length count includes itself,
//! but not the message-type byte). The remaining contents of the message are determined by the message type.
//!
//! ```text
//! | u8 |        i32        | body
//! |----|-------------------|-----
//! | 43 | 00 | 00 | 00 | 32 |  ..
//!
//! Message Type -> length -> body
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte.
//!
//! # Extended Query Overview
//!
//! In the extended-query protocol, overall execution cycle consists of a:
//!
//! - Parse step, which creates a prepared statement from a textual query string
//! - Bind step, which creates a portal given a prepared statement and values for any needed parameters;
//! - Execute step, that runs a portal's query.
//!
//! # Formats and Format Codes
//!
//! Data of a particular data type might be transmitted in any of several different formats.
//! As of PostgreSQL 7.4 the only supported formats are “text” and “binary”.
//!
//! | format | format code |
//! |--------|-------------|
//! |  text  |      0      |
//! | binary |      1      |
//!
//! Clients can specify a format code for each transmitted parameter value and for each column of a query result.

pub mod frontend;
pub mod backend;
pub mod error;

pub use backend::{BackendMessage, BackendProtocol};
pub use error::{DbError, ProtocolError};
pub use frontend::FrontendProtocol;

use bytes::{Buf, Bytes};

use crate::{common::ByteStr, ext::BytesExt};

/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// Postgres data transmission format.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// In the text transmitted representation, there is no trailing null character;
    /// the frontend must add one to received values if it wants to process them as C strings.
    #[default]
    Text,
    /// Binary has format code one.
    ///
    /// Binary representations for integers use network byte order (most significant byte first).
    Binary,
}

impl PgFormat {
    /// Return format code for current format.
    pub fn format_code(&self) -> u16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    /// Format from an on-wire format code.
    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(PgFormat::Text),
            1 => Ok(PgFormat::Binary),
            _ => Err(ProtocolError::unknown_format(code)),
        }
    }
}

/// Per column metadata from a `RowDescription` message.
#[derive(Clone, Debug)]
pub struct FieldDescription {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub attr_number: u16,
    /// The object ID of the field's data type.
    pub data_type: Oid,
    /// The data type size (see pg_type.typlen).
    /// Note that negative values denote variable-width types.
    pub data_type_size: i16,
    /// The type modifier (see pg_attribute.atttypmod).
    /// The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field.
    ///
    /// In a RowDescription returned from the statement variant of Describe,
    /// the format code is not yet known and will always be zero.
    pub format: PgFormat,
    /// Type name resolved from the registry.
    pub type_name: ByteStr,
}

impl FieldDescription {
    pub(crate) fn parse(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let name = body
            .get_nul_bytestr()
            .ok_or_else(|| ProtocolError::malformed("RowDescription"))?;
        if body.remaining() < 18 {
            return Err(ProtocolError::malformed("RowDescription"));
        }
        Ok(Self {
            name,
            table_oid: body.get_u32(),
            attr_number: body.get_u16(),
            data_type: body.get_u32(),
            data_type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: PgFormat::from_code(body.get_u16())?,
            type_name: ByteStr::default(),
        })
    }
}
