//! Postgres Backend Messages
use bytes::{Buf, Bytes};

use super::{DbError, FieldDescription, Oid, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    FunctionCallResponse(FunctionCallResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }

            /// Whether a tag byte identifies a known backend message.
            ///
            /// The framer rejects unknown tags before the body is queued.
            pub fn is_known(msgtype: u8) -> bool {
                matches!(msgtype, $($name::MSGTYPE)|*)
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyBothResponse,
    CopyData,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms,
    /// in the server's order of preference.
    SASL {
        name: Bytes,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 4 {
            return Err(ProtocolError::malformed("Authentication"));
        }
        let auth = match body.get_u32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::malformed("Authentication"));
                }
                Authentication::MD5Password { salt: body.get_u32().to_be_bytes() }
            },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => Authentication::SASL { name: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Clone, Copy, Debug)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 8 {
            return Err(ProtocolError::malformed("BackendKeyData"));
        }
        Ok(Self {
            process_id: body.get_u32(),
            secret_key: body.get_u32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let malformed = || ProtocolError::malformed("ParameterStatus");
        Ok(Self {
            name: body.get_nul_bytestr().ok_or_else(malformed)?,
            value: body.get_nul_bytestr().ok_or_else(malformed)?,
        })
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug)]
pub struct NoticeResponse {
    pub notice: DbError,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(NoticeResponse { notice: DbError::parse(body)? })
    }
}

/// Identifies the message as an error.
///
/// A server error never kills the connection; only framing and I/O
/// failures do.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: DbError,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { error: DbError::parse(body)? })
    }
}

/// Identifies the message as an asynchronous notification from `NOTIFY`.
#[derive(Debug)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let malformed = || ProtocolError::malformed("NotificationResponse");
        if body.remaining() < 4 {
            return Err(malformed());
        }
        Ok(Self {
            process_id: body.get_u32(),
            channel: body.get_nul_bytestr().ok_or_else(malformed)?,
            payload: body.get_nul_bytestr().ok_or_else(malformed)?,
        })
    }
}

/// Identifies the message as a row description
#[derive(Debug)]
pub struct RowDescription {
    /// Specifies the number of fields in a row (can be zero).
    pub field_len: u16,
    /// Undecoded response body.
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';

    /// Parse the per-field descriptions.
    pub fn fields(&self) -> Result<Vec<FieldDescription>, ProtocolError> {
        let mut body = self.body.clone();
        let mut fields = Vec::with_capacity(self.field_len as usize);
        for _ in 0..self.field_len {
            fields.push(FieldDescription::parse(&mut body)?);
        }
        Ok(fields)
    }
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 2 {
            return Err(ProtocolError::malformed("RowDescription"));
        }
        Ok(Self {
            field_len: body.get_u16(),
            body,
        })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub column_len: u16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Split the body into per-column values.
    ///
    /// A length of -1 on the wire indicates a NULL column value.
    pub fn values(&self) -> Result<Vec<Option<Bytes>>, ProtocolError> {
        let mut body = self.body.clone();
        let mut values = Vec::with_capacity(self.column_len as usize);
        for _ in 0..self.column_len {
            if body.remaining() < 4 {
                return Err(ProtocolError::malformed("DataRow"));
            }
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
                continue;
            }
            let len = len as usize;
            if body.remaining() < len {
                return Err(ProtocolError::malformed("DataRow"));
            }
            values.push(Some(body.split_to(len)));
        }
        Ok(values)
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 2 {
            return Err(ProtocolError::malformed("DataRow"));
        }
        Ok(Self {
            column_len: body.get_u16(),
            body,
        })
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is INSERT oid rows. For a DELETE, UPDATE,
/// MERGE, SELECT, MOVE, FETCH or COPY command the tag carries the affected
/// row count in its last word.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which
    /// SQL command was completed.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows the completed command affected, zero when the tag
    /// carries none.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            tag: body
                .get_nul_bytestr()
                .ok_or_else(|| ProtocolError::malformed("CommandComplete"))?,
        })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major
    /// protocol version requested by the client.
    pub minor: u32,
    /// Number of protocol options not recognized by the server.
    pub len: u32,
    /// Then, for protocol option not recognized by the server, there is the following:
    pub opt_names: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 8 {
            return Err(ProtocolError::malformed("NegotiateProtocolVersion"));
        }
        Ok(Self {
            minor: body.get_u32(),
            len: body.get_u32(),
            opt_names: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// Specifies the object ID of each parameter data type.
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 2 {
            return Err(ProtocolError::malformed("ParameterDescription"));
        }
        let param_len = body.get_u16();
        if body.remaining() < param_len as usize * 4 {
            return Err(ProtocolError::malformed("ParameterDescription"));
        }
        let mut oids = Vec::with_capacity(param_len as usize);
        for _ in 0..param_len {
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// Identifies the message as `COPY` data.
#[derive(Debug)]
pub struct CopyData {
    /// Data that forms part of a COPY data stream.
    ///
    /// Messages sent from the backend will always correspond to single data
    /// rows, but messages sent by frontends might divide the data stream
    /// arbitrarily.
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data: body })
    }
}

/// Identifies the message as the result of a function call.
#[derive(Debug)]
pub struct FunctionCallResponse {
    /// The function result value, `None` for NULL.
    pub result: Option<Bytes>,
}

impl FunctionCallResponse {
    pub const MSGTYPE: u8 = b'V';
}

impl BackendProtocol for FunctionCallResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 4 {
            return Err(ProtocolError::malformed("FunctionCallResponse"));
        }
        let len = body.get_i32();
        if len < 0 {
            return Ok(Self { result: None });
        }
        if body.remaining() < len as usize {
            return Err(ProtocolError::malformed("FunctionCallResponse"));
        }
        Ok(Self { result: Some(body.split_to(len as usize)) })
    }
}

macro_rules! copy_response {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// 0 indicates the overall COPY format is textual, 1 indicates binary.
            pub format: u8,
            /// The format codes to be used for each column.
            pub column_formats: Vec<u16>,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                if body.remaining() < 3 {
                    return Err(ProtocolError::malformed(stringify!($name)));
                }
                let format = body.get_u8();
                let column_len = body.get_u16();
                if body.remaining() < column_len as usize * 2 {
                    return Err(ProtocolError::malformed(stringify!($name)));
                }
                let mut column_formats = Vec::with_capacity(column_len as usize);
                for _ in 0..column_len {
                    column_formats.push(body.get_u16());
                }
                Ok(Self { format, column_formats })
            }
        }
    )*};
}

copy_response! {
    /// Identifies the message as a Start Copy In response.
    ///
    /// The frontend must now send copy-in data.
    struct CopyInResponse, b'G';

    /// Identifies the message as a Start Copy Out response.
    ///
    /// This message will be followed by copy-out data.
    struct CopyOutResponse, b'H';

    /// Identifies the message as a Start Copy Both response.
    ///
    /// This message is used only for Streaming Replication.
    struct CopyBothResponse, b'W';
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend
/// is ready for a new query cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    ///
    /// Possible values are 'I' if idle (not in a transaction block);
    /// 'T' if in a transaction block; or 'E' if in a failed transaction block.
    pub status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if !body.has_remaining() {
            return Err(ProtocolError::malformed("ReadyForQuery"));
        }
        Ok(Self { status: body.get_u8() })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    assert_msgtype!(msgtype);
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    use crate::ext::BufMutExt;

    #[test]
    fn data_row_values_with_null() {
        let mut body = BytesMut::new();
        body.put_u16(3);
        body.put_i32(2);
        body.put_slice(b"42");
        body.put_i32(-1);
        body.put_i32(0);
        let row = DataRow::decode(b'D', body.freeze()).unwrap();
        let values = row.values().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].as_deref(), Some(&b"42"[..]));
        assert_eq!(values[1], None);
        assert_eq!(values[2].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn data_row_truncated_body() {
        let mut body = BytesMut::new();
        body.put_u16(1);
        body.put_i32(16);
        body.put_slice(b"short");
        let row = DataRow::decode(b'D', body.freeze()).unwrap();
        assert!(row.values().is_err());
    }

    #[test]
    fn command_complete_rows() {
        let mut body = BytesMut::new();
        body.put_nul_string("SELECT 7");
        let cmd = CommandComplete::decode(b'C', body.freeze()).unwrap();
        assert_eq!(cmd.rows_affected(), 7);

        let mut body = BytesMut::new();
        body.put_nul_string("INSERT 0 3");
        let cmd = CommandComplete::decode(b'C', body.freeze()).unwrap();
        assert_eq!(cmd.rows_affected(), 3);

        let mut body = BytesMut::new();
        body.put_nul_string("CREATE TABLE");
        let cmd = CommandComplete::decode(b'C', body.freeze()).unwrap();
        assert_eq!(cmd.rows_affected(), 0);
    }

    #[test]
    fn row_description_fields() {
        let mut body = BytesMut::new();
        body.put_u16(2);
        for (name, oid) in [("id", 23u32), ("name", 25u32)] {
            body.put_nul_string(name);
            body.put_u32(0);
            body.put_u16(0);
            body.put_u32(oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_u16(0);
        }
        let rd = RowDescription::decode(b'T', body.freeze()).unwrap();
        let fields = rd.fields().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[0].data_type, 23);
        assert_eq!(fields[1].name, "name");
        assert_eq!(fields[1].data_type, 25);
    }

    #[test]
    fn mismatched_tag_rejected() {
        assert!(DataRow::decode(b'T', Bytes::new()).is_err());
    }

    #[test]
    fn known_tags() {
        for tag in [
            b'1', b'2', b'3', b'A', b'C', b'd', b'D', b'E', b'G', b'H', b'I',
            b'K', b'n', b'N', b'R', b'S', b't', b'T', b'V', b'W', b'Z', b's', b'v',
        ] {
            assert!(BackendMessage::is_known(tag), "{}", tag as char);
        }
        assert!(!BackendMessage::is_known(b'x'));
    }
}
