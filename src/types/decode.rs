use bytes::Bytes;

use super::{BOOL, BPCHAR, BYTEA, CHAR, FLOAT4, FLOAT8, INT2, INT4, INT8, NAME, TEXT, UUID, VARCHAR};
use crate::{
    ext::FmtExt,
    postgres::{FieldDescription, Oid, PgFormat},
};

/// An error when decoding a column value.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown oid: {0}")]
    UnknownOid(Oid),
    #[error("cannot decode column with oid {oid} into {dst}")]
    OidMismatch {
        oid: Oid,
        dst: &'static str,
    },
    #[error("unexpected NULL value")]
    UnexpectedNull,
    #[error("invalid {0} value: {1}")]
    Invalid(&'static str, String),
    #[error("postgres returned non utf8 string: {0}")]
    Utf8(std::str::Utf8Error),
}

impl DecodeError {
    pub(crate) fn invalid(name: &'static str, value: &[u8]) -> Self {
        Self::Invalid(name, value.lossy().to_string())
    }

    fn mismatch(field: &FieldDescription, dst: &'static str) -> Self {
        Self::OidMismatch { oid: field.data_type, dst }
    }
}

/// A type that can be decoded from a column value.
///
/// Implementations handle both transmission formats; the field carries the
/// format code the server actually used.
pub trait Decode: Sized {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError>;
}

impl<T: Decode> Decode for Option<T> {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        match value {
            None => Ok(None),
            some => T::decode(field, some).map(Some),
        }
    }
}

fn require<'v>(value: Option<&'v Bytes>) -> Result<&'v Bytes, DecodeError> {
    value.ok_or(DecodeError::UnexpectedNull)
}

macro_rules! decode_int {
    ($ty:ty, $name:literal, [$($oid:pat),*]) => {
        impl Decode for $ty {
            fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
                if !matches!(field.data_type, $($oid)|*) {
                    return Err(DecodeError::mismatch(field, $name));
                }
                let value = require(value)?;
                match field.format {
                    PgFormat::Text => {
                        let s = std::str::from_utf8(value).map_err(DecodeError::Utf8)?;
                        s.parse().map_err(|_| DecodeError::invalid($name, value))
                    }
                    PgFormat::Binary => match field.data_type {
                        INT2 => decode_be::<2>($name, value).map(|b| i16::from_be_bytes(b) as $ty),
                        INT4 => decode_be::<4>($name, value).map(|b| i32::from_be_bytes(b) as $ty),
                        INT8 => decode_be::<8>($name, value)
                            .and_then(|b| {
                                <$ty>::try_from(i64::from_be_bytes(b))
                                    .map_err(|_| DecodeError::invalid($name, value))
                            }),
                        _ => Err(DecodeError::mismatch(field, $name)),
                    },
                }
            }
        }
    };
}

fn decode_be<const N: usize>(name: &'static str, value: &[u8]) -> Result<[u8; N], DecodeError> {
    value.try_into().map_err(|_| DecodeError::invalid(name, value))
}

decode_int!(i16, "i16", [INT2]);
decode_int!(i32, "i32", [INT2, INT4]);
decode_int!(i64, "i64", [INT2, INT4, INT8]);

impl Decode for bool {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        if field.data_type != BOOL {
            return Err(DecodeError::mismatch(field, "bool"));
        }
        let value = require(value)?;
        match (field.format, &value[..]) {
            (PgFormat::Text, b"t") | (PgFormat::Binary, [1]) => Ok(true),
            (PgFormat::Text, b"f") | (PgFormat::Binary, [0]) => Ok(false),
            _ => Err(DecodeError::invalid("bool", value)),
        }
    }
}

impl Decode for f32 {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        if field.data_type != FLOAT4 {
            return Err(DecodeError::mismatch(field, "f32"));
        }
        let value = require(value)?;
        match field.format {
            PgFormat::Text => std::str::from_utf8(value)
                .map_err(DecodeError::Utf8)?
                .parse()
                .map_err(|_| DecodeError::invalid("f32", value)),
            PgFormat::Binary => decode_be::<4>("f32", value).map(f32::from_be_bytes),
        }
    }
}

impl Decode for f64 {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        let value = require(value)?;
        match (field.data_type, field.format) {
            (FLOAT8, PgFormat::Text) | (FLOAT4, PgFormat::Text) => std::str::from_utf8(value)
                .map_err(DecodeError::Utf8)?
                .parse()
                .map_err(|_| DecodeError::invalid("f64", value)),
            (FLOAT8, PgFormat::Binary) => decode_be::<8>("f64", value).map(f64::from_be_bytes),
            (FLOAT4, PgFormat::Binary) => {
                decode_be::<4>("f64", value).map(|b| f32::from_be_bytes(b) as f64)
            }
            _ => Err(DecodeError::mismatch(field, "f64")),
        }
    }
}

impl Decode for String {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        if !matches!(field.data_type, TEXT | VARCHAR | BPCHAR | CHAR | NAME) {
            return Err(DecodeError::mismatch(field, "String"));
        }
        let value = require(value)?;
        // Character types transmit identically in both formats.
        std::str::from_utf8(value)
            .map(str::to_owned)
            .map_err(DecodeError::Utf8)
    }
}

impl Decode for Vec<u8> {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        Bytes::decode(field, value).map(Into::into)
    }
}

impl Decode for Bytes {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        if field.data_type != BYTEA {
            return Err(DecodeError::mismatch(field, "bytes"));
        }
        let value = require(value)?;
        match field.format {
            PgFormat::Binary => Ok(value.clone()),
            PgFormat::Text => match super::decode_bytea_text(value)? {
                super::Value::Bytes(b) => Ok(b),
                _ => unreachable!("bytea text decoder yields bytes"),
            },
        }
    }
}

impl Decode for [u8; 16] {
    fn decode(field: &FieldDescription, value: Option<&Bytes>) -> Result<Self, DecodeError> {
        if field.data_type != UUID {
            return Err(DecodeError::mismatch(field, "uuid"));
        }
        let value = require(value)?;
        match field.format {
            PgFormat::Binary => decode_be::<16>("uuid", value),
            PgFormat::Text => match super::decode_uuid_text(value)? {
                super::Value::Uuid(u) => Ok(u),
                _ => unreachable!("uuid text decoder yields uuid"),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ByteStr;

    fn field(oid: Oid, format: PgFormat) -> FieldDescription {
        FieldDescription {
            name: ByteStr::from_static("c"),
            table_oid: 0,
            attr_number: 0,
            data_type: oid,
            data_type_size: -1,
            type_modifier: -1,
            format,
            type_name: ByteStr::default(),
        }
    }

    #[test]
    fn int_text_and_binary() {
        let text = Bytes::from_static(b"42");
        let n = i32::decode(&field(INT4, PgFormat::Text), Some(&text)).unwrap();
        assert_eq!(n, 42);

        let binary = Bytes::copy_from_slice(&42i32.to_be_bytes());
        let n = i32::decode(&field(INT4, PgFormat::Binary), Some(&binary)).unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn widening_int() {
        let binary = Bytes::copy_from_slice(&7i16.to_be_bytes());
        let n = i64::decode(&field(INT2, PgFormat::Binary), Some(&binary)).unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn oid_mismatch() {
        let text = Bytes::from_static(b"42");
        assert!(i32::decode(&field(TEXT, PgFormat::Text), Some(&text)).is_err());
    }

    #[test]
    fn null_into_option() {
        let got = Option::<i32>::decode(&field(INT4, PgFormat::Text), None).unwrap();
        assert_eq!(got, None);
        assert!(i32::decode(&field(INT4, PgFormat::Text), None).is_err());
    }
}
