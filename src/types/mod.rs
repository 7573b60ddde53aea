//! Type oids, the codec registry and dynamic values.
//!
//! The registry maps a postgres type oid to a [`TypeInfo`] descriptor which
//! knows how to decode the text and binary representation of that type into
//! a dynamic [`Value`]. Typed scan destinations bypass the registry through
//! [`Decode`].
mod decode;

pub use decode::{Decode, DecodeError};

use std::collections::HashMap;

use bytes::Bytes;

use crate::{common::ByteStr, postgres::{FieldDescription, Oid, PgFormat}};

/// A type that have corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

macro_rules! oid {
    ($ty:ty, $oid:expr $(, $doc:literal)? ) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;
        }
    };
}

pub const BOOL: Oid = 16;
pub const BYTEA: Oid = 17;
pub const CHAR: Oid = 18;
pub const NAME: Oid = 19;
pub const INT8: Oid = 20;
pub const INT2: Oid = 21;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const OID_OID: Oid = 26;
pub const FLOAT4: Oid = 700;
pub const FLOAT8: Oid = 701;
pub const BPCHAR: Oid = 1042;
pub const VARCHAR: Oid = 1043;
pub const UUID: Oid = 2950;

oid!(bool, BOOL);
oid!(i64, INT8, "`int8` ~18 digit integer, 8-byte storage");
oid!(i16, INT2, "`int2` -32 thousand to 32 thousand, 2-byte storage");
oid!(i32, INT4, "`int4` -2 billion to 2 billion integer, 4-byte storage");
oid!(str, TEXT, "`text` variable-length string, no limit specified");
oid!(String, TEXT, "`text` variable-length string, no limit specified");
oid!(&str, TEXT);
oid!(f32, FLOAT4, "`float4` single-precision floating point number, 4-byte storage");
oid!(f64, FLOAT8, "`float8` double-precision floating point number, 8-byte storage");
oid!(Vec<u8>, BYTEA, "`bytea` variable-length string, binary values escaped");
oid!(&[u8], BYTEA);
oid!(Bytes, BYTEA);
oid!([u8; 16], UUID);

/// A decoded column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(ByteStr),
    Bytes(Bytes),
    Uuid([u8; 16]),
}

/// Descriptor for one registered postgres type.
pub struct TypeInfo {
    pub oid: Oid,
    pub name: &'static str,
    pub decode_text: fn(&[u8]) -> Result<Value, DecodeError>,
    pub decode_binary: fn(&[u8]) -> Result<Value, DecodeError>,
}

/// Registry of type descriptors keyed by oid.
///
/// Built once when a connection starts and treated as read-only afterwards.
pub struct TypeRegistry {
    types: HashMap<Oid, TypeInfo>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { types: HashMap::new() }
    }

    /// Registry with the built-in scalar types.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for info in defaults() {
            reg.register(info);
        }
        reg
    }

    pub fn register(&mut self, info: TypeInfo) {
        self.types.insert(info.oid, info);
    }

    pub fn get(&self, oid: Oid) -> Option<&TypeInfo> {
        self.types.get(&oid)
    }

    /// Materialize a dynamic [`Value`] for a column.
    pub fn decode(
        &self,
        field: &FieldDescription,
        value: Option<&Bytes>,
    ) -> Result<Value, DecodeError> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        let info = self
            .types
            .get(&field.data_type)
            .ok_or(DecodeError::UnknownOid(field.data_type))?;
        match field.format {
            PgFormat::Text => (info.decode_text)(value),
            PgFormat::Binary => (info.decode_binary)(value),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.len())
            .finish()
    }
}

fn utf8(value: &[u8]) -> Result<ByteStr, DecodeError> {
    ByteStr::from_utf8(Bytes::copy_from_slice(value)).map_err(DecodeError::Utf8)
}

fn be_array<const N: usize>(name: &'static str, value: &[u8]) -> Result<[u8; N], DecodeError> {
    value
        .try_into()
        .map_err(|_| DecodeError::invalid(name, value))
}

fn defaults() -> impl Iterator<Item = TypeInfo> {
    macro_rules! number {
        ($oid:expr, $name:literal, $ty:ty, $variant:expr) => {
            TypeInfo {
                oid: $oid,
                name: $name,
                decode_text: |v| {
                    let s = std::str::from_utf8(v).map_err(DecodeError::Utf8)?;
                    s.parse::<$ty>()
                        .map($variant)
                        .map_err(|_| DecodeError::invalid($name, v))
                },
                decode_binary: |v| {
                    Ok($variant(<$ty>::from_be_bytes(be_array($name, v)?)))
                },
            }
        };
    }

    macro_rules! textual {
        ($oid:expr, $name:literal) => {
            TypeInfo {
                oid: $oid,
                name: $name,
                // Text and binary representations coincide for character types.
                decode_text: |v| Ok(Value::Text(utf8(v)?)),
                decode_binary: |v| Ok(Value::Text(utf8(v)?)),
            }
        };
    }

    [
        TypeInfo {
            oid: BOOL,
            name: "bool",
            decode_text: |v| match v {
                b"t" => Ok(Value::Bool(true)),
                b"f" => Ok(Value::Bool(false)),
                _ => Err(DecodeError::invalid("bool", v)),
            },
            decode_binary: |v| match v {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(DecodeError::invalid("bool", v)),
            },
        },
        number!(INT2, "int2", i16, Value::Int2),
        number!(INT4, "int4", i32, Value::Int4),
        number!(INT8, "int8", i64, Value::Int8),
        number!(FLOAT4, "float4", f32, Value::Float4),
        number!(FLOAT8, "float8", f64, Value::Float8),
        TypeInfo {
            oid: OID_OID,
            name: "oid",
            decode_text: |v| {
                let s = std::str::from_utf8(v).map_err(DecodeError::Utf8)?;
                s.parse::<u32>()
                    .map(|n| Value::Int8(n as i64))
                    .map_err(|_| DecodeError::invalid("oid", v))
            },
            decode_binary: |v| Ok(Value::Int8(u32::from_be_bytes(be_array("oid", v)?) as i64)),
        },
        textual!(TEXT, "text"),
        textual!(VARCHAR, "varchar"),
        textual!(BPCHAR, "bpchar"),
        textual!(CHAR, "char"),
        textual!(NAME, "name"),
        TypeInfo {
            oid: BYTEA,
            name: "bytea",
            decode_text: |v| decode_bytea_text(v),
            decode_binary: |v| Ok(Value::Bytes(Bytes::copy_from_slice(v))),
        },
        TypeInfo {
            oid: UUID,
            name: "uuid",
            decode_text: |v| decode_uuid_text(v),
            decode_binary: |v| Ok(Value::Uuid(be_array("uuid", v)?)),
        },
    ]
    .into_iter()
}

/// Text representation is hex escaped: `\x0123..`.
fn decode_bytea_text(value: &[u8]) -> Result<Value, DecodeError> {
    let hex = value
        .strip_prefix(b"\\x")
        .ok_or_else(|| DecodeError::invalid("bytea", value))?;
    if hex.len() % 2 != 0 {
        return Err(DecodeError::invalid("bytea", value));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        let hi = hex_digit(pair[0]).ok_or_else(|| DecodeError::invalid("bytea", value))?;
        let lo = hex_digit(pair[1]).ok_or_else(|| DecodeError::invalid("bytea", value))?;
        out.push(hi << 4 | lo);
    }
    Ok(Value::Bytes(out.into()))
}

/// `8-4-4-4-12` hex groups.
fn decode_uuid_text(value: &[u8]) -> Result<Value, DecodeError> {
    let mut out = [0u8; 16];
    let mut digits = value.iter().copied().filter(|b| *b != b'-');
    for byte in &mut out {
        let hi = digits.next().and_then(hex_digit);
        let lo = digits.next().and_then(hex_digit);
        match (hi, lo) {
            (Some(hi), Some(lo)) => *byte = hi << 4 | lo,
            _ => return Err(DecodeError::invalid("uuid", value)),
        }
    }
    if digits.next().is_some() {
        return Err(DecodeError::invalid("uuid", value));
    }
    Ok(Value::Uuid(out))
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

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
    fn int4_both_formats() {
        let reg = TypeRegistry::with_defaults();
        let text = Bytes::from_static(b"-42");
        let binary = Bytes::copy_from_slice(&(-42i32).to_be_bytes());
        assert_eq!(
            reg.decode(&field(INT4, PgFormat::Text), Some(&text)).unwrap(),
            Value::Int4(-42),
        );
        assert_eq!(
            reg.decode(&field(INT4, PgFormat::Binary), Some(&binary)).unwrap(),
            Value::Int4(-42),
        );
    }

    #[test]
    fn null_is_null() {
        let reg = TypeRegistry::with_defaults();
        assert_eq!(reg.decode(&field(TEXT, PgFormat::Text), None).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_oid() {
        let reg = TypeRegistry::with_defaults();
        let v = Bytes::from_static(b"x");
        assert!(matches!(
            reg.decode(&field(999_999, PgFormat::Text), Some(&v)),
            Err(DecodeError::UnknownOid(999_999)),
        ));
    }

    #[test]
    fn bytea_text_hex() {
        let reg = TypeRegistry::with_defaults();
        let v = Bytes::from_static(b"\\x48690a");
        assert_eq!(
            reg.decode(&field(BYTEA, PgFormat::Text), Some(&v)).unwrap(),
            Value::Bytes(Bytes::from_static(b"Hi\n")),
        );
    }

    #[test]
    fn uuid_text() {
        let reg = TypeRegistry::with_defaults();
        let v = Bytes::from_static(b"00010203-0405-0607-0809-0a0b0c0d0e0f");
        let expect: [u8; 16] = std::array::from_fn(|i| i as u8);
        assert_eq!(
            reg.decode(&field(UUID, PgFormat::Text), Some(&v)).unwrap(),
            Value::Uuid(expect),
        );
    }
}
