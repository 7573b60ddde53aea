use bytes::{BufMut, Bytes};

use crate::ext::FmtExt;

/// A borrowed or owned value bound to a query parameter.
#[derive(Debug)]
pub enum ValueRef<'a> {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(&'a str),
    String(String),
    Slice(&'a [u8]),
    Bytes(Bytes),
}

impl ValueRef<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, ValueRef::Null)
    }

    /// Size of the binary wire representation in bytes.
    pub fn binary_len(&self) -> i32 {
        match self {
            ValueRef::Null => 0,
            ValueRef::Bool(_) => 1,
            ValueRef::Int2(_) => 2,
            ValueRef::Int4(_) | ValueRef::Float4(_) => 4,
            ValueRef::Int8(_) | ValueRef::Float8(_) => 8,
            ValueRef::Text(t) => t.len() as i32,
            ValueRef::String(s) => s.len() as i32,
            ValueRef::Slice(s) => s.len() as i32,
            ValueRef::Bytes(b) => b.len() as i32,
        }
    }

    /// Write the binary wire representation.
    ///
    /// Binary representations for integers use network byte order.
    /// NULL writes nothing; the -1 length prefix already said so.
    pub fn write_binary(&self, buf: &mut impl BufMut) {
        match self {
            ValueRef::Null => { }
            ValueRef::Bool(b) => buf.put_u8(*b as u8),
            ValueRef::Int2(n) => buf.put_i16(*n),
            ValueRef::Int4(n) => buf.put_i32(*n),
            ValueRef::Int8(n) => buf.put_i64(*n),
            ValueRef::Float4(n) => buf.put_f32(*n),
            ValueRef::Float8(n) => buf.put_f64(*n),
            ValueRef::Text(t) => buf.put_slice(t.as_bytes()),
            ValueRef::String(s) => buf.put_slice(s.as_bytes()),
            ValueRef::Slice(s) => buf.put_slice(s),
            ValueRef::Bytes(b) => buf.put_slice(b),
        }
    }
}

macro_rules! from {
    (<$lf:tt> $ty:ty => $variant:expr) => {
        impl<$lf> From<$ty> for ValueRef<$lf> {
            fn from(value: $ty) -> Self {
                $variant(value)
            }
        }
    };
    ($ty:ty => $variant:expr) => {
        impl From<$ty> for ValueRef<'static> {
            fn from(value: $ty) -> Self {
                $variant(value)
            }
        }
    };
}

from!(bool => ValueRef::Bool);
from!(i16 => ValueRef::Int2);
from!(i32 => ValueRef::Int4);
from!(i64 => ValueRef::Int8);
from!(f32 => ValueRef::Float4);
from!(f64 => ValueRef::Float8);
from!(<'a> &'a str => ValueRef::Text);
from!(String => ValueRef::String);
from!(<'a> &'a [u8] => ValueRef::Slice);
from!(Bytes => ValueRef::Bytes);

impl From<()> for ValueRef<'static> {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl<'a> From<&'a String> for ValueRef<'a> {
    fn from(value: &'a String) -> Self {
        Self::Text(value.as_str())
    }
}

impl From<Vec<u8>> for ValueRef<'static> {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

impl<'a> From<&'a Vec<u8>> for ValueRef<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Self::Slice(value.as_slice())
    }
}

impl std::fmt::Display for ValueRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueRef::Null => f.write_str("NULL"),
            ValueRef::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            ValueRef::Int2(n) => f.write_str(itoa::Buffer::new().format(*n)),
            ValueRef::Int4(n) => f.write_str(itoa::Buffer::new().format(*n)),
            ValueRef::Int8(n) => f.write_str(itoa::Buffer::new().format(*n)),
            ValueRef::Float4(n) => write!(f, "{n}"),
            ValueRef::Float8(n) => write!(f, "{n}"),
            ValueRef::Text(t) => f.write_str(t),
            ValueRef::String(s) => f.write_str(s),
            ValueRef::Slice(s) => write!(f, "{}", s.lossy()),
            ValueRef::Bytes(b) => write!(f, "{}", b.lossy()),
        }
    }
}
