//! Parameter encoding for the Bind message.
use bytes::{BufMut, Bytes};

use crate::{
    postgres::Oid,
    types::PgType,
    value::ValueRef,
};

/// Value that can be encoded to be bound to sql parameter.
pub trait Encode<'q> {
    fn encode(self) -> Encoded<'q>;
}

/// Postgres encoded value.
#[derive(Debug)]
pub struct Encoded<'q> {
    value: ValueRef<'q>,
    oid: Oid,
}

impl<'q> Encoded<'q> {
    pub(crate) fn new(value: ValueRef<'q>, oid: Oid) -> Self {
        Self { value, oid }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub(crate) fn value(&self) -> &ValueRef<'q> {
        &self.value
    }

    /// The length of the parameter value, in bytes (this count does not
    /// include itself). As a special case, -1 indicates a NULL parameter
    /// value.
    pub(crate) fn size(&self) -> i32 {
        match self.is_null() {
            true => -1,
            false => self.value.binary_len(),
        }
    }

    pub(crate) fn binary_len(&self) -> i32 {
        self.value.binary_len()
    }

    pub(crate) fn write_binary(&self, buf: &mut impl BufMut) {
        self.value.write_binary(buf);
    }
}

macro_rules! encode {
    (<$lf:tt> $ty:ty) => {
        impl<$lf> Encode<$lf> for $ty {
            fn encode(self) -> Encoded<$lf> {
                Encoded::new(self.into(), <$ty>::OID)
            }
        }
    };
    ($ty:ty) => {
        impl Encode<'static> for $ty {
            fn encode(self) -> Encoded<'static> {
                Encoded::new(self.into(), <$ty>::OID)
            }
        }
    };
}

encode!(bool);
encode!(i16);
encode!(i32);
encode!(i64);
encode!(f32);
encode!(f64);
encode!(<'a> &'a str);
encode!(String);
encode!(<'a> &'a [u8]);
encode!(Vec<u8>);
encode!(Bytes);

impl<'a> Encode<'a> for &'a String {
    fn encode(self) -> Encoded<'a> {
        Encoded::new(self.into(), String::OID)
    }
}

impl Encode<'static> for [u8; 16] {
    /// Encoded with the `uuid` oid; postgres stores uuid as raw 16 bytes.
    fn encode(self) -> Encoded<'static> {
        Encoded::new(ValueRef::Bytes(Bytes::copy_from_slice(&self)), crate::types::UUID)
    }
}

impl<'q, T> Encode<'q> for Option<T>
where
    T: Encode<'q> + PgType,
{
    fn encode(self) -> Encoded<'q> {
        match self {
            Some(value) => value.encode(),
            None => Encoded::new(ValueRef::Null, T::OID),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_size() {
        let none = None::<i64>.encode();
        assert!(none.is_null());
        assert_eq!(none.size(), -1);
        assert_eq!(none.oid(), i64::OID);
    }

    #[test]
    fn binary_sizes() {
        assert_eq!(true.encode().size(), 1);
        assert_eq!(7i16.encode().size(), 2);
        assert_eq!(7i32.encode().size(), 4);
        assert_eq!(7i64.encode().size(), 8);
        assert_eq!("abc".encode().size(), 3);
    }
}
