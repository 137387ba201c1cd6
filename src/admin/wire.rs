//! Stable binary serialization for the administration protocol
//!
//! Integers are varint-encoded; `String`, `Vec<T>`, and `Option<T>` are
//! length- or presence-prefixed. The format is part of the wire protocol:
//! both ends of the administration connection must agree on it bit for bit.

use std::io;

/// Serialization or deserialization failure
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Payload ended in the middle of a value
    #[error("unexpected end of payload")]
    UnexpectedEof,
    /// Varint longer than 10 bytes
    #[error("malformed varint")]
    Varint,
    /// String field is not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    /// Enum discriminant out of range
    #[error("invalid discriminant {0}")]
    InvalidDiscriminant(u64),
    /// Trailing bytes after the last field
    #[error("trailing bytes in payload")]
    TrailingBytes,
    /// Declared length exceeds the payload
    #[error("declared length out of bounds")]
    BadLength,
}

impl From<WireError> for io::Error {
    fn from(e: WireError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Append a varint
pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Cursor over a received payload
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a payload
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read one varint
    pub fn read_varint(&mut self) -> Result<u64, WireError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(WireError::UnexpectedEof)?;
            self.pos += 1;
            if shift >= 64 {
                return Err(WireError::Varint);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read exactly `n` raw bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::BadLength);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Fail unless every byte was consumed
    pub fn finish(&self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

/// Value that can be written to the wire
pub trait WireEncode {
    /// Append this value's encoding
    fn encode(&self, out: &mut Vec<u8>);
}

/// Value that can be read back from the wire
pub trait WireDecode: Sized {
    /// Decode one value at the reader's position
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

macro_rules! impl_wire_uint {
    ($($ty:ty),*) => {$(
        impl WireEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                write_varint(out, u64::from(*self));
            }
        }

        impl WireDecode for $ty {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
                let v = r.read_varint()?;
                <$ty>::try_from(v).map_err(|_| WireError::BadLength)
            }
        }
    )*};
}

impl_wire_uint!(u8, u16, u32, u64);

impl WireEncode for usize {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, *self as u64);
    }
}

impl WireDecode for usize {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        usize::try_from(r.read_varint()?).map_err(|_| WireError::BadLength)
    }
}

impl WireEncode for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        // ZigZag keeps small magnitudes short regardless of sign.
        let zz = ((*self << 1) ^ (*self >> 63)) as u64;
        write_varint(out, zz);
    }
}

impl WireDecode for i64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let zz = r.read_varint()?;
        Ok(((zz >> 1) as i64) ^ -((zz & 1) as i64))
    }
}

impl WireEncode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match r.read_bytes(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidDiscriminant(u64::from(other))),
        }
    }
}

impl WireEncode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.len() as u64);
        out.extend_from_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let len = usize::try_from(r.read_varint()?).map_err(|_| WireError::BadLength)?;
        let bytes = r.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.len() as u64);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let len = usize::try_from(r.read_varint()?).map_err(|_| WireError::BadLength)?;
        // A length prefix can claim at most one element per remaining byte.
        if len > r.remaining() {
            return Err(WireError::BadLength);
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            None => out.push(0),
            Some(v) => {
                out.push(1);
                v.encode(out);
            }
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match r.read_bytes(1)?[0] {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            other => Err(WireError::InvalidDiscriminant(u64::from(other))),
        }
    }
}

/// Declare a struct whose fields encode in declaration order
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                pub $field:ident : $ty:ty,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $crate::admin::wire::WireEncode for $name {
            fn encode(&self, out: &mut Vec<u8>) {
                $( self.$field.encode(out); )*
            }
        }

        impl $crate::admin::wire::WireDecode for $name {
            fn decode(
                r: &mut $crate::admin::wire::WireReader<'_>,
            ) -> Result<Self, $crate::admin::wire::WireError> {
                Ok(Self {
                    $( $field: <$ty as $crate::admin::wire::WireDecode>::decode(r)?, )*
                })
            }
        }
    };
}

/// Declare a fieldless enum carried as a varint discriminant
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:literal,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant = $value,
            )*
        }

        impl $crate::admin::wire::WireEncode for $name {
            fn encode(&self, out: &mut Vec<u8>) {
                $crate::admin::wire::write_varint(out, *self as u64);
            }
        }

        impl $crate::admin::wire::WireDecode for $name {
            fn decode(
                r: &mut $crate::admin::wire::WireReader<'_>,
            ) -> Result<Self, $crate::admin::wire::WireError> {
                match r.read_varint()? {
                    $( $value => Ok(Self::$variant), )*
                    other => Err($crate::admin::wire::WireError::InvalidDiscriminant(other)),
                }
            }
        }
    };
}

pub(crate) use {wire_enum, wire_struct};
