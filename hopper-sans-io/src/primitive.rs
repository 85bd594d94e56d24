// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire primitives: zigzag variable length integers and nullable octet
//! sequences, with their exact encoded sizes.

use std::ops::Deref;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::{Decode, Encode, Error, Result};

/// The exact number of bytes a value occupies on the wire.
pub trait ByteSize {
    fn size_in_bytes(&self) -> Result<usize>;
}

const CONTINUATION: u8 = 0b1000_0000;
const MASK: u8 = 0b0111_1111;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VarInt(pub i32);

impl From<i32> for VarInt {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<VarInt> for i32 {
    fn from(value: VarInt) -> Self {
        value.0
    }
}

impl TryFrom<usize> for VarInt {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        i32::try_from(value).map(Self).map_err(Into::into)
    }
}

impl Deref for VarInt {
    type Target = i32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl VarInt {
    #[allow(clippy::cast_sign_loss)]
    fn en_zigzag(decoded: i32) -> u32 {
        ((decoded << 1) ^ (decoded >> 31)) as u32
    }

    #[allow(clippy::cast_possible_wrap)]
    fn de_zigzag(encoded: u32) -> i32 {
        ((encoded >> 1) as i32) ^ -((encoded & 1) as i32)
    }
}

impl ByteSize for VarInt {
    fn size_in_bytes(&self) -> Result<usize> {
        let mut v = Self::en_zigzag(self.0);
        let mut size = 1;

        while v >= u32::from(CONTINUATION) {
            v >>= 7;
            size += 1;
        }

        Ok(size)
    }
}

impl Encode for VarInt {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

        let mut v = Self::en_zigzag(self.0);

        while v >= u32::from(CONTINUATION) {
            #[allow(clippy::cast_possible_truncation)]
            encoded.put_u8(v as u8 | CONTINUATION);
            v >>= 7;
        }

        #[allow(clippy::cast_possible_truncation)]
        encoded.put_u8(v as u8);

        Ok(encoded.into())
    }
}

impl Decode for VarInt {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let mut shift = 0u8;
        let mut accumulator = 0u32;

        loop {
            if !encoded.has_remaining() {
                return Err(Error::VarIntTruncated);
            }

            let byte = encoded.get_u8();

            if byte & CONTINUATION == CONTINUATION {
                accumulator += u32::from(byte & MASK) << shift;
                shift += 7;
            } else {
                accumulator += u32::from(byte) << shift;
                return Ok(Self(Self::de_zigzag(accumulator)));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LongVarInt(pub i64);

impl From<i64> for LongVarInt {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<LongVarInt> for i64 {
    fn from(value: LongVarInt) -> Self {
        value.0
    }
}

impl Deref for LongVarInt {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LongVarInt {
    #[allow(clippy::cast_sign_loss)]
    fn en_zigzag(decoded: i64) -> u64 {
        ((decoded << 1) ^ (decoded >> 63)) as u64
    }

    #[allow(clippy::cast_possible_wrap)]
    fn de_zigzag(encoded: u64) -> i64 {
        ((encoded >> 1) as i64) ^ -((encoded & 1) as i64)
    }
}

impl ByteSize for LongVarInt {
    fn size_in_bytes(&self) -> Result<usize> {
        let mut v = Self::en_zigzag(self.0);
        let mut size = 1;

        while v >= u64::from(CONTINUATION) {
            v >>= 7;
            size += 1;
        }

        Ok(size)
    }
}

impl Encode for LongVarInt {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

        let mut v = Self::en_zigzag(self.0);

        while v >= u64::from(CONTINUATION) {
            #[allow(clippy::cast_possible_truncation)]
            encoded.put_u8(v as u8 | CONTINUATION);
            v >>= 7;
        }

        #[allow(clippy::cast_possible_truncation)]
        encoded.put_u8(v as u8);

        Ok(encoded.into())
    }
}

impl Decode for LongVarInt {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let mut shift = 0u8;
        let mut accumulator = 0u64;

        loop {
            if !encoded.has_remaining() {
                return Err(Error::VarIntTruncated);
            }

            let byte = encoded.get_u8();

            if byte & CONTINUATION == CONTINUATION {
                accumulator += u64::from(byte & MASK) << shift;
                shift += 7;
            } else {
                accumulator += u64::from(byte) << shift;
                return Ok(Self(Self::de_zigzag(accumulator)));
            }
        }
    }
}

/// A nullable octet sequence, prefixed with its zigzag varint length
/// (-1 being null).
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Octets(pub Option<Bytes>);

impl From<Bytes> for Octets {
    fn from(value: Bytes) -> Self {
        Self(Some(value))
    }
}

impl From<Option<Bytes>> for Octets {
    fn from(value: Option<Bytes>) -> Self {
        Self(value)
    }
}

impl From<Octets> for Option<Bytes> {
    fn from(value: Octets) -> Self {
        value.0
    }
}

impl ByteSize for Octets {
    fn size_in_bytes(&self) -> Result<usize> {
        self.0.as_ref().map_or_else(
            || VarInt(-1).size_in_bytes(),
            |bytes| {
                VarInt::try_from(bytes.len())
                    .and_then(|length| length.size_in_bytes())
                    .map(|length| length + bytes.len())
            },
        )
    }
}

impl Encode for Octets {
    fn encode(&self) -> Result<Bytes> {
        match self.0.clone() {
            None => VarInt(-1).encode(),
            Some(data) => {
                let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

                encoded.put(VarInt::try_from(data.len()).and_then(|length| length.encode())?);
                encoded.put(data);

                Ok(encoded.into())
            }
        }
    }
}

impl Decode for Octets {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let length = VarInt::decode(encoded)?.0;

        if length == -1 {
            Ok(Self(None))
        } else {
            usize::try_from(length)
                .map_err(Into::into)
                .and_then(|length| {
                    if encoded.remaining() < length {
                        Err(Error::OctetsTruncated)
                    } else {
                        Ok(Self(Some(encoded.split_to(length))))
                    }
                })
        }
    }
}
