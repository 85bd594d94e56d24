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

//! A record: the unit of data produced to a topic.
//!
//! Constructing a [`Record`] using a builder:
//!
//! ```
//! use bytes::Bytes;
//! use hopper_sans_io::record::{Header, Record};
//!
//! let record = Record::builder()
//!     .key(Some(Bytes::from_static(b"message")))
//!     .value(Some(Bytes::from_static(b"hello world!")))
//!     .header(
//!         Header::builder()
//!             .key(Bytes::from_static(b"format"))
//!             .value(Bytes::from_static(b"text")),
//!     );
//! ```

pub mod batch;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::{
    Decode, Encode, Error, Result,
    primitive::{ByteSize, LongVarInt, Octets, VarInt},
};

/// A record within a batch, with offset and timestamp deltas relative
/// to the base of the owning batch.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Record {
    pub length: i32,
    pub attributes: u8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

impl Record {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn key(&self) -> Option<Bytes> {
        self.key.clone()
    }

    pub fn value(&self) -> Option<Bytes> {
        self.value.clone()
    }
}

impl ByteSize for Record {
    fn size_in_bytes(&self) -> Result<usize> {
        let size = VarInt(self.length).size_in_bytes()?
            + size_of::<u8>()
            + LongVarInt(self.timestamp_delta).size_in_bytes()?
            + VarInt(self.offset_delta).size_in_bytes()?
            + Octets(self.key.clone()).size_in_bytes()?
            + Octets(self.value.clone()).size_in_bytes()?
            + headers_size_in_bytes(&self.headers)?;

        Ok(size)
    }
}

impl Encode for Record {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

        encoded.put(VarInt(self.length).encode()?);
        encoded.put_u8(self.attributes);
        encoded.put(LongVarInt(self.timestamp_delta).encode()?);
        encoded.put(VarInt(self.offset_delta).encode()?);
        encoded.put(Octets(self.key.clone()).encode()?);
        encoded.put(Octets(self.value.clone()).encode()?);
        encoded.put(VarInt::try_from(self.headers.len()).and_then(|count| count.encode())?);

        for header in &self.headers {
            encoded.put(header.encode()?);
        }

        Ok(encoded.into())
    }
}

impl Decode for Record {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let length = VarInt::decode(encoded).map(Into::into)?;

        if !encoded.has_remaining() {
            return Err(Error::RecordTruncated);
        }

        let attributes = encoded.get_u8();
        let timestamp_delta = LongVarInt::decode(encoded).map(Into::into)?;
        let offset_delta = VarInt::decode(encoded).map(Into::into)?;
        let key = Octets::decode(encoded).map(Into::into)?;
        let value = Octets::decode(encoded).map(Into::into)?;

        let count = VarInt::decode(encoded).and_then(|count| {
            usize::try_from(count.0).map_err(|_| Error::RecordTruncated)
        })?;

        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            headers.push(Header::decode(encoded)?);
        }

        Ok(Self {
            length,
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        })
    }
}

fn headers_size_in_bytes(headers: &[Header]) -> Result<usize> {
    headers
        .iter()
        .map(ByteSize::size_in_bytes)
        .try_fold(VarInt::try_from(headers.len())?.size_in_bytes()?, |acc, size| {
            size.map(|size| acc + size)
        })
}

impl TryFrom<Builder> for Record {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        Ok(Self {
            length: builder
                .size_in_bytes()
                .and_then(|size| i32::try_from(size).map_err(Into::into))?,
            attributes: builder.attributes,
            timestamp_delta: *builder.timestamp_delta,
            offset_delta: *builder.offset_delta,
            key: builder.key.into(),
            value: builder.value.into(),
            headers: builder.headers.into_iter().map(Header::from).collect(),
        })
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Builder {
    attributes: u8,
    timestamp_delta: LongVarInt,
    offset_delta: VarInt,
    key: Octets,
    value: Octets,
    headers: Vec<header::Builder>,
}

impl ByteSize for Builder {
    fn size_in_bytes(&self) -> Result<usize> {
        let headers = self
            .headers
            .iter()
            .map(ByteSize::size_in_bytes)
            .try_fold(VarInt::try_from(self.headers.len())?.size_in_bytes()?, |acc, size| {
                size.map(|size| acc + size)
            })?;

        Ok(size_of::<u8>()
            + self.timestamp_delta.size_in_bytes()?
            + self.offset_delta.size_in_bytes()?
            + self.key.size_in_bytes()?
            + self.value.size_in_bytes()?
            + headers)
    }
}

impl Builder {
    #[must_use]
    pub fn attributes(self, attributes: u8) -> Self {
        Self { attributes, ..self }
    }

    #[must_use]
    pub fn timestamp_delta(self, timestamp_delta: i64) -> Self {
        Self {
            timestamp_delta: timestamp_delta.into(),
            ..self
        }
    }

    #[must_use]
    pub fn offset_delta(self, offset_delta: i32) -> Self {
        Self {
            offset_delta: offset_delta.into(),
            ..self
        }
    }

    #[must_use]
    pub fn key(self, key: Option<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    #[must_use]
    pub fn value(self, value: Option<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..self
        }
    }

    #[must_use]
    pub fn header(mut self, header: header::Builder) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build(self) -> Result<Record> {
        Record::try_from(self)
    }
}

pub use header::Header;

pub mod header {
    //! An optional key/value annotation carried by a record.

    use bytes::{BufMut as _, Bytes, BytesMut};

    use crate::{
        Decode, Encode, Result,
        primitive::{ByteSize, Octets},
    };

    #[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct Header {
        pub key: Option<Bytes>,
        pub value: Option<Bytes>,
    }

    impl Header {
        #[must_use]
        pub fn builder() -> Builder {
            Builder::default()
        }
    }

    impl ByteSize for Header {
        fn size_in_bytes(&self) -> Result<usize> {
            Octets(self.key.clone())
                .size_in_bytes()
                .and_then(|key| Octets(self.value.clone()).size_in_bytes().map(|value| key + value))
        }
    }

    impl Encode for Header {
        fn encode(&self) -> Result<Bytes> {
            let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

            encoded.put(Octets(self.key.clone()).encode()?);
            encoded.put(Octets(self.value.clone()).encode()?);

            Ok(encoded.into())
        }
    }

    impl Decode for Header {
        fn decode(encoded: &mut Bytes) -> Result<Self> {
            let key = Octets::decode(encoded).map(Into::into)?;
            let value = Octets::decode(encoded).map(Into::into)?;

            Ok(Self { key, value })
        }
    }

    #[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct Builder {
        key: Octets,
        value: Octets,
    }

    impl Builder {
        #[must_use]
        pub fn key(mut self, key: Bytes) -> Self {
            self.key = Octets::from(key);
            self
        }

        #[must_use]
        pub fn value(mut self, value: Bytes) -> Self {
            self.value = Octets::from(value);
            self
        }

        #[must_use]
        pub fn build(self) -> Header {
            Header {
                key: self.key.into(),
                value: self.value.into(),
            }
        }
    }

    impl From<Builder> for Header {
        fn from(builder: Builder) -> Self {
            builder.build()
        }
    }

    impl ByteSize for Builder {
        fn size_in_bytes(&self) -> Result<usize> {
            self.key
                .size_in_bytes()
                .and_then(|key| self.value.size_in_bytes().map(|value| key + value))
        }
    }
}
