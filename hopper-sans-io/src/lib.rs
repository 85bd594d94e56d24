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

//! The hopper produce protocol, performing no I/O (it operates only on
//! bytes).
//!
//! A producer frames a [`ProduceRequest`] carrying a [`record::batch::Batch`]
//! for one topic partition, and the broker answers with a
//! [`ProduceResponse`] carrying an [`ErrorCode`], the offset assigned to
//! the first record of the batch and the broker append time. Frames are
//! prefixed with their length and correlated by id:
//!
//! ```
//! # use hopper_sans_io::Error;
//! # fn main() -> Result<(), Error> {
//! use bytes::Bytes;
//! use hopper_sans_io::{ApiKey as _, Frame, Header, ProduceRequest, record::{Record, batch::Batch}};
//!
//! let batch = Batch::builder()
//!     .record(Record::builder().value(Some(Bytes::from_static(b"hello world!"))))
//!     .build()?;
//!
//! let encoded = Frame::request(
//!     Header::Request {
//!         api_key: ProduceRequest::KEY,
//!         correlation_id: 12321,
//!         client_id: Some("hopper".into()),
//!     },
//!     ProduceRequest::default()
//!         .topic("test")
//!         .partition(0)
//!         .batch(batch)
//!         .into(),
//! )?;
//!
//! let frame = Frame::request_from_bytes(&encoded[..])?;
//!
//! assert_eq!(
//!     Header::Request {
//!         api_key: ProduceRequest::KEY,
//!         correlation_id: 12321,
//!         client_id: Some("hopper".into()),
//!     },
//!     frame.header
//! );
//! # Ok(())
//! # }
//! ```

pub mod primitive;
pub mod record;

use std::{
    fmt::{self, Display, Formatter},
    num, string,
    sync::Arc,
};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut, TryGetError};

use record::batch::Batch;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    BatchTruncated,
    CrcMismatch { computed: u32, stored: u32 },
    FromUtf8(#[from] string::FromUtf8Error),
    Message(String),
    NoSuchRequest(i16),
    NoSuchResponse(i16),
    OctetsTruncated,
    RecordTruncated,
    RequestFrame,
    ResponseFrame,
    StringTruncated,
    TryFromInt(#[from] num::TryFromIntError),
    TryGet(Arc<TryGetError>),
    UnexpectedBody,
    UnknownErrorCode(i16),
    VarIntTruncated,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Message(message) => f.write_str(message),
            error => write!(f, "{error:?}"),
        }
    }
}

impl From<TryGetError> for Error {
    fn from(value: TryGetError) -> Self {
        Self::TryGet(Arc::new(value))
    }
}

/// Encode a value into its wire representation.
pub trait Encode {
    fn encode(&self) -> Result<Bytes>;
}

/// Decode a value from its wire representation, consuming the bytes read.
pub trait Decode: Sized {
    fn decode(encoded: &mut Bytes) -> Result<Self>;
}

pub trait ApiKey {
    const KEY: i16;
}

/// Result codes reported by the broker in a [`ProduceResponse`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorCode {
    #[default]
    None,
    CorruptMessage,
    UnknownTopicOrPartition,
    RequestTimedOut,
    BrokerNotAvailable,
    MessageTooLarge,
}

impl ErrorCode {
    /// Whether the same request may succeed if sent again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RequestTimedOut | Self::BrokerNotAvailable)
    }
}

impl From<ErrorCode> for i16 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::None => 0,
            ErrorCode::CorruptMessage => 2,
            ErrorCode::UnknownTopicOrPartition => 3,
            ErrorCode::RequestTimedOut => 7,
            ErrorCode::BrokerNotAvailable => 8,
            ErrorCode::MessageTooLarge => 10,
        }
    }
}

impl TryFrom<i16> for ErrorCode {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            2 => Ok(Self::CorruptMessage),
            3 => Ok(Self::UnknownTopicOrPartition),
            7 => Ok(Self::RequestTimedOut),
            8 => Ok(Self::BrokerNotAvailable),
            10 => Ok(Self::MessageTooLarge),
            otherwise => Err(Error::UnknownErrorCode(otherwise)),
        }
    }
}

/// A frame header, correlating responses with their requests.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Header {
    Request {
        api_key: i16,
        correlation_id: i32,
        client_id: Option<String>,
    },
    Response {
        correlation_id: i32,
    },
}

/// A message body, either side of the produce exchange.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Body {
    ProduceRequest(ProduceRequest),
    ProduceResponse(ProduceResponse),
}

/// Produce a batch of records to a topic partition.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProduceRequest {
    pub topic: String,
    pub partition: i32,
    pub batch: Batch,
}

impl ApiKey for ProduceRequest {
    const KEY: i16 = 0;
}

impl ProduceRequest {
    #[must_use]
    pub fn topic(self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self
        }
    }

    #[must_use]
    pub fn partition(self, partition: i32) -> Self {
        Self { partition, ..self }
    }

    #[must_use]
    pub fn batch(self, batch: Batch) -> Self {
        Self { batch, ..self }
    }
}

impl From<ProduceRequest> for Body {
    fn from(value: ProduceRequest) -> Self {
        Self::ProduceRequest(value)
    }
}

impl TryFrom<Body> for ProduceRequest {
    type Error = Error;

    fn try_from(value: Body) -> Result<Self, Self::Error> {
        match value {
            Body::ProduceRequest(request) => Ok(request),
            _ => Err(Error::UnexpectedBody),
        }
    }
}

impl Encode for ProduceRequest {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = BytesMut::new();

        put_string(&mut encoded, &self.topic)?;
        encoded.put_i32(self.partition);
        encoded.put(self.batch.encode()?);

        Ok(encoded.into())
    }
}

impl Decode for ProduceRequest {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let topic = get_string(encoded)?;
        let partition = encoded.try_get_i32()?;
        let batch = Batch::decode(encoded)?;

        Ok(Self {
            topic,
            partition,
            batch,
        })
    }
}

/// The broker's answer to a [`ProduceRequest`]: an error code with the
/// base offset and append time assigned to the batch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProduceResponse {
    pub error_code: i16,
    pub base_offset: i64,
    pub log_append_time: i64,
}

impl ApiKey for ProduceResponse {
    const KEY: i16 = 0;
}

impl ProduceResponse {
    #[must_use]
    pub fn error_code(self, error_code: ErrorCode) -> Self {
        Self {
            error_code: error_code.into(),
            ..self
        }
    }

    #[must_use]
    pub fn base_offset(self, base_offset: i64) -> Self {
        Self {
            base_offset,
            ..self
        }
    }

    #[must_use]
    pub fn log_append_time(self, log_append_time: i64) -> Self {
        Self {
            log_append_time,
            ..self
        }
    }

    pub fn error(&self) -> Result<ErrorCode> {
        ErrorCode::try_from(self.error_code)
    }
}

impl From<ProduceResponse> for Body {
    fn from(value: ProduceResponse) -> Self {
        Self::ProduceResponse(value)
    }
}

impl TryFrom<Body> for ProduceResponse {
    type Error = Error;

    fn try_from(value: Body) -> Result<Self, Self::Error> {
        match value {
            Body::ProduceResponse(response) => Ok(response),
            _ => Err(Error::UnexpectedBody),
        }
    }
}

impl Encode for ProduceResponse {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = BytesMut::with_capacity(
            size_of::<i16>() + size_of::<i64>() + size_of::<i64>(),
        );

        encoded.put_i16(self.error_code);
        encoded.put_i64(self.base_offset);
        encoded.put_i64(self.log_append_time);

        Ok(encoded.into())
    }
}

impl Decode for ProduceResponse {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let error_code = encoded.try_get_i16()?;
        let base_offset = encoded.try_get_i64()?;
        let log_append_time = encoded.try_get_i64()?;

        Ok(Self {
            error_code,
            base_offset,
            log_append_time,
        })
    }
}

/// A frame prefixed with its length, followed by a header and the
/// message body.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    /// The size of this frame, excluding the length prefix itself.
    pub size: i32,

    /// The frame header.
    pub header: Header,

    /// The frame body.
    pub body: Body,
}

impl Frame {
    /// serialize a produce request into a frame of bytes
    pub fn request(header: Header, body: Body) -> Result<Bytes> {
        let Header::Request {
            api_key,
            correlation_id,
            client_id,
        } = &header
        else {
            return Err(Error::RequestFrame);
        };

        let mut payload = BytesMut::new();
        payload.put_i16(*api_key);
        payload.put_i32(*correlation_id);
        put_nullable_string(&mut payload, client_id.as_deref())?;

        match &body {
            Body::ProduceRequest(request) => payload.put(request.encode()?),
            Body::ProduceResponse(_) => return Err(Error::RequestFrame),
        }

        framed(payload)
    }

    /// serialize a produce response into a frame of bytes
    pub fn response(header: Header, body: Body) -> Result<Bytes> {
        let Header::Response { correlation_id } = &header else {
            return Err(Error::ResponseFrame);
        };

        let mut payload = BytesMut::new();
        payload.put_i32(*correlation_id);

        match &body {
            Body::ProduceResponse(response) => payload.put(response.encode()?),
            Body::ProduceRequest(_) => return Err(Error::ResponseFrame),
        }

        framed(payload)
    }

    /// demarshall a request frame, dispatching the body on its api key
    pub fn request_from_bytes(encoded: &[u8]) -> Result<Frame> {
        let mut encoded = Bytes::copy_from_slice(encoded);

        let size = encoded.try_get_i32()?;
        let api_key = encoded.try_get_i16()?;
        let correlation_id = encoded.try_get_i32()?;
        let client_id = get_nullable_string(&mut encoded)?;

        let body = match api_key {
            ProduceRequest::KEY => ProduceRequest::decode(&mut encoded).map(Body::from)?,
            otherwise => return Err(Error::NoSuchRequest(otherwise)),
        };

        Ok(Frame {
            size,
            header: Header::Request {
                api_key,
                correlation_id,
                client_id,
            },
            body,
        })
    }

    /// demarshall a response frame for the given request api key
    pub fn response_from_bytes(encoded: &[u8], api_key: i16) -> Result<Frame> {
        let mut encoded = Bytes::copy_from_slice(encoded);

        let size = encoded.try_get_i32()?;
        let correlation_id = encoded.try_get_i32()?;

        let body = match api_key {
            ProduceResponse::KEY => ProduceResponse::decode(&mut encoded).map(Body::from)?,
            otherwise => return Err(Error::NoSuchResponse(otherwise)),
        };

        Ok(Frame {
            size,
            header: Header::Response { correlation_id },
            body,
        })
    }
}

fn framed(payload: BytesMut) -> Result<Bytes> {
    let size = i32::try_from(payload.len())?;

    let mut encoded = BytesMut::with_capacity(payload.len() + size_of::<i32>());
    encoded.put_i32(size);
    encoded.put(payload);

    Ok(encoded.into())
}

fn put_string(encoded: &mut BytesMut, s: &str) -> Result<()> {
    let length = i16::try_from(s.len())?;
    encoded.put_i16(length);
    encoded.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(encoded: &mut Bytes) -> Result<String> {
    get_nullable_string(encoded)?.ok_or(Error::StringTruncated)
}

fn put_nullable_string(encoded: &mut BytesMut, s: Option<&str>) -> Result<()> {
    match s {
        None => {
            encoded.put_i16(-1);
            Ok(())
        }
        Some(s) => put_string(encoded, s),
    }
}

fn get_nullable_string(encoded: &mut Bytes) -> Result<Option<String>> {
    let length = encoded.try_get_i16()?;

    if length == -1 {
        return Ok(None);
    }

    usize::try_from(length)
        .map_err(Error::from)
        .and_then(|length| {
            if encoded.remaining() < length {
                Err(Error::StringTruncated)
            } else {
                String::from_utf8(encoded.split_to(length).to_vec())
                    .map(Some)
                    .map_err(Into::into)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use pretty_assertions::assert_eq;

    #[test]
    fn produce_response_frame() -> Result<()> {
        let encoded = Frame::response(
            Header::Response { correlation_id: 12 },
            ProduceResponse::default()
                .base_offset(5)
                .log_append_time(1_000)
                .into(),
        )?;

        assert_eq!(
            Bytes::from_static(&[
                0, 0, 0, 22, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 3, 232,
            ]),
            encoded
        );

        let frame = Frame::response_from_bytes(&encoded[..], ProduceResponse::KEY)?;
        assert_eq!(Header::Response { correlation_id: 12 }, frame.header);

        let response = ProduceResponse::try_from(frame.body)?;
        assert_eq!(5, response.base_offset);
        assert_eq!(ErrorCode::None, response.error()?);

        Ok(())
    }

    #[test]
    fn produce_request_frame() -> Result<()> {
        let batch = Batch::builder()
            .base_timestamp(1_707_750_000_000)
            .max_timestamp(1_707_750_000_000)
            .record(Record::builder().value(Some(Bytes::from_static(b"def"))))
            .build()?;

        let body = Body::from(
            ProduceRequest::default()
                .topic("t")
                .partition(0)
                .batch(batch),
        );

        let header = Header::Request {
            api_key: ProduceRequest::KEY,
            correlation_id: 3,
            client_id: Some("hopper".into()),
        };

        let encoded = Frame::request(header.clone(), body.clone())?;
        let frame = Frame::request_from_bytes(&encoded[..])?;

        assert_eq!(74, frame.size);
        assert_eq!(header, frame.header);
        assert_eq!(body, frame.body);

        Ok(())
    }

    #[test]
    fn anonymous_client_id() -> Result<()> {
        let batch = Batch::builder()
            .record(Record::builder().value(Some(Bytes::from_static(b"def"))))
            .build()?;

        let encoded = Frame::request(
            Header::Request {
                api_key: ProduceRequest::KEY,
                correlation_id: 0,
                client_id: None,
            },
            ProduceRequest::default().topic("t").batch(batch).into(),
        )?;

        let frame = Frame::request_from_bytes(&encoded[..])?;

        assert_eq!(
            Header::Request {
                api_key: ProduceRequest::KEY,
                correlation_id: 0,
                client_id: None,
            },
            frame.header
        );

        Ok(())
    }

    #[test]
    fn error_code_codes() -> Result<()> {
        for code in [
            ErrorCode::None,
            ErrorCode::CorruptMessage,
            ErrorCode::UnknownTopicOrPartition,
            ErrorCode::RequestTimedOut,
            ErrorCode::BrokerNotAvailable,
            ErrorCode::MessageTooLarge,
        ] {
            assert_eq!(code, ErrorCode::try_from(i16::from(code))?);
        }

        assert!(ErrorCode::RequestTimedOut.is_retriable());
        assert!(ErrorCode::BrokerNotAvailable.is_retriable());
        assert!(!ErrorCode::MessageTooLarge.is_retriable());
        assert!(!ErrorCode::UnknownTopicOrPartition.is_retriable());

        assert!(matches!(
            ErrorCode::try_from(111),
            Err(Error::UnknownErrorCode(111))
        ));

        Ok(())
    }
}
