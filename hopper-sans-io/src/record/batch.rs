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

//! A batch of records sent together in one produce request, with a
//! CRC-32C over everything following the checksum itself.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use crc::{CRC_32_ISCSI, Crc};
use tracing::debug;

use crate::{
    Decode, Encode, Error, Result,
    primitive::ByteSize,
    record::Record,
};

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Fixed fields following the batch length: magic, crc, attributes,
/// last offset delta, base and max timestamp, record count.
const FIXED_BATCH_LENGTH: usize = size_of::<i8>()
    + size_of::<u32>()
    + size_of::<i16>()
    + size_of::<i32>()
    + size_of::<i64>()
    + size_of::<i64>()
    + size_of::<u32>();

/// The framing cost of a batch before any record data: base offset and
/// batch length, plus the fixed fields covered by [`FIXED_BATCH_LENGTH`].
pub const BATCH_OVERHEAD: usize = size_of::<i64>() + size_of::<i32>() + FIXED_BATCH_LENGTH;

/// Bytes between the batch length field and the CRC region: magic and
/// the checksum itself.
const PRE_CRC_LENGTH: usize = size_of::<i8>() + size_of::<u32>();

pub(crate) const MAGIC: i8 = 2;

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Batch {
    pub base_offset: i64,
    pub batch_length: i32,
    pub magic: i8,
    pub crc: u32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub record_count: u32,
    pub record_data: Bytes,
}

impl Batch {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn max_offset(&self) -> i64 {
        self.base_offset + i64::from(self.last_offset_delta)
    }

    fn crc_region(&self) -> Bytes {
        let mut region = BytesMut::with_capacity(
            FIXED_BATCH_LENGTH - PRE_CRC_LENGTH + self.record_data.len(),
        );

        region.put_i16(self.attributes);
        region.put_i32(self.last_offset_delta);
        region.put_i64(self.base_timestamp);
        region.put_i64(self.max_timestamp);
        region.put_u32(self.record_count);
        region.put(self.record_data.clone());

        region.into()
    }
}

impl ByteSize for Batch {
    fn size_in_bytes(&self) -> Result<usize> {
        Ok(BATCH_OVERHEAD + self.record_data.len())
    }
}

impl Encode for Batch {
    fn encode(&self) -> Result<Bytes> {
        let mut encoded = self.size_in_bytes().map(BytesMut::with_capacity)?;

        encoded.put_i64(self.base_offset);
        encoded.put_i32(self.batch_length);
        encoded.put_i8(self.magic);
        encoded.put_u32(self.crc);
        encoded.put(self.crc_region());

        Ok(encoded.into())
    }
}

impl Decode for Batch {
    fn decode(encoded: &mut Bytes) -> Result<Self> {
        let base_offset = encoded.try_get_i64()?;
        let batch_length = encoded.try_get_i32()?;
        let magic = encoded.try_get_i8()?;
        let crc = encoded.try_get_u32()?;

        let region_length = usize::try_from(batch_length)
            .map_err(Error::from)
            .and_then(|batch_length| {
                batch_length
                    .checked_sub(PRE_CRC_LENGTH)
                    .ok_or(Error::BatchTruncated)
            })?;

        if encoded.remaining() < region_length {
            return Err(Error::BatchTruncated);
        }

        let computed = CASTAGNOLI.checksum(&encoded.slice(..region_length));
        if computed != crc {
            debug!(crc, computed);
            return Err(Error::CrcMismatch { computed, stored: crc });
        }

        let attributes = encoded.try_get_i16()?;
        let last_offset_delta = encoded.try_get_i32()?;
        let base_timestamp = encoded.try_get_i64()?;
        let max_timestamp = encoded.try_get_i64()?;
        let record_count = encoded.try_get_u32()?;

        let record_data = encoded.split_to(
            usize::try_from(batch_length)
                .map_err(Error::from)
                .and_then(|batch_length| {
                    batch_length
                        .checked_sub(FIXED_BATCH_LENGTH)
                        .ok_or(Error::BatchTruncated)
                })?,
        );

        Ok(Self {
            base_offset,
            batch_length,
            magic,
            crc,
            attributes,
            last_offset_delta,
            base_timestamp,
            max_timestamp,
            record_count,
            record_data,
        })
    }
}

impl TryFrom<Batch> for Vec<Record> {
    type Error = Error;

    fn try_from(batch: Batch) -> Result<Self, Self::Error> {
        let mut record_data = batch.record_data;
        let record_count = usize::try_from(batch.record_count)?;

        let mut records = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            records.push(Record::decode(&mut record_data)?);
        }

        Ok(records)
    }
}

/// Milliseconds since the unix epoch, as carried in batch timestamps.
pub fn to_timestamp(system_time: &SystemTime) -> Result<i64> {
    system_time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Message(String::from("system time before unix epoch")))
        .and_then(|duration| i64::try_from(duration.as_millis()).map_err(Into::into))
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Builder {
    base_offset: i64,
    attributes: i16,
    base_timestamp: i64,
    max_timestamp: i64,
    records: Vec<super::Builder>,
}

impl Default for Builder {
    fn default() -> Self {
        let base_timestamp = to_timestamp(&SystemTime::now()).unwrap_or_default();

        Self {
            base_offset: 0,
            attributes: 0,
            base_timestamp,
            max_timestamp: base_timestamp,
            records: Vec::new(),
        }
    }
}

impl Builder {
    #[must_use]
    pub fn base_offset(self, base_offset: i64) -> Self {
        Self {
            base_offset,
            ..self
        }
    }

    #[must_use]
    pub fn attributes(self, attributes: i16) -> Self {
        Self { attributes, ..self }
    }

    #[must_use]
    pub fn base_timestamp(self, base_timestamp: i64) -> Self {
        Self {
            base_timestamp,
            ..self
        }
    }

    #[must_use]
    pub fn max_timestamp(self, max_timestamp: i64) -> Self {
        Self {
            max_timestamp,
            ..self
        }
    }

    #[must_use]
    pub fn record(mut self, record: super::Builder) -> Self {
        self.records.push(record);
        self
    }

    /// Records are given their offset delta from their position within
    /// the batch.
    pub fn build(self) -> Result<Batch> {
        let records = self
            .records
            .into_iter()
            .enumerate()
            .try_fold(Vec::new(), |mut acc, (delta, record)| {
                i32::try_from(delta)
                    .map_err(Error::from)
                    .and_then(|delta| record.offset_delta(delta).build())
                    .map(|record| {
                        acc.push(record);
                        acc
                    })
            })?;

        let record_data = records
            .iter()
            .try_fold(BytesMut::new(), |mut acc, record| {
                record.encode().map(|encoded| {
                    acc.put(encoded);
                    acc
                })
            })
            .map(Bytes::from)?;

        let record_count = u32::try_from(records.len())?;
        let last_offset_delta = i32::try_from(records.len().saturating_sub(1))?;

        let mut batch = Batch {
            base_offset: self.base_offset,
            batch_length: i32::try_from(FIXED_BATCH_LENGTH + record_data.len())?,
            magic: MAGIC,
            crc: 0,
            attributes: self.attributes,
            last_offset_delta,
            base_timestamp: self.base_timestamp,
            max_timestamp: self.max_timestamp,
            record_count,
            record_data,
        };

        batch.crc = CASTAGNOLI.checksum(&batch.crc_region());

        Ok(batch)
    }
}
