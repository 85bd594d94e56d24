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

//! Hopper producer client
//!
//! A batching producer for a hopper broker. Records submitted with
//! [`Producer::send`] are grouped into per topic partition batches,
//! bounded by the configured batch size and buffer memory, and drained
//! by a background sender that delivers each batch in one produce
//! request. Every send is answered immediately with a
//! [`DeliveryFuture`] that resolves once the owning batch is
//! acknowledged by the broker, or has permanently failed.
//!
//! ```no_run
//! use bytes::Bytes;
//! use hopper_client::{Config, Producer, ProducerRecord};
//! use std::time::Duration;
//! use url::Url;
//!
//! # async fn example() -> hopper_client::Result<()> {
//! let config = Config::builder()
//!     .broker(Url::parse("tcp://localhost:9092").expect("url"))
//!     .max_request_size(1_048_576)
//!     .buffer_memory(33_554_432)
//!     .build()?;
//!
//! let producer = Producer::connect(config).await?;
//!
//! let mut delivery = producer
//!     .send(
//!         ProducerRecord::default()
//!             .topic("test-topic")
//!             .value(Some(Bytes::from_static(b"hello world!"))),
//!     )
//!     .await?;
//!
//! let _metadata = delivery.get(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    io, num, result,
    sync::{Arc, LazyLock, PoisonError},
};

use deadpool::managed::{BuildError, PoolError};
use hopper_sans_io::ErrorCode;
use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use url::Url;

pub mod config;
pub mod connection;
pub mod producer;
pub mod retry;

pub use config::Config;
pub use connection::Client;
pub use producer::{Broker, Delivery, DeliveryFuture, Produced, Producer, ProducerRecord, Topition};
pub use retry::Backoff;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The broker answered with an error code.
    Api(ErrorCode),

    /// Buffer memory stayed exhausted for the whole append timeout.
    BufferTimeout,

    Configuration(String),

    /// The sender went away without resolving the delivery.
    DeliveryDropped,

    /// The caller's wait on a delivery expired; the send itself may
    /// still complete later.
    DeliveryTimeout,

    Io(Arc<io::Error>),

    Message(String),

    Poison,

    Pool(Arc<dyn std::error::Error + Send + Sync>),

    PoolBuild(Arc<BuildError>),

    /// The producer has been closed.
    ProducerClosed,

    Protocol(#[from] hopper_sans_io::Error),

    /// The estimated wire size of a single record exceeds the
    /// configured maximum request size.
    RecordTooLarge {
        size: usize,
        max_request_size: usize,
    },

    /// The broker rejected the request as too large; never retried.
    RequestTooLarge,

    TryFromInt(#[from] num::TryFromIntError),

    /// No configured broker endpoint responded.
    Unreachable,

    UnknownHost(Url),

    Url(#[from] url::ParseError),
}

pub type Result<T, E = Error> = result::Result<T, E>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(message) => f.write_str(message),
            error => write!(f, "{error:?}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<BuildError> for Error {
    fn from(value: BuildError) -> Self {
        Self::PoolBuild(Arc::new(value))
    }
}

impl<E> From<PoolError<E>> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(value: PoolError<E>) -> Self {
        Self::Pool(Arc::new(value))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}
