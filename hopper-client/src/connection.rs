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

//! Pooled broker connections carrying framed produce requests.

use std::{net::SocketAddr, sync::LazyLock, time::SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use deadpool::managed::{self, PoolError};
use hopper_sans_io::{
    ApiKey as _, ErrorCode, Frame, Header, ProduceRequest, ProduceResponse,
    record::batch::Batch,
};
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpStream, lookup_host},
    time::Instant,
};
use tracing::{Instrument, Level, debug, error, span, warn};
use url::Url;

use crate::{
    Config, Error, METER, Result,
    producer::{Broker, Produced, Topition},
};

/// A broker connection with a correlation id
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    correlation_id: i32,
}

impl Connection {
    pub(crate) async fn produce(
        &mut self,
        req: ProduceRequest,
        client_id: Option<String>,
    ) -> Result<ProduceResponse> {
        let local = self.stream.local_addr().inspect(|local| debug!(%local))?;
        let peer = self.stream.peer_addr().inspect(|peer| debug!(%peer))?;

        let attributes = [KeyValue::new("peer", peer.to_string())];

        let span = span!(Level::DEBUG, "produce", local = %local, peer = %peer);

        async move {
            self.request(req, client_id, &attributes).await?;

            self.correlation_id += 1;

            self.response(&attributes).await
        }
        .instrument(span)
        .await
    }

    /// send a produce request to the broker
    async fn request(
        &mut self,
        req: ProduceRequest,
        client_id: Option<String>,
        attributes: &[KeyValue],
    ) -> Result<()> {
        let payload = Frame::request(
            Header::Request {
                api_key: ProduceRequest::KEY,
                correlation_id: self.correlation_id,
                client_id,
            },
            req.into(),
        )?;

        let start = SystemTime::now();

        self.stream
            .write_all(&payload[..])
            .await
            .inspect(|_| {
                TCP_SEND_DURATION.record(
                    start
                        .elapsed()
                        .map_or(0, |duration| duration.as_millis() as u64),
                    attributes,
                );

                TCP_BYTES_SENT.add(payload.len() as u64, attributes);
            })
            .inspect_err(|_| {
                TCP_SEND_ERRORS.add(1, attributes);
            })
            .map_err(Into::into)
    }

    /// demarshall a produce response frame from the broker
    async fn response(&mut self, attributes: &[KeyValue]) -> Result<ProduceResponse> {
        self.read_frame(attributes)
            .await
            .and_then(|response| {
                Frame::response_from_bytes(&response[..], ProduceResponse::KEY)
                    .map_err(Into::into)
            })
            .map(|frame| frame.body)
            .and_then(|body| ProduceResponse::try_from(body).map_err(Into::into))
            .inspect(|response| debug!(?response))
    }

    async fn read_frame(&mut self, attributes: &[KeyValue]) -> Result<Bytes> {
        let start = SystemTime::now();

        let mut size = [0u8; 4];
        _ = self.stream.read_exact(&mut size).await?;

        let mut buffer: Vec<u8> = vec![0u8; frame_length(size)];
        buffer[0..size.len()].copy_from_slice(&size[..]);
        _ = self
            .stream
            .read_exact(&mut buffer[4..])
            .await
            .inspect(|_| {
                TCP_RECEIVE_DURATION.record(
                    start
                        .elapsed()
                        .map_or(0, |duration| duration.as_millis() as u64),
                    attributes,
                );

                TCP_BYTES_RECEIVED.add(buffer.len() as u64, attributes);
            })
            .inspect_err(|_| {
                TCP_RECEIVE_ERRORS.add(1, attributes);
            })?;

        Ok(Bytes::from(buffer))
    }
}

fn frame_length(encoded: [u8; 4]) -> usize {
    i32::from_be_bytes(encoded) as usize + encoded.len()
}

/// A connection factory trying each configured endpoint in order
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Manager {
    brokers: Vec<Url>,
    client_id: Option<String>,
}

impl Manager {
    pub fn new(brokers: Vec<Url>, client_id: Option<String>) -> Self {
        Self { brokers, client_id }
    }

    /// client id used in requests to the broker
    pub fn client_id(&self) -> Option<String> {
        self.client_id.clone()
    }

    /// resolve a host into an IP socket address
    async fn host_port(broker: &Url) -> Result<SocketAddr> {
        if let Some(host) = broker.host_str()
            && let Some(port) = broker.port()
        {
            let attributes = [KeyValue::new("url", broker.to_string())];
            let start = SystemTime::now();

            let mut addresses = lookup_host(format!("{host}:{port}"))
                .await
                .inspect(|_| {
                    DNS_LOOKUP_DURATION.record(
                        start
                            .elapsed()
                            .map_or(0, |duration| duration.as_millis() as u64),
                        &attributes,
                    )
                })?
                .filter(|socket_addr| matches!(socket_addr, SocketAddr::V4(_)));

            if let Some(socket_addr) = addresses.next().inspect(|socket_addr| debug!(?socket_addr))
            {
                return Ok(socket_addr);
            }
        }

        Err(Error::UnknownHost(broker.clone()))
    }

    async fn connect(broker: &Url) -> Result<Connection> {
        let attributes = [KeyValue::new("broker", broker.to_string())];
        let start = SystemTime::now();

        let socket_addr = Self::host_port(broker).await?;

        TcpStream::connect(socket_addr)
            .await
            .inspect(|_| {
                TCP_CONNECT_DURATION.record(
                    start
                        .elapsed()
                        .map_or(0, |duration| duration.as_millis() as u64),
                    &attributes,
                )
            })
            .inspect_err(|err| {
                error!(%broker, ?err);
                TCP_CONNECT_ERRORS.add(1, &attributes);
            })
            .map(|stream| Connection {
                stream,
                correlation_id: 0,
            })
            .map_err(Into::into)
    }
}

impl managed::Manager for Manager {
    type Type = Connection;
    type Error = Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        for broker in &self.brokers {
            debug!(%broker);

            match Self::connect(broker).await {
                Ok(connection) => return Ok(connection),
                Err(err) => warn!(%broker, ?err),
            }
        }

        Err(Error::Unreachable)
    }

    async fn recycle(
        &self,
        obj: &mut Self::Type,
        metrics: &managed::Metrics,
    ) -> managed::RecycleResult<Self::Error> {
        debug!(?obj, ?metrics);
        Ok(())
    }
}

/// a managed pool of broker connections
pub type Pool = managed::Pool<Manager>;

/// The pooled transport behind [`crate::Producer`], delivering one
/// batch per produce request.
#[derive(Clone, Debug)]
pub struct Client {
    pool: Pool,
}

impl Client {
    /// create a new client using the supplied pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// establish that at least one configured endpoint responds
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.brokers().is_empty() {
            return Err(Error::Configuration(String::from(
                "at least one broker endpoint is required",
            )));
        }

        let client = Pool::builder(Manager::new(
            config.brokers().to_vec(),
            config.client_id(),
        ))
        .build()
        .map(Self::new)?;

        match client.pool.get().await {
            Ok(connection) => drop(connection),
            Err(PoolError::Backend(error)) => return Err(error),
            Err(error) => return Err(error.into()),
        }

        Ok(client)
    }
}

#[async_trait]
impl Broker for Client {
    async fn produce(&self, topition: &Topition, batch: Batch) -> Result<Produced> {
        let client_id = self.pool.manager().client_id();
        let mut connection = self.pool.get().await?;

        let start = Instant::now();

        let response = connection
            .produce(
                ProduceRequest::default()
                    .topic(topition.topic())
                    .partition(topition.partition())
                    .batch(batch),
                client_id,
            )
            .await
            .inspect(|_| {
                REQUEST_DURATION.record(
                    start.elapsed().as_millis() as u64,
                    &[KeyValue::new("topic", topition.topic().to_owned())],
                )
            })?;

        match response.error()? {
            ErrorCode::None => Ok(Produced {
                base_offset: response.base_offset,
                log_append_time: response.log_append_time,
            }),
            error_code => Err(Error::Api(error_code)),
        }
    }
}

static DNS_LOOKUP_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("dns_lookup_duration")
        .with_unit("ms")
        .with_description("DNS lookup latencies")
        .build()
});

static TCP_CONNECT_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("tcp_connect_duration")
        .with_unit("ms")
        .with_description("The TCP connect latencies in milliseconds")
        .build()
});

static TCP_CONNECT_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tcp_connect_errors")
        .with_description("TCP connect errors")
        .build()
});

static TCP_SEND_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("tcp_send_duration")
        .with_unit("ms")
        .with_description("The TCP send latencies in milliseconds")
        .build()
});

static TCP_SEND_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tcp_send_errors")
        .with_description("TCP send errors")
        .build()
});

static TCP_RECEIVE_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("tcp_receive_duration")
        .with_unit("ms")
        .with_description("The TCP receive latencies in milliseconds")
        .build()
});

static TCP_RECEIVE_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tcp_receive_errors")
        .with_description("TCP receive errors")
        .build()
});

static TCP_BYTES_SENT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tcp_bytes_sent")
        .with_description("TCP bytes sent")
        .build()
});

static TCP_BYTES_RECEIVED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tcp_bytes_received")
        .with_description("TCP bytes received")
        .build()
});

static REQUEST_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("produce_request_duration")
        .with_unit("ms")
        .with_description("Produce request round trip latencies in milliseconds")
        .build()
});
