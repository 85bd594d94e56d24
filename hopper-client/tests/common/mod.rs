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

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::SystemTime,
};

use async_trait::async_trait;
use bytes::Bytes;
use hopper_client::{Broker, Error, Produced, Result, Topition};
use hopper_sans_io::{
    ErrorCode, Frame, Header, ProduceRequest, ProduceResponse,
    record::batch::{Batch, to_timestamp},
};
use rand::{distr::StandardUniform, prelude::*, rng};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, subscriber::DefaultGuard};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    "hopper_client=debug"
                        .parse()
                        .map_err(|error| Error::Message(format!("{error:?}")))?,
                ),
            )
            .with_test_writer()
            .finish(),
    ))
}

pub(crate) fn random_bytes(length: usize) -> Bytes {
    rng()
        .sample_iter(StandardUniform)
        .take(length)
        .collect::<Vec<u8>>()
        .into()
}

/// An in process broker keeping every produced batch, assigning
/// offsets per topic partition.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordingBroker {
    produced: Arc<Mutex<Vec<(Topition, Batch)>>>,
    offsets: Arc<Mutex<BTreeMap<Topition, i64>>>,
}

impl RecordingBroker {
    pub(crate) fn batches(&self) -> Vec<(Topition, Batch)> {
        self.produced.lock().expect("lock").clone()
    }

    pub(crate) fn records(&self) -> u32 {
        self.batches()
            .iter()
            .map(|(_, batch)| batch.record_count)
            .sum()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn produce(&self, topition: &Topition, batch: Batch) -> Result<Produced> {
        let base_offset = {
            let mut offsets = self.offsets.lock()?;
            let next = offsets.entry(topition.clone()).or_insert(0);
            let base_offset = *next;
            *next += i64::from(batch.record_count);
            base_offset
        };

        debug!(%topition, base_offset, record_count = batch.record_count);
        self.produced.lock()?.push((topition.clone(), batch));

        Ok(Produced {
            base_offset,
            log_append_time: to_timestamp(&SystemTime::now())?,
        })
    }
}

/// A broker answering every produce request with the same error code.
#[derive(Clone, Debug)]
pub(crate) struct RejectingBroker {
    error_code: ErrorCode,
    attempts: Arc<AtomicU32>,
}

impl RejectingBroker {
    pub(crate) fn new(error_code: ErrorCode) -> Self {
        Self {
            error_code,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for RejectingBroker {
    async fn produce(&self, _topition: &Topition, _batch: Batch) -> Result<Produced> {
        _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Api(self.error_code))
    }
}

/// A broker failing the first few produce requests with a retriable
/// code, then delegating to a [`RecordingBroker`].
#[derive(Clone, Debug, Default)]
pub(crate) struct FlakyBroker {
    failures: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
    pub(crate) inner: RecordingBroker,
}

impl FlakyBroker {
    pub(crate) fn failing(failures: u32) -> Self {
        Self {
            failures: Arc::new(AtomicU32::new(failures)),
            ..Self::default()
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn produce(&self, topition: &Topition, batch: Batch) -> Result<Produced> {
        _ = self.attempts.fetch_add(1, Ordering::SeqCst);

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::Api(ErrorCode::RequestTimedOut));
        }

        self.inner.produce(topition, batch).await
    }
}

/// A broker withholding acknowledgements until released, one produce
/// request per released permit.
#[derive(Clone, Debug)]
pub(crate) struct GatedBroker {
    gate: Arc<tokio::sync::Semaphore>,
    pub(crate) inner: RecordingBroker,
}

impl GatedBroker {
    pub(crate) fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
            inner: RecordingBroker::default(),
        }
    }

    pub(crate) fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl Broker for GatedBroker {
    async fn produce(&self, topition: &Topition, batch: Batch) -> Result<Produced> {
        self.gate
            .acquire()
            .await
            .map_err(|_| Error::Message(String::from("gate closed")))?
            .forget();

        self.inner.produce(topition, batch).await
    }
}

/// A broker speaking the framed produce protocol over TCP, assigning
/// offsets per topic partition.
pub(crate) async fn fake_broker() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let socket_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let offsets = Arc::new(Mutex::new(BTreeMap::new()));

        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };

            debug!(?peer);

            let offsets = offsets.clone();
            _ = tokio::spawn(async move {
                if let Err(error) = serve(stream, offsets).await {
                    debug!(?error);
                }
            });
        }
    });

    Ok((socket_addr, handle))
}

async fn serve(
    mut stream: TcpStream,
    offsets: Arc<Mutex<BTreeMap<Topition, i64>>>,
) -> Result<()> {
    loop {
        let mut size = [0u8; 4];
        if stream.read_exact(&mut size).await.is_err() {
            return Ok(());
        }

        let mut frame = vec![0u8; i32::from_be_bytes(size) as usize + size.len()];
        frame[0..size.len()].copy_from_slice(&size[..]);
        _ = stream.read_exact(&mut frame[4..]).await?;

        let frame = Frame::request_from_bytes(&frame[..])?;

        let Header::Request { correlation_id, .. } = frame.header else {
            return Ok(());
        };

        let request = ProduceRequest::try_from(frame.body)?;
        let topition = Topition::new(request.topic, request.partition);

        let base_offset = {
            let mut offsets = offsets.lock()?;
            let next = offsets.entry(topition).or_insert(0i64);
            let base_offset = *next;
            *next += i64::from(request.batch.record_count);
            base_offset
        };

        let response = Frame::response(
            Header::Response { correlation_id },
            ProduceResponse::default()
                .base_offset(base_offset)
                .log_append_time(to_timestamp(&SystemTime::now())?)
                .into(),
        )?;

        stream.write_all(&response[..]).await?;
    }
}
