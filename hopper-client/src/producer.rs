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

//! The batching producer: admission, accumulation and the background
//! sender.
//!
//! Submitted records pass a size admission check, then join the open
//! batch of their topic partition inside a memory budget shared across
//! all destinations. The sender drains sealed batches in arrival
//! order, keeping at most one request in flight per topic partition so
//! acknowledged offsets follow submission order.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt::{self, Display, Formatter},
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use hopper_sans_io::{
    ErrorCode,
    primitive::{ByteSize as _, VarInt},
    record,
    record::batch::{BATCH_OVERHEAD, Batch, to_timestamp},
};
use opentelemetry::metrics::Counter;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Client, Config, Error, METER, Result};

/// A topic and partition
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Topition {
    topic: String,
    partition: i32,
}

impl Topition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for Topition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record to submit with [`Producer::send`]: destination topic,
/// optional partition hint, optional key, payload and headers.
#[derive(Clone, Debug, Default)]
pub struct ProducerRecord {
    topic: String,
    partition: Option<i32>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<record::header::Builder>,
}

impl ProducerRecord {
    #[must_use]
    pub fn topic(self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self
        }
    }

    #[must_use]
    pub fn partition(self, partition: Option<i32>) -> Self {
        Self { partition, ..self }
    }

    #[must_use]
    pub fn key(self, key: Option<Bytes>) -> Self {
        Self { key, ..self }
    }

    #[must_use]
    pub fn value(self, value: Option<Bytes>) -> Self {
        Self { value, ..self }
    }

    #[must_use]
    pub fn header(mut self, header: record::header::Builder) -> Self {
        self.headers.push(header);
        self
    }
}

/// Where a record landed: its topic partition, assigned offset and
/// broker append time.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Delivery {
    pub topition: Topition,
    pub offset: i64,
    pub timestamp: i64,
}

/// A broker acknowledgement for one batch.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Produced {
    pub base_offset: i64,
    pub log_append_time: i64,
}

/// The transport seam used by the sender: deliver one batch to a topic
/// partition, answering the assigned base offset and append time.
#[async_trait]
pub trait Broker: Clone + fmt::Debug + Send + Sync + 'static {
    async fn produce(&self, topition: &Topition, batch: Batch) -> Result<Produced>;
}

/// A handle resolved once the owning batch is acknowledged or has
/// permanently failed.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: Option<oneshot::Receiver<Result<Delivery>>>,
    outcome: Option<Result<Delivery>>,
}

impl DeliveryFuture {
    fn pending(rx: oneshot::Receiver<Result<Delivery>>) -> Self {
        Self {
            rx: Some(rx),
            outcome: None,
        }
    }

    fn ready(outcome: Result<Delivery>) -> Self {
        Self {
            rx: None,
            outcome: Some(outcome),
        }
    }

    /// Wait for the delivery outcome. Once resolved, repeated calls
    /// return the same outcome. [`Error::DeliveryTimeout`] leaves the
    /// future unresolved: the send may still complete later.
    pub async fn get(&mut self, timeout: Duration) -> Result<Delivery> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::DeliveryDropped);
        };

        let outcome = match time::timeout(timeout, rx).await {
            Err(_elapsed) => return Err(Error::DeliveryTimeout),
            Ok(Err(_dropped)) => Err(Error::DeliveryDropped),
            Ok(Ok(outcome)) => outcome,
        };

        self.rx = None;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

#[derive(Debug)]
struct OpenBatch {
    records: Vec<record::Builder>,
    acks: Vec<oneshot::Sender<Result<Delivery>>>,
    permits: Vec<OwnedSemaphorePermit>,
    size: usize,
    created_at: Instant,
    base_timestamp: i64,
    max_timestamp: i64,
}

impl OpenBatch {
    fn new(base_timestamp: i64) -> Self {
        Self {
            records: Vec::new(),
            acks: Vec::new(),
            permits: Vec::new(),
            size: BATCH_OVERHEAD,
            created_at: Instant::now(),
            base_timestamp,
            max_timestamp: base_timestamp,
        }
    }
}

#[derive(Debug)]
struct SealedBatch {
    topition: Topition,
    records: Vec<record::Builder>,
    acks: Vec<oneshot::Sender<Result<Delivery>>>,
    permits: Vec<OwnedSemaphorePermit>,
    base_timestamp: i64,
    max_timestamp: i64,
}

#[derive(Debug, Default)]
struct Accumulated {
    open: BTreeMap<Topition, OpenBatch>,
    ready: VecDeque<SealedBatch>,
}

#[derive(Debug)]
struct Shared {
    config: Config,
    memory: Arc<Semaphore>,
    accumulated: Mutex<Accumulated>,
    wakeup: Notify,
    flush_notify: Notify,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    /// move the open batch of this topition, if any, onto the ready queue
    fn seal(&self, topition: &Topition, accumulated: &mut Accumulated) {
        if let Some(open) = accumulated.open.remove(topition) {
            BATCHES_SEALED.add(1, &[]);

            accumulated.ready.push_back(SealedBatch {
                topition: topition.clone(),
                records: open.records,
                acks: open.acks,
                permits: open.permits,
                base_timestamp: open.base_timestamp,
                max_timestamp: open.max_timestamp,
            });
        }
    }

    fn seal_expired(&self) -> Result<()> {
        let linger = self.config.linger();
        let mut accumulated = self.accumulated.lock()?;

        let expired: Vec<Topition> = accumulated
            .open
            .iter()
            .filter(|(_, open)| open.created_at.elapsed() >= linger)
            .map(|(topition, _)| topition.clone())
            .collect();

        for topition in expired {
            self.seal(&topition, &mut accumulated);
        }

        Ok(())
    }

    fn seal_all(&self) -> Result<()> {
        let mut accumulated = self.accumulated.lock()?;

        let all: Vec<Topition> = accumulated.open.keys().cloned().collect();
        for topition in all {
            self.seal(&topition, &mut accumulated);
        }

        Ok(())
    }

    fn next_deadline(&self) -> Result<Option<Instant>> {
        let linger = self.config.linger();
        let accumulated = self.accumulated.lock()?;

        Ok(accumulated
            .open
            .values()
            .map(|open| open.created_at + linger)
            .min())
    }

    /// the oldest sealed batch of a topition with no request in flight
    fn next_dispatchable(&self, busy: &HashSet<Topition>) -> Result<Option<SealedBatch>> {
        let mut accumulated = self.accumulated.lock()?;

        Ok(accumulated
            .ready
            .iter()
            .position(|sealed| !busy.contains(&sealed.topition))
            .and_then(|index| accumulated.ready.remove(index)))
    }

    fn is_drained(&self) -> Result<bool> {
        let accumulated = self.accumulated.lock()?;
        Ok(accumulated.open.is_empty() && accumulated.ready.is_empty())
    }
}

fn estimated_size(record: &record::Builder) -> Result<usize> {
    let body = record.size_in_bytes()?;

    VarInt::try_from(body)
        .and_then(|length| length.size_in_bytes())
        .map(|length| BATCH_OVERHEAD + length + body)
        .map_err(Into::into)
}

/// A batching producer, shared between tasks behind [`Arc`].
#[derive(Debug)]
pub struct Producer {
    shared: Arc<Shared>,
    cancellation: CancellationToken,
}

impl Producer {
    /// connect to the first answering configured endpoint
    pub async fn connect(config: Config) -> Result<Self> {
        Client::connect(&config)
            .await
            .map(|client| Self::new(config, client))
    }

    /// start a producer delivering batches through the supplied broker
    pub fn new(config: Config, broker: impl Broker) -> Self {
        let shared = Arc::new(Shared {
            memory: Arc::new(Semaphore::new(config.buffer_memory())),
            config,
            accumulated: Mutex::new(Accumulated::default()),
            wakeup: Notify::new(),
            flush_notify: Notify::new(),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let cancellation = CancellationToken::new();

        _ = tokio::spawn(send_loop(
            shared.clone(),
            broker,
            cancellation.clone(),
        ));

        Self {
            shared,
            cancellation,
        }
    }

    /// Submit a record, answering a future resolved on delivery.
    ///
    /// A record whose estimated wire size exceeds the configured
    /// maximum request size never reaches the buffer: its future is
    /// already resolved with [`Error::RecordTooLarge`]. When buffer
    /// memory is exhausted the send suspends until space is freed by
    /// an acknowledged batch, bounded by the append timeout.
    pub async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ProducerClosed);
        }

        let ProducerRecord {
            topic,
            partition,
            key,
            value,
            headers,
        } = record;

        let topition = Topition::new(topic, partition.unwrap_or(0));

        let mut builder = record::Record::builder().key(key).value(value);
        for header in headers {
            builder = builder.header(header);
        }

        let size = estimated_size(&builder)?;

        if size > self.shared.config.max_request_size() {
            RECORDS_REJECTED.add(1, &[]);
            debug!(
                %topition,
                size,
                max_request_size = self.shared.config.max_request_size()
            );

            return Ok(DeliveryFuture::ready(Err(Error::RecordTooLarge {
                size,
                max_request_size: self.shared.config.max_request_size(),
            })));
        }

        let permit = match time::timeout(
            self.shared.config.append_timeout(),
            self.shared
                .memory
                .clone()
                .acquire_many_owned(u32::try_from(size)?),
        )
        .await
        {
            Err(_elapsed) => return Err(Error::BufferTimeout),
            Ok(Err(_closed)) => return Err(Error::ProducerClosed),
            Ok(Ok(permit)) => permit,
        };

        let now = to_timestamp(&SystemTime::now())?;
        let (tx, rx) = oneshot::channel();

        _ = self.shared.pending.fetch_add(1, Ordering::SeqCst);

        let appended = (|| -> Result<()> {
            let mut accumulated = self.shared.accumulated.lock()?;

            if let Some(open) = accumulated.open.get(&topition)
                && open.size + size - BATCH_OVERHEAD > self.shared.config.batch_size()
            {
                self.shared.seal(&topition, &mut accumulated);
            }

            let open = accumulated
                .open
                .entry(topition.clone())
                .or_insert_with(|| OpenBatch::new(now));

            open.records
                .push(builder.timestamp_delta(now.saturating_sub(open.base_timestamp)));
            open.acks.push(tx);
            open.permits.push(permit);
            open.size += size - BATCH_OVERHEAD;
            open.max_timestamp = open.max_timestamp.max(now);

            if self.shared.config.linger().is_zero() {
                self.shared.seal(&topition, &mut accumulated);
            }

            Ok(())
        })();

        if let Err(error) = appended {
            _ = self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(error);
        }

        RECORDS_SENT.add(1, &[]);
        self.shared.wakeup.notify_one();

        Ok(DeliveryFuture::pending(rx))
    }

    /// Seal and dispatch everything currently buffered, waiting until
    /// nothing is pending or the timeout elapses.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.shared.seal_all()?;
        self.shared.wakeup.notify_one();

        let deadline = Instant::now() + timeout;

        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::DeliveryTimeout);
            }

            _ = time::timeout(
                remaining.min(Duration::from_millis(10)),
                self.shared.flush_notify.notified(),
            )
            .await;
        }

        Ok(())
    }

    /// Final flush, releasing suspended senders with
    /// [`Error::ProducerClosed`], then stop the sender once drained.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.memory.close();

        let flushed = self.flush(self.shared.config.append_timeout()).await;

        self.cancellation.cancel();

        flushed
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn send_loop(shared: Arc<Shared>, broker: impl Broker, cancellation: CancellationToken) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut busy: HashSet<Topition> = HashSet::new();
    let mut in_flight = 0usize;
    let mut draining = false;

    loop {
        let sealed = if draining {
            shared.seal_all()
        } else {
            shared.seal_expired()
        };

        if let Err(error) = sealed {
            error!(?error);
            break;
        }

        while in_flight < shared.config.max_in_flight() {
            match shared.next_dispatchable(&busy) {
                Ok(Some(sealed)) => {
                    _ = busy.insert(sealed.topition.clone());
                    in_flight += 1;

                    _ = tokio::spawn(transmit(
                        shared.clone(),
                        broker.clone(),
                        sealed,
                        done_tx.clone(),
                    ));
                }
                Ok(None) => break,
                Err(error) => {
                    error!(?error);
                    return;
                }
            }
        }

        if draining && in_flight == 0 && shared.is_drained().unwrap_or(true) {
            break;
        }

        let deadline = match shared.next_deadline() {
            Ok(deadline) => deadline,
            Err(error) => {
                error!(?error);
                break;
            }
        };

        tokio::select! {
            _ = shared.wakeup.notified() => {}

            Some(topition) = done_rx.recv() => {
                _ = busy.remove(&topition);
                in_flight -= 1;
            }

            _ = time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(1))
            ), if deadline.is_some() => {}

            _ = cancellation.cancelled(), if !draining => {
                draining = true;
            }
        }
    }

    debug!(in_flight, draining, "sender stopped");
}

async fn transmit(
    shared: Arc<Shared>,
    broker: impl Broker,
    sealed: SealedBatch,
    done_tx: mpsc::UnboundedSender<Topition>,
) {
    let SealedBatch {
        topition,
        records,
        acks,
        permits,
        base_timestamp,
        max_timestamp,
    } = sealed;

    let count = acks.len();

    let outcome = match records
        .into_iter()
        .fold(
            Batch::builder()
                .base_timestamp(base_timestamp)
                .max_timestamp(max_timestamp),
            |builder, record| builder.record(record),
        )
        .build()
    {
        Ok(batch) => send_batch(&shared, &broker, &topition, batch).await,
        Err(error) => Err(Error::Protocol(error)),
    };

    match outcome {
        Ok(produced) => {
            debug!(%topition, ?produced, count);

            for (index, ack) in acks.into_iter().enumerate() {
                _ = ack.send(Ok(Delivery {
                    topition: topition.clone(),
                    offset: produced.base_offset + index as i64,
                    timestamp: produced.log_append_time,
                }));
            }
        }

        Err(error) => {
            error!(%topition, ?error, count);
            DELIVERY_ERRORS.add(1, &[]);

            for ack in acks {
                _ = ack.send(Err(error.clone()));
            }
        }
    }

    drop(permits);

    if shared.pending.fetch_sub(count, Ordering::SeqCst) == count {
        shared.flush_notify.notify_waiters();
    }

    _ = done_tx.send(topition);
}

async fn send_batch(
    shared: &Shared,
    broker: &impl Broker,
    topition: &Topition,
    batch: Batch,
) -> Result<Produced> {
    let retry = shared.config.retry();
    let mut attempt = 1;

    loop {
        match broker.produce(topition, batch.clone()).await {
            Ok(produced) => return Ok(produced),

            Err(Error::Api(ErrorCode::MessageTooLarge)) => return Err(Error::RequestTooLarge),

            Err(error) if retriable(&error) => match retry.delay(attempt) {
                Some(delay) => {
                    warn!(%topition, ?error, attempt, ?delay);
                    SEND_RETRIES.add(1, &[]);
                    time::sleep(delay).await;
                    attempt += 1;
                }

                None => return Err(error),
            },

            Err(error) => return Err(error),
        }
    }
}

fn retriable(error: &Error) -> bool {
    match error {
        Error::Api(error_code) => error_code.is_retriable(),
        Error::Io(_) | Error::Pool(_) | Error::Unreachable => true,
        _ => false,
    }
}

static RECORDS_SENT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("producer_records_sent")
        .with_description("Records admitted into the accumulator")
        .build()
});

static RECORDS_REJECTED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("producer_records_rejected")
        .with_description("Records rejected as larger than the maximum request size")
        .build()
});

static BATCHES_SEALED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("producer_batches_sealed")
        .with_description("Batches sealed for dispatch")
        .build()
});

static SEND_RETRIES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("producer_send_retries")
        .with_description("Produce requests tried again after a retriable failure")
        .build()
});

static DELIVERY_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("producer_delivery_errors")
        .with_description("Batches that permanently failed")
        .build()
});

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn estimate_includes_batch_framing() -> Result<()> {
        let record = record::Record::builder().value(Some(Bytes::from_static(b"def")));

        // 9 bytes of record body, 1 byte of length prefix
        assert_eq!(BATCH_OVERHEAD + 10, estimated_size(&record)?);

        Ok(())
    }

    #[tokio::test]
    async fn ready_future_is_idempotent() {
        let mut future = DeliveryFuture::ready(Err(Error::RecordTooLarge {
            size: 2_097_152,
            max_request_size: 1_048_576,
        }));

        for _ in 0..2 {
            assert!(matches!(
                future.get(Duration::from_millis(10)).await,
                Err(Error::RecordTooLarge {
                    max_request_size: 1_048_576,
                    ..
                })
            ));
        }
    }

    #[tokio::test]
    async fn timed_out_future_can_still_resolve() -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut future = DeliveryFuture::pending(rx);

        assert!(matches!(
            future.get(Duration::from_millis(10)).await,
            Err(Error::DeliveryTimeout)
        ));

        let delivery = Delivery {
            topition: Topition::new("test-topic", 0),
            offset: 12321,
            timestamp: 0,
        };

        tx.send(Ok(delivery.clone())).expect("send");

        assert_eq!(delivery, future.get(Duration::from_millis(10)).await?);

        Ok(())
    }
}
