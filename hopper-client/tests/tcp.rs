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

use std::time::Duration;

use bytes::Bytes;
use hopper_client::{Config, Error, Producer, ProducerRecord, Result};
use pretty_assertions::assert_eq;
use url::Url;

pub mod common;

#[tokio::test]
async fn produce_over_tcp() -> Result<()> {
    let _guard = common::init_tracing()?;

    let (socket_addr, _broker) = common::fake_broker().await?;

    let producer = Producer::connect(
        Config::builder()
            .broker(Url::parse(&format!("tcp://{socket_addr}"))?)
            .client_id(Some("hopper".into()))
            .build()?,
    )
    .await?;

    let mut offsets = Vec::new();
    for n in 0..5 {
        let mut delivery = producer
            .send(
                ProducerRecord::default()
                    .topic("test-topic")
                    .value(Some(Bytes::from(format!("message-{n}")))),
            )
            .await?;

        offsets.push(delivery.get(Duration::from_secs(10)).await?.offset);
    }

    assert_eq!(vec![0, 1, 2, 3, 4], offsets);

    producer.close().await
}

#[tokio::test]
async fn unreachable_endpoint() -> Result<()> {
    let _guard = common::init_tracing()?;

    let outcome = Producer::connect(
        Config::builder()
            .broker(Url::parse("tcp://127.0.0.1:1")?)
            .build()?,
    )
    .await;

    assert!(matches!(outcome, Err(Error::Unreachable)));

    Ok(())
}

#[tokio::test]
async fn endpoints_are_tried_in_order() -> Result<()> {
    let _guard = common::init_tracing()?;

    let (socket_addr, _broker) = common::fake_broker().await?;

    // the first endpoint refuses, the second answers
    let producer = Producer::connect(
        Config::builder()
            .broker(Url::parse("tcp://127.0.0.1:1")?)
            .broker(Url::parse(&format!("tcp://{socket_addr}"))?)
            .build()?,
    )
    .await?;

    let mut delivery = producer
        .send(
            ProducerRecord::default()
                .topic("test-topic")
                .value(Some(Bytes::from_static(b"hello world!"))),
        )
        .await?;

    assert_eq!(0, delivery.get(Duration::from_secs(10)).await?.offset);

    producer.close().await
}

#[tokio::test]
async fn no_endpoints_configured() -> Result<()> {
    let _guard = common::init_tracing()?;

    assert!(matches!(
        Producer::connect(Config::builder().build()?).await,
        Err(Error::Configuration(_))
    ));

    Ok(())
}
