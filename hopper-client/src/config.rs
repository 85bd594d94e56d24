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

//! Producer configuration, immutable for the lifetime of a producer.

use std::time::Duration;

use url::Url;

use crate::{Error, Result, retry::Backoff};

const DEFAULT_MAX_REQUEST_SIZE: usize = 1_048_576;
const DEFAULT_BUFFER_MEMORY: usize = 33_554_432;
const DEFAULT_BATCH_SIZE: usize = 16_384;
const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_IN_FLIGHT: usize = 5;

/// Validated producer configuration, built with [`Config::builder`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    brokers: Vec<Url>,
    client_id: Option<String>,
    max_request_size: usize,
    buffer_memory: usize,
    batch_size: usize,
    linger: Duration,
    append_timeout: Duration,
    max_in_flight: usize,
    retry: Backoff,
}

impl Config {
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn brokers(&self) -> &[Url] {
        &self.brokers
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.clone()
    }

    /// The maximum estimated wire size of a single record, checked
    /// before the record is buffered.
    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }

    /// The process wide budget for buffered, not yet acknowledged
    /// records, across all topic partitions.
    pub fn buffer_memory(&self) -> usize {
        self.buffer_memory
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// How long a send may wait for buffer memory before failing with
    /// [`Error::BufferTimeout`].
    pub fn append_timeout(&self) -> Duration {
        self.append_timeout
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn retry(&self) -> Backoff {
        self.retry
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Builder {
    brokers: Vec<Url>,
    client_id: Option<String>,
    max_request_size: usize,
    buffer_memory: usize,
    batch_size: usize,
    linger: Duration,
    append_timeout: Duration,
    max_in_flight: usize,
    retry: Backoff,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: None,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            buffer_memory: DEFAULT_BUFFER_MEMORY,
            batch_size: DEFAULT_BATCH_SIZE,
            linger: Duration::ZERO,
            append_timeout: DEFAULT_APPEND_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: Backoff::default(),
        }
    }
}

impl Builder {
    #[must_use]
    pub fn broker(mut self, broker: Url) -> Self {
        self.brokers.push(broker);
        self
    }

    #[must_use]
    pub fn brokers(self, brokers: Vec<Url>) -> Self {
        Self { brokers, ..self }
    }

    #[must_use]
    pub fn client_id(self, client_id: Option<String>) -> Self {
        Self { client_id, ..self }
    }

    #[must_use]
    pub fn max_request_size(self, max_request_size: usize) -> Self {
        Self {
            max_request_size,
            ..self
        }
    }

    #[must_use]
    pub fn buffer_memory(self, buffer_memory: usize) -> Self {
        Self {
            buffer_memory,
            ..self
        }
    }

    #[must_use]
    pub fn batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    #[must_use]
    pub fn linger(self, linger: Duration) -> Self {
        Self { linger, ..self }
    }

    #[must_use]
    pub fn append_timeout(self, append_timeout: Duration) -> Self {
        Self {
            append_timeout,
            ..self
        }
    }

    #[must_use]
    pub fn max_in_flight(self, max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            ..self
        }
    }

    #[must_use]
    pub fn retry(self, retry: Backoff) -> Self {
        Self { retry, ..self }
    }

    pub fn build(self) -> Result<Config> {
        if self.max_request_size > self.buffer_memory {
            return Err(Error::Configuration(format!(
                "max_request_size {} exceeds buffer_memory {}",
                self.max_request_size, self.buffer_memory
            )));
        }

        if self.batch_size > self.max_request_size {
            return Err(Error::Configuration(format!(
                "batch_size {} exceeds max_request_size {}",
                self.batch_size, self.max_request_size
            )));
        }

        if self.buffer_memory > u32::MAX as usize {
            return Err(Error::Configuration(format!(
                "buffer_memory {} exceeds {}",
                self.buffer_memory,
                u32::MAX
            )));
        }

        if self.max_in_flight == 0 {
            return Err(Error::Configuration(String::from(
                "max_in_flight must be at least 1",
            )));
        }

        Ok(Config {
            brokers: self.brokers,
            client_id: self.client_id,
            max_request_size: self.max_request_size,
            buffer_memory: self.buffer_memory,
            batch_size: self.batch_size,
            linger: self.linger,
            append_timeout: self.append_timeout,
            max_in_flight: self.max_in_flight,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() -> Result<()> {
        let config = Config::builder().build()?;

        assert_eq!(DEFAULT_MAX_REQUEST_SIZE, config.max_request_size());
        assert_eq!(DEFAULT_BUFFER_MEMORY, config.buffer_memory());
        assert_eq!(DEFAULT_BATCH_SIZE, config.batch_size());
        assert_eq!(Duration::ZERO, config.linger());
        assert_eq!(DEFAULT_MAX_IN_FLIGHT, config.max_in_flight());
        assert_eq!(None, config.client_id());

        Ok(())
    }

    #[test]
    fn single_record_must_fit_in_memory() {
        assert!(matches!(
            Config::builder()
                .max_request_size(64)
                .batch_size(16)
                .buffer_memory(32)
                .build(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn batch_bounded_by_request_size() {
        assert!(matches!(
            Config::builder()
                .max_request_size(1_024)
                .batch_size(2_048)
                .build(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn in_flight_floor() {
        assert!(matches!(
            Config::builder().max_in_flight(0).build(),
            Err(Error::Configuration(_))
        ));
    }
}
