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

//! Bounded attempt retry policy with exponential backoff.

use std::time::Duration;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How often, and with what delays, a retriable produce request is
/// tried again before its batch is abandoned.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Backoff {
    attempts: u32,
    backoff: Duration,
    backoff_max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    #[must_use]
    pub fn backoff(self, backoff: Duration) -> Self {
        Self { backoff, ..self }
    }

    #[must_use]
    pub fn backoff_max(self, backoff_max: Duration) -> Self {
        Self {
            backoff_max,
            ..self
        }
    }

    /// The delay before the attempt following the given one, doubling
    /// from the base up to the cap, or [`None`] once the attempt
    /// budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.attempts).then(|| {
            self.backoff
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)))
                .min(self.backoff_max)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn doubles_until_exhausted() {
        let backoff = Backoff::default();

        assert_eq!(Some(Duration::from_millis(100)), backoff.delay(1));
        assert_eq!(Some(Duration::from_millis(200)), backoff.delay(2));
        assert_eq!(None, backoff.delay(3));
    }

    #[test]
    fn capped() {
        let backoff = Backoff::default()
            .attempts(10)
            .backoff(Duration::from_millis(400));

        assert_eq!(Some(Duration::from_millis(800)), backoff.delay(2));
        assert_eq!(Some(Duration::from_secs(1)), backoff.delay(3));
        assert_eq!(Some(Duration::from_secs(1)), backoff.delay(9));
        assert_eq!(None, backoff.delay(10));
    }

    #[test]
    fn single_attempt_never_delays() {
        assert_eq!(None, Backoff::default().attempts(1).delay(1));
    }
}
