// Parfetch Parallel Download Accelerator for S3 Compatible Object Storage
// Copyright 2025 Parfetch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded retry with jittered exponential backoff

use crate::s3::error::Error;
use crate::s3::http::HttpResponse;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempts for S3 object requests.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Attempts for instance metadata service requests.
pub const IMDS_MAX_ATTEMPTS: u32 = 3;

/// Ceiling on a single backoff delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Whether a failed attempt may be retried.
pub fn is_retriable_error(err: &Error) -> bool {
    match err {
        Error::Network(kind) => kind.is_retriable(),
        Error::Timeout(_) => true,
        _ => false,
    }
}

/// Whether a response status warrants another attempt.
pub fn is_retriable_status(status_code: u16) -> bool {
    status_code == 429 || (500..600).contains(&status_code)
}

/// Backoff delay before attempt `attempt` (1-based; the first retry is
/// attempt 2): `uniform(0, 2^(attempt-1))` seconds clamped to `max_delay`.
/// The exponent grows without bound while the clamp prevents pathological
/// delays.
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let limit = 2f64.powi(attempt.saturating_sub(1).min(32) as i32);
    let secs: f64 = rand::thread_rng().gen_range(0.0..limit);
    Duration::from_secs_f64(secs).min(max_delay)
}

/// Runs `op` up to `max_attempts` times. Responses with a retriable status
/// (429 or 5xx) and errors in the retriable classification are retried after
/// a backoff; everything else is returned immediately. When attempts run out
/// the last response or error is surfaced as-is, so an exhausted 5xx still
/// carries its status code and raw body.
pub async fn execute_with_retry<F, Fut>(
    max_attempts: u32,
    max_delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<HttpResponse, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<HttpResponse, Error>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        let last = attempt >= max_attempts;
        match op(attempt).await {
            Ok(resp) if is_retriable_status(resp.status_code) && !last => {
                log::debug!(
                    "attempt {attempt} returned status {}, retrying",
                    resp.status_code
                );
            }
            Ok(resp) => return Ok(resp),
            Err(e) if is_retriable_error(&e) && !last => {
                log::debug!("attempt {attempt} failed: {e}, retrying");
            }
            Err(e) => return Err(e),
        }

        attempt += 1;
        wait_before(attempt, max_delay, cancel).await?;
    }
}

/// Sleeps the backoff delay for the upcoming attempt. The wait is
/// interruptible: a fired cancel token ends it immediately.
async fn wait_before(
    attempt: u32,
    max_delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let delay = backoff_delay(attempt, max_delay);
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
