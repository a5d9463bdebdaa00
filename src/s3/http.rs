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

//! Single-request execution with layered timeouts and cancellation

use crate::s3::error::{Error, NetworkErrorKind, TimeoutKind};
use crate::s3::multimap_ext::Multimap;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::{HeaderMap, Method};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Five request-phase deadlines plus a whole-request wall clock.
///
/// `Duration::ZERO` disables the corresponding deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// DNS lookup for this request.
    pub resolve: Duration,
    /// TCP + TLS handshake.
    pub connection: Duration,
    /// Finish writing the request body.
    pub write: Duration,
    /// Finish reading the response body, from headers-received to end.
    pub read: Duration,
    /// Maximum gap between consecutive response-body chunks.
    pub data: Duration,
    /// Whole-request wall clock.
    pub request: Duration,
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        Self {
            resolve: Duration::from_secs(3),
            connection: Duration::from_secs(3),
            write: Duration::from_secs(300),
            read: Duration::from_secs(300),
            data: Duration::from_secs(3),
            request: Duration::from_secs(300),
        }
    }
}

impl TimeoutProfile {
    /// The profile used against the instance metadata service: short
    /// request/connection deadlines, everything else disabled.
    pub fn imds() -> Self {
        Self {
            resolve: Duration::ZERO,
            connection: Duration::from_secs(3),
            write: Duration::ZERO,
            read: Duration::ZERO,
            data: Duration::ZERO,
            request: Duration::from_secs(3),
        }
    }
}

/// A fully collected HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Performs one HTTP(S) request and collects the full response body.
///
/// Exactly one of `Ok`/`Err` is produced. The cancellation token may fire at
/// any moment; in-flight resolution, connection and body reads are abandoned
/// and the call fails with [`Error::Cancelled`].
pub async fn execute(
    client: &reqwest::Client,
    method: Method,
    url: String,
    headers: &Multimap,
    body: Option<Bytes>,
    profile: &TimeoutProfile,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error> {
    let fut = execute_inner(client, method, url, headers, body, profile, cancel);
    if profile.request.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(profile.request, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(TimeoutKind::Request)),
        }
    }
}

async fn execute_inner(
    client: &reqwest::Client,
    method: Method,
    url: String,
    headers: &Multimap,
    body: Option<Bytes>,
    profile: &TimeoutProfile,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error> {
    let mut req = client.request(method, url);
    for (key, values) in headers.iter_all() {
        for value in values {
            req = req.header(key.as_str(), value.as_str());
        }
    }

    let has_body = body.is_some();
    if let Some(b) = body {
        req = req.body(b);
    }

    let send_fut = req.send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::cancelled()),
        result = send_with_deadline(send_fut, has_body, profile) => result?,
    };

    let status_code = response.status().as_u16();
    let capacity = response.content_length().unwrap_or(8192) as usize;
    let mut response = response;
    let resp_headers = std::mem::take(response.headers_mut());

    let mut buf = BytesMut::with_capacity(capacity);
    let mut stream = response.bytes_stream();

    let read_enabled = !profile.read.is_zero();
    let read_sleep = tokio::time::sleep(if read_enabled {
        profile.read
    } else {
        Duration::ZERO
    });
    tokio::pin!(read_sleep);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            _ = &mut read_sleep, if read_enabled => {
                return Err(Error::Timeout(TimeoutKind::Read));
            }
            chunk = next_chunk(&mut stream, profile.data) => chunk?,
        };
        match chunk {
            Some(data) => buf.extend_from_slice(&data),
            None => break,
        }
    }

    Ok(HttpResponse {
        status_code,
        headers: resp_headers,
        body: buf.freeze(),
    })
}

/// Waits for the response head. With a request body present the deadline is
/// the `write` timeout; connect-phase timeouts are reported by the client's
/// own connect deadline and mapped separately.
async fn send_with_deadline(
    send_fut: impl std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    has_body: bool,
    profile: &TimeoutProfile,
) -> Result<reqwest::Response, Error> {
    if has_body && !profile.write.is_zero() {
        match tokio::time::timeout(profile.write, send_fut).await {
            Ok(result) => result.map_err(map_transport_error),
            Err(_) => Err(Error::Timeout(TimeoutKind::Write)),
        }
    } else {
        send_fut.await.map_err(map_transport_error)
    }
}

async fn next_chunk(
    stream: &mut (impl futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Unpin),
    data_timeout: Duration,
) -> Result<Option<Bytes>, Error> {
    let next = stream.next();
    let item = if data_timeout.is_zero() {
        next.await
    } else {
        tokio::time::timeout(data_timeout, next)
            .await
            .map_err(|_| Error::Timeout(TimeoutKind::Data))?
    };
    match item {
        None => Ok(None),
        Some(Ok(data)) => Ok(Some(data)),
        Some(Err(e)) => Err(map_transport_error(e)),
    }
}

/// Maps a transport failure onto the retry classification, digging through
/// the source chain for the I/O error or cache error that caused it.
pub(crate) fn map_transport_error(e: reqwest::Error) -> Error {
    use std::error::Error as _;

    if e.is_timeout() {
        if e.is_connect() {
            return Error::Timeout(TimeoutKind::Connection);
        }
        return Error::Network(NetworkErrorKind::GenericTimeout);
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = e.source();
    while let Some(err) = source {
        if let Some(ours) = err.downcast_ref::<Error>() {
            return ours.clone();
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Error::Network(NetworkErrorKind::from_io_kind(io.kind(), &io.to_string()));
        }
        source = err.source();
    }

    Error::Network(NetworkErrorKind::Other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_documented_values() {
        let p = TimeoutProfile::default();
        assert_eq!(p.resolve, Duration::from_secs(3));
        assert_eq!(p.connection, Duration::from_secs(3));
        assert_eq!(p.write, Duration::from_secs(300));
        assert_eq!(p.read, Duration::from_secs(300));
        assert_eq!(p.data, Duration::from_secs(3));
        assert_eq!(p.request, Duration::from_secs(300));
    }

    #[test]
    fn imds_profile_disables_body_deadlines() {
        let p = TimeoutProfile::imds();
        assert_eq!(p.connection, Duration::from_secs(3));
        assert_eq!(p.request, Duration::from_secs(3));
        assert!(p.resolve.is_zero());
        assert!(p.write.is_zero());
        assert!(p.read.is_zero());
        assert!(p.data.is_zero());
    }

    #[tokio::test]
    async fn cancellation_fires_before_send() {
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = execute(
            &client,
            Method::GET,
            "http://192.0.2.1/unreachable".into(),
            &Multimap::new(),
            None,
            &TimeoutProfile::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
