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

//! Region discovery and path-style endpoint composition

use crate::s3::error::{Error, ValidationErr};
use crate::s3::imds;
use crate::s3::multimap_ext::{Multimap, MultimapExt};
use crate::s3::utils::{match_hostname, urlencode_object_key};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use tokio_util::sync::CancellationToken;

fn region_cache() -> &'static Mutex<Option<String>> {
    static CACHE: OnceLock<Mutex<Option<String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

/// Drops the process-wide cached region.
pub fn clear_region_cache() {
    *region_cache().lock().expect("region lock poisoned") = None;
}

/// Returns the region: `AWS_REGION` if set, otherwise the instance identity
/// document. The first success is cached for the process lifetime.
pub async fn region() -> Result<String, Error> {
    if let Some(cached) = region_cache()
        .lock()
        .expect("region lock poisoned")
        .clone()
    {
        return Ok(cached);
    }

    let region = match std::env::var("AWS_REGION") {
        Ok(v) if !v.is_empty() => v,
        _ => imds::fetch_region(&CancellationToken::new()).await?,
    };

    log::debug!("resolved region {region}");
    *region_cache().lock().expect("region lock poisoned") = Some(region.clone());
    Ok(region)
}

/// An S3 endpoint authority, `https` unless the caller's override says
/// otherwise.
///
/// Path-style addressing is used uniformly so bucket names containing dots
/// work without TLS SNI workarounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub https: bool,
    host: String,
    port: u16,
}

impl Endpoint {
    /// The default endpoint for a region: `s3.{region}.amazonaws.com`.
    pub fn for_region(region: &str) -> Endpoint {
        Endpoint {
            https: true,
            host: format!("s3.{region}.amazonaws.com"),
            port: 0,
        }
    }

    /// The value of the `Host` header for requests against this endpoint.
    pub fn host_header_value(&self) -> String {
        if self.port > 0 {
            return format!("{}:{}", self.host, self.port);
        }
        self.host.clone()
    }

    /// Builds the absolute request URL for a path and query.
    pub fn url(&self, path: &str, query: &Multimap) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let mut url = format!("{scheme}://{}{path}", self.host_header_value());
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.to_query_string());
        }
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host_header_value())
    }
}

impl FromStr for Endpoint {
    type Err = ValidationErr;

    /// Parses a caller-supplied endpoint override: a bare hostname
    /// (defaults to HTTPS), or `http://host[:port]` / `https://host[:port]`.
    fn from_str(s: &str) -> Result<Self, ValidationErr> {
        let (https, rest) = match s.split_once("://") {
            None => (true, s),
            Some(("http", rest)) => (false, rest),
            Some(("https", rest)) => (true, rest),
            Some((scheme, _)) => {
                return Err(ValidationErr::InvalidEndpoint(format!(
                    "scheme must be http or https, got {scheme}"
                )));
            }
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p.parse().map_err(|_| {
                    ValidationErr::InvalidEndpoint(format!("invalid port {p}"))
                })?;
                (h, port)
            }
            None => (rest, 0),
        };

        if host.is_empty() || (!match_hostname(host) && host.parse::<std::net::IpAddr>().is_err())
        {
            return Err(ValidationErr::InvalidEndpoint(format!(
                "valid host must be provided, got {host:?}"
            )));
        }

        Ok(Endpoint {
            https,
            host: host.to_string(),
            port,
        })
    }
}

/// Composes the path-style URI path `/{bucket}/{escaped_key}`.
pub fn object_path(bucket: &str, key: &str) -> String {
    format!("/{bucket}/{}", urlencode_object_key(key))
}
