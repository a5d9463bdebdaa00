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

//! EC2 instance metadata service v2 client
//!
//! Token-authenticated access to role credentials and the instance identity
//! document. The session token and the credential document are cached
//! process-wide; both caches tolerate concurrent downloads.

use crate::s3::creds::Credentials;
use crate::s3::error::Error;
use crate::s3::header_constants::{
    X_AWS_EC2_METADATA_TOKEN, X_AWS_EC2_METADATA_TOKEN_TTL_SECONDS,
};
use crate::s3::http::{execute, HttpResponse, TimeoutProfile};
use crate::s3::multimap_ext::{Multimap, MultimapExt};
use crate::s3::retry::{execute_with_retry, DEFAULT_MAX_RETRY_DELAY, IMDS_MAX_ATTEMPTS};
use http::Method;
use serde::Deserialize;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const IMDS_BASE_URL: &str = "http://169.254.169.254";

/// Session token lifetime requested from the service.
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

/// The token is refreshed this long before it expires.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// A cached role credential older than this is refreshed on next use.
pub const CREDENTIALS_MAX_AGE: Duration = Duration::from_secs(240);

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_usable(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Clone, Debug)]
struct CachedCredentials {
    creds: Credentials,
    cached_at: Instant,
}

impl CachedCredentials {
    fn is_fresh(&self) -> bool {
        self.cached_at.elapsed() < CREDENTIALS_MAX_AGE
    }
}

fn token_cache() -> &'static Mutex<Option<CachedToken>> {
    static CACHE: OnceLock<Mutex<Option<CachedToken>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

fn credentials_cache() -> &'static Mutex<Option<CachedCredentials>> {
    static CACHE: OnceLock<Mutex<Option<CachedCredentials>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

fn imds_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(TimeoutProfile::imds().connection)
            .no_proxy()
            .build()
            .expect("default IMDS client construction cannot fail")
    })
}

/// Drops the cached session token and role credentials.
pub fn clear_imds_caches() {
    *token_cache().lock().expect("imds token lock poisoned") = None;
    *credentials_cache()
        .lock()
        .expect("imds credentials lock poisoned") = None;
}

/// The role credential document returned by the metadata service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceIdentity {
    region: String,
}

async fn request(
    method: Method,
    path: &str,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error> {
    let url = format!("{IMDS_BASE_URL}{path}");
    let profile = TimeoutProfile::imds();
    let resp = execute_with_retry(
        IMDS_MAX_ATTEMPTS,
        DEFAULT_MAX_RETRY_DELAY,
        cancel,
        |_attempt| {
            let mut headers = Multimap::new();
            if method == Method::PUT {
                headers.add(X_AWS_EC2_METADATA_TOKEN_TTL_SECONDS, TOKEN_TTL.as_secs().to_string());
            }
            if let Some(t) = token {
                headers.add(X_AWS_EC2_METADATA_TOKEN, t);
            }
            let url = url.clone();
            let method = method.clone();
            async move {
                execute(imds_client(), method, url, &headers, None, &profile, cancel).await
            }
        },
    )
    .await?;

    if !resp.is_success() {
        return Err(Error::InvalidResponse {
            status_code: resp.status_code,
            content_type: String::new(),
            body: resp.body,
        });
    }
    Ok(resp)
}

async fn session_token(cancel: &CancellationToken) -> Result<String, Error> {
    if let Some(cached) = token_cache()
        .lock()
        .expect("imds token lock poisoned")
        .clone()
    {
        if cached.is_usable() {
            return Ok(cached.value);
        }
    }

    log::debug!("refreshing IMDS session token");
    let resp = request(Method::PUT, "/latest/api/token", None, cancel).await?;
    let value = String::from_utf8_lossy(&resp.body).trim().to_string();
    let cached = CachedToken {
        value: value.clone(),
        expires_at: Instant::now() + TOKEN_TTL,
    };
    *token_cache().lock().expect("imds token lock poisoned") = Some(cached);
    Ok(value)
}

/// Fetches role credentials, consulting the 4-minute cache first.
pub(crate) async fn fetch_credentials(cancel: &CancellationToken) -> Result<Credentials, Error> {
    if let Some(cached) = credentials_cache()
        .lock()
        .expect("imds credentials lock poisoned")
        .clone()
    {
        if cached.is_fresh() {
            return Ok(cached.creds);
        }
    }

    let token = session_token(cancel).await?;
    let roles = request(
        Method::GET,
        "/latest/meta-data/iam/security-credentials/",
        Some(&token),
        cancel,
    )
    .await?;
    let body = String::from_utf8_lossy(&roles.body);
    let role = body.lines().next().unwrap_or("").trim().to_string();
    if role.is_empty() {
        return Err(Error::InvalidResponse {
            status_code: roles.status_code,
            content_type: String::new(),
            body: roles.body.clone(),
        });
    }

    let doc = request(
        Method::GET,
        &format!("/latest/meta-data/iam/security-credentials/{role}"),
        Some(&token),
        cancel,
    )
    .await?;
    let parsed: SecurityCredentials = serde_json::from_slice(&doc.body).map_err(|e| {
        log::warn!("malformed IMDS credential document: {e}");
        Error::InvalidResponse {
            status_code: doc.status_code,
            content_type: String::new(),
            body: doc.body.clone(),
        }
    })?;

    let creds = Credentials {
        access_key: parsed.access_key_id,
        secret_key: parsed.secret_access_key,
        session_token: parsed.token,
    };
    log::debug!("refreshed IMDS role credentials for {role}");
    *credentials_cache()
        .lock()
        .expect("imds credentials lock poisoned") = Some(CachedCredentials {
        creds: creds.clone(),
        cached_at: Instant::now(),
    });
    Ok(creds)
}

/// Reads the region out of the instance identity document.
pub(crate) async fn fetch_region(cancel: &CancellationToken) -> Result<String, Error> {
    let token = session_token(cancel).await?;
    let doc = request(
        Method::GET,
        "/latest/dynamic/instance-identity/document",
        Some(&token),
        cancel,
    )
    .await?;
    let parsed: InstanceIdentity = serde_json::from_slice(&doc.body).map_err(|e| {
        log::warn!("malformed instance identity document: {e}");
        Error::InvalidResponse {
            status_code: doc.status_code,
            content_type: String::new(),
            body: doc.body.clone(),
        }
    })?;
    Ok(parsed.region)
}
