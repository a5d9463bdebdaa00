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

//! One signed, retried S3 `GetObject` for a byte range or multipart part

use crate::s3::creds::Provider;
use crate::s3::endpoint::{object_path, Endpoint};
use crate::s3::error::Error;
use crate::s3::error_response::{S3ErrorCode, S3ErrorResponse};
use crate::s3::header_constants::*;
use crate::s3::http::{execute, HttpResponse, TimeoutProfile};
use crate::s3::multimap_ext::{Multimap, MultimapExt};
use crate::s3::retry::{execute_with_retry, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RETRY_DELAY};
use crate::s3::signer::sign_v4_s3;
use crate::s3::utils::{
    header_str, header_u64, parse_content_range, to_amz_date, utc_now, ContentRange, EMPTY_SHA256,
};
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

/// How one part of the object is addressed on the wire. The two variants are
/// mutually exclusive by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartSpec {
    /// Inclusive byte range, sent as `Range: bytes=START-END`.
    Range { start: u64, end: u64 },
    /// Server-side multipart component, sent as `partNumber=N`.
    PartNumber(u64),
}

/// A successfully fetched part.
#[derive(Clone, Debug)]
pub struct PartResponse {
    pub body: Bytes,
    pub content_length: u64,
    /// Parsed `Content-Range`; `None` for a zero-length object.
    pub content_range: Option<ContentRange>,
    /// `x-amz-mp-parts-count`, when the server reported it.
    pub parts_count: Option<u64>,
}

impl PartResponse {
    /// Total object size learned from this response. Zero-length responses
    /// carry no `Content-Range`.
    pub fn total_size(&self) -> u64 {
        self.content_range.map(|cr| cr.total).unwrap_or(0)
    }

    fn empty() -> Self {
        PartResponse {
            body: Bytes::new(),
            content_length: 0,
            content_range: None,
            parts_count: None,
        }
    }
}

/// Argument builder for one part GET.
///
/// Signs the request with SigV4, executes it through the retry wrapper, and
/// interprets the response. Cancellation is observed at every await point
/// through the supplied token.
#[derive(Clone, Debug, TypedBuilder)]
pub struct GetPart {
    client: reqwest::Client,
    provider: Arc<dyn Provider>,
    endpoint: Endpoint,
    #[builder(setter(into))]
    region: String,
    #[builder(setter(into))]
    bucket: String,
    #[builder(setter(into))]
    key: String,
    #[builder(default)]
    version: Option<String>,
    part: PartSpec,
    #[builder(default)]
    timeouts: TimeoutProfile,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    attempts: u32,
    #[builder(default = DEFAULT_MAX_RETRY_DELAY)]
    max_retry_delay: Duration,
    cancel: CancellationToken,
}

impl GetPart {
    pub async fn send(&self) -> Result<PartResponse, Error> {
        let path = object_path(&self.bucket, &self.key);

        let mut query = Multimap::new();
        query.add_version(self.version.clone());
        if let PartSpec::PartNumber(n) = self.part {
            query.add("partNumber", n.to_string());
        }
        let url = self.endpoint.url(&path, &query);

        let resp = execute_with_retry(
            self.attempts,
            self.max_retry_delay,
            &self.cancel,
            |_attempt| {
                let url = url.clone();
                let path = path.clone();
                let query = query.clone();
                async move {
                    // re-sign per attempt so refreshed credentials are picked up
                    let creds = self.provider.fetch().await?;

                    let mut headers = Multimap::new();
                    headers.add(HOST, self.endpoint.host_header_value());
                    headers.add(
                        USER_AGENT,
                        format!(
                            "parfetch/{} ({}; {})",
                            env!("CARGO_PKG_VERSION"),
                            std::env::consts::OS,
                            std::env::consts::ARCH
                        ),
                    );
                    headers.add(X_AMZ_CONTENT_SHA256, EMPTY_SHA256);
                    let date = utc_now();
                    headers.add(X_AMZ_DATE, to_amz_date(date));
                    if let Some(token) = &creds.session_token {
                        headers.add(X_AMZ_SECURITY_TOKEN, token.clone());
                    }
                    if let PartSpec::Range { start, end } = self.part {
                        headers.add(RANGE, format!("bytes={start}-{end}"));
                    }

                    sign_v4_s3(
                        &Method::GET,
                        &path,
                        &self.region,
                        &mut headers,
                        &query,
                        &creds.access_key,
                        &creds.secret_key,
                        EMPTY_SHA256,
                        date,
                    );

                    execute(
                        &self.client,
                        Method::GET,
                        url,
                        &headers,
                        None,
                        &self.timeouts,
                        &self.cancel,
                    )
                    .await
                }
            },
        )
        .await?;

        self.interpret(resp)
    }

    fn interpret(&self, resp: HttpResponse) -> Result<PartResponse, Error> {
        match resp.status_code {
            206 => self.interpret_partial(resp),
            200 => {
                if resp.body.is_empty() {
                    // a zero-length object answers ranged requests with 200
                    Ok(PartResponse::empty())
                } else {
                    Err(unexpected_response(&resp))
                }
            }
            416 => match parse_error_body(&resp) {
                Ok(parsed) if parsed.code() == &S3ErrorCode::InvalidRange => {
                    // requesting bytes 0.. of an empty object
                    Ok(PartResponse::empty())
                }
                Ok(parsed) => Err(Error::S3Error(parsed)),
                Err(e) => Err(e),
            },
            _ => Err(self.interpret_failure(resp)),
        }
    }

    fn interpret_partial(&self, resp: HttpResponse) -> Result<PartResponse, Error> {
        let raw = header_str(&resp.headers, CONTENT_RANGE)
            .ok_or_else(|| unexpected_response(&resp))?;
        let content_range = parse_content_range(raw)
            .ok_or_else(|| Error::UnexpectedContentRange(raw.to_string()))?;

        if let PartSpec::Range { start, .. } = self.part {
            if content_range.start != start {
                return Err(Error::UnexpectedContentRange(format!(
                    "requested bytes from {start}, server answered {raw}"
                )));
            }
        }

        let parts_count = header_u64(&resp.headers, X_AMZ_MP_PARTS_COUNT);
        let content_length = resp.body.len() as u64;
        Ok(PartResponse {
            body: resp.body,
            content_length,
            content_range: Some(content_range),
            parts_count,
        })
    }

    fn interpret_failure(&self, resp: HttpResponse) -> Error {
        let content_type = header_str(&resp.headers, CONTENT_TYPE).unwrap_or_default();
        if content_type.to_lowercase().contains("application/xml") && !resp.body.is_empty() {
            return match S3ErrorResponse::new_from_body(resp.status_code, resp.body.clone()) {
                Ok(parsed) => Error::S3Error(parsed),
                Err(e) => e,
            };
        }
        unexpected_response(&resp)
    }
}

fn parse_error_body(resp: &HttpResponse) -> Result<S3ErrorResponse, Error> {
    if resp.body.is_empty() {
        return Err(unexpected_response(resp));
    }
    S3ErrorResponse::new_from_body(resp.status_code, resp.body.clone())
}

fn unexpected_response(resp: &HttpResponse) -> Error {
    Error::InvalidResponse {
        status_code: resp.status_code,
        content_type: header_str(&resp.headers, CONTENT_TYPE)
            .unwrap_or_default()
            .to_string(),
        body: resp.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::creds::StaticProvider;
    use http::HeaderMap;

    fn get_part(part: PartSpec) -> GetPart {
        GetPart::builder()
            .client(reqwest::Client::new())
            .provider(Arc::new(StaticProvider::new("ak", "sk", None)))
            .endpoint(Endpoint::for_region("eu-west-1"))
            .region("eu-west-1")
            .bucket("bucket")
            .key("key")
            .part(part)
            .cancel(CancellationToken::new())
            .build()
    }

    fn partial_response(range: &str, body: &'static [u8]) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-range", range.parse().unwrap());
        HttpResponse {
            status_code: 206,
            headers,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn partial_content_parses_range_and_parts_count() {
        let gp = get_part(PartSpec::PartNumber(1));
        let mut resp = partial_response("bytes 0-4/17", b"hello");
        resp.headers
            .insert("x-amz-mp-parts-count", "3".parse().unwrap());

        let part = gp.interpret(resp).unwrap();
        assert_eq!(part.body.as_ref(), b"hello");
        assert_eq!(part.content_length, 5);
        assert_eq!(part.total_size(), 17);
        assert_eq!(part.parts_count, Some(3));
    }

    #[test]
    fn range_mismatch_is_surfaced() {
        let gp = get_part(PartSpec::Range {
            start: 8,
            end: 15,
        });
        let resp = partial_response("bytes 0-7/16", b"12345678");
        let err = gp.interpret(resp).unwrap_err();
        assert!(matches!(err, Error::UnexpectedContentRange(_)));
    }

    #[test]
    fn missing_content_range_is_invalid() {
        let gp = get_part(PartSpec::PartNumber(1));
        let resp = HttpResponse {
            status_code: 206,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"x"),
        };
        assert!(matches!(
            gp.interpret(resp),
            Err(Error::InvalidResponse { status_code: 206, .. })
        ));
    }

    #[test]
    fn empty_200_is_a_zero_length_object() {
        let gp = get_part(PartSpec::Range { start: 0, end: 7 });
        let resp = HttpResponse {
            status_code: 200,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let part = gp.interpret(resp).unwrap();
        assert!(part.body.is_empty());
        assert_eq!(part.total_size(), 0);
    }

    #[test]
    fn nonempty_200_is_rejected() {
        let gp = get_part(PartSpec::Range { start: 0, end: 7 });
        let resp = HttpResponse {
            status_code: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"whole object"),
        };
        assert!(matches!(
            gp.interpret(resp),
            Err(Error::InvalidResponse { status_code: 200, .. })
        ));
    }

    #[test]
    fn invalid_range_416_is_a_zero_length_object() {
        let gp = get_part(PartSpec::Range { start: 0, end: 7 });
        let resp = HttpResponse {
            status_code: 416,
            headers: HeaderMap::new(),
            body: Bytes::from_static(
                b"<Error><Code>InvalidRange</Code><Message>range not satisfiable</Message></Error>",
            ),
        };
        let part = gp.interpret(resp).unwrap();
        assert!(part.body.is_empty());
        assert_eq!(part.total_size(), 0);
    }

    #[test]
    fn structured_error_preserves_code() {
        let gp = get_part(PartSpec::PartNumber(1));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/xml".parse().unwrap());
        let resp = HttpResponse {
            status_code: 404,
            headers,
            body: Bytes::from_static(
                b"<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>",
            ),
        };
        let err = gp.interpret(resp).unwrap_err();
        let s3 = err.as_s3_error().expect("expected S3 error");
        assert_eq!(s3.code(), &S3ErrorCode::NoSuchKey);
        assert_eq!(s3.status_code(), 404);
    }

    #[test]
    fn xml_that_is_not_an_error_document() {
        let gp = get_part(PartSpec::PartNumber(1));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/xml".parse().unwrap());
        let resp = HttpResponse {
            status_code: 409,
            headers,
            body: Bytes::from_static(b"<Something/>"),
        };
        assert!(matches!(gp.interpret(resp), Err(Error::XmlError(_))));
    }

    #[test]
    fn non_xml_failure_is_unexpected_response() {
        let gp = get_part(PartSpec::PartNumber(1));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        let resp = HttpResponse {
            status_code: 403,
            headers,
            body: Bytes::from_static(b"<html>forbidden</html>"),
        };
        assert!(matches!(
            gp.interpret(resp),
            Err(Error::InvalidResponse { status_code: 403, .. })
        ));
    }
}
