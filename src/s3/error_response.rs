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

//! Typed representation of the S3 `<Error>` response document

use crate::s3::error::Error;
use crate::s3::utils::{get_text_default, get_text_option};
use bytes::{Buf, Bytes};
use std::fmt;
use std::str::FromStr;
use xmltree::Element;

/// Error codes returned by S3 compatible servers.
///
/// Codes that matter to the download path get their own variant; everything
/// else is preserved verbatim in [`S3ErrorCode::Other`] so callers can still
/// branch on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum S3ErrorCode {
    #[default]
    NoError,

    NoSuchBucket,
    NoSuchKey,
    AccessDenied,
    InvalidRange,
    InternalError,
    SlowDown,
    PermanentRedirect,
    Redirect,
    BadRequest,
    ResourceNotFound,
    MethodNotAllowed,
    ResourceConflict,
    NotSupported,

    Other(String),
}

#[allow(dead_code)]
const ALL_S3_ERROR_CODES: &[S3ErrorCode] = &[
    S3ErrorCode::NoError,
    S3ErrorCode::NoSuchBucket,
    S3ErrorCode::NoSuchKey,
    S3ErrorCode::AccessDenied,
    S3ErrorCode::InvalidRange,
    S3ErrorCode::InternalError,
    S3ErrorCode::SlowDown,
    S3ErrorCode::PermanentRedirect,
    S3ErrorCode::Redirect,
    S3ErrorCode::BadRequest,
    S3ErrorCode::ResourceNotFound,
    S3ErrorCode::MethodNotAllowed,
    S3ErrorCode::ResourceConflict,
    S3ErrorCode::NotSupported,
];

impl FromStr for S3ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "noerror" => S3ErrorCode::NoError,
            "nosuchbucket" => S3ErrorCode::NoSuchBucket,
            "nosuchkey" => S3ErrorCode::NoSuchKey,
            "accessdenied" => S3ErrorCode::AccessDenied,
            "invalidrange" => S3ErrorCode::InvalidRange,
            "internalerror" => S3ErrorCode::InternalError,
            "slowdown" => S3ErrorCode::SlowDown,
            "permanentredirect" => S3ErrorCode::PermanentRedirect,
            "redirect" => S3ErrorCode::Redirect,
            "badrequest" => S3ErrorCode::BadRequest,
            "resourcenotfound" => S3ErrorCode::ResourceNotFound,
            "methodnotallowed" => S3ErrorCode::MethodNotAllowed,
            "resourceconflict" => S3ErrorCode::ResourceConflict,
            "notsupported" => S3ErrorCode::NotSupported,
            // keep the server's spelling, not the lowercased match key
            _ => S3ErrorCode::Other(s.to_owned()),
        })
    }
}

impl fmt::Display for S3ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S3ErrorCode::NoError => write!(f, "NoError"),
            S3ErrorCode::NoSuchBucket => write!(f, "NoSuchBucket"),
            S3ErrorCode::NoSuchKey => write!(f, "NoSuchKey"),
            S3ErrorCode::AccessDenied => write!(f, "AccessDenied"),
            S3ErrorCode::InvalidRange => write!(f, "InvalidRange"),
            S3ErrorCode::InternalError => write!(f, "InternalError"),
            S3ErrorCode::SlowDown => write!(f, "SlowDown"),
            S3ErrorCode::PermanentRedirect => write!(f, "PermanentRedirect"),
            S3ErrorCode::Redirect => write!(f, "Redirect"),
            S3ErrorCode::BadRequest => write!(f, "BadRequest"),
            S3ErrorCode::ResourceNotFound => write!(f, "ResourceNotFound"),
            S3ErrorCode::MethodNotAllowed => write!(f, "MethodNotAllowed"),
            S3ErrorCode::ResourceConflict => write!(f, "ResourceConflict"),
            S3ErrorCode::NotSupported => write!(f, "NotSupported"),
            S3ErrorCode::Other(code) => write!(f, "{code}"),
        }
    }
}

/// The typed error returned when the server answers with an XML `<Error>`
/// document.
#[derive(Clone, Debug)]
pub struct S3ErrorResponse {
    code: S3ErrorCode,
    message: Option<String>,
    status_code: u16,
    request_id: String,
    host_id: String,
    body: Bytes,
}

impl S3ErrorResponse {
    /// Parses the XML body of a failed response. Fails with
    /// [`Error::XmlError`] when the body is not well-formed XML or the root
    /// element is not `<Error>`.
    pub fn new_from_body(status_code: u16, body: Bytes) -> Result<Self, Error> {
        let root = Element::parse(body.clone().reader())
            .map_err(|e| Error::XmlError(format!("malformed XML error body: {e}")))?;
        if root.name != "Error" {
            return Err(Error::XmlError(format!(
                "expected <Error> document, got <{}>",
                root.name
            )));
        }
        let code_text = get_text_default(&root, "Code");
        Ok(Self {
            code: code_text.parse().unwrap_or_default(),
            message: get_text_option(&root, "Message"),
            status_code,
            request_id: get_text_default(&root, "RequestId"),
            host_id: get_text_default(&root, "HostId"),
            body,
        })
    }

    pub fn code(&self) -> &S3ErrorCode {
        &self.code
    }

    /// The `<Code>` element exactly as the server spelled it.
    pub fn code_str(&self) -> String {
        self.code.to_string()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The raw response body as received.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for S3ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S3 operation failed; code: {}, message: {:?}, status code: {}, request_id: {}, host_id: {}",
            self.code, self.message, self.status_code, self.request_id, self.host_id,
        )
    }
}

impl std::error::Error for S3ErrorResponse {}
