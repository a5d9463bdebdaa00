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

//! Failure surfacing through the sink and callbacks

mod common;

use common::*;
use parfetch::s3::download::DownloadEvent;
use parfetch::s3::error::Error;
use parfetch::s3::error_response::S3ErrorCode;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A probe answered with `404 NoSuchKey` surfaces the parsed error and never
/// reports the object as downloading.
#[tokio::test]
async fn structured_s3_error_reaches_the_caller() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("Content-Type", "application/xml")
                .set_body_bytes(
                    &b"<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"[..],
                ),
        )
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let mut events = dl.events();

    let err = stream_error(dl.read_stream().unwrap()).await;
    let s3 = err.as_s3_error().expect("expected a structured S3 error");
    assert_eq!(s3.code(), &S3ErrorCode::NoSuchKey);
    assert_eq!(s3.code_str(), "NoSuchKey");
    assert_eq!(s3.status_code(), 404);
    assert_eq!(s3.message(), Some("The specified key does not exist."));

    let events = drain_events(&mut events);
    assert!(
        !events
            .iter()
            .any(|ev| matches!(ev, DownloadEvent::ObjectDownloading { .. })),
        "no object:downloading after a failed probe"
    );
}

/// `meta()` propagates the same memoized probe failure.
#[tokio::test]
async fn meta_surfaces_probe_failure() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("Content-Type", "application/xml")
                .set_body_bytes(
                    &b"<Error><Code>AccessDenied</Code><Message>denied</Message></Error>"[..],
                ),
        )
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let err = dl.meta().await.unwrap_err();
    assert_eq!(err.as_s3_error().unwrap().code(), &S3ErrorCode::AccessDenied);

    // memoized: the second call fails identically without a new request
    let err = dl.meta().await.unwrap_err();
    assert_eq!(err.as_s3_error().unwrap().code(), &S3ErrorCode::AccessDenied);
}

/// A non-XML failure body becomes an unexpected-response error.
#[tokio::test]
async fn non_xml_failure_is_invalid_response() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("Content-Type", "text/html")
                .set_body_bytes(&b"<html>no</html>"[..]),
        )
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let err = stream_error(dl.read_stream().unwrap()).await;
    match err {
        Error::InvalidResponse {
            status_code,
            content_type,
            ..
        } => {
            assert_eq!(status_code, 403);
            assert_eq!(content_type, "text/html");
        }
        other => panic!("expected InvalidResponse, got {other:?}"),
    }
}

/// XML that is not an `<Error>` document is its own failure class.
#[tokio::test]
async fn mismatched_xml_is_an_xml_error() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(409)
                .insert_header("Content-Type", "application/xml")
                .set_body_bytes(&b"<Conflict><Why>busy</Why></Conflict>"[..]),
        )
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let err = stream_error(dl.read_stream().unwrap()).await;
    assert!(matches!(err, Error::XmlError(_)));
}

/// A failed `to_file` leaves neither the destination nor a temporary file.
#[tokio::test]
async fn failed_to_file_leaves_no_partial_files() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("Content-Type", "application/xml")
                .set_body_bytes(
                    &b"<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>"[..],
                ),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("object.bin");

    let dl = downloader(test_options(&server));
    let err = dl.to_file(&dest).await.unwrap_err();
    assert!(err.as_s3_error().is_some());

    assert!(!dest.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// A successful `to_file` writes the full object atomically.
#[tokio::test]
async fn to_file_writes_the_object() {
    clear_caches();
    let server = MockServer::start().await;
    let total = 2_500_000u64;
    mount_native_part(&server, 1, 0, total, 2, part_body(2_000_000, b'f'), None).await;
    mount_native_part(&server, 2, 2_000_000, total, 2, part_body(500_000, b'g'), None).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("nested").join("object.bin");

    let dl = downloader(test_options(&server));
    dl.to_file(&dest).await.unwrap();

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len(), 2_500_000);
    assert_eq!(written, bytes_of(&[(2_000_000, b'f'), (500_000, b'g')]));
}
