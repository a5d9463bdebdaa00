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

//! Native-part mode downloads against a mock S3 server

mod common;

use common::*;
use parfetch::s3::download::DownloadEvent;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Three server-side parts of 8 MB / 8 MB / 1 MB, fetched with concurrency 4.
#[tokio::test]
async fn three_native_parts_reassemble_in_order() {
    clear_caches();
    let server = MockServer::start().await;
    let total = 17_000_000u64;
    mount_native_part(&server, 1, 0, total, 3, part_body(8_000_000, b'a'), None).await;
    mount_native_part(&server, 2, 8_000_000, total, 3, part_body(8_000_000, b'b'), None).await;
    mount_native_part(&server, 3, 16_000_000, total, 3, part_body(1_000_000, b'c'), None).await;

    let mut options = test_options(&server);
    options.concurrency = 4;
    let dl = downloader(options);
    let mut events = dl.events();

    let bytes = collect_stream(dl.read_stream().unwrap()).await.unwrap();

    assert_eq!(bytes.len(), 17_000_000);
    assert_eq!(
        bytes,
        bytes_of(&[(8_000_000, b'a'), (8_000_000, b'b'), (1_000_000, b'c')])
    );

    let events = drain_events(&mut events);
    assert_eq!(
        sorted(part_numbers(&events, downloading_part)),
        vec![1, 2, 3]
    );
    assert_eq!(sorted(part_numbers(&events, done_part)), vec![1, 2, 3]);
    assert!(peak_concurrent_downloads(&events) <= 3);
    assert!(events.iter().any(|ev| matches!(
        ev,
        DownloadEvent::ObjectDownloading {
            object_size: 17_000_000,
            parts_count: Some(3)
        }
    )));
}

/// An object uploaded without multipart: no `x-amz-mp-parts-count`, the
/// probe body is the whole object.
#[tokio::test]
async fn single_part_object_closes_after_probe() {
    clear_caches();
    let server = MockServer::start().await;
    let body = part_body(4096, b'z');
    Mock::given(method("GET"))
        .and(path(object_path()))
        .and(query_param("partNumber", "1"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-4095/4096")
                .set_body_bytes(body.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let bytes = collect_stream(dl.read_stream().unwrap()).await.unwrap();
    assert_eq!(bytes, body);
}

/// A zero-length object answers `200` with an empty body in native mode.
#[tokio::test]
async fn zero_length_object_native_mode() {
    clear_caches();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(object_path()))
        .and(query_param("partNumber", "1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let meta = dl.meta().await.unwrap();
    assert_eq!(meta.length, 0);
    assert_eq!(meta.parts, Some(1));

    let bytes = collect_stream(dl.read_stream().unwrap()).await.unwrap();
    assert!(bytes.is_empty());
}

/// `meta()` probes at most once, and the probe feeds the later stream.
#[tokio::test]
async fn meta_is_memoized_and_shares_the_probe() {
    clear_caches();
    let server = MockServer::start().await;
    let body = part_body(1024, b'm');
    Mock::given(method("GET"))
        .and(path(object_path()))
        .and(query_param("partNumber", "1"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-1023/1024")
                .set_body_bytes(body.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dl = downloader(test_options(&server));
    let first = dl.meta().await.unwrap();
    let second = dl.meta().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.length, 1024);
    assert_eq!(first.parts, Some(1));

    // no second GET: the memoized probe body feeds the sink
    let bytes = collect_stream(dl.read_stream().unwrap()).await.unwrap();
    assert_eq!(bytes, body);
}

/// Downloading the same mocked object twice produces identical output.
#[tokio::test]
async fn repeat_download_is_byte_identical() {
    clear_caches();
    let server = MockServer::start().await;
    let total = 3000u64;
    mount_native_part(&server, 1, 0, total, 2, part_body(2000, b'p'), None).await;
    mount_native_part(&server, 2, 2000, total, 2, part_body(1000, b'q'), None).await;

    let first = collect_stream(
        downloader(test_options(&server))
            .read_stream()
            .unwrap(),
    )
    .await
    .unwrap();

    clear_caches();
    let second = collect_stream(
        downloader(test_options(&server))
            .read_stream()
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3000);
}
