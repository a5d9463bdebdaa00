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

//! # Parfetch (`parfetch`)
//!
//! A high-throughput download accelerator for single large objects stored in
//! Amazon S3 or any S3-compatible object store. Instead of one sequential GET,
//! parfetch issues many concurrent byte-range (or multipart part-number) GETs,
//! reassembles the bytes in strict object order, and delivers them either as a
//! byte stream or as a file on local storage. With 64-way concurrency it is
//! able to saturate multi-gigabit network paths without a vendor SDK.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use parfetch::s3::download::{Downloader, DownloadOptions, ObjectSource};
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = ObjectSource::new("my-bucket", "path/to/object");
//!     let options = DownloadOptions::builder()
//!         .part_size_mb(8)
//!         .concurrency(64)
//!         .build();
//!
//!     let downloader = Downloader::new(source, options).expect("valid options");
//!     downloader
//!         .to_file("/tmp/object.bin")
//!         .await
//!         .expect("download failed");
//! }
//! ```
//!
//! ## Features
//! - Range mode (fixed part size) and native multipart-part mode
//! - Strict in-order delivery decoupled from part downloads
//! - AWS Signature V4 signing with environment, IMDSv2 or caller-supplied
//!   credentials
//! - Layered timeouts (resolve / connection / write / read / data / request)
//!   and bounded retries with jittered exponential backoff
//! - Process-wide DNS record cache with round-robin address selection
//!
//! ## Design
//! - [`s3::download::Downloader`] owns the per-download state machine
//! - [`s3::get_object::GetPart`] performs one signed ranged GET with retry
//! - [`s3::sink::ObjectSink`] is the delivery contract for streams and files

#![allow(clippy::result_large_err)]
pub mod s3;
