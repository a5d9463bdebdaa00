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

//! Parallel download engine for S3 compatible object storage

pub mod creds;
pub mod dns;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod error_response;
pub mod get_object;
pub mod header_constants;
pub mod http;
pub mod imds;
pub mod multimap_ext;
pub mod retry;
pub mod signer;
pub mod sink;
pub mod utils;

pub use download::{DownloadEvent, DownloadOptions, Downloader, ObjectMeta, ObjectSource};
pub use error::Error;
