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

//! The download coordinator
//!
//! Probes the object for size and part layout, schedules concurrent part
//! GETs under a fixed concurrency budget, and delivers downloaded parts to
//! the sink in strict ascending order while downloads stay decoupled from
//! writes.

use crate::s3::creds::{default_provider, Provider};
use crate::s3::dns::CachingResolver;
use crate::s3::endpoint::{self, Endpoint};
use crate::s3::error::{Error, ValidationErr};
use crate::s3::get_object::{GetPart, PartResponse, PartSpec};
use crate::s3::http::TimeoutProfile;
use crate::s3::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RETRY_DELAY};
use crate::s3::sink::{stream_pair, FileSink, ObjectSink, ObjectStream};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

/// An immutable reference to the object being downloaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSource {
    pub bucket: String,
    pub key: String,
    pub version: Option<String>,
}

impl ObjectSource {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Lifecycle notifications, delivered in per-part causal order
/// (`PartDownloading < PartDownloaded < PartWriting < PartDone`). No
/// ordering is guaranteed across parts, and nothing is emitted after abort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Emitted once, after the probe, when streaming begins.
    ObjectDownloading {
        object_size: u64,
        parts_count: Option<u64>,
    },
    /// A part GET was issued.
    PartDownloading(u64),
    /// A part GET succeeded and its bytes are in memory.
    PartDownloaded(u64),
    /// A part is about to flow to the sink.
    PartWriting(u64),
    /// A part write was accepted by the sink.
    PartDone(u64),
}

/// Result of [`Downloader::meta`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Total object size in bytes.
    pub length: u64,
    /// Multipart part count, in native-part mode.
    pub parts: Option<u64>,
}

/// Tuning knobs for one download.
#[derive(Clone, Debug, TypedBuilder)]
pub struct DownloadOptions {
    /// Fixed part size in megabytes. Absent means native-part mode.
    #[builder(default, setter(strip_option))]
    pub part_size_mb: Option<u64>,

    /// Number of simultaneous part GETs. The probe counts as one.
    #[builder(default = 8)]
    pub concurrency: usize,

    /// The six request deadlines applied to every part GET.
    #[builder(default)]
    pub timeouts: TimeoutProfile,

    /// Attempts per part GET.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub attempts: u32,

    /// Ceiling on a single retry backoff delay.
    #[builder(default = DEFAULT_MAX_RETRY_DELAY)]
    pub max_retry_delay: Duration,

    /// Endpoint override, e.g. `http://127.0.0.1:9000`. Default is the
    /// path-style regional host.
    #[builder(default, setter(strip_option, into))]
    pub endpoint_hostname: Option<String>,

    /// Region override; skips `AWS_REGION` / instance metadata discovery.
    #[builder(default, setter(strip_option, into))]
    pub region: Option<String>,

    /// Credential provider override; defaults to environment variables,
    /// then the instance metadata service.
    #[builder(default, setter(strip_option))]
    pub credentials_provider: Option<Arc<dyn Provider>>,

    /// Caller-tuned connection pool. A fresh client with the cached DNS
    /// resolver is built when absent.
    #[builder(default, setter(strip_option))]
    pub connection_pool: Option<reqwest::Client>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions::builder().build()
    }
}

#[derive(Clone, Copy, Debug)]
enum PartMode {
    Range { part_size: u64 },
    Native,
}

/// Probe outcome: object layout plus the first part's body, kept in memory
/// so it can seed the sink when streaming starts.
#[derive(Clone, Debug)]
struct Probe {
    object_size: u64,
    parts: u64,
    parts_count_header: Option<u64>,
    body: Bytes,
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Handle for one object download.
///
/// Created without I/O; the first call to [`meta`](Downloader::meta),
/// [`read_stream`](Downloader::read_stream) or
/// [`to_file`](Downloader::to_file) starts network activity.
/// `read_stream`/`to_file` are single-shot: a download is consumed once.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader").finish_non_exhaustive()
    }
}

struct Inner {
    source: ObjectSource,
    mode: PartMode,
    concurrency: usize,
    timeouts: TimeoutProfile,
    attempts: u32,
    max_retry_delay: Duration,
    endpoint_override: Option<Endpoint>,
    region_override: Option<String>,
    provider: Arc<dyn Provider>,
    client: reqwest::Client,

    cancel: CancellationToken,
    aborted: AtomicBool,
    abort_cause: Mutex<Option<Error>>,
    started: AtomicBool,
    downloading: AtomicUsize,
    events: broadcast::Sender<DownloadEvent>,

    probe: OnceCell<Result<Probe, Error>>,
    net: OnceCell<(Endpoint, String)>,
}

impl Downloader {
    /// Validates options and prepares a download. No I/O happens here.
    pub fn new(source: ObjectSource, options: DownloadOptions) -> Result<Downloader, Error> {
        if options.concurrency < 1 {
            return Err(ValidationErr::InvalidConcurrency(options.concurrency).into());
        }
        let mode = match options.part_size_mb {
            Some(0) => return Err(ValidationErr::InvalidPartSize(0).into()),
            Some(mb) => PartMode::Range {
                part_size: mb * 1_000_000,
            },
            None => PartMode::Native,
        };
        let endpoint_override = options
            .endpoint_hostname
            .as_deref()
            .map(str::parse)
            .transpose()?;

        let client = match options.connection_pool {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder()
                    .no_gzip()
                    .dns_resolver(Arc::new(CachingResolver::new(options.timeouts.resolve)));
                if !options.timeouts.connection.is_zero() {
                    builder = builder.connect_timeout(options.timeouts.connection);
                }
                builder
                    .build()
                    .map_err(|e| ValidationErr::UrlBuildError(e.to_string()))?
            }
        };

        let provider = options.credentials_provider.unwrap_or_else(default_provider);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Downloader {
            inner: Arc::new(Inner {
                source,
                mode,
                concurrency: options.concurrency,
                timeouts: options.timeouts,
                attempts: options.attempts,
                max_retry_delay: options.max_retry_delay,
                endpoint_override,
                region_override: options.region,
                provider,
                client,
                cancel: CancellationToken::new(),
                aborted: AtomicBool::new(false),
                abort_cause: Mutex::new(None),
                started: AtomicBool::new(false),
                downloading: AtomicUsize::new(0),
                events,
                probe: OnceCell::new(),
                net: OnceCell::new(),
            }),
        })
    }

    /// Learns the object's size (and part count in native-part mode) from a
    /// probing first request, without starting delivery. Idempotent:
    /// repeated calls share one in-flight probe and its memoized result.
    pub async fn meta(&self) -> Result<ObjectMeta, Error> {
        let probe = self.inner.probe().await?;
        let parts = match self.inner.mode {
            PartMode::Native => Some(probe.parts),
            PartMode::Range { .. } => None,
        };
        Ok(ObjectMeta {
            length: probe.object_size,
            parts,
        })
    }

    /// Begins delivery as a byte stream. The stream yields the object's
    /// bytes in strict order, ending after the last chunk; a failure is
    /// delivered as a single `Err` item.
    pub fn read_stream(&self) -> Result<ObjectStream, Error> {
        self.inner.consume()?;
        let (sink, stream) = stream_pair();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = run_download(inner, Box::new(sink)).await;
        });
        Ok(stream)
    }

    /// Downloads the object to `path`, writing through a temporary file that
    /// is renamed into place on success.
    pub async fn to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.inner.consume()?;
        let sink = FileSink::create(path).await?;
        run_download(self.inner.clone(), Box::new(sink)).await
    }

    /// Requests cancellation. Idempotent; the first cause wins. All
    /// in-flight part GETs are cancelled, buffered parts are discarded and
    /// the cause reaches the sink exactly once.
    pub fn abort(&self, err: Option<Error>) {
        self.inner.abort_with(err.unwrap_or_else(Error::cancelled));
    }

    /// Number of parts whose GET is currently in flight.
    pub fn parts_downloading(&self) -> usize {
        self.inner.downloading.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted()
    }

    /// Subscribes to lifecycle events. Subscribe before starting delivery
    /// to observe the full sequence.
    pub fn events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Marks the single-shot delivery surface as used.
    fn consume(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ValidationErr::AlreadyConsumed.into());
        }
        Ok(())
    }

    fn abort_with(&self, err: Error) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(
            "aborting download of {}/{}: {err}",
            self.source.bucket,
            self.source.key
        );
        *self.abort_cause.lock().expect("abort cause lock poisoned") = Some(err);
        self.cancel.cancel();
    }

    fn abort_cause(&self) -> Error {
        self.abort_cause
            .lock()
            .expect("abort cause lock poisoned")
            .clone()
            .unwrap_or_else(Error::cancelled)
    }

    fn emit(&self, event: DownloadEvent) {
        if self.aborted() {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Region and endpoint for this download, resolved once.
    async fn net_context(&self) -> Result<(Endpoint, String), Error> {
        self.net
            .get_or_try_init(|| async {
                let region = match &self.region_override {
                    Some(r) => r.clone(),
                    None => endpoint::region().await?,
                };
                let endpoint = match &self.endpoint_override {
                    Some(e) => e.clone(),
                    None => Endpoint::for_region(&region),
                };
                Ok((endpoint, region))
            })
            .await
            .cloned()
    }

    async fn probe(&self) -> Result<Probe, Error> {
        self.probe
            .get_or_init(|| async { self.do_probe().await })
            .await
            .clone()
    }

    async fn do_probe(&self) -> Result<Probe, Error> {
        if self.aborted() {
            return Err(self.abort_cause());
        }

        let part = match self.mode {
            PartMode::Range { part_size } => PartSpec::Range {
                start: 0,
                end: part_size - 1,
            },
            PartMode::Native => PartSpec::PartNumber(1),
        };

        let resp = self.issue_part(1, part).await?;
        let object_size = resp.total_size();
        let parts = match self.mode {
            PartMode::Range { part_size } => {
                if object_size == 0 {
                    1
                } else {
                    object_size.div_ceil(part_size)
                }
            }
            // absent or 1 means a single-part object
            PartMode::Native => resp.parts_count.unwrap_or(1).max(1),
        };

        log::debug!(
            "probe of {}/{}: {object_size} bytes in {parts} part(s)",
            self.source.bucket,
            self.source.key
        );
        Ok(Probe {
            object_size,
            parts,
            parts_count_header: resp.parts_count,
            body: resp.body,
        })
    }

    /// Issues one part GET, maintaining the in-flight gauge and per-part
    /// events.
    async fn issue_part(&self, part_no: u64, part: PartSpec) -> Result<PartResponse, Error> {
        let (endpoint, region) = self.net_context().await?;

        self.emit(DownloadEvent::PartDownloading(part_no));
        self.downloading.fetch_add(1, Ordering::SeqCst);
        let result = GetPart::builder()
            .client(self.client.clone())
            .provider(self.provider.clone())
            .endpoint(endpoint)
            .region(region)
            .bucket(self.source.bucket.clone())
            .key(self.source.key.clone())
            .version(self.source.version.clone())
            .part(part)
            .timeouts(self.timeouts)
            .attempts(self.attempts)
            .max_retry_delay(self.max_retry_delay)
            .cancel(self.cancel.clone())
            .build()
            .send()
            .await;
        self.downloading.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            self.emit(DownloadEvent::PartDownloaded(part_no));
        }
        result
    }

    fn part_spec(&self, probe: &Probe, part_no: u64) -> PartSpec {
        match self.mode {
            PartMode::Native => PartSpec::PartNumber(part_no),
            PartMode::Range { part_size } => {
                let start = (part_no - 1) * part_size;
                let end = if part_no == probe.parts {
                    probe.object_size - 1
                } else {
                    part_no * part_size - 1
                };
                PartSpec::Range { start, end }
            }
        }
    }
}

/// Pulls part numbers from the shared counter until they run out. One worker
/// holds at most one GET in flight; handing the finished part to the writer
/// is the gate before pulling the next number.
async fn worker(
    inner: Arc<Inner>,
    probe: Probe,
    next: Arc<AtomicU64>,
    tx: mpsc::Sender<(u64, Bytes)>,
) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        let part_no = next.fetch_add(1, Ordering::SeqCst);
        if part_no > probe.parts {
            return;
        }

        let spec = inner.part_spec(&probe, part_no);
        match inner.issue_part(part_no, spec).await {
            Ok(resp) => {
                if tx.send((part_no, resp.body)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                inner.abort_with(e);
                return;
            }
        }
    }
}

/// The coordinator body: probe, fan out workers, write in order, finish or
/// fail the sink exactly once.
async fn run_download(inner: Arc<Inner>, mut sink: Box<dyn ObjectSink>) -> Result<(), Error> {
    let probe = match inner.probe().await {
        Ok(p) => p,
        Err(e) => {
            inner.abort_with(e);
            let cause = inner.abort_cause();
            sink.fail(cause.clone()).await;
            return Err(cause);
        }
    };

    if inner.aborted() {
        let cause = inner.abort_cause();
        sink.fail(cause.clone()).await;
        return Err(cause);
    }

    inner.emit(DownloadEvent::ObjectDownloading {
        object_size: probe.object_size,
        parts_count: probe.parts_count_header,
    });

    let parts = probe.parts;
    let (tx, mut rx) = mpsc::channel::<(u64, Bytes)>(inner.concurrency.max(1));
    tx.send((1, probe.body.clone()))
        .await
        .expect("fresh channel accepts the probe part");

    if parts > 1 {
        let next = Arc::new(AtomicU64::new(2));
        let workers = std::cmp::min(inner.concurrency as u64, parts - 1);
        for _ in 0..workers {
            tokio::spawn(worker(inner.clone(), probe.clone(), next.clone(), tx.clone()));
        }
    }
    drop(tx);

    let mut pending: BTreeMap<u64, Bytes> = BTreeMap::new();
    let mut last_written: u64 = 0;

    'delivery: while last_written < parts {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => break 'delivery,
            received = rx.recv() => received,
        };
        let Some((part_no, body)) = received else {
            // every sender is gone; without an abort this cannot happen
            // before the final part arrives
            break 'delivery;
        };
        pending.insert(part_no, body);

        while let Some(body) = pending.remove(&(last_written + 1)) {
            let part_no = last_written + 1;
            inner.emit(DownloadEvent::PartWriting(part_no));
            let written = tokio::select! {
                _ = inner.cancel.cancelled() => break 'delivery,
                written = sink.write(body) => written,
            };
            if let Err(e) = written {
                inner.abort_with(e);
                break 'delivery;
            }
            last_written = part_no;
            inner.emit(DownloadEvent::PartDone(part_no));
            // walk buffered successors on a fresh tick
            tokio::task::yield_now().await;
        }
    }
    drop(pending);

    if last_written == parts && !inner.aborted() {
        match sink.close().await {
            Ok(()) => {
                log::debug!(
                    "downloaded {}/{} ({} bytes, {} parts)",
                    inner.source.bucket,
                    inner.source.key,
                    probe.object_size,
                    parts
                );
                Ok(())
            }
            Err(e) => {
                inner.abort_with(e.clone());
                Err(e)
            }
        }
    } else {
        if !inner.aborted() {
            inner.abort_with(Error::cancelled());
        }
        let cause = inner.abort_cause();
        sink.fail(cause.clone()).await;
        Err(cause)
    }
}
