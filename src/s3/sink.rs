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

//! Delivery targets for downloaded bytes
//!
//! A sink is owned exclusively by the download coordinator from the moment
//! streaming starts until the terminal state. Backpressure is expressed by
//! `write` suspending; ordering is the coordinator's responsibility.

use crate::s3::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The delivery contract between the coordinator and the byte destination.
#[async_trait]
pub trait ObjectSink: Send {
    /// Accepts the next in-order chunk. Suspends while the sink is not ready
    /// for more data.
    async fn write(&mut self, data: Bytes) -> Result<(), Error>;

    /// Finishes the sink after the last chunk was written.
    async fn close(&mut self) -> Result<(), Error>;

    /// Destroys the sink, surfacing `err` through its error channel.
    async fn fail(&mut self, err: Error);
}

/// Writes the object to a temporary file next to the destination and renames
/// it into place on success. A failed download leaves no partial destination
/// file behind.
pub struct FileSink {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl FileSink {
    /// Opens the temporary file, creating missing parent directories.
    pub async fn create(path: impl AsRef<Path>) -> Result<FileSink, Error> {
        let final_path = path.as_ref().to_path_buf();
        if final_path.is_dir() {
            return Err(Error::Io(std::io::Error::other("path is a directory").into()));
        }
        let parent = final_path
            .parent()
            .ok_or_else(|| Error::Io(std::io::Error::other("path has no parent directory").into()))?;
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = final_path
            .file_name()
            .ok_or_else(|| Error::Io(std::io::Error::other("path has no file name").into()))?;

        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!("_{}", Uuid::new_v4().to_string().replace('-', "_")));
        let tmp_path = parent.join(tmp_name);

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        Ok(FileSink {
            file: Some(file),
            tmp_path,
            final_path,
        })
    }
}

#[async_trait]
impl ObjectSink for FileSink {
    async fn write(&mut self, data: Bytes) -> Result<(), Error> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(&data).await?),
            None => Err(Error::Io(std::io::Error::other("sink already closed").into())),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            drop(file);
            fs::rename(&self.tmp_path, &self.final_path).await?;
        }
        Ok(())
    }

    async fn fail(&mut self, _err: Error) {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path).await {
                log::warn!("could not remove temporary file {:?}: {e}", self.tmp_path);
            }
        }
    }
}

/// The channel capacity of a byte stream sink. Writes beyond this many
/// undelivered chunks suspend until the consumer catches up.
const STREAM_BUFFER_CHUNKS: usize = 2;

/// Sink half of [`stream_pair`].
pub struct StreamSink {
    tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
}

/// Consumer half of [`stream_pair`]: the object's bytes in strict order,
/// terminated by `None` on success or one `Err` item on failure.
#[derive(Debug)]
pub struct ObjectStream {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
}

/// Creates a connected sink/stream pair.
pub fn stream_pair() -> (StreamSink, ObjectStream) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
    (StreamSink { tx: Some(tx) }, ObjectStream { rx })
}

#[async_trait]
impl ObjectSink for StreamSink {
    async fn write(&mut self, data: Bytes) -> Result<(), Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Cancelled(Some("stream already closed".into())))?;
        tx.send(Ok(data))
            .await
            .map_err(|_| Error::Cancelled(Some("stream consumer dropped".into())))
    }

    async fn close(&mut self) -> Result<(), Error> {
        // dropping the sender ends the stream
        self.tx.take();
        Ok(())
    }

    async fn fail(&mut self, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err)).await;
        }
    }
}

impl Stream for ObjectStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_pair_delivers_in_order_then_ends() {
        let (mut sink, mut stream) = stream_pair();
        let writer = tokio::spawn(async move {
            sink.write(Bytes::from_static(b"ab")).await.unwrap();
            sink.write(Bytes::from_static(b"cd")).await.unwrap();
            sink.close().await.unwrap();
        });

        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            collected.extend_from_slice(&item.unwrap());
        }
        writer.await.unwrap();
        assert_eq!(collected, b"abcd");
    }

    #[tokio::test]
    async fn stream_pair_surfaces_failure_once() {
        let (mut sink, mut stream) = stream_pair();
        sink.fail(Error::cancelled()).await;
        let item = stream.next().await.unwrap();
        assert!(item.unwrap_err().is_cancelled());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_write_suspends_until_consumer_reads() {
        let (mut sink, mut stream) = stream_pair();
        // fill the buffer past its capacity
        for _ in 0..STREAM_BUFFER_CHUNKS {
            sink.write(Bytes::from_static(b"x")).await.unwrap();
        }
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sink.write(Bytes::from_static(b"y")),
        )
        .await;
        assert!(pending.is_err(), "write should block on a full buffer");

        // draining one chunk releases the writer
        stream.next().await.unwrap().unwrap();
        tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sink.write(Bytes::from_static(b"y")),
        )
        .await
        .expect("write should complete after drain")
        .unwrap();
    }

    #[tokio::test]
    async fn file_sink_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("object.bin");

        let mut sink = FileSink::create(&dest).await.unwrap();
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        // no stray temporary files
        let entries: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn file_sink_failure_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("object.bin");

        let mut sink = FileSink::create(&dest).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.fail(Error::cancelled()).await;

        assert!(!dest.exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "temporary file should be removed");
    }

    #[tokio::test]
    async fn file_sink_rejects_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSink::create(dir.path()).await.is_err());
    }
}
