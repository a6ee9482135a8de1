//! Capability traits for the streams callers hand to the client.
//!
//! The preparer writes the staging stream forward and the uploader then
//! re-reads ranges of it as request bodies, possibly more than once, so
//! staging needs more than write access: it must be able to hand out
//! independent readers over the bytes written so far.  Download outputs only
//! need to be writable, but when the backing can report its size the client
//! checks that it starts empty.

use crate::error::Error;
use async_trait::async_trait;
use std::io::Cursor;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// An intermediate stream the preparer writes and the uploader re-reads.
///
/// The stream must start empty and support random-access reads over
/// previously written bytes.  `part_reader` produces an independent reader
/// over the same bytes for use as a request body; the returned reader can be
/// consumed without disturbing the staging stream's own position.
#[async_trait]
pub trait Staging: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {
    type Reader: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static;

    async fn part_reader(&mut self) -> Result<Self::Reader, Error>;
}

#[async_trait]
impl Staging for File {
    type Reader = File;

    async fn part_reader(&mut self) -> Result<File, Error> {
        self.try_clone()
            .await
            .map_err(|e| Error::io("cloning the staging file for a request body", e))
    }
}

/// In-memory staging.  Each part reader snapshots the buffer; adequate for
/// small uploads and tests, wasteful for anything else.
#[async_trait]
impl Staging for Cursor<Vec<u8>> {
    type Reader = Cursor<Vec<u8>>;

    async fn part_reader(&mut self) -> Result<Cursor<Vec<u8>>, Error> {
        Ok(Cursor::new(self.get_ref().clone()))
    }
}

/// A destination for downloaded bytes.
///
/// `initial_size` reports the size of the sink's current contents when the
/// backing can observe it; sinks that cannot (standard output, pipes) return
/// `None` and are trusted to be empty.
#[async_trait]
pub trait DownloadSink: AsyncWrite + Send + Unpin {
    async fn initial_size(&mut self) -> Option<u64> {
        None
    }
}

#[async_trait]
impl DownloadSink for File {
    async fn initial_size(&mut self) -> Option<u64> {
        // a failed probe is not an error, just an unobservable sink
        self.metadata().await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl DownloadSink for Cursor<Vec<u8>> {
    async fn initial_size(&mut self) -> Option<u64> {
        Some(self.get_ref().len() as u64)
    }
}

#[async_trait]
impl DownloadSink for tokio::io::Stdout {}

#[async_trait]
impl DownloadSink for tokio::io::Sink {}
