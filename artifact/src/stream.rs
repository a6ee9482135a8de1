//! Byte-level stream plumbing: counting, fan-out, digest observation, and
//! bounded windows over seekable sources.
//!
//! Uploads and downloads both hash and count every byte on each side of the
//! transport encoding.  The pieces here let a single read or write pass feed
//! several observers at once.

use crate::error::Error;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, ReadBuf, SeekFrom};

/// Encode bytes as lowercase hex.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A writer that discards its input and counts how many bytes it was given.
/// Writes never fail and are never short.
#[derive(Debug, Default)]
pub struct ByteCounter {
    count: u64,
}

impl ByteCounter {
    /// Total number of bytes written so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A fan-out writer: forwards every buffer to each of a fixed set of sinks
/// and reports the full length on success, so observers never see a short
/// write.
pub struct MultiWrite<'a> {
    sinks: Vec<&'a mut dyn Write>,
}

impl<'a> MultiWrite<'a> {
    pub fn new(sinks: Vec<&'a mut dyn Write>) -> Self {
        Self { sinks }
    }
}

impl Write for MultiWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in self.sinks.iter_mut() {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Shared observation state for one pass over a stream: a SHA-256 of every
/// byte seen plus a byte count.  Shared behind an [`Arc`] so a reader or
/// writer wrapper can feed it while the surrounding code keeps a handle to
/// collect the results.
pub(crate) struct StreamDigest(Mutex<StreamDigestInner>);

struct StreamDigestInner {
    sha256: Sha256,
    bytes: u64,
}

impl StreamDigest {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(StreamDigestInner {
            sha256: Sha256::new(),
            bytes: 0,
        }))
    }

    pub(crate) fn update(&self, buf: &[u8]) {
        let mut inner = self.0.lock().unwrap();
        inner.sha256.update(buf);
        inner.bytes += buf.len() as u64;
    }

    /// The digest and byte count of everything observed so far.
    pub(crate) fn digest_and_len(&self) -> ([u8; 32], u64) {
        let inner = self.0.lock().unwrap();
        (inner.sha256.clone().finalize().into(), inner.bytes)
    }

    pub(crate) fn hex_and_len(&self) -> (String, u64) {
        let (digest, len) = self.digest_and_len();
        (hex(&digest), len)
    }
}

/// Wrapper for an [`AsyncRead`] that feeds every byte read through it into a
/// [`StreamDigest`].
pub(crate) struct DigestRead<R> {
    inner: R,
    digest: Arc<StreamDigest>,
}

impl<R> DigestRead<R> {
    pub(crate) fn new(inner: R, digest: Arc<StreamDigest>) -> Self {
        Self { inner, digest }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // poll_read appends data to the buffer, so the length must be
        // examined before and after to see how much was added
        let len_before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) {
            self.digest.update(&buf.filled()[len_before..]);
        }
        res
    }
}

/// Wrapper for an [`AsyncWrite`] that feeds every byte successfully written
/// through it into a [`StreamDigest`].
pub(crate) struct DigestWrite<W> {
    inner: W,
    digest: Arc<StreamDigest>,
}

impl<W> DigestWrite<W> {
    pub(crate) fn new(inner: W, digest: Arc<StreamDigest>) -> Self {
        Self { inner, digest }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWrite<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(size)) = res {
            self.digest.update(&buf[..size]);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A read window `[offset, offset + size)` over a seekable source.
///
/// Reads return EOF after exactly `size` bytes even if the source has more.
/// [`BoundedStream::reset`] rewinds to the start of the window so the same
/// stream can serve another request attempt.  The backing source is owned
/// for the duration of one request and is not closed on drop.  Not
/// thread-safe; callers must serialize access.
pub struct BoundedStream<S> {
    source: S,
    offset: u64,
    size: u64,
    remaining: u64,
}

impl<S: AsyncRead + AsyncSeek + Unpin> BoundedStream<S> {
    /// Create a window of `size` bytes starting at `offset`, seeking the
    /// source there.  A window of zero bytes is rejected.
    pub async fn new(mut source: S, offset: u64, size: u64) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot specify a size of 0".into(),
            ));
        }
        source
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::io("seeking to the start of the bounded window", e))?;
        Ok(Self {
            source,
            offset,
            size,
            remaining: size,
        })
    }

    /// Rewind to the start of the window and re-arm the limit, so the whole
    /// window can be read again.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.source
            .seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| Error::io("seeking to the start of the bounded window", e))?;
        self.remaining = self.size;
        Ok(())
    }

    /// The window size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<S: AsyncRead + AsyncSeek + Unpin> AsyncRead for BoundedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let max = me.remaining.min(buf.remaining() as u64) as usize;
        let mut limited = buf.take(max);
        ready!(Pin::new(&mut me.source).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        // the sub-buffer shares storage with `buf`; carry its progress over
        unsafe {
            buf.assume_init(n);
        }
        buf.advance(n);
        me.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}
