//! Upload preparation: hashing, optional gzip encoding, and part-splitting.
//!
//! Preparation copies the caller's input to a staging stream exactly once,
//! hashing and counting the bytes on both sides of the optional gzip
//! encoder.  Multipart preparation then re-reads the staging stream to
//! compute per-part digests, cross-checking the full digest against the
//! first pass so a staging stream mutated underneath us is caught before
//! anything is sent.

use crate::error::Error;
use crate::stream::{ByteCounter, DigestWrite, MultiWrite, StreamDigest};
use async_compression::tokio::write::GzipEncoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom,
};

/// Parts may not be smaller than 5 MB (the object store's floor).
pub(crate) const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Chunks may not be smaller than 1 KB.
pub(crate) const MIN_CHUNK_SIZE: usize = 1024;

/// The transport encoding applied to an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentEncoding::Identity => write!(f, "identity"),
            ContentEncoding::Gzip => write!(f, "gzip"),
        }
    }
}

/// One contiguous range of the staging stream, uploaded as a single PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// SHA-256 of the bytes in `[start, start + size)`.
    pub digest: [u8; 32],
    /// Size of this part in bytes.  Only the last part may be smaller than
    /// the nominal part size, and it is never empty.
    pub size: i64,
    /// Byte offset of this part in the staging stream.
    pub start: i64,
}

/// Everything the upload protocol needs to know about prepared data.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// SHA-256 of the caller's logical bytes, before any transport encoding.
    pub content_digest: [u8; 32],
    /// Length of the logical bytes.
    pub content_size: i64,
    /// SHA-256 of the bytes as they go over the wire.  Equal to
    /// `content_digest` for identity encoding.
    pub transfer_digest: [u8; 32],
    /// Length of the on-wire bytes.
    pub transfer_size: i64,
    pub content_encoding: ContentEncoding,
    /// Part descriptions, in order; empty for a single-part upload.
    pub parts: Vec<Part>,
}

/// Prepare a single-part upload.
///
/// Seeks `input` to the start, copies it into `staging` (through a gzip
/// encoder when `gzip` is set), and returns the resulting plan.  After this
/// returns, `staging` holds exactly `transfer_size` bytes whose SHA-256 is
/// `transfer_digest`.
///
/// The gzip encoder writes a fixed modification time and no file name, so
/// encoding the same input always produces the same transfer digest.
pub async fn prepare_single<I, S>(
    input: &mut I,
    staging: &mut S,
    gzip: bool,
    chunk_size: usize,
) -> Result<UploadPlan, Error>
where
    I: AsyncRead + AsyncSeek + Unpin + ?Sized,
    S: AsyncWrite + Unpin + ?Sized,
{
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(Error::InvalidArgument(format!(
            "chunk size {} is not the minimum of 1KB",
            chunk_size
        )));
    }

    input
        .seek(SeekFrom::Start(0))
        .await
        .map_err(|e| Error::io("seeking input to the start for preparation", e))?;

    let transfer = Arc::new(StreamDigest::new());
    let mut content_hash = Sha256::new();
    let mut content_count = ByteCounter::default();
    let mut buf = vec![0u8; chunk_size];

    if gzip {
        let mut encoder = GzipEncoder::new(DigestWrite::new(&mut *staging, transfer.clone()));
        let mut content_tee = MultiWrite::new(vec![&mut content_hash, &mut content_count]);
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| Error::io("reading input during preparation", e))?;
            if n == 0 {
                break;
            }
            content_tee
                .write_all(&buf[..n])
                .map_err(|e| Error::io("hashing input during preparation", e))?;
            encoder
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::io("writing encoded bytes to staging", e))?;
        }
        // shutdown emits the gzip trailer and flushes the staging stream
        encoder
            .shutdown()
            .await
            .map_err(|e| Error::io("finishing the gzip stream", e))?;
    } else {
        let mut observed = DigestWrite::new(&mut *staging, transfer.clone());
        let mut content_tee = MultiWrite::new(vec![&mut content_hash, &mut content_count]);
        loop {
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| Error::io("reading input during preparation", e))?;
            if n == 0 {
                break;
            }
            content_tee
                .write_all(&buf[..n])
                .map_err(|e| Error::io("hashing input during preparation", e))?;
            observed
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::io("writing to staging", e))?;
        }
        observed
            .flush()
            .await
            .map_err(|e| Error::io("flushing staging", e))?;
    }

    let (transfer_digest, transfer_size) = transfer.digest_and_len();
    Ok(UploadPlan {
        content_digest: content_hash.finalize().into(),
        content_size: content_count.count() as i64,
        transfer_digest,
        transfer_size: transfer_size as i64,
        content_encoding: if gzip {
            ContentEncoding::Gzip
        } else {
            ContentEncoding::Identity
        },
        parts: Vec::new(),
    })
}

/// Prepare a multipart upload.
///
/// Runs the single-part preparation, then rewinds `staging` and re-reads it
/// to compute per-part digests.  The part size is `chunk_size *
/// chunks_per_part`; every part but the last has exactly that size.  The
/// full digest of the second pass must match the first pass's transfer
/// digest; a mismatch means the staging stream changed underneath us and is
/// fatal.
pub async fn prepare_multi<I, S>(
    input: &mut I,
    staging: &mut S,
    gzip: bool,
    chunk_size: usize,
    chunks_per_part: usize,
) -> Result<UploadPlan, Error>
where
    I: AsyncRead + AsyncSeek + Unpin + ?Sized,
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin + ?Sized,
{
    let part_size = chunk_size * chunks_per_part;
    if part_size < MIN_PART_SIZE {
        return Err(Error::InvalidArgument(format!(
            "part size {} is not the minimum of 5MB",
            part_size
        )));
    }

    let mut plan = prepare_single(input, staging, gzip, chunk_size).await?;

    staging
        .seek(SeekFrom::Start(0))
        .await
        .map_err(|e| Error::io("rewinding staging for part hashing", e))?;

    let (parts, full_digest) = hash_parts(staging, chunk_size, part_size).await?;

    if full_digest != plan.transfer_digest {
        return Err(Error::Protocol(
            "staging stream changed while computing part digests".into(),
        ));
    }

    plan.parts = parts;
    Ok(plan)
}

/// Second pass over the staging stream: per-part digests and offsets, plus
/// the digest of the whole stream for cross-checking against the first pass.
async fn hash_parts<S>(
    staging: &mut S,
    chunk_size: usize,
    part_size: usize,
) -> Result<(Vec<Part>, [u8; 32]), Error>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut full = Sha256::new();
    let mut part_hash = Sha256::new();
    let mut parts = Vec::new();
    let mut part_len: usize = 0;
    let mut start: u64 = 0;
    let mut buf = vec![0u8; chunk_size];

    loop {
        // cap the read so a short read can never straddle a part boundary
        let cap = chunk_size.min(part_size - part_len);
        let n = staging
            .read(&mut buf[..cap])
            .await
            .map_err(|e| Error::io("re-reading staging for part digests", e))?;
        if n == 0 {
            if part_len > 0 {
                parts.push(Part {
                    digest: part_hash.finalize_reset().into(),
                    size: part_len as i64,
                    start: start as i64,
                });
            }
            break;
        }
        full.update(&buf[..n]);
        part_hash.update(&buf[..n]);
        part_len += n;
        if part_len == part_size {
            parts.push(Part {
                digest: part_hash.finalize_reset().into(),
                size: part_len as i64,
                start: start as i64,
            });
            start += part_len as u64;
            part_len = 0;
        }
    }

    Ok((parts, full.finalize().into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::test_bytes;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const CHUNK: usize = 128 * 1024;

    fn sha(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[tokio::test]
    async fn rejects_small_chunks() {
        let mut input = Cursor::new(vec![0u8; 16]);
        let mut staging = Cursor::new(Vec::new());
        let res = prepare_single(&mut input, &mut staging, false, 512).await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn rejects_small_parts() {
        let mut input = Cursor::new(vec![0u8; 16]);
        let mut staging = Cursor::new(Vec::new());
        let res = prepare_multi(&mut input, &mut staging, false, 1024, 2).await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn single_identity() {
        let data = test_bytes(256 * 1024 + 77);
        let mut input = Cursor::new(data.clone());
        let mut staging = Cursor::new(Vec::new());

        let plan = prepare_single(&mut input, &mut staging, false, CHUNK)
            .await
            .unwrap();

        assert_eq!(plan.content_encoding, ContentEncoding::Identity);
        assert_eq!(plan.content_size, data.len() as i64);
        assert_eq!(plan.transfer_size, data.len() as i64);
        assert_eq!(plan.content_digest, sha(&data));
        assert_eq!(plan.transfer_digest, plan.content_digest);
        assert!(plan.parts.is_empty());
        assert_eq!(staging.get_ref(), &data);
    }

    #[tokio::test]
    async fn single_gzip() {
        let data = test_bytes(256 * 1024);
        let mut input = Cursor::new(data.clone());
        let mut staging = Cursor::new(Vec::new());

        let plan = prepare_single(&mut input, &mut staging, true, CHUNK)
            .await
            .unwrap();

        assert_eq!(plan.content_encoding, ContentEncoding::Gzip);
        assert_eq!(plan.content_size, data.len() as i64);
        assert_eq!(plan.content_digest, sha(&data));
        // the staged bytes are what was hashed and counted as the transfer
        assert_eq!(plan.transfer_size, staging.get_ref().len() as i64);
        assert_eq!(plan.transfer_digest, sha(staging.get_ref()));
        assert_ne!(plan.transfer_digest, plan.content_digest);
    }

    #[tokio::test]
    async fn gzip_output_is_deterministic() {
        let data = test_bytes(512 * 1024);

        let mut first_staging = Cursor::new(Vec::new());
        let first = prepare_single(&mut Cursor::new(data.clone()), &mut first_staging, true, CHUNK)
            .await
            .unwrap();

        let mut second_staging = Cursor::new(Vec::new());
        let second = prepare_single(&mut Cursor::new(data), &mut second_staging, true, CHUNK)
            .await
            .unwrap();

        assert_eq!(first.transfer_digest, second.transfer_digest);
        assert_eq!(first.transfer_size, second.transfer_size);
        assert_eq!(first_staging.get_ref(), second_staging.get_ref());
    }

    #[tokio::test]
    async fn multi_identity_ten_megabytes() {
        let data = test_bytes(10 * 1024 * 1024);
        let mut input = Cursor::new(data.clone());
        let mut staging = Cursor::new(Vec::new());

        // 40 chunks of 128KB per part: 5MB parts
        let plan = prepare_multi(&mut input, &mut staging, false, CHUNK, 40)
            .await
            .unwrap();

        assert_eq!(plan.content_digest, plan.transfer_digest);
        assert_eq!(plan.parts.len(), 2);
        assert_eq!(plan.parts[0].start, 0);
        assert_eq!(plan.parts[0].size, 5 * 1024 * 1024);
        assert_eq!(plan.parts[1].start, 5 * 1024 * 1024);
        assert_eq!(plan.parts[1].size, 5 * 1024 * 1024);
        assert_eq!(
            plan.parts.iter().map(|p| p.size).sum::<i64>(),
            plan.transfer_size
        );
        for part in &plan.parts {
            let range = &data[part.start as usize..(part.start + part.size) as usize];
            assert_eq!(part.digest, sha(range));
        }
    }

    #[tokio::test]
    async fn multi_identity_with_remainder() {
        let data = test_bytes(10 * 1024 * 1024 + 123);
        let mut input = Cursor::new(data.clone());
        let mut staging = Cursor::new(Vec::new());

        let plan = prepare_multi(&mut input, &mut staging, false, CHUNK, 40)
            .await
            .unwrap();

        assert_eq!(plan.parts.len(), 3);
        assert_eq!(plan.parts[2].start, 10 * 1024 * 1024);
        assert_eq!(plan.parts[2].size, 123);
        let tail = &data[10 * 1024 * 1024..];
        assert_eq!(plan.parts[2].digest, sha(tail));
    }

    #[tokio::test]
    async fn multi_gzip_matches_single_content_and_is_deterministic() {
        let data = test_bytes(10 * 1024 * 1024);

        let mut staging = Cursor::new(Vec::new());
        let plan = prepare_multi(&mut Cursor::new(data.clone()), &mut staging, true, CHUNK, 40)
            .await
            .unwrap();

        assert_eq!(plan.content_digest, sha(&data));
        assert_ne!(plan.transfer_digest, plan.content_digest);
        assert_eq!(plan.transfer_size, staging.get_ref().len() as i64);
        assert_eq!(
            plan.parts.iter().map(|p| p.size).sum::<i64>(),
            plan.transfer_size
        );
        for part in &plan.parts {
            let range = &staging.get_ref()[part.start as usize..(part.start + part.size) as usize];
            assert_eq!(part.digest, sha(range));
        }

        let mut rerun_staging = Cursor::new(Vec::new());
        let rerun = prepare_multi(
            &mut Cursor::new(data),
            &mut rerun_staging,
            true,
            CHUNK,
            40,
        )
        .await
        .unwrap();
        assert_eq!(rerun.transfer_digest, plan.transfer_digest);
    }

    /// A staging stream that corrupts its first byte as soon as it is read
    /// back, simulating mutation between the two preparation passes.
    struct MutatingStaging {
        inner: Cursor<Vec<u8>>,
        corrupted: bool,
    }

    impl AsyncWrite for MutatingStaging {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl AsyncRead for MutatingStaging {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if !self.corrupted && !self.inner.get_ref().is_empty() {
                self.inner.get_mut()[0] ^= 0xff;
                self.corrupted = true;
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncSeek for MutatingStaging {
        fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    #[tokio::test]
    async fn multi_detects_mutated_staging() {
        let data = test_bytes(6 * 1024 * 1024);
        let mut input = Cursor::new(data);
        let mut staging = MutatingStaging {
            inner: Cursor::new(Vec::new()),
            corrupted: false,
        };

        let res = prepare_multi(&mut input, &mut staging, false, CHUNK, 40).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }
}
