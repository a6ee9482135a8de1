/*! Interact with blob artifacts stored through the queue service.

This crate uploads and downloads opaque byte blobs with end-to-end integrity
guarantees: every byte written or read is hashed and counted on both sides of
the optional gzip transport encoding, and any disagreement with the metadata
the service returns surfaces as a typed, retryability-classified error.

## Uploading

An upload runs in three phases.  [`prepare_single`] or [`prepare_multi`]
copies the input to a caller-supplied staging stream, hashing the logical
content and the (possibly gzip-encoded) transfer bytes and splitting the
latter into parts.  [`Client::upload`] registers the resulting plan with the
queue, PUTs each presigned request descriptor the queue returns with a
[`BoundedStream`] window over the staging stream as its body, and finally
echoes the collected ETags back to the queue.

The staging stream must start empty and be seekable; the preparer writes it
forward and the uploader seeks back and re-reads it.  The [`Staging`] trait
captures this, and is implemented for [`tokio::fs::File`] and for in-memory
buffers.

## Downloading

[`Client::download`], [`Client::download_latest`], and
[`Client::download_url`] fetch an artifact URL with redirect following
disabled, dispatch on the `x-taskcluster-artifact-storage-type` header, and
for blob artifacts issue the follow-up request with full verification: the
content and transfer lengths and SHA-256 digests are checked against the
`x-amz-meta-*` headers on the object response.  On failure the server's
response body is streamed to the output in place of artifact content so the
caller can inspect it.

## Retrying

Nothing here retries.  Every error reports whether a fresh attempt might
succeed via [`Error::retryable`], and every HTTP transaction produces a
[`CallSummary`] whether it succeeded or not, so a retry policy can be
layered on top without parsing message strings.

 */

mod agent;
mod client;
mod error;
mod prepare;
mod queue;
mod staging;
mod stream;

#[cfg(test)]
mod test_helpers;

pub use agent::{CallSummary, Request};
pub use client::{Client, StorageType, DEFAULT_CHUNK_SIZE, DEFAULT_PART_SIZE};
pub use error::{Error, Result};
pub use prepare::{prepare_multi, prepare_single, ContentEncoding, Part, UploadPlan};
pub use queue::{
    ArtifactRequest, CompleteArtifactRequest, CreateArtifactResponse, PartRequest, Queue,
    QueueService, RequestDescriptor,
};
pub use staging::{DownloadSink, Staging};
pub use stream::{BoundedStream, ByteCounter, MultiWrite};
