//! Upload and download protocol orchestration.
//!
//! Uploads run in three phases: register the prepared artifact with the
//! queue, PUT each presigned request descriptor with a bounded window over
//! the staging stream as its body, then send the collected ETags back to
//! the queue.  Downloads run in two: an authenticated request with
//! redirect-following disabled so the storage type and Location can be
//! inspected, then a second request that streams into the caller's output
//! with full integrity verification for blob artifacts.

use crate::agent::{Agent, Request};
use crate::error::Error;
use crate::prepare::{prepare_multi, prepare_single, MIN_CHUNK_SIZE, MIN_PART_SIZE};
use crate::queue::{ArtifactRequest, CompleteArtifactRequest, PartRequest, QueueService};
use crate::staging::{DownloadSink, Staging};
use crate::stream::{hex, BoundedStream};
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ETAG, LOCATION};
use reqwest::Method;
use slog::{debug, info, o, warn, Drain, Logger};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::io::StreamReader;

/// Default I/O chunk size: 128KB.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Default multipart part size: 100MB.
pub const DEFAULT_PART_SIZE: usize = 100 * 1024 * 1024;

/// How an artifact is stored, from the queue's
/// `x-taskcluster-artifact-storage-type` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Stored directly in object storage with integrity metadata; downloads
    /// are verified.
    Blob,
    /// A redirect to content stored elsewhere; followed blindly.
    Reference,
    /// Legacy storage types, also followed blindly.
    S3,
    Azure,
    /// A record that the artifact could not be produced.
    Error,
}

impl StorageType {
    fn from_headers(headers: &HeaderMap) -> StorageType {
        match headers
            .get("x-taskcluster-artifact-storage-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
        {
            "error" => StorageType::Error,
            "reference" => StorageType::Reference,
            "s3" => StorageType::S3,
            "azure" => StorageType::Azure,
            _ => StorageType::Blob,
        }
    }
}

/// Uploads and downloads blob artifacts against a queue deployment.
pub struct Client<Q: QueueService> {
    queue: Q,
    agent: Agent,
    /// Follows redirects automatically, for the storage types downloaded
    /// without verification.
    blind_client: reqwest::Client,
    chunk_size: usize,
    chunks_per_part: usize,
    /// Allow redirects to non-https resources.
    pub allow_insecure: bool,
    logger: Logger,
}

impl<Q: QueueService> Client<Q> {
    /// Create a client logging to standard output.
    pub fn new(queue: Q) -> Result<Client<Q>, Error> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Self::with_logger(queue, Logger::root(drain, o!()))
    }

    /// Create a client with an injected logging sink.
    pub fn with_logger(queue: Q, logger: Logger) -> Result<Client<Q>, Error> {
        let blind_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Transport {
                context: "building redirect-following http client".into(),
                source: e,
            })?;
        Ok(Client {
            agent: Agent::new(logger.clone())?,
            queue,
            blind_client,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_part: DEFAULT_PART_SIZE / DEFAULT_CHUNK_SIZE,
            allow_insecure: false,
            logger,
        })
    }

    /// Set the chunk size and part size, both in bytes.  The chunk size is
    /// the unit of all stream I/O; a multipart upload sends the staging
    /// stream in parts of `part_size` bytes.  The part size must be a whole
    /// multiple of the chunk size so no single read straddles two parts.
    pub fn set_internal_sizes(&mut self, chunk_size: usize, part_size: usize) -> Result<(), Error> {
        if part_size < MIN_PART_SIZE {
            return Err(Error::InvalidArgument(format!(
                "part size {} is not the minimum of 5MB",
                part_size
            )));
        }
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "chunk size {} is not the minimum of 1KB",
                chunk_size
            )));
        }
        if part_size % chunk_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "part size {} is not divisible by chunk size {}",
                part_size, chunk_size
            )));
        }
        self.chunk_size = chunk_size;
        self.chunks_per_part = part_size / chunk_size;
        Ok(())
    }

    /// The configured (chunk size, part size), in bytes.
    pub fn internal_sizes(&self) -> (usize, usize) {
        (self.chunk_size, self.chunk_size * self.chunks_per_part)
    }

    /// Upload an artifact.
    ///
    /// The contents of `input` are copied through the preparer into
    /// `staging`, optionally gzip-encoded, then sent to the object store
    /// exactly as staged.  `staging` must start empty and remains the
    /// caller's to clean up.  The orchestration never retries; failures
    /// carry a retryability classification for callers that do.
    pub async fn upload<I, S>(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        input: &mut I,
        staging: &mut S,
        gzip: bool,
        multipart: bool,
    ) -> Result<(), Error>
    where
        I: AsyncRead + AsyncSeek + Send + Unpin,
        S: Staging,
    {
        // Seeking to the end is enough to learn the current size; the
        // preparer seeks everything back to the start itself.
        let staged_bytes = staging
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| Error::io("checking that the staging stream is empty", e))?;
        if staged_bytes != 0 {
            return Err(Error::BadOutputWriter);
        }

        let content_type = sniff_content_type(input).await?;

        let plan = if multipart {
            prepare_multi(input, staging, gzip, self.chunk_size, self.chunks_per_part).await?
        } else {
            prepare_single(input, staging, gzip, self.chunk_size).await?
        };

        let parts = if plan.parts.is_empty() {
            None
        } else {
            Some(
                plan.parts
                    .iter()
                    .map(|p| PartRequest {
                        sha256: hex(&p.digest),
                        size: p.size,
                    })
                    .collect(),
            )
        };

        let registration = ArtifactRequest::Blob {
            content_type,
            content_encoding: plan.content_encoding,
            content_length: plan.content_size,
            content_sha256: hex(&plan.content_digest),
            transfer_length: plan.transfer_size,
            transfer_sha256: hex(&plan.transfer_digest),
            expires: Utc::now() + Duration::days(1),
            parts,
        };

        let created = self
            .queue
            .create_artifact(task_id, run_id, name, &registration)
            .await?;

        let mut etags = Vec::with_capacity(created.requests.len());
        for (i, descriptor) in created.requests.iter().enumerate() {
            let request = Request::from_descriptor(descriptor)?;
            let (start, size) = if plan.parts.is_empty() {
                (0, plan.transfer_size as u64)
            } else {
                let part = plan.parts.get(i).ok_or_else(|| {
                    Error::Protocol(format!(
                        "queue returned {} upload requests for {} parts",
                        created.requests.len(),
                        plan.parts.len()
                    ))
                })?;
                (part.start as u64, part.size as u64)
            };

            let reader = staging.part_reader().await?;
            let body = BoundedStream::new(reader, start, size).await?;

            // any error document from the object store lands here so it can
            // be logged alongside the call summary
            let mut error_buf = Cursor::new(Vec::new());
            let (cs, result) = self
                .agent
                .run(
                    request,
                    Some(Box::new(body)),
                    self.chunk_size,
                    &mut error_buf,
                    false,
                )
                .await;
            if let Err(err) = result {
                warn!(
                    self.logger,
                    "{}\n{}",
                    cs,
                    String::from_utf8_lossy(error_buf.get_ref())
                );
                return Err(err);
            }

            etags.push(
                cs.response_headers
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string(),
            );
        }

        self.queue
            .complete_artifact(task_id, run_id, name, &CompleteArtifactRequest { etags: etags.clone() })
            .await?;

        debug!(self.logger, "etags: {:?}", etags);
        Ok(())
    }

    /// Register an error artifact recording that the artifact could not be
    /// produced.
    pub async fn create_error(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        let registration = ArtifactRequest::Error {
            reason: reason.to_string(),
            message: message.to_string(),
            expires: Utc::now() + Duration::days(1),
        };
        self.queue
            .create_artifact(task_id, run_id, name, &registration)
            .await?;
        Ok(())
    }

    /// Register a reference artifact redirecting to `url`.
    pub async fn create_reference(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        url: &str,
    ) -> Result<(), Error> {
        let registration = ArtifactRequest::Reference {
            // a redirect has no body of its own; register a safe content type
            content_type: "application/octet-stream".to_string(),
            url: url.to_string(),
            expires: Utc::now() + Duration::days(1),
        };
        self.queue
            .create_artifact(task_id, run_id, name, &registration)
            .await?;
        Ok(())
    }

    /// Download the named artifact from a specific run of a task.
    pub async fn download<W: DownloadSink>(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        output: &mut W,
    ) -> Result<(), Error> {
        let url = self.queue.artifact_url(task_id, run_id, name)?;
        self.download_url(url.as_str(), output).await
    }

    /// Download the named artifact from the latest run of a task.
    pub async fn download_latest<W: DownloadSink>(
        &self,
        task_id: &str,
        name: &str,
        output: &mut W,
    ) -> Result<(), Error> {
        let url = self.queue.latest_artifact_url(task_id, name)?;
        self.download_url(url.as_str(), output).await
    }

    /// Download a queue artifact URL into `output`.
    ///
    /// On failure the response body the server sent — typically an error
    /// document — is streamed into `output` instead of artifact content,
    /// and the output is neither rewound nor truncated; cleaning up is the
    /// caller's responsibility.  Error artifacts write their message to the
    /// output and return [`Error::ErrorArtifact`].
    pub async fn download_url<W: DownloadSink>(
        &self,
        url: &str,
        output: &mut W,
    ) -> Result<(), Error> {
        // only fail the emptiness check when the sink can actually observe
        // its size
        if let Some(size) = output.initial_size().await {
            if size != 0 {
                return Err(Error::BadOutputWriter);
            }
        }

        let mut redirect_buf = Cursor::new(Vec::new());
        let (cs, result) = self
            .agent
            .run(
                Request::new(Method::GET, url),
                None,
                self.chunk_size,
                &mut redirect_buf,
                false,
            )
            .await;

        let storage_type = StorageType::from_headers(&cs.response_headers);
        debug!(self.logger, "storage type: {:?}", storage_type);

        if let Err(err) = result {
            // an error artifact arrives as an error status; for everything
            // else a failed redirect request is fatal
            if storage_type != StorageType::Error {
                warn!(
                    self.logger,
                    "{}\n{}",
                    cs,
                    String::from_utf8_lossy(redirect_buf.get_ref())
                );
                return Err(err);
            }
        }

        if storage_type == StorageType::Error {
            output
                .write_all(redirect_buf.get_ref())
                .await
                .map_err(|e| Error::io("copying the error artifact body to the output", e))?;
            output
                .flush()
                .await
                .map_err(|e| Error::io("flushing the output", e))?;
            info!(self.logger, "error artifact written");
            return Err(Error::ErrorArtifact);
        }

        let location = match cs.response_headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => return Err(Error::BadRedirect),
        };
        let resource_url = reqwest::Url::parse(&location).map_err(|_| Error::BadRedirect)?;
        if !self.allow_insecure && resource_url.scheme() != "https" {
            return Err(Error::HttpsRequired);
        }

        match storage_type {
            StorageType::Reference | StorageType::S3 | StorageType::Azure => {
                debug!(
                    self.logger,
                    "following blind redirect of {:?} artifact", storage_type
                );
                self.follow_blind(&location, output).await
            }
            StorageType::Blob => {
                if cs.status_code < 300 || cs.status_code >= 400 {
                    return Err(Error::ExpectedRedirect);
                }
                let (cs, result) = self
                    .agent
                    .run(
                        Request::new(Method::GET, location),
                        None,
                        self.chunk_size,
                        output,
                        true,
                    )
                    .await;
                if let Err(err) = result {
                    warn!(self.logger, "{}", cs);
                    return Err(err);
                }
                if cs.status_code >= 300 {
                    return Err(Error::UnexpectedRedirect);
                }
                Ok(())
            }
            // handled above; kept for completeness
            StorageType::Error => Err(Error::ErrorArtifact),
        }
    }

    /// Fetch a URL with redirect following enabled and no verification,
    /// streaming the body into `output`.
    async fn follow_blind<W: DownloadSink>(&self, url: &str, output: &mut W) -> Result<(), Error> {
        let response = self
            .blind_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport {
                context: format!("fetching {}", url),
                source: e,
            })?;
        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut reader = StreamReader::new(stream);
        tokio::io::copy(&mut reader, output)
            .await
            .map_err(|e| Error::io(format!("copying {} to the output", url), e))?;
        output
            .flush()
            .await
            .map_err(|e| Error::io("flushing the output", e))?;
        Ok(())
    }
}

/// Read up to 512 bytes from the input to classify its media type, then
/// seek back to the start.  A zero-length input is fine and classifies as
/// the default.
async fn sniff_content_type<I>(input: &mut I) -> Result<String, Error>
where
    I: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let mut probe = vec![0u8; 512];
    let mut filled = 0;
    loop {
        let n = input
            .read(&mut probe[filled..])
            .await
            .map_err(|e| Error::io("reading the content-type probe", e))?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == probe.len() {
            break;
        }
    }
    probe.truncate(filled);
    input
        .seek(SeekFrom::Start(0))
        .await
        .map_err(|e| Error::io("rewinding input after the content-type probe", e))?;
    Ok(infer::get(&probe)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string()))
}
