//! Utilities shared by the unit tests.

use crate::error::Error;
use crate::queue::{
    ArtifactRequest, CompleteArtifactRequest, CreateArtifactResponse, QueueService,
};
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use reqwest::Url;
use slog::{o, Drain, Logger};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

/// A logger that routes through the test harness's captured stdout.
pub(crate) fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

/// Event logger, used to record events in fake service implementations and
/// then assert on them.
#[derive(Default, Clone)]
pub(crate) struct EventLog {
    logged: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub(crate) fn log<S: Into<String>>(&self, message: S) {
        self.logged.lock().unwrap().push(message.into())
    }

    pub(crate) fn assert(&self, expected: Vec<String>) {
        assert_eq!(*self.logged.lock().unwrap(), expected);
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.logged.lock().unwrap().clone()
    }
}

/// Fake implementation of the queue service, answering createArtifact with
/// a canned response and logging every call.
pub(crate) struct FakeQueueService {
    pub(crate) logger: EventLog,
    pub(crate) create_response: Option<CreateArtifactResponse>,
    pub(crate) signed_url: Option<String>,
}

impl FakeQueueService {
    pub(crate) fn new(logger: EventLog) -> Self {
        Self {
            logger,
            create_response: None,
            signed_url: None,
        }
    }
}

fn describe(request: &ArtifactRequest) -> String {
    match request {
        ArtifactRequest::Blob {
            content_type,
            content_encoding,
            content_length,
            parts,
            ..
        } => format!(
            "blob {} {} {} parts={}",
            content_type,
            content_encoding,
            content_length,
            parts.as_ref().map(|p| p.len()).unwrap_or(0)
        ),
        ArtifactRequest::Error { reason, .. } => format!("error {}", reason),
        ArtifactRequest::Reference { url, .. } => format!("reference {}", url),
    }
}

#[async_trait]
impl QueueService for FakeQueueService {
    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<CreateArtifactResponse, Error> {
        self.logger.log(format!(
            "createArtifact {} {} {} {}",
            task_id,
            run_id,
            name,
            describe(request)
        ));
        self.create_response
            .clone()
            .ok_or_else(|| Error::Protocol("no create response configured".into()))
    }

    async fn complete_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &CompleteArtifactRequest,
    ) -> Result<(), Error> {
        self.logger.log(format!(
            "completeArtifact {} {} {} {:?}",
            task_id, run_id, name, request.etags
        ));
        Ok(())
    }

    fn artifact_url(&self, task_id: &str, run_id: &str, name: &str) -> Result<Url, Error> {
        self.logger
            .log(format!("artifactUrl {} {} {}", task_id, run_id, name));
        let url = self
            .signed_url
            .as_ref()
            .ok_or_else(|| Error::Protocol("no signed url configured".into()))?;
        Url::parse(url).map_err(|e| Error::Protocol(format!("bad signed url: {}", e)))
    }

    fn latest_artifact_url(&self, task_id: &str, name: &str) -> Result<Url, Error> {
        self.logger
            .log(format!("latestArtifactUrl {} {}", task_id, name));
        let url = self
            .signed_url
            .as_ref()
            .ok_or_else(|| Error::Protocol("no signed url configured".into()))?;
        Url::parse(url).map_err(|e| Error::Protocol(format!("bad signed url: {}", e)))
    }
}

/// Deterministic pseudorandom bytes (xorshift), so tests hash the same data
/// on every run without carrying fixture files around.
pub(crate) fn test_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Gzip-encode a buffer with the same encoder the preparer uses.
pub(crate) async fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}
