//! The queue service's artifact API, as seen by this library.
//!
//! The queue is an external collaborator: it registers artifacts, hands back
//! presigned object-store request descriptors, and records completion.  The
//! [`QueueService`] trait names exactly the operations the transfer protocol
//! needs, which also allows injecting a fake implementation during testing.
//! Credential management and request signing live outside this crate; the
//! [`Queue`] implementation issues plain REST calls against a root URL.

use crate::error::Error;
use crate::prepare::ContentEncoding;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An artifact registration, posted to the queue's createArtifact endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "storageType")]
pub enum ArtifactRequest {
    /// A blob stored directly in object storage with integrity metadata.
    #[serde(rename = "blob", rename_all = "camelCase")]
    Blob {
        content_type: String,
        content_encoding: ContentEncoding,
        content_length: i64,
        content_sha256: String,
        transfer_length: i64,
        transfer_sha256: String,
        expires: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parts: Option<Vec<PartRequest>>,
    },

    /// A record that the artifact could not be produced.
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        reason: String,
        message: String,
        expires: DateTime<Utc>,
    },

    /// A redirect to content stored elsewhere.
    #[serde(rename = "reference", rename_all = "camelCase")]
    Reference {
        content_type: String,
        url: String,
        expires: DateTime<Utc>,
    },
}

/// One part of a multipart registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRequest {
    pub sha256: String,
    pub size: i64,
}

/// The queue's answer to a blob registration: one presigned request
/// descriptor per part to be uploaded, in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactResponse {
    pub storage_type: String,
    #[serde(default)]
    pub requests: Vec<RequestDescriptor>,
    pub expires: DateTime<Utc>,
}

/// A presigned object-store request, to be issued exactly as given.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The completion record: object-store ETags in part order.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteArtifactRequest {
    pub etags: Vec<String>,
}

/// The queue operations the transfer protocol needs.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<CreateArtifactResponse, Error>;

    async fn complete_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &CompleteArtifactRequest,
    ) -> Result<(), Error>;

    /// URL from which the named artifact of a specific run can be fetched.
    fn artifact_url(&self, task_id: &str, run_id: &str, name: &str) -> Result<Url, Error>;

    /// URL from which the named artifact of the latest run can be fetched.
    fn latest_artifact_url(&self, task_id: &str, name: &str) -> Result<Url, Error>;
}

/// A thin REST client for the queue's artifact endpoints.
pub struct Queue {
    base_url: Url,
    client: reqwest::Client,
}

impl Queue {
    /// Create a queue client for the deployment at `root_url`.
    pub fn new(root_url: &str) -> Result<Queue, Error> {
        let base_url = Url::parse(root_url)
            .and_then(|u| u.join("api/queue/v1/"))
            .map_err(|e| Error::InvalidArgument(format!("parsing root url {}: {}", root_url, e)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport {
                context: "building queue http client".into(),
                source: e,
            })?;
        Ok(Queue { base_url, client })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidArgument(format!("building queue url {}: {}", path, e)))
    }

    fn check_status(response: &reqwest::Response) -> Result<(), Error> {
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::Status {
                code: status.as_u16(),
                text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for Queue {
    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<CreateArtifactResponse, Error> {
        let url = self.url(&format!(
            "task/{}/runs/{}/artifacts/{}",
            task_id, run_id, name
        ))?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport {
                context: format!("calling createArtifact for {}/{}/{}", task_id, run_id, name),
                source: e,
            })?;
        Self::check_status(&response)?;
        response
            .json::<CreateArtifactResponse>()
            .await
            .map_err(|e| Error::Protocol(format!("parsing createArtifact response: {}", e)))
    }

    async fn complete_artifact(
        &self,
        task_id: &str,
        run_id: &str,
        name: &str,
        request: &CompleteArtifactRequest,
    ) -> Result<(), Error> {
        let url = self.url(&format!(
            "task/{}/runs/{}/artifacts/{}",
            task_id, run_id, name
        ))?;
        let response = self
            .client
            .put(url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport {
                context: format!(
                    "calling completeArtifact for {}/{}/{}",
                    task_id, run_id, name
                ),
                source: e,
            })?;
        Self::check_status(&response)?;
        Ok(())
    }

    fn artifact_url(&self, task_id: &str, run_id: &str, name: &str) -> Result<Url, Error> {
        self.url(&format!(
            "task/{}/runs/{}/artifacts/{}",
            task_id, run_id, name
        ))
    }

    fn latest_artifact_url(&self, task_id: &str, name: &str) -> Result<Url, Error> {
        self.url(&format!("task/{}/artifacts/{}", task_id, name))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn blob_request_wire_shape() {
        let request = ArtifactRequest::Blob {
            content_type: "application/octet-stream".into(),
            content_encoding: ContentEncoding::Gzip,
            content_length: 1024,
            content_sha256: "aa".repeat(32),
            transfer_length: 512,
            transfer_sha256: "bb".repeat(32),
            expires: "2018-01-22T20:06:49.022Z".parse().unwrap(),
            parts: Some(vec![PartRequest {
                sha256: "cc".repeat(32),
                size: 512,
            }]),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "storageType": "blob",
                "contentType": "application/octet-stream",
                "contentEncoding": "gzip",
                "contentLength": 1024,
                "contentSha256": "aa".repeat(32),
                "transferLength": 512,
                "transferSha256": "bb".repeat(32),
                "expires": "2018-01-22T20:06:49.022Z",
                "parts": [{"sha256": "cc".repeat(32), "size": 512}],
            })
        );
    }

    #[test]
    fn single_part_blob_request_omits_parts() {
        let request = ArtifactRequest::Blob {
            content_type: "text/plain".into(),
            content_encoding: ContentEncoding::Identity,
            content_length: 12,
            content_sha256: "aa".repeat(32),
            transfer_length: 12,
            transfer_sha256: "aa".repeat(32),
            expires: Utc::now(),
            parts: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("parts").is_none());
        assert_eq!(value["storageType"], "blob");
        assert_eq!(value["contentEncoding"], "identity");
    }

    #[test]
    fn error_and_reference_wire_shapes() {
        let error = ArtifactRequest::Error {
            reason: "file-missing-on-worker".into(),
            message: "no such file".into(),
            expires: Utc::now(),
        };
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["storageType"], "error");
        assert_eq!(value["reason"], "file-missing-on-worker");

        let reference = ArtifactRequest::Reference {
            content_type: "application/octet-stream".into(),
            url: "https://elsewhere.example/thing".into(),
            expires: Utc::now(),
        };
        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(value["storageType"], "reference");
        assert_eq!(value["url"], "https://elsewhere.example/thing");
    }

    #[test]
    fn create_response_parses() {
        let response: CreateArtifactResponse = serde_json::from_value(json!({
            "storageType": "blob",
            "requests": [
                {
                    "url": "https://bucket.example/part0",
                    "method": "PUT",
                    "headers": {"Content-Length": "512"},
                },
                {
                    "url": "https://bucket.example/part1",
                    "method": "PUT",
                },
            ],
            "expires": "2018-01-22T20:06:49.022Z",
        }))
        .unwrap();

        assert_eq!(response.storage_type, "blob");
        assert_eq!(response.requests.len(), 2);
        assert_eq!(response.requests[0].method, "PUT");
        assert_eq!(
            response.requests[0].headers.get("Content-Length"),
            Some(&"512".to_string())
        );
        assert!(response.requests[1].headers.is_empty());
    }

    #[test]
    fn complete_request_wire_shape() {
        let request = CompleteArtifactRequest {
            etags: vec!["etag-0".into(), "etag-1".into()],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"etags": ["etag-0", "etag-1"]})
        );
    }

    #[test]
    fn queue_urls() {
        let queue = Queue::new("https://tc.example.com").unwrap();
        assert_eq!(
            queue
                .artifact_url("LyTqA-MYReaNrLTYYHyrtw", "0", "public/logs/live.log")
                .unwrap()
                .as_str(),
            "https://tc.example.com/api/queue/v1/task/LyTqA-MYReaNrLTYYHyrtw/runs/0/artifacts/public/logs/live.log"
        );
        assert_eq!(
            queue
                .latest_artifact_url("LyTqA-MYReaNrLTYYHyrtw", "public/logs/live.log")
                .unwrap()
                .as_str(),
            "https://tc.example.com/api/queue/v1/task/LyTqA-MYReaNrLTYYHyrtw/artifacts/public/logs/live.log"
        );
    }
}
