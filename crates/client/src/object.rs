//! Provider wire operations.
//!
//! Every call goes through [`ObjectClient::execute`], which stamps the date
//! and payload headers, signs with the current wall-clock time and maps
//! non-2xx responses to [`ClientError::Protocol`]. Nothing is retried here;
//! that is the [`PartExecutor`](crate::PartExecutor)'s job.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use tracing::{debug, warn};

use cloudxfer_protocol::{Credential, PartResult, ProviderKind};
use cloudxfer_signing::encoding::uri_encode_path;
use cloudxfer_signing::{
    ProviderSigner, SignableRequest, SigningStrategy, TIMESTAMP_FORMAT, UNSIGNED_PAYLOAD,
};
use cloudxfer_transfer::content_md5;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::{ClientError, Endpoint, xml};

/// Largest key count a single batch delete accepts.
pub const MAX_BATCH_DELETE: usize = 1000;

const REQUEST_ID_HEADERS: [&str; 2] = ["x-amz-request-id", "x-oss-request-id"];

/// What a `HEAD` reports about an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// `None` when the response carried no usable `Content-Length`.
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// One key a batch delete could not remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// A request before signing.
struct ObjectRequest<'a> {
    method: Method,
    bucket: &'a str,
    key: Option<&'a str>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl<'a> ObjectRequest<'a> {
    fn new(method: Method, bucket: &'a str, key: Option<&'a str>) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Signed wire operations against one provider account.
pub struct ObjectClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: Endpoint,
    credential: Credential,
    signer: ProviderSigner,
}

impl ObjectClient {
    /// The signer is chosen from the credential's provider.
    pub fn new(transport: Arc<dyn HttpTransport>, endpoint: Endpoint, credential: Credential) -> Self {
        let signer = ProviderSigner::for_provider(credential.provider);
        Self {
            transport,
            endpoint,
            credential,
            signer,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.credential.provider
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Builds, signs and sends `req`. Non-2xx responses become protocol errors.
    async fn execute(&self, req: ObjectRequest<'_>) -> Result<HttpResponse, ClientError> {
        let request = self.sign(req)?;
        let method = request.method.clone();
        let resp = self.transport.send(request).await?;
        if resp.is_success() {
            return Ok(resp);
        }

        let request_id = REQUEST_ID_HEADERS.iter().find_map(|h| resp.header(h));
        let err = xml::protocol_error(resp.status, &resp.body_text(), request_id);
        debug!(%method, status = resp.status, error = %err, "provider rejected request");
        Err(err)
    }

    fn sign(&self, req: ObjectRequest<'_>) -> Result<HttpRequest, ClientError> {
        let now = Utc::now();
        let mut headers = req.headers;
        headers.push(("host".to_string(), self.endpoint.host(req.bucket)));
        headers.push((
            self.signer.date_header().to_string(),
            now.format(TIMESTAMP_FORMAT).to_string(),
        ));
        headers.push((
            self.signer.content_sha256_header().to_string(),
            UNSIGNED_PAYLOAD.to_string(),
        ));

        let path = self.endpoint.path(req.bucket, req.key);
        let signable = SignableRequest {
            method: req.method.as_str(),
            path: &path,
            bucket: Some(req.bucket),
            key: req.key,
            headers: &headers,
            query: &req.query,
        };
        let authorization = self.signer.sign(&signable, &self.credential, now)?;
        headers.push(("authorization".to_string(), authorization));

        Ok(HttpRequest {
            url: self.endpoint.url(req.bucket, req.key, &req.query),
            method: req.method,
            headers,
            body: req.body,
        })
    }

    /// Single-request upload. Returns the ETag (empty if the provider sent none).
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, ClientError> {
        let mut req = ObjectRequest::new(Method::PUT, bucket, Some(key))
            .header("content-md5", content_md5(&body));
        if let Some(ct) = content_type {
            req = req.header("content-type", ct);
        }
        let resp = self.execute(req.body(body)).await?;
        Ok(resp.header("etag").unwrap_or_default().to_string())
    }

    /// Starts a multipart session and returns its upload id.
    pub async fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<String, ClientError> {
        let req = ObjectRequest::new(Method::POST, bucket, Some(key)).query("uploads", "");
        let resp = self.execute(req).await?;
        xml::extract_tag(&resp.body_text(), "UploadId").ok_or_else(|| {
            ClientError::Consistency("initiate response carried no UploadId".to_string())
        })
    }

    /// Uploads one part. Returns the raw ETag header, if any.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<Option<String>, ClientError> {
        let req = ObjectRequest::new(Method::PUT, bucket, Some(key))
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .header("content-md5", content_md5(&body))
            .body(body);
        let resp = self.execute(req).await?;
        if resp.status != 200 {
            return Err(ClientError::Consistency(format!(
                "upload part {part_number} answered HTTP {}",
                resp.status
            )));
        }
        Ok(resp
            .header("etag")
            .filter(|tag| !tag.trim().is_empty())
            .map(str::to_string))
    }

    /// Commits a multipart session.
    ///
    /// `parts` must already be sorted and gap-free. A 200 whose body is an
    /// `<Error>` document is still a failure.
    pub async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<String, ClientError> {
        if parts.is_empty() {
            return Err(ClientError::InvalidRequest(
                "complete_multipart needs at least one part".to_string(),
            ));
        }
        let body = xml::complete_multipart_body(parts).into_bytes();
        let req = ObjectRequest::new(Method::POST, bucket, Some(key))
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")
            .body(body);
        let resp = self.execute(req).await?;

        let text = resp.body_text();
        if xml::is_error_document(&text) {
            let request_id = REQUEST_ID_HEADERS.iter().find_map(|h| resp.header(h));
            return Err(xml::protocol_error(resp.status, &text, request_id));
        }
        Ok(xml::extract_tag(&text, "ETag")
            .or_else(|| resp.header("etag").map(str::to_string))
            .unwrap_or_default())
    }

    /// Discards a multipart session and its stored parts.
    pub async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ClientError> {
        let req = ObjectRequest::new(Method::DELETE, bucket, Some(key)).query("uploadId", upload_id);
        self.execute(req).await?;
        Ok(())
    }

    /// `GET` with `Range: bytes=start-end_inclusive`. The caller checks the status.
    pub async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<HttpResponse, ClientError> {
        let req = ObjectRequest::new(Method::GET, bucket, Some(key))
            .header("range", format!("bytes={start}-{end_inclusive}"));
        self.execute(req).await
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, ClientError> {
        let resp = self
            .execute(ObjectRequest::new(Method::HEAD, bucket, Some(key)))
            .await?;
        Ok(ObjectMetadata {
            size: resp
                .header("content-length")
                .and_then(|v| v.trim().parse().ok()),
            etag: resp.header("etag").map(str::to_string),
            content_type: resp.header("content-type").map(str::to_string),
        })
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.execute(ObjectRequest::new(Method::DELETE, bucket, Some(key)))
            .await?;
        Ok(())
    }

    /// Deletes up to [`MAX_BATCH_DELETE`] keys in quiet mode.
    ///
    /// Returns only the keys that could not be deleted.
    pub async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<DeleteFailure>, ClientError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if keys.len() > MAX_BATCH_DELETE {
            return Err(ClientError::InvalidRequest(format!(
                "batch delete of {} keys exceeds the limit of {MAX_BATCH_DELETE}",
                keys.len()
            )));
        }

        let body = xml::delete_objects_body(keys, true).into_bytes();
        let req = ObjectRequest::new(Method::POST, bucket, None)
            .query("delete", "")
            .header("content-md5", content_md5(&body))
            .header("content-type", "application/xml")
            .body(body);
        let resp = self.execute(req).await?;

        let text = resp.body_text();
        let failures: Vec<DeleteFailure> = xml::extract_blocks(&text, "Error")
            .into_iter()
            .map(|block| DeleteFailure {
                key: xml::extract_tag(block, "Key").unwrap_or_default(),
                code: xml::extract_tag(block, "Code").unwrap_or_default(),
                message: xml::extract_tag(block, "Message").unwrap_or_default(),
            })
            .collect();
        if !failures.is_empty() {
            warn!(bucket, failed = failures.len(), "batch delete left keys behind");
        }
        Ok(failures)
    }

    /// Server-side copy. Returns the new object's ETag.
    pub async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<String, ClientError> {
        let source = uri_encode_path(&format!("/{source_bucket}/{source_key}"));
        let header = format!("{}copy-source", self.signer.header_prefix());
        let req = ObjectRequest::new(Method::PUT, dest_bucket, Some(dest_key)).header(&header, source);
        let resp = self.execute(req).await?;

        let text = resp.body_text();
        if xml::is_error_document(&text) {
            return Err(xml::protocol_error(resp.status, &text, None));
        }
        Ok(xml::extract_tag(&text, "ETag").unwrap_or_default())
    }
}
