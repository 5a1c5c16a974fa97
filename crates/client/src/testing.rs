//! In-memory object store speaking the provider wire protocol.
//!
//! [`MemoryStore`] implements [`HttpTransport`], so a real [`ObjectClient`]
//! (URL building, signing, XML parsing) runs against it unchanged. Only
//! path-style addressing is understood. Knobs inject transport faults per
//! part, slow every request down, and count what was asked for.
//!
//! [`ObjectClient`]: crate::ObjectClient

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::Method;

use cloudxfer_protocol::ProviderKind;
use cloudxfer_transfer::{content_md5, md5_hex};

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::{Endpoint, xml};

const BASE_URL: &str = "http://mem.test";

type ObjectId = (String, String);

#[derive(Default)]
struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, Vec<u8>>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    locked: HashSet<ObjectId>,

    upload_faults: HashMap<u32, u32>,
    range_faults: HashMap<u64, u32>,
    delay: Option<Duration>,
    omit_etag: bool,
    short_ranges: bool,
    omit_head_length: bool,
    complete_ok_error: bool,
    part_status: Option<u16>,

    upload_part_requests: usize,
    range_requests: usize,
    abort_requests: usize,
    total_requests: usize,
}

/// A fake provider for tests.
pub struct MemoryStore {
    provider: ProviderKind,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    /// A store that only accepts signatures of `provider`.
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Path-style endpoint pointing at this store.
    pub fn endpoint(&self) -> Endpoint {
        match Endpoint::new(BASE_URL, true) {
            Ok(endpoint) => endpoint,
            Err(e) => unreachable!("static endpoint is valid: {e}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- fixtures ----------------------------------------------------------

    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of multipart sessions neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Part numbers stored for an open session.
    pub fn stored_parts(&self, upload_id: &str) -> Vec<u32> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Makes batch deletes of this key fail with `AccessDenied`.
    pub fn lock_key(&self, bucket: &str, key: &str) {
        self.lock()
            .locked
            .insert((bucket.to_string(), key.to_string()));
    }

    // -- fault injection ---------------------------------------------------

    /// The next `times` uploads of `part_number` fail at the transport level.
    pub fn inject_upload_fault(&self, part_number: u32, times: u32) {
        self.lock().upload_faults.insert(part_number, times);
    }

    /// The next `times` ranged GETs starting at `offset` fail at the transport level.
    pub fn inject_range_fault(&self, offset: u64, times: u32) {
        self.lock().range_faults.insert(offset, times);
    }

    /// Every request waits this long before being served.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Part uploads succeed without an `ETag` header.
    pub fn set_omit_etag(&self, omit: bool) {
        self.lock().omit_etag = omit;
    }

    /// Ranged GETs return one byte less than asked for.
    pub fn set_short_ranges(&self, short: bool) {
        self.lock().short_ranges = short;
    }

    /// HEAD responses carry no `Content-Length`.
    pub fn set_omit_head_length(&self, omit: bool) {
        self.lock().omit_head_length = omit;
    }

    /// Complete answers 200 with an `<Error>` document.
    pub fn fail_complete_with_ok_error(&self, fail: bool) {
        self.lock().complete_ok_error = fail;
    }

    /// Part uploads that succeed answer `code` instead of 200.
    pub fn set_part_status(&self, code: u16) {
        self.lock().part_status = Some(code);
    }

    // -- counters ----------------------------------------------------------

    pub fn upload_part_requests(&self) -> usize {
        self.lock().upload_part_requests
    }

    pub fn range_requests(&self) -> usize {
        self.lock().range_requests
    }

    pub fn abort_requests(&self) -> usize {
        self.lock().abort_requests
    }

    pub fn total_requests(&self) -> usize {
        self.lock().total_requests
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        let mut inner = self.lock();
        inner.upload_part_requests = 0;
        inner.range_requests = 0;
        inner.abort_requests = 0;
        inner.total_requests = 0;
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    // -- request handling --------------------------------------------------

    /// Counts the request and returns the configured delay.
    fn arrive(&self, req: &ParsedRequest) -> Option<Duration> {
        let mut inner = self.lock();
        inner.total_requests += 1;
        if req.method == Method::PUT && req.query("partNumber").is_some() {
            inner.upload_part_requests += 1;
        }
        if req.method == Method::GET && req.header("range").is_some() {
            inner.range_requests += 1;
        }
        if req.method == Method::DELETE && req.query("uploadId").is_some() {
            inner.abort_requests += 1;
        }
        inner.delay
    }

    async fn serve(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let req = ParsedRequest::parse(request)?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if let Some(delay) = self.arrive(&req) {
            tokio::time::sleep(delay).await;
        }
        self.handle(req)
    }

    fn handle(&self, req: ParsedRequest) -> Result<HttpResponse, TransportError> {
        if let Some(denied) = self.check_auth(&req) {
            return Ok(denied);
        }
        let Some(bucket) = req.bucket.clone() else {
            return Ok(error(400, "InvalidBucketName", "bucket required"));
        };
        let mut inner = self.lock();

        if req.method == Method::PUT {
            if req.query("partNumber").is_some() {
                return inner.upload_part(&req);
            }
            if let Some(source) = req.header(&self.copy_source_header()) {
                return Ok(inner.copy_object(&bucket, &req, source));
            }
            return Ok(inner.put_object(&bucket, &req));
        }
        if req.method == Method::POST {
            if req.query("uploads").is_some() {
                return Ok(inner.initiate(&bucket, &req));
            }
            if let Some(id) = req.query("uploadId") {
                return Ok(inner.complete(id, &req));
            }
            if req.query("delete").is_some() {
                return Ok(inner.delete_objects(&bucket, &req));
            }
        }
        if req.method == Method::DELETE {
            if let Some(id) = req.query("uploadId") {
                return Ok(match inner.uploads.remove(id) {
                    Some(_) => status(204),
                    None => error(404, "NoSuchUpload", "The specified upload does not exist."),
                });
            }
            if let Some(key) = &req.key {
                inner.objects.remove(&(bucket.clone(), key.clone()));
                return Ok(status(204));
            }
        }
        if req.method == Method::GET {
            return inner.get_object(&bucket, &req);
        }
        if req.method == Method::HEAD {
            return Ok(inner.head_object(&bucket, &req));
        }
        Ok(error(405, "MethodNotAllowed", "unsupported operation"))
    }

    fn check_auth(&self, req: &ParsedRequest) -> Option<HttpResponse> {
        let (algorithm, date_header) = match self.provider {
            ProviderKind::S3 => ("AWS4-HMAC-SHA256 ", "x-amz-date"),
            ProviderKind::Oss => ("OSS4-HMAC-SHA256 ", "x-oss-date"),
        };
        let signed = req
            .header("authorization")
            .is_some_and(|auth| auth.starts_with(algorithm));
        if signed && req.header(date_header).is_some() {
            None
        } else {
            Some(error(
                403,
                "SignatureDoesNotMatch",
                "The request signature we calculated does not match the signature you provided.",
            ))
        }
    }

    fn copy_source_header(&self) -> String {
        match self.provider {
            ProviderKind::S3 => "x-amz-copy-source".to_string(),
            ProviderKind::Oss => "x-oss-copy-source".to_string(),
        }
    }
}

impl HttpTransport for MemoryStore {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + '_>> {
        Box::pin(self.serve(request))
    }
}

impl Inner {
    fn upload_part(&mut self, req: &ParsedRequest) -> Result<HttpResponse, TransportError> {
        let part_number: u32 = req
            .query("partNumber")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if let Some(remaining) = self.upload_faults.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Connect(format!(
                    "injected fault on part {part_number}"
                )));
            }
        }

        let id = req.query("uploadId").unwrap_or_default();
        if let Some(md5) = req.header("content-md5") {
            if md5 != content_md5(&req.body) {
                return Ok(error(400, "BadDigest", "Content-MD5 mismatch"));
            }
        }
        let omit_etag = self.omit_etag;
        let Some(upload) = self.uploads.get_mut(id) else {
            return Ok(error(404, "NoSuchUpload", "The specified upload does not exist."));
        };
        let etag = etag_of(&req.body);
        upload.parts.insert(part_number, req.body.clone());

        let mut resp = status(self.part_status.unwrap_or(200));
        if !omit_etag {
            resp.headers.push(("ETag".into(), etag));
        }
        Ok(resp)
    }

    fn put_object(&mut self, bucket: &str, req: &ParsedRequest) -> HttpResponse {
        let Some(key) = &req.key else {
            return error(400, "InvalidRequest", "key required");
        };
        if let Some(md5) = req.header("content-md5") {
            if md5 != content_md5(&req.body) {
                return error(400, "BadDigest", "Content-MD5 mismatch");
            }
        }
        let etag = etag_of(&req.body);
        self.objects
            .insert((bucket.to_string(), key.clone()), req.body.clone());
        let mut resp = status(200);
        resp.headers.push(("ETag".into(), etag));
        resp
    }

    fn copy_object(&mut self, bucket: &str, req: &ParsedRequest, source: &str) -> HttpResponse {
        let Some(key) = &req.key else {
            return error(400, "InvalidRequest", "key required");
        };
        let source = percent_decode_str(source).decode_utf8_lossy().into_owned();
        let Some((src_bucket, src_key)) = source.trim_start_matches('/').split_once('/') else {
            return error(400, "InvalidArgument", "malformed copy source");
        };
        let Some(data) = self
            .objects
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .cloned()
        else {
            return error(404, "NoSuchKey", "The specified key does not exist.");
        };
        let etag = etag_of(&data);
        self.objects.insert((bucket.to_string(), key.clone()), data);
        let mut resp = status(200);
        resp.body = format!(
            "<CopyObjectResult><ETag>{}</ETag></CopyObjectResult>",
            xml::escape(&etag)
        )
        .into_bytes();
        resp
    }

    fn initiate(&mut self, bucket: &str, req: &ParsedRequest) -> HttpResponse {
        let Some(key) = &req.key else {
            return error(400, "InvalidRequest", "key required");
        };
        self.next_upload += 1;
        let id = format!("upload-{}", self.next_upload);
        self.uploads.insert(
            id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.clone(),
                parts: BTreeMap::new(),
            },
        );
        let mut resp = status(200);
        resp.body = format!(
            "<InitiateMultipartUploadResult><Bucket>{bucket}</Bucket><Key>{}</Key>\
             <UploadId>{id}</UploadId></InitiateMultipartUploadResult>",
            xml::escape(key)
        )
        .into_bytes();
        resp
    }

    fn complete(&mut self, id: &str, req: &ParsedRequest) -> HttpResponse {
        if self.complete_ok_error {
            let mut resp = status(200);
            resp.body = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>InternalError</Code>\
                <Message>We encountered an internal error. Please try again.</Message>\
                <RequestId>mem-1</RequestId></Error>"
                .to_vec();
            return resp;
        }
        let Some(upload) = self.uploads.get(id) else {
            return error(404, "NoSuchUpload", "The specified upload does not exist.");
        };

        let text = String::from_utf8_lossy(&req.body).into_owned();
        let mut data = Vec::new();
        let mut last = 0;
        let mut count = 0;
        for block in xml::extract_blocks(&text, "Part") {
            let number: u32 = xml::extract_tag(block, "PartNumber")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let tag = xml::extract_tag(block, "ETag").unwrap_or_default();
            if number <= last {
                return error(400, "InvalidPartOrder", "parts must be ascending");
            }
            let Some(bytes) = upload.parts.get(&number) else {
                return error(400, "InvalidPart", "one or more parts could not be found");
            };
            if etag_of(bytes) != tag {
                return error(400, "InvalidPart", "part ETag mismatch");
            }
            data.extend_from_slice(bytes);
            last = number;
            count += 1;
        }
        if count == 0 {
            return error(400, "MalformedXML", "no parts listed");
        }

        let etag = format!("\"{}-{count}\"", md5_hex(&data));
        let (bucket, key) = (upload.bucket.clone(), upload.key.clone());
        self.uploads.remove(id);
        self.objects.insert((bucket.clone(), key.clone()), data);

        let mut resp = status(200);
        resp.body = format!(
            "<CompleteMultipartUploadResult><Bucket>{bucket}</Bucket><Key>{}</Key>\
             <ETag>{}</ETag></CompleteMultipartUploadResult>",
            xml::escape(&key),
            xml::escape(&etag)
        )
        .into_bytes();
        resp
    }

    fn delete_objects(&mut self, bucket: &str, req: &ParsedRequest) -> HttpResponse {
        let text = String::from_utf8_lossy(&req.body).into_owned();
        let quiet = xml::extract_tag(&text, "Quiet").is_some_and(|q| q == "true");
        let mut body = String::from("<DeleteResult>");
        for block in xml::extract_blocks(&text, "Object") {
            let key = xml::extract_tag(block, "Key").unwrap_or_default();
            let id = (bucket.to_string(), key.clone());
            if self.locked.contains(&id) {
                body.push_str(&format!(
                    "<Error><Key>{}</Key><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                    xml::escape(&key)
                ));
                continue;
            }
            self.objects.remove(&id);
            if !quiet {
                body.push_str(&format!("<Deleted><Key>{}</Key></Deleted>", xml::escape(&key)));
            }
        }
        body.push_str("</DeleteResult>");
        let mut resp = status(200);
        resp.body = body.into_bytes();
        resp
    }

    fn get_object(&mut self, bucket: &str, req: &ParsedRequest) -> Result<HttpResponse, TransportError> {
        let Some(key) = &req.key else {
            return Ok(error(400, "InvalidRequest", "key required"));
        };
        let Some(data) = self.objects.get(&(bucket.to_string(), key.clone())) else {
            return Ok(error(404, "NoSuchKey", "The specified key does not exist."));
        };

        let Some(range) = req.header("range") else {
            let mut resp = status(200);
            resp.body = data.clone();
            return Ok(resp);
        };
        let Some((start, end)) = parse_range(range) else {
            return Ok(error(400, "InvalidArgument", "malformed Range header"));
        };
        if let Some(remaining) = self.range_faults.get_mut(&start) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Timeout(format!(
                    "injected fault on range starting at {start}"
                )));
            }
        }
        let len = data.len() as u64;
        if start >= len || end < start {
            return Ok(error(416, "InvalidRange", "The requested range is not satisfiable"));
        }
        let end = end.min(len - 1);
        let mut slice = data[start as usize..=end as usize].to_vec();
        if self.short_ranges {
            slice.pop();
        }
        let mut resp = status(206);
        resp.headers
            .push(("Content-Range".into(), format!("bytes {start}-{end}/{len}")));
        resp.body = slice;
        Ok(resp)
    }

    fn head_object(&self, bucket: &str, req: &ParsedRequest) -> HttpResponse {
        let data = req
            .key
            .as_ref()
            .and_then(|key| self.objects.get(&(bucket.to_string(), key.clone())));
        let Some(data) = data else {
            return status(404);
        };
        let mut resp = status(200);
        if !self.omit_head_length {
            resp.headers
                .push(("Content-Length".into(), data.len().to_string()));
        }
        resp.headers.push(("ETag".into(), etag_of(data)));
        resp
    }
}

/// A request split back into its parts.
struct ParsedRequest {
    method: Method,
    bucket: Option<String>,
    key: Option<String>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ParsedRequest {
    fn parse(request: HttpRequest) -> Result<Self, TransportError> {
        let rest = request.url.strip_prefix(BASE_URL).ok_or_else(|| {
            TransportError::Connect(format!("unknown host in {}", request.url))
        })?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
        let path = path.trim_start_matches('/');
        let (bucket, key) = match path.split_once('/') {
            Some((bucket, key)) => (bucket, Some(key)),
            None => (path, None),
        };

        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (decode(k), decode(v))
            })
            .collect();

        Ok(Self {
            method: request.method,
            bucket: (!bucket.is_empty()).then(|| bucket.to_string()),
            key: key.filter(|k| !k.is_empty()).map(str::to_string),
            query,
            headers: request.headers,
            body: request.body,
        })
    }

    fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", md5_hex(data))
}

fn status(code: u16) -> HttpResponse {
    HttpResponse {
        status: code,
        headers: vec![("x-amz-request-id".into(), "mem-request".into())],
        body: Vec::new(),
    }
}

fn error(code: u16, error_code: &str, message: &str) -> HttpResponse {
    let mut resp = status(code);
    resp.body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{error_code}</Code>\
         <Message>{message}</Message><RequestId>mem-request</RequestId></Error>"
    )
    .into_bytes();
    resp
}
