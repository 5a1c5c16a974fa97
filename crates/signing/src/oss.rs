use chrono::{DateTime, Utc};

use cloudxfer_protocol::{Credential, ProviderKind};

use crate::encoding::{EmptyValue, canonical_headers, canonical_query, uri_encode_path};
use crate::{
    DATE_FORMAT, KeyChain, SignError, SignableRequest, SigningStrategy, TIMESTAMP_FORMAT,
    UNSIGNED_PAYLOAD, check_credential, header_value, hmac_sha256, sha256_hex,
};

const ALGORITHM: &str = "OSS4-HMAC-SHA256";

const CHAIN: KeyChain = KeyChain {
    secret_prefix: "aliyun_v4",
    service: "oss",
    terminator: "aliyun_v4_request",
};

/// Headers listed under `AdditionalHeaders`; signed on top of the default set.
const ADDITIONAL_HEADERS: &str = "host";

/// OSS Signature Version 4.
///
/// Differs from SigV4 in three places: the canonical URI is always the
/// resource path `/{bucket}/{key}` whatever the addressing style, empty query
/// values are rendered as bare keys, and the extra signed headers are listed
/// in a separate `AdditionalHeaders` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OssV4Signer;

impl OssV4Signer {
    fn canonical_uri(req: &SignableRequest<'_>) -> String {
        match (req.bucket, req.key) {
            (Some(bucket), Some(key)) => uri_encode_path(&format!("/{bucket}/{key}")),
            (Some(bucket), None) => uri_encode_path(&format!("/{bucket}/")),
            (None, _) => "/".to_string(),
        }
    }
}

impl SigningStrategy for OssV4Signer {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Oss
    }

    fn header_prefix(&self) -> &'static str {
        "x-oss-"
    }

    fn date_header(&self) -> &'static str {
        "x-oss-date"
    }

    fn content_sha256_header(&self) -> &'static str {
        "x-oss-content-sha256"
    }

    fn canonical_request(&self, req: &SignableRequest<'_>) -> String {
        let headers = canonical_headers(req.headers, self.header_prefix());
        let payload =
            header_value(req.headers, self.content_sha256_header()).unwrap_or(UNSIGNED_PAYLOAD);
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            req.method.to_ascii_uppercase(),
            Self::canonical_uri(req),
            canonical_query(req.query, EmptyValue::BareKey),
            headers.block,
            ADDITIONAL_HEADERS,
            payload
        )
    }

    fn sign(
        &self,
        req: &SignableRequest<'_>,
        credential: &Credential,
        timestamp: DateTime<Utc>,
    ) -> Result<String, SignError> {
        check_credential(credential, self.provider())?;

        let oss_date = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let date = timestamp.format(DATE_FORMAT).to_string();
        let region = normalize_region(&credential.region);
        let scope = CHAIN.scope(&date, region);

        let canonical = self.canonical_request(req);
        let string_to_sign = format!(
            "{ALGORITHM}\n{oss_date}\n{scope}\n{}",
            sha256_hex(canonical.as_bytes())
        );

        let key = CHAIN.derive(&credential.secret_access_key, &date, region)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{ALGORITHM} Credential={}/{scope},AdditionalHeaders={ADDITIONAL_HEADERS},Signature={signature}",
            credential.access_key_id
        ))
    }
}

/// OSS endpoints use `oss-cn-hangzhou`; the signing scope wants `cn-hangzhou`.
fn normalize_region(region: &str) -> &str {
    region.strip_prefix("oss-").unwrap_or(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers() -> Vec<(String, String)> {
        vec![
            ("Host".into(), "examplebucket.oss-cn-hangzhou.aliyuncs.com".into()),
            ("x-oss-date".into(), "20250411T064124Z".into()),
            ("x-oss-content-sha256".into(), "UNSIGNED-PAYLOAD".into()),
            ("Content-Type".into(), "application/octet-stream".into()),
            ("Range".into(), "bytes=0-1".into()),
        ]
    }

    fn credential() -> Credential {
        Credential::new(ProviderKind::Oss, "LTAIexample", "secret-example", "oss-cn-hangzhou")
    }

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 11, 6, 41, 24).unwrap()
    }

    #[test]
    fn canonical_request_uses_resource_path_and_bare_keys() {
        let headers = headers();
        let query = vec![("uploads".to_string(), String::new())];
        let req = SignableRequest {
            method: "post",
            path: "/photo%20%281%29.jpg",
            bucket: Some("examplebucket"),
            key: Some("photo (1).jpg"),
            headers: &headers,
            query: &query,
        };
        let expected = "POST\n/examplebucket/photo%20%281%29.jpg\nuploads\n\
             content-type:application/octet-stream\n\
             host:examplebucket.oss-cn-hangzhou.aliyuncs.com\n\
             x-oss-content-sha256:UNSIGNED-PAYLOAD\n\
             x-oss-date:20250411T064124Z\n\nhost\nUNSIGNED-PAYLOAD";
        assert_eq!(OssV4Signer.canonical_request(&req), expected);
    }

    #[test]
    fn bucket_and_service_level_uris() {
        let headers = headers();
        let bucket_only = SignableRequest {
            method: "POST",
            path: "/",
            bucket: Some("b"),
            key: None,
            headers: &headers,
            query: &[],
        };
        assert_eq!(OssV4Signer::canonical_uri(&bucket_only), "/b/");
        let service = SignableRequest {
            bucket: None,
            ..bucket_only
        };
        assert_eq!(OssV4Signer::canonical_uri(&service), "/");
    }

    #[test]
    fn authorization_shape() {
        let headers = headers();
        let req = SignableRequest {
            method: "GET",
            path: "/k",
            bucket: Some("examplebucket"),
            key: Some("k"),
            headers: &headers,
            query: &[],
        };
        let auth = OssV4Signer.sign(&req, &credential(), time()).unwrap();
        assert!(auth.starts_with(
            "OSS4-HMAC-SHA256 Credential=LTAIexample/20250411/cn-hangzhou/oss/aliyun_v4_request,"
        ));
        assert!(auth.contains(",AdditionalHeaders=host,"));
        let sig = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signing_is_deterministic_and_secret_dependent() {
        let headers = headers();
        let req = SignableRequest {
            method: "GET",
            path: "/k",
            bucket: Some("examplebucket"),
            key: Some("k"),
            headers: &headers,
            query: &[],
        };
        let a = OssV4Signer.sign(&req, &credential(), time()).unwrap();
        let b = OssV4Signer.sign(&req, &credential(), time()).unwrap();
        assert_eq!(a, b);

        let mut other = credential();
        other.secret_access_key = "another-secret".into();
        let c = OssV4Signer.sign(&req, &other, time()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_s3_credential() {
        let headers = headers();
        let req = SignableRequest {
            method: "GET",
            path: "/",
            bucket: None,
            key: None,
            headers: &headers,
            query: &[],
        };
        let cred = Credential::new(ProviderKind::S3, "ak", "sk", "us-east-1");
        assert!(OssV4Signer.sign(&req, &cred, time()).is_err());
    }
}
