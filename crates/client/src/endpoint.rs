use reqwest::Url;

use cloudxfer_signing::encoding::{EmptyValue, canonical_query, uri_encode_path};

use crate::ClientError;

/// Where requests go and how buckets are addressed.
///
/// Path style puts the bucket in the path (`http://host/bucket/key`),
/// virtual-hosted style in the host name (`https://bucket.host/key`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    path_style: bool,
}

impl Endpoint {
    /// Parses `scheme://host[:port]`. A trailing `/` is ignored; a default
    /// port is dropped.
    pub fn new(base_url: &str, path_style: bool) -> Result<Self, ClientError> {
        let invalid = |reason: &str| {
            ClientError::InvalidRequest(format!("invalid endpoint {base_url}: {reason}"))
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials are not allowed in the URL"));
        }
        if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("expected scheme://host[:port]"));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            path_style,
        })
    }

    pub fn path_style(&self) -> bool {
        self.path_style
    }

    /// Value of the `host` header for requests against `bucket`.
    pub fn host(&self, bucket: &str) -> String {
        if self.path_style {
            self.host.clone()
        } else {
            format!("{bucket}.{}", self.host)
        }
    }

    /// Encoded request path, exactly as sent and signed.
    pub fn path(&self, bucket: &str, key: Option<&str>) -> String {
        match (self.path_style, key) {
            (true, Some(key)) => uri_encode_path(&format!("/{bucket}/{key}")),
            (true, None) => uri_encode_path(&format!("/{bucket}")),
            (false, Some(key)) => uri_encode_path(&format!("/{key}")),
            (false, None) => "/".to_string(),
        }
    }

    /// Full URL including the encoded query string.
    pub fn url(&self, bucket: &str, key: Option<&str>, query: &[(String, String)]) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.host(bucket), self.path(bucket, key));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query, EmptyValue::BareKey));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn virtual_hosted_urls() {
        let ep = Endpoint::new("https://s3.us-east-1.amazonaws.com/", false).unwrap();
        assert_eq!(ep.host("photos"), "photos.s3.us-east-1.amazonaws.com");
        assert_eq!(
            ep.url("photos", Some("2024/a b.jpg"), &q(&[("uploads", "")])),
            "https://photos.s3.us-east-1.amazonaws.com/2024/a%20b.jpg?uploads"
        );
        assert_eq!(ep.path("photos", None), "/");
    }

    #[test]
    fn path_style_urls() {
        let ep = Endpoint::new("http://localhost:9000", true).unwrap();
        assert_eq!(ep.host("b"), "localhost:9000");
        assert_eq!(
            ep.url("b", Some("k(1)"), &q(&[("uploadId", "u/1"), ("partNumber", "3")])),
            "http://localhost:9000/b/k%281%29?partNumber=3&uploadId=u%2F1"
        );
        assert_eq!(ep.path("b", None), "/b");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(Endpoint::new("localhost:9000", true).is_err());
        assert!(Endpoint::new("ftp://host", true).is_err());
        assert!(Endpoint::new("http://", true).is_err());
        assert!(Endpoint::new("http://host/prefix", true).is_err());
        assert!(Endpoint::new("http://host?x=1", true).is_err());
    }

    #[test]
    fn rejects_userinfo() {
        assert!(Endpoint::new("https://user@s3.example.com", false).is_err());
        assert!(Endpoint::new("https://user:pw@s3.example.com", false).is_err());
    }

    #[test]
    fn default_port_is_dropped_from_host() {
        let ep = Endpoint::new("https://S3.Example.com:443", true).unwrap();
        assert_eq!(ep.host("b"), "s3.example.com");
        let ep = Endpoint::new("http://127.0.0.1:9000/", true).unwrap();
        assert_eq!(ep.host("b"), "127.0.0.1:9000");
    }
}
