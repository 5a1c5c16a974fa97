//! Canonicalization primitives shared by both signers.
//!
//! The same encoders are used by the HTTP client to build URLs, so the
//! bytes on the wire always match the bytes that were signed.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Everything except the RFC 3986 unreserved set.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Like [`COMPONENT`] but keeps `/` as a path separator.
const PATH: &AsciiSet = &COMPONENT.remove(b'/');

/// Encodes an object path, leaving `/` unescaped.
///
/// `photos/a (1).jpg` → `photos/a%20%281%29.jpg`
pub fn uri_encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH).to_string()
}

/// Encodes a single query key or value (`/` is escaped).
pub fn uri_encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// How an empty query value is rendered in the canonical query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyValue {
    /// `uploads=`
    KeepEquals,
    /// `uploads`
    BareKey,
}

/// Builds the canonical query string: encoded pairs sorted by key then value.
pub fn canonical_query(query: &[(String, String)], empty: EmptyValue) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode_component(k), uri_encode_component(v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| {
            if v.is_empty() && empty == EmptyValue::BareKey {
                k
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Result of header selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalHeaders {
    /// `name:value\n` lines, sorted by name.
    pub block: String,
    /// Selected header names, sorted.
    pub names: Vec<String>,
}

impl CanonicalHeaders {
    /// Names joined with `;` (the `SignedHeaders` list).
    pub fn signed_list(&self) -> String {
        self.names.join(";")
    }
}

/// Selects and canonicalizes the headers that participate in the signature.
///
/// `host` is always included, `content-type` and `content-md5` only when
/// present, plus every header starting with `prefix`.
pub fn canonical_headers(headers: &[(String, String)], prefix: &str) -> CanonicalHeaders {
    let mut selected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.trim().to_ascii_lowercase();
        let wanted = name == "host"
            || name == "content-type"
            || name == "content-md5"
            || name.starts_with(prefix);
        if !wanted {
            continue;
        }
        let value = collapse_whitespace(value);
        selected
            .entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let mut block = String::new();
    for (name, value) in &selected {
        block.push_str(name);
        block.push(':');
        block.push_str(value);
        block.push('\n');
    }
    CanonicalHeaders {
        block,
        names: selected.into_keys().collect(),
    }
}

/// Trims and collapses runs of spaces into one.
fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn path_keeps_slashes_and_escapes_reserved() {
        assert_eq!(uri_encode_path("/bucket/a b/(1).txt"), "/bucket/a%20b/%281%29.txt");
        assert_eq!(uri_encode_path("/b/key~_-.x"), "/b/key~_-.x");
        assert_eq!(uri_encode_path("/b/a+b=c&d"), "/b/a%2Bb%3Dc%26d");
    }

    #[test]
    fn non_ascii_is_utf8_encoded() {
        assert_eq!(uri_encode_path("/b/é"), "/b/%C3%A9");
    }

    #[test]
    fn component_escapes_slash() {
        assert_eq!(uri_encode_component("a/b"), "a%2Fb");
    }

    #[test]
    fn query_sorted_with_equals() {
        let q = pairs(&[("uploadId", "x/y"), ("partNumber", "2")]);
        assert_eq!(
            canonical_query(&q, EmptyValue::KeepEquals),
            "partNumber=2&uploadId=x%2Fy"
        );
    }

    #[test]
    fn empty_values_render_per_provider() {
        let q = pairs(&[("uploads", "")]);
        assert_eq!(canonical_query(&q, EmptyValue::KeepEquals), "uploads=");
        assert_eq!(canonical_query(&q, EmptyValue::BareKey), "uploads");
        assert_eq!(canonical_query(&[], EmptyValue::BareKey), "");
    }

    #[test]
    fn header_selection_rule() {
        let headers = pairs(&[
            ("Host", "bucket.example.com"),
            ("Range", "bytes=0-9"),
            ("X-Amz-Date", "20240101T000000Z"),
            ("Content-Type", "  text/plain  "),
            ("x-oss-meta", "ignored-for-s3"),
            ("User-Agent", "cloudxfer"),
        ]);
        let ch = canonical_headers(&headers, "x-amz-");
        assert_eq!(ch.names, vec!["content-type", "host", "x-amz-date"]);
        assert_eq!(
            ch.block,
            "content-type:text/plain\nhost:bucket.example.com\nx-amz-date:20240101T000000Z\n"
        );
        assert_eq!(ch.signed_list(), "content-type;host;x-amz-date");
    }

    #[test]
    fn header_values_are_collapsed() {
        let headers = pairs(&[("host", "h"), ("x-amz-meta-note", " a   b ")]);
        let ch = canonical_headers(&headers, "x-amz-");
        assert!(ch.block.contains("x-amz-meta-note:a b\n"));
    }
}
