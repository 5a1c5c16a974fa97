//! Just enough XML for the multipart and batch-delete documents.
//!
//! Provider responses are small, flat and machine generated, so tags are
//! pulled out with regular expressions instead of a full parser.

use std::sync::LazyLock;

use regex::Regex;

use cloudxfer_protocol::PartResult;

use crate::ClientError;

static ERROR_DOCUMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:<\?xml[^>]*\?>\s*)?<Error>").ok());

/// Text of the first `<tag>` element, unescaped and trimmed.
///
/// Empty elements yield `None`.
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let tag = regex::escape(tag);
    let re = Regex::new(&format!(r"<{tag}(?:\s[^>]*)?>([^<]*)</{tag}>")).ok()?;
    let text = unescape(re.captures(xml)?.get(1)?.as_str().trim());
    (!text.is_empty()).then_some(text)
}

/// Raw inner content of every `<tag>...</tag>` element, in document order.
pub fn extract_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let tag = regex::escape(tag);
    let Ok(re) = Regex::new(&format!(r"(?s)<{tag}(?:\s[^>]*)?>(.*?)</{tag}>")) else {
        return Vec::new();
    };
    re.captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Returns `true` if the document's root element is `<Error>`.
pub fn is_error_document(body: &str) -> bool {
    ERROR_DOCUMENT
        .as_ref()
        .is_some_and(|re| re.is_match(body))
}

/// Builds a [`ClientError::Protocol`] from a provider error response.
///
/// Bodiless responses (HEAD, some 5xx) fall back to the status line and the
/// request id header.
pub fn protocol_error(status: u16, body: &str, request_id_header: Option<&str>) -> ClientError {
    let code = extract_tag(body, "Code").unwrap_or_else(|| format!("Http{status}"));
    let message = extract_tag(body, "Message").unwrap_or_else(|| "no error document".to_string());
    let request_id = extract_tag(body, "RequestId")
        .or_else(|| request_id_header.map(str::to_string))
        .unwrap_or_default();
    ClientError::Protocol {
        status,
        code,
        message,
        request_id,
    }
}

/// `CompleteMultipartUpload` request body, parts in the given order.
pub fn complete_multipart_body(parts: &[PartResult]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            escape(&part.tag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Batch `Delete` request body.
pub fn delete_objects_body(keys: &[String], quiet: bool) -> String {
    let mut xml = format!("<Delete><Quiet>{quiet}</Quiet>");
    for key in keys {
        xml.push_str(&format!("<Object><Key>{}</Key></Object>", escape(key)));
    }
    xml.push_str("</Delete>");
    xml
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
