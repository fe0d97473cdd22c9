//! Response model: insertion-ordered headers, a polymorphic body, and
//! emission as FastCGI STDOUT records.
//!
//! A plain response always goes out with a correct `Content-Length`; a
//! chunked one always goes out with `Transfer-Encoding: chunked`. The
//! two headers never appear together.

use crate::error::FcgiResult;
use crate::protocol::{self, PACKET_IO_CONTENT_LEN, RecordType};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const STATUS: &str = "Status";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";

/// Insertion-ordered header map. Lookup is case-insensitive and ignores
/// surrounding whitespace; the application's key casing is preserved on
/// the wire.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        let want = key.trim().to_ascii_lowercase();
        self.entries
            .iter()
            .position(|(k, _)| k.trim().to_ascii_lowercase() == want)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Set a header, replacing an existing one regardless of casing but
    /// keeping its slot in the emission order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove a header. True if one was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Headers {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// Response body variants. A temp-file body deletes its file when the
/// response drops; a path body leaves the file alone.
#[derive(Debug)]
pub enum Body {
    None,
    Bytes(Vec<u8>),
    Text(String),
    TempFile(NamedTempFile),
    File(PathBuf),
    Response(Box<Response>),
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Bytes(b)
    }
}

impl From<&[u8]> for Body {
    fn from(b: &[u8]) -> Self {
        Body::Bytes(b.to_vec())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

impl From<NamedTempFile> for Body {
    fn from(f: NamedTempFile) -> Self {
        Body::TempFile(f)
    }
}

impl From<PathBuf> for Body {
    fn from(p: PathBuf) -> Self {
        Body::File(p)
    }
}

impl From<Response> for Body {
    fn from(r: Response) -> Self {
        Body::Response(Box::new(r))
    }
}

/// A response: headers plus body. Plain responses carry a
/// `Content-Length`; the chunked variant is produced internally when a
/// responder opens the stdout stream.
#[derive(Debug)]
pub struct Response {
    pub headers: Headers,
    pub body: Body,
    chunked: bool,
}

impl Response {
    pub fn new(headers: Headers, body: impl Into<Body>) -> Self {
        Self {
            headers,
            body: body.into(),
            chunked: false,
        }
    }

    /// Header-only response announcing a chunked body to follow.
    pub(crate) fn chunked(headers: Headers) -> Self {
        Self {
            headers,
            body: Body::None,
            chunked: true,
        }
    }

    /// Size of the body in bytes; file-backed bodies are stat'ed.
    pub fn body_len(&self) -> FcgiResult<u64> {
        Ok(match &self.body {
            Body::None => 0,
            Body::Bytes(b) => b.len() as u64,
            Body::Text(s) => s.len() as u64,
            Body::TempFile(f) => fs::metadata(f.path())?.len(),
            Body::File(p) => fs::metadata(p)?.len(),
            Body::Response(inner) => inner.serialize_headers()?.len() as u64 + inner.body_len()?,
        })
    }

    /// Serialize the header block: `Key: value\r\n` lines in insertion
    /// order, then a blank line. Chunked responses get
    /// `Transfer-Encoding: chunked` forced and any `Content-Length`
    /// dropped; plain responses the other way around, with the length
    /// computed from the body when the application did not set one.
    pub fn serialize_headers(&self) -> FcgiResult<Vec<u8>> {
        let mut h = self.headers.clone();

        if self.chunked {
            if !h.contains(TRANSFER_ENCODING) {
                h.set(TRANSFER_ENCODING, "chunked");
            }
            if h.remove(CONTENT_LENGTH) {
                log::warn!("header {CONTENT_LENGTH} is ignored on a chunked response");
            }
        } else {
            if !h.contains(CONTENT_LENGTH) {
                h.set(CONTENT_LENGTH, self.body_len()?.to_string());
            }
            if h.remove(TRANSFER_ENCODING) {
                log::warn!("header {TRANSFER_ENCODING} is ignored on a sized response");
            }
        }

        let mut out = Vec::new();
        for (k, v) in h.iter() {
            out.extend_from_slice(k.trim().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.trim().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }
}

/// Reason phrases for the handful of codes the runtime emits itself.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Emit a response as STDOUT records for the given request, dispatching
/// on the body tag. In-memory bodies ride in one logical payload (the
/// codec splits as needed); file bodies are streamed one read per
/// record; a nested response is emitted recursively after the outer
/// header block.
pub fn send_response(
    conn: &mut impl Write,
    request_id: u16,
    resp: &Response,
) -> FcgiResult<usize> {
    match &resp.body {
        Body::None => protocol::send_record(conn, RecordType::Stdout, request_id, &resp.serialize_headers()?),
        Body::Bytes(b) => send_headers_and_bytes(conn, request_id, resp, b),
        Body::Text(s) => send_headers_and_bytes(conn, request_id, resp, s.as_bytes()),
        Body::TempFile(f) => send_headers_and_file(conn, request_id, resp, f.path()),
        Body::File(p) => send_headers_and_file(conn, request_id, resp, p),
        Body::Response(inner) => {
            let mut sum = protocol::send_record(conn, RecordType::Stdout, request_id, &resp.serialize_headers()?)?;
            sum += send_response(conn, request_id, inner)?;
            Ok(sum)
        }
    }
}

fn send_headers_and_bytes(
    conn: &mut impl Write,
    request_id: u16,
    resp: &Response,
    body: &[u8],
) -> FcgiResult<usize> {
    let mut data = resp.serialize_headers()?;
    data.extend_from_slice(body);
    protocol::send_record(conn, RecordType::Stdout, request_id, &data)
}

fn send_headers_and_file(
    conn: &mut impl Write,
    request_id: u16,
    resp: &Response,
    path: &Path,
) -> FcgiResult<usize> {
    let mut sum = protocol::send_record(conn, RecordType::Stdout, request_id, &resp.serialize_headers()?)?;
    let mut file = File::open(path)?;
    let mut buff = [0u8; PACKET_IO_CONTENT_LEN];
    loop {
        let nread = file.read(&mut buff)?;
        if nread == 0 {
            break;
        }
        sum += protocol::send_record(conn, RecordType::Stdout, request_id, &buff[..nread])?;
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire;

    #[test]
    fn header_lookup_is_case_insensitive_and_trimmed() {
        let mut h = Headers::from([("Content-Length", "100")]);
        assert!(h.contains("content-length"));
        assert!(h.contains("  CONTENT-LENGTH  "));
        assert!(!h.contains("c0ntent-length"));
        assert_eq!(h.get("content-LENGTH"), Some("100"));

        h.set("  content-length  ", "7");
        assert_eq!(h.get("Content-Length"), Some("7"));

        assert!(h.remove("CONTENT-length"));
        assert!(!h.contains("Content-Length"));
        assert!(!h.remove("Content-Length"));
    }

    #[test]
    fn headers_preserve_insertion_order_and_casing() {
        let resp = Response::new(
            Headers::from([("Status", "200 OK"), ("X-cUsToM", "a")]),
            Body::None,
        );
        let dumped = String::from_utf8(resp.serialize_headers().unwrap()).unwrap();
        assert_eq!(
            dumped,
            "Status: 200 OK\r\nX-cUsToM: a\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn plain_response_forces_content_length() {
        let resp = Response::new(
            Headers::from([("Transfer-Encoding", "chunked")]),
            "hello",
        );
        let dumped = String::from_utf8(resp.serialize_headers().unwrap()).unwrap();
        assert!(dumped.contains("Content-Length: 5\r\n"));
        assert!(!dumped.contains("Transfer-Encoding"));
    }

    #[test]
    fn chunked_response_forces_transfer_encoding() {
        let resp = Response::chunked(Headers::from([("Content-Length", "999")]));
        let dumped = String::from_utf8(resp.serialize_headers().unwrap()).unwrap();
        assert!(dumped.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!dumped.contains("Content-Length"));
    }

    #[test]
    fn application_content_length_is_kept() {
        let resp = Response::new(Headers::from([("Content-Length", "3")]), "abcdef");
        let dumped = String::from_utf8(resp.serialize_headers().unwrap()).unwrap();
        assert!(dumped.contains("Content-Length: 3\r\n"));
    }

    #[test]
    fn body_len_by_variant() {
        let h = || Headers::new();
        assert_eq!(Response::new(h(), Body::None).body_len().unwrap(), 0);
        assert_eq!(Response::new(h(), "héllo").body_len().unwrap(), 6);
        assert_eq!(Response::new(h(), vec![0u8; 42]).body_len().unwrap(), 42);

        let mut tmpf = NamedTempFile::new().unwrap();
        tmpf.as_file_mut().write_all(b"0123456789").unwrap();
        assert_eq!(Response::new(h(), tmpf).body_len().unwrap(), 10);
    }

    #[test]
    fn static_body_emission() {
        //  GET of a small static body, as the upstream would decode it.
        let resp = Response::new(
            Headers::from([("Status", "200 OK"), ("Content-Type", "text/javascript")]),
            "// js",
        );
        let mut out = Vec::new();
        send_response(&mut out, 1, &resp).unwrap();

        let records = wire::parse_records(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].content,
            b"Status: 200 OK\r\nContent-Type: text/javascript\r\nContent-Length: 5\r\n\r\n// js"
        );
    }

    #[test]
    fn file_body_streams_one_record_per_read() {
        let mut tmpf = NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        tmpf.as_file_mut().write_all(&payload).unwrap();

        let resp = Response::new(Headers::from([("Status", "200 OK")]), tmpf);
        let mut out = Vec::new();
        send_response(&mut out, 1, &resp).unwrap();

        let records = wire::parse_records(&out);
        //  Header record plus three file reads (8184 + 8184 + 3632).
        assert_eq!(records.len(), 4);
        let dumped = String::from_utf8(records[0].content.clone()).unwrap();
        assert!(dumped.contains("Content-Length: 20000\r\n"));
        let body: Vec<u8> = records[1..]
            .iter()
            .flat_map(|r| r.content.iter().copied())
            .collect();
        assert_eq!(body, payload);
    }

    #[test]
    fn nested_response_body() {
        let inner = Response::new(Headers::from([("X-Inner", "1")]), "abc");
        let outer = Response::new(Headers::from([("Status", "200 OK")]), inner);
        let mut out = Vec::new();
        send_response(&mut out, 1, &outer).unwrap();

        let records = wire::parse_records(&out);
        assert_eq!(records.len(), 2);
        let outer_headers = String::from_utf8(records[0].content.clone()).unwrap();
        //  Outer length covers the inner render.
        let inner_len = records[1].content.len();
        assert!(outer_headers.contains(&format!("Content-Length: {inner_len}")));
        assert!(String::from_utf8_lossy(&records[1].content).ends_with("abc"));
    }
}
