//! Responder contract, per-request state, and the canned error
//! responders.

use crate::buffering::StdinBuffer;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{FcgiError, FcgiResult};
use crate::protocol::{self, PARAM_CONTENT_LENGTH, RecordType};
use crate::response::{self, Response, status_text};
use std::collections::HashMap;

/// Per-request state handed to a responder: the decoded params, the
/// connection, and the stdin/stdout progress flags the responder
/// disciplines are built on.
pub struct Request<'c> {
    pub context: &'c Context,
    pub(crate) conn: &'c mut Connection,
    /// Peer address, for logging.
    pub client: String,
    pub request_id: u16,
    /// Immutable snapshot of the PARAMS stream.
    pub params: HashMap<String, String>,
    pub(crate) stdin_done: bool,
    pub(crate) stdout_sent: bool,
    pub(crate) stdin_buf: Option<StdinBuffer>,
}

impl<'c> Request<'c> {
    pub(crate) fn new(
        context: &'c Context,
        conn: &'c mut Connection,
        client: String,
        request_id: u16,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            context,
            conn,
            client,
            request_id,
            params,
            stdin_done: false,
            stdout_sent: false,
            stdin_buf: None,
        }
    }

    /// One parameter by exact name.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Whether the response header block already went out.
    pub fn stdout_sent(&self) -> bool {
        self.stdout_sent
    }

    /// Declared request body size; zero when absent or empty.
    pub(crate) fn content_length(&self) -> FcgiResult<u64> {
        match self.params.get(PARAM_CONTENT_LENGTH) {
            Some(v) if !v.is_empty() => v.parse().map_err(|e| {
                FcgiError::Protocol(format!("bad {PARAM_CONTENT_LENGTH} {v:?}: {e}"))
            }),
            _ => Ok(0),
        }
    }

    /// Emit a complete response as STDOUT records.
    pub fn send_response(&mut self, resp: &Response) -> FcgiResult<usize> {
        response::send_response(self.conn, self.request_id, resp)
    }

    /// Close the STDOUT stream with the zero-length record.
    pub(crate) fn send_stdout_end(&mut self) -> FcgiResult<()> {
        protocol::send_record(self.conn, RecordType::Stdout, self.request_id, &[])?;
        Ok(())
    }
}

/// The application's reaction to one request. The listener calls
/// `do_response` exactly once per BEGIN_REQUEST and then `close`
/// unconditionally; temp resources are additionally reclaimed by `Drop`
/// whatever happens. The returned value becomes the END_REQUEST app
/// status (0 for success).
pub trait Responder {
    fn do_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<u32>;

    fn close(&mut self) {}
}

/// Canned error responder: a single STDOUT record carrying the status
/// line, an HTML content type, a content length, and a minimal HTML
/// body, followed by the STDOUT end marker. App status is 1.
pub struct ErrorResponder {
    code: u16,
}

impl ErrorResponder {
    pub fn bad_request() -> Self {
        Self { code: 400 }
    }

    pub fn not_found() -> Self {
        Self { code: 404 }
    }

    pub fn method_not_allowed() -> Self {
        Self { code: 405 }
    }

    pub fn internal_server_error() -> Self {
        Self { code: 500 }
    }

    pub fn not_implemented() -> Self {
        Self { code: 501 }
    }

    pub fn service_unavailable() -> Self {
        Self { code: 503 }
    }
}

impl Responder for ErrorResponder {
    fn do_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<u32> {
        let herr = format!("{} {}", self.code, status_text(self.code));
        let body = format!("<!doctype html><html><body>{herr}</body></html>");
        let content = format!(
            "Status: {herr}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );

        protocol::send_record(req.conn, RecordType::Stdout, req.request_id, content.as_bytes())?;
        req.send_stdout_end()?;

        Ok(1)
    }
}
