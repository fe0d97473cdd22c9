//! Streaming responders: lazy stdin iteration and a chunked-transfer
//! stdout writer.
//
// Normal usage:
//
//     struct Echo;
//     impl StreamApp for Echo {
//         fn on_request(&mut self, req: &mut Request<'_>) -> anyhow::Result<()> {
//             let mut out = req.open_stdout(Headers::from([("Content-Type", "text/plain")]))?;
//             while let Some(data) = req.next_stdin()? {
//                 out.write(&data)?;
//             }
//             out.close()?;
//             Ok(())
//         }
//     }

use crate::connection::Connection;
use crate::error::{self, FcgiError, FcgiResult};
use crate::protocol::{self, PACKET_IO_CONTENT_LEN, RecordType};
use crate::responder::{Request, Responder};
use crate::response::{Headers, Response};

/// Placeholder chunk-size prefix: four hex digits and CRLF.
const CHUNK_PREFIX: &[u8] = b"****\r\n";
const CHUNK_SUFFIX: &[u8] = b"\r\n";
/// HTTP chunk-stream terminator.
const CHUNK_END: &[u8] = b"0\r\n\r\n";
/// Payload capacity of one chunk: the record payload minus the size
/// prefix and the trailing CRLF.
const CHUNK_PAYLOAD_LEN: usize = PACKET_IO_CONTENT_LEN - CHUNK_PREFIX.len() - CHUNK_SUFFIX.len();

impl Request<'_> {
    /// Pull the next STDIN payload; `None` at the zero-length
    /// terminator. The stream can be consumed once. Asking again fails
    /// with [`FcgiError::StdinConsumed`], or
    /// [`FcgiError::HeaderAlreadySent`] once the response header block
    /// is out (a responder that still needed stdin has lost its chance
    /// to report a clean error page).
    pub fn next_stdin(&mut self) -> FcgiResult<Option<Vec<u8>>> {
        if self.stdin_done {
            return Err(if self.stdout_sent {
                FcgiError::HeaderAlreadySent
            } else {
                FcgiError::StdinConsumed
            });
        }

        let record = protocol::read_record(self.conn)?;
        if record.header.request_id != self.request_id {
            return Err(FcgiError::Protocol(format!(
                "request id changed from {} to {} mid-stream",
                self.request_id, record.header.request_id
            )));
        }
        if record.header.rec_type != RecordType::Stdin {
            return Err(FcgiError::Protocol(format!(
                "expected STDIN, got {:?}",
                record.header.rec_type
            )));
        }
        if record.header.content_length == 0 {
            self.stdin_done = true;
            return Ok(None);
        }
        Ok(Some(record.content))
    }

    /// Open the chunked response stream. The header block goes out
    /// immediately with `Transfer-Encoding: chunked` forced (the body
    /// length is unknowable at this point, so any `Content-Length` is
    /// dropped). Opening twice fails.
    pub fn open_stdout(&mut self, headers: Headers) -> FcgiResult<ChunkedStream> {
        if self.stdout_sent {
            return Err(FcgiError::HeaderAlreadySent);
        }
        self.stdout_sent = true;

        let chunked_response = Response::chunked(headers);
        protocol::send_record(
            self.conn,
            RecordType::Stdout,
            self.request_id,
            &chunked_response.serialize_headers()?,
        )?;

        Ok(ChunkedStream::new(self.conn.try_clone()?, self.request_id))
    }
}

/// Chunked-transfer writer over STDOUT records.
///
/// Owns a fixed send buffer of exactly one record payload with the
/// layout `"xxxx\r\n" + payload + "\r\n"`; a full buffer goes out as a
/// single STDOUT record after the four hex digits are patched in place.
/// Single producer: the stream owns its buffer exclusively and is not
/// meant to be shared across threads.
pub struct ChunkedStream {
    conn: Connection,
    request_id: u16,
    sndbuf: Box<[u8; PACKET_IO_CONTENT_LEN]>,
    /// Next free byte in `sndbuf`.
    pos: usize,
    closed: bool,
}

impl ChunkedStream {
    fn new(conn: Connection, request_id: u16) -> Self {
        let mut sndbuf = Box::new([0u8; PACKET_IO_CONTENT_LEN]);
        sndbuf[..CHUNK_PREFIX.len()].copy_from_slice(CHUNK_PREFIX);
        sndbuf[PACKET_IO_CONTENT_LEN - CHUNK_SUFFIX.len()..].copy_from_slice(CHUNK_SUFFIX);
        Self {
            conn,
            request_id,
            sndbuf,
            pos: CHUNK_PREFIX.len(),
            closed: false,
        }
    }

    /// Patch the 4-hex-digit chunk size into the prefix.
    fn set_chunk_size(&mut self, len: usize) {
        let hex = format!("{len:04x}");
        self.sndbuf[..4].copy_from_slice(hex.as_bytes());
    }

    /// Buffer bytes, emitting each filled 8176-byte chunk as one STDOUT
    /// record. Empty writes are ignored: a zero-length chunk would
    /// terminate the HTTP chunked stream early.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> FcgiResult<usize> {
        if self.closed {
            return Err(FcgiError::StreamClosed);
        }
        let mut mem = data.as_ref();
        if mem.is_empty() {
            return Ok(0);
        }

        let mut sum_send = 0;
        while !mem.is_empty() {
            let space = CHUNK_PREFIX.len() + CHUNK_PAYLOAD_LEN - self.pos;
            let advance = mem.len().min(space);
            self.sndbuf[self.pos..self.pos + advance].copy_from_slice(&mem[..advance]);
            self.pos += advance;
            mem = &mem[advance..];

            if self.pos == CHUNK_PREFIX.len() + CHUNK_PAYLOAD_LEN {
                //  No more space: ship the whole buffer and reuse it.
                self.set_chunk_size(CHUNK_PAYLOAD_LEN);
                sum_send += protocol::send_record(
                    &mut self.conn,
                    RecordType::Stdout,
                    self.request_id,
                    &self.sndbuf[..],
                )?;
                self.pos = CHUNK_PREFIX.len();
            }
        }
        Ok(sum_send)
    }

    fn close_inner(&mut self) -> FcgiResult<()> {
        self.closed = true;

        if self.pos > CHUNK_PREFIX.len() {
            //  Flush the partial chunk: patch the size, terminate the
            //  payload with CRLF, send the effective prefix of the buffer.
            let payload = self.pos - CHUNK_PREFIX.len();
            self.set_chunk_size(payload);
            let effective = self.pos + CHUNK_SUFFIX.len();
            self.sndbuf[self.pos..effective].copy_from_slice(CHUNK_SUFFIX);
            protocol::send_record(
                &mut self.conn,
                RecordType::Stdout,
                self.request_id,
                &self.sndbuf[..effective],
            )?;
        }

        //  Terminate the HTTP chunk stream, then the STDOUT stream.
        protocol::send_record(&mut self.conn, RecordType::Stdout, self.request_id, CHUNK_END)?;
        protocol::send_record(&mut self.conn, RecordType::Stdout, self.request_id, &[])?;
        Ok(())
    }

    /// Flush the partial chunk, send the `0\r\n\r\n` terminator, and
    /// close the STDOUT stream. Taking the stream by value makes a
    /// second close unrepresentable; `Drop` covers unwinding paths.
    pub fn close(mut self) -> FcgiResult<()> {
        self.close_inner()
    }
}

impl Drop for ChunkedStream {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                log::warn!("chunked stream close failed: {e}");
            }
        }
    }
}

/// The application half of a streaming responder.
pub trait StreamApp {
    fn on_request(&mut self, req: &mut Request<'_>) -> anyhow::Result<()>;
}

/// Adapter turning a [`StreamApp`] into a [`Responder`] with the shared
/// failure discipline.
pub struct Streaming<A>(pub A);

impl<A: StreamApp> Responder for Streaming<A> {
    fn do_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<u32> {
        let app = &mut self.0;
        drive(req, |req| app.on_request(req))
    }
}

/// Run an application callback with the shared failure discipline:
/// typed sentinels and dead connections propagate as-is; any other
/// failure after the header block went out must not produce a second
/// header, so it is wrapped in [`FcgiError::ResponseInProgress`] for
/// the listener.
pub(crate) fn drive(
    req: &mut Request<'_>,
    f: impl FnOnce(&mut Request<'_>) -> anyhow::Result<()>,
) -> anyhow::Result<u32> {
    match f(req) {
        Ok(()) => Ok(0),
        Err(e) => {
            let pass_through = match e.downcast_ref::<FcgiError>() {
                Some(FcgiError::Io(ioe)) => error::io_means_disconnect(ioe),
                Some(_) => true,
                None => e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(error::io_means_disconnect),
            };
            if pass_through || !req.stdout_sent() {
                Err(e)
            } else {
                Err(FcgiError::ResponseInProgress(e).into())
            }
        }
    }
}
