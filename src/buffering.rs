//! Buffering responders: stdin fully reassembled before the application
//! runs, spilling to a temp file past a size threshold, with the
//! response emitted in one pass.
//
// Normal usage:
//
//     struct App;
//     impl BufferedApp for App {
//         fn make_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<Option<Response>> {
//             let len = req.open_stdin()?.len();
//             Ok(Some(Response::new(
//                 Headers::from([("Status", "200 OK"), ("Content-Type", "text/plain")]),
//                 len.to_string(),
//             )))
//         }
//     }

use crate::error::{FcgiError, FcgiResult};
use crate::responder::{Request, Responder};
use crate::response::Response;
use crate::streaming;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::ops::Deref;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Backing store of a reassembled stdin stream. A temp file is deleted
/// when the request drops; a plain file path (the result of persisting)
/// is left alone.
#[derive(Debug)]
pub enum StdinBuffer {
    Memory(Vec<u8>),
    TempFile(NamedTempFile),
    File(PathBuf),
}

impl StdinBuffer {
    /// Size of the reassembled stream in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(match self {
            StdinBuffer::Memory(buf) => buf.len() as u64,
            StdinBuffer::TempFile(tmpf) => fs::metadata(tmpf.path())?.len(),
            StdinBuffer::File(path) => fs::metadata(path)?.len(),
        })
    }
}

/// Scoped read-only view over a stdin backing, independent of where the
/// bytes ended up.
pub enum StdinView<'a> {
    Memory(&'a [u8]),
    Mapped(Mmap),
}

impl StdinView<'_> {
    fn map_file(path: &Path) -> FcgiResult<StdinView<'static>> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            //  mmap of an empty file fails; an empty slice is the same view.
            return Ok(StdinView::Memory(&[]));
        }
        //  Safety: read-only map of a file this request owns; nothing
        //  truncates it while the view is alive.
        let map = unsafe { Mmap::map(&file)? };
        Ok(StdinView::Mapped(map))
    }
}

impl Deref for StdinView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            StdinView::Memory(mem) => mem,
            StdinView::Mapped(map) => map,
        }
    }
}

/// Same filesystem object check (device and inode), tolerating a target
/// that does not exist yet.
fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    let ma = fs::metadata(a)?;
    let mb = match fs::metadata(b) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

impl Request<'_> {
    fn new_stdin_tempfile(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("fcgihost-stdin-")
            .suffix(".tmp")
            .tempfile_in(&self.context.temp_dir)
    }

    /// Drain the STDIN stream into a backing store.
    ///
    /// A declared CONTENT_LENGTH above the configured memory cap goes
    /// straight to a temp file. A declared length within the cap gets an
    /// exact buffer (a peer sending more than it declared is a protocol
    /// error). An undeclared length buffers in memory until the cap is
    /// crossed, then promotes: the accumulated bytes are flushed to a
    /// temp file and further records are written there.
    fn fill_stdin(&mut self) -> FcgiResult<StdinBuffer> {
        let declared = usize::try_from(self.content_length()?).unwrap_or(usize::MAX);
        let max_mem = self.context.max_stdio_mem;

        let mut backing = if declared > max_mem {
            StdinBuffer::TempFile(self.new_stdin_tempfile()?)
        } else {
            StdinBuffer::Memory(Vec::with_capacity(declared))
        };
        let fixed_len = (declared > 0 && declared <= max_mem).then_some(declared);

        while let Some(chunk) = self.next_stdin()? {
            backing = match backing {
                StdinBuffer::Memory(mut buf) => {
                    if let Some(limit) = fixed_len {
                        if buf.len() + chunk.len() > limit {
                            return Err(FcgiError::Protocol(format!(
                                "stdin exceeds declared CONTENT_LENGTH {limit}"
                            )));
                        }
                        buf.extend_from_slice(&chunk);
                        StdinBuffer::Memory(buf)
                    } else if buf.len() + chunk.len() > max_mem {
                        //  Over the cap: flush what we have to a temp file
                        //  and keep writing there.
                        let mut tmpf = self.new_stdin_tempfile()?;
                        tmpf.as_file_mut().write_all(&buf)?;
                        tmpf.as_file_mut().write_all(&chunk)?;
                        StdinBuffer::TempFile(tmpf)
                    } else {
                        buf.extend_from_slice(&chunk);
                        StdinBuffer::Memory(buf)
                    }
                }
                StdinBuffer::TempFile(mut tmpf) => {
                    tmpf.as_file_mut().write_all(&chunk)?;
                    StdinBuffer::TempFile(tmpf)
                }
                StdinBuffer::File(_) => unreachable!("stdin persisted before it was filled"),
            };
        }

        if let StdinBuffer::TempFile(tmpf) = &mut backing {
            tmpf.as_file_mut().flush()?;
        }
        Ok(backing)
    }

    fn need_stdin(&mut self) -> FcgiResult<()> {
        if self.stdin_buf.is_none() {
            let backing = self.fill_stdin()?;
            self.stdin_buf = Some(backing);
        }
        Ok(())
    }

    /// The raw stdin backing: bytes in memory, or the file they spilled
    /// to. Drains the STDIN stream on first use.
    pub fn stdin(&mut self) -> FcgiResult<&StdinBuffer> {
        self.need_stdin()?;
        Ok(self.stdin_buf.as_ref().expect("stdin buffer just filled"))
    }

    /// Read-only random access to stdin regardless of backing; a file
    /// backing is memory-mapped.
    pub fn open_stdin(&mut self) -> FcgiResult<StdinView<'_>> {
        self.need_stdin()?;
        match self.stdin_buf.as_ref().expect("stdin buffer just filled") {
            StdinBuffer::Memory(buf) => Ok(StdinView::Memory(buf)),
            StdinBuffer::TempFile(tmpf) => StdinView::map_file(tmpf.path()),
            StdinBuffer::File(path) => StdinView::map_file(path),
        }
    }

    /// Write the reassembled stdin to `wpath`.
    ///
    /// A memory backing is written out; a temp-file backing is renamed
    /// into place (the backing becomes a plain path and stops being
    /// deleted when the request drops); a plain-file backing is copied
    /// unless source and target are already the same filesystem object.
    pub fn write_stdin_to_file(&mut self, wpath: &Path) -> FcgiResult<()> {
        self.need_stdin()?;
        let backing = self.stdin_buf.take().expect("stdin buffer just filled");

        let replaced = match backing {
            StdinBuffer::Memory(buf) => {
                fs::write(wpath, &buf)?;
                StdinBuffer::Memory(buf)
            }
            StdinBuffer::TempFile(tmpf) => {
                if wpath.exists() {
                    log::info!("unlink {}", wpath.display());
                    fs::remove_file(wpath)?;
                }
                tmpf.persist(wpath).map_err(|e| FcgiError::Io(e.error))?;
                StdinBuffer::File(wpath.to_path_buf())
            }
            StdinBuffer::File(rpath) => {
                if !same_file(&rpath, wpath)? {
                    fs::copy(&rpath, wpath)?;
                }
                StdinBuffer::File(rpath)
            }
        };

        self.stdin_buf = Some(replaced);
        Ok(())
    }
}

/// The application half of a buffering responder: all of stdin is
/// available for random access, and the whole response is returned in
/// one piece. Returning `None` is only valid when the application
/// streamed its own output through `open_stdout`.
pub trait BufferedApp {
    fn make_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<Option<Response>>;
}

/// Adapter turning a [`BufferedApp`] into a [`Responder`].
pub struct Buffering<A>(pub A);

impl<A: BufferedApp> Responder for Buffering<A> {
    fn do_response(&mut self, req: &mut Request<'_>) -> anyhow::Result<u32> {
        let app = &mut self.0;
        streaming::drive(req, |req| {
            let stdout_data = app.make_response(req)?;

            if req.stdout_sent() {
                //  The chunked path was already used; returning a
                //  response on top of that is a contract violation.
                if stdout_data.is_some() {
                    return Err(FcgiError::HeaderAlreadySent.into());
                }
            } else {
                match stdout_data {
                    None => return Err(FcgiError::NoResponse.into()),
                    Some(resp) => {
                        req.send_response(&resp)?;
                        req.send_stdout_end()?;
                        //  resp drops here; a temp-file body is unlinked.
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::context::{Config, Context};
    use crate::protocol::{RecordType, wire};
    use std::collections::HashMap;

    fn stdin_wire(request_id: u16, chunks: &[&[u8]]) -> Vec<u8> {
        let mut input = Vec::new();
        for chunk in chunks {
            input.extend(wire::record_bytes(RecordType::Stdin, request_id, chunk));
        }
        input.extend(wire::record_bytes(RecordType::Stdin, request_id, &[]));
        input
    }

    fn request_with_content_length<'c>(
        context: &'c Context,
        conn: &'c mut Connection,
        content_length: Option<usize>,
    ) -> Request<'c> {
        let mut params = HashMap::new();
        if let Some(n) = content_length {
            params.insert("CONTENT_LENGTH".to_string(), n.to_string());
        }
        Request::new(context, conn, "test".into(), 1, params)
    }

    #[test]
    fn in_memory_reassembly() {
        let context = Context::new(Config::default());
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"hel", b"lo"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(5));

        match req.stdin().unwrap() {
            StdinBuffer::Memory(buf) => assert_eq!(buf, b"hello"),
            other => panic!("expected memory backing, got {other:?}"),
        }
        //  Second access reuses the backing; the stream is not re-read.
        assert_eq!(req.stdin().unwrap().len().unwrap(), 5);
        assert_eq!(&*req.open_stdin().unwrap(), b"hello");
    }

    #[test]
    fn declared_length_over_cap_spills_up_front() {
        let mut config = Config::default();
        config.max_stdio_mem = 4;
        let context = Context::new(config);
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"hello", b" world"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(11));

        let spill_path = match req.stdin().unwrap() {
            StdinBuffer::TempFile(tmpf) => {
                assert_eq!(fs::read(tmpf.path()).unwrap(), b"hello world");
                tmpf.path().to_path_buf()
            }
            other => panic!("expected temp-file backing, got {other:?}"),
        };
        assert_eq!(&*req.open_stdin().unwrap(), b"hello world");

        //  The spill file goes away with the request.
        drop(req);
        assert!(!spill_path.exists());
    }

    #[test]
    fn undeclared_length_promotes_past_the_cap() {
        let mut config = Config::default();
        config.max_stdio_mem = 8;
        let context = Context::new(config);
        let (mut conn, _peer) =
            Connection::test(stdin_wire(1, &[b"0123", b"4567", b"89ab", b"cdef"]));
        let mut req = request_with_content_length(&context, &mut conn, None);

        match req.stdin().unwrap() {
            StdinBuffer::TempFile(tmpf) => {
                assert_eq!(fs::read(tmpf.path()).unwrap(), b"0123456789abcdef");
            }
            other => panic!("expected promotion to a temp file, got {other:?}"),
        }
    }

    #[test]
    fn overflowing_the_declared_length_is_a_protocol_error() {
        let context = Context::new(Config::default());
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"too much data"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(4));
        assert!(matches!(req.stdin(), Err(FcgiError::Protocol(_))));
    }

    #[test]
    fn empty_stdin() {
        let context = Context::new(Config::default());
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[]));
        let mut req = request_with_content_length(&context, &mut conn, None);
        assert_eq!(req.stdin().unwrap().len().unwrap(), 0);
        assert_eq!(&*req.open_stdin().unwrap(), b"");
    }

    #[test]
    fn write_stdin_to_file_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.bin");

        let context = Context::new(Config::default());
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"payload"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(7));

        req.write_stdin_to_file(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        //  Backing is still the bytes.
        assert!(matches!(req.stdin().unwrap(), StdinBuffer::Memory(_)));
    }

    #[test]
    fn write_stdin_to_file_persists_a_spill_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("kept.bin");
        fs::write(&target, b"old contents").unwrap();

        let mut config = Config::default();
        config.max_stdio_mem = 2;
        let context = Context::new(config);
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"payload"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(7));

        req.write_stdin_to_file(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert!(matches!(req.stdin().unwrap(), StdinBuffer::File(_)));

        //  Persisted: dropping the request must not delete the target.
        drop(req);
        assert!(target.exists());
    }

    #[test]
    fn write_stdin_to_file_same_path_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("kept.bin");

        let mut config = Config::default();
        config.max_stdio_mem = 2;
        let context = Context::new(config);
        let (mut conn, _peer) = Connection::test(stdin_wire(1, &[b"payload"]));
        let mut req = request_with_content_length(&context, &mut conn, Some(7));

        req.write_stdin_to_file(&target).unwrap();
        //  Same target again: the backing is already that file.
        req.write_stdin_to_file(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }
}
