//! Socket listener: bind, the two accept loops, and the per-connection
//! request loop.
//!
//! One accepted connection carries exactly one request (keep-alive is
//! not supported): BEGIN_REQUEST, the PARAMS stream, the responder, one
//! END_REQUEST, then a half-close drain and close.

use crate::connection::{self, Connection};
use crate::context::{BindAddr, Context, Event};
use crate::error::{self, FailureKind, FcgiError};
use crate::protocol::{
    self, BeginRequestBody, EndRequestBody, ProtocolStatus, Record, RecordType, Role,
};
use crate::responder::{ErrorResponder, Request, Responder};
use crate::response::{self, Headers, Response, status_text};
use anyhow::Result;
use mio::unix::SourceFd;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::{Mode, umask};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Duration;
use threadpool::ThreadPool;
use uuid::Uuid;

/// Listening socket for either address family.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind per the context's address. A pre-existing Unix socket file
    /// is unlinked first, and the umask is held at 0o111 across the
    /// bind so the socket node comes out world-non-executable.
    pub fn bind(context: &Context) -> Result<Listener> {
        match &context.bind_addr {
            BindAddr::Tcp(host, port) => {
                let listener = if host.is_empty() {
                    TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port))?
                } else {
                    TcpListener::bind((host.as_str(), *port))?
                };
                log::info!("listening on {:?}", listener.local_addr()?);
                Ok(Listener::Tcp(listener))
            }
            BindAddr::Unix(path) => {
                if path.exists() {
                    log::info!("unlink {}", path.display());
                    std::fs::remove_file(path)?;
                }
                let oldmask = umask(Mode::from_bits_truncate(0o111));
                let bound = UnixListener::bind(path);
                umask(oldmask);
                log::info!("listening on {}", path.display());
                Ok(Listener::Unix(bound?))
            }
        }
    }

    /// Local TCP address, for callers that bound port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Listener::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Accept one connection; the accepted socket is always switched to
    /// blocking mode whatever the listener's mode was.
    fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok((Connection::Tcp(stream), addr.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok((Connection::Unix(stream), format!("{addr:?}")))
            }
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}

/// Bind and serve until the context's running flag clears.
pub fn start(context: Arc<Context>) -> Result<()> {
    context.emit(Event::StartListener);
    let listener = Listener::bind(&context)?;
    context.emit(Event::Listen);
    let result = serve(Arc::clone(&context), listener);
    context.emit(Event::StopListener);
    result
}

/// Run the accept loop over an already-bound listener. Split from
/// [`start`] so callers can bind port 0 and learn the address first.
pub fn serve(context: Arc<Context>, listener: Listener) -> Result<()> {
    let pool = ThreadPool::new(context.threads.max(1));

    let result = if context.nonblocking {
        nonblocking_loop(&context, &listener, &pool)
    } else {
        blocking_loop(&context, &listener, &pool)
    };

    //  Let in-flight requests finish before tearing down.
    pool.join();

    //  The process that bound a Unix socket removes its node again.
    if let BindAddr::Unix(path) = &context.bind_addr {
        if context.pid == std::process::id() && path.exists() {
            log::info!("unlink {}", path.display());
            let _ = std::fs::remove_file(path);
        }
    }

    result
}

/// Clamp a duration to a poll(2) timeout in milliseconds.
fn poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
}

/// Blocking accept loop: wait for readiness with the socket timeout,
/// then accept synchronously.
fn blocking_loop(context: &Arc<Context>, listener: &Listener, pool: &ThreadPool) -> Result<()> {
    while context.looping() {
        context.incr_stats(&["blocking-loop"]);

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        let nready = match poll(&mut fds, poll_timeout(context.so_timeout)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue, // signal; re-check the flag
            Err(e) => return Err(e.into()),
        };

        if nready == 0 {
            context.incr_stats(&["socket-timeout"]);
            context.emit(Event::Idle);
            continue;
        }
        accept_submit(context, listener, pool);
    }
    Ok(())
}

/// Selector-based accept loop: the listener runs non-blocking and is
/// registered with a readiness poll.
fn nonblocking_loop(context: &Arc<Context>, listener: &Listener, pool: &ThreadPool) -> Result<()> {
    const ACCEPT: mio::Token = mio::Token(0);

    listener.set_nonblocking(true)?;
    let raw_fd = listener.as_fd().as_raw_fd();
    let mut selector = mio::Poll::new()?;
    let mut events = mio::Events::with_capacity(8);
    selector
        .registry()
        .register(&mut SourceFd(&raw_fd), ACCEPT, mio::Interest::READABLE)?;

    while context.looping() {
        context.incr_stats(&["nonblocking-loop"]);

        match selector.poll(&mut events, Some(context.so_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        if events.is_empty() {
            context.incr_stats(&["select-timeout"]);
            context.emit(Event::Idle);
            continue;
        }
        for _event in events.iter() {
            accept_submit(context, listener, pool);
        }
    }
    Ok(())
}

/// Accept one connection and hand it to the pool. If shutdown was
/// requested in the meantime the connection is dropped unread; the
/// supervisor's wake-up byte must never reach the record decoder.
fn accept_submit(context: &Arc<Context>, listener: &Listener, pool: &ThreadPool) {
    match listener.accept() {
        Ok((conn, client)) => {
            if !context.looping() {
                return;
            }
            context.incr_stats(&["socket-accepted"]);
            context.emit(Event::Accept);
            let context = Arc::clone(context);
            pool.execute(move || on_accepted(context, conn, client));
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            context.incr_stats(&["socket-blockerr"]);
            log::debug!("accept would block: {e}, ignore");
        }
        Err(e) => log::error!("accept failed: {e}"),
    }
}

/// Worker entry: run the request loop, then half-close, drain, close.
fn on_accepted(context: Arc<Context>, mut conn: Connection, client: String) {
    log::debug!("accepted connection from {client}");

    if let Err(e) = process_request(&context, &mut conn, &client) {
        log::error!("request from {client} failed: {e:#}");
    }

    connection::close_socket(&mut conn);
    context.incr_stats(&["socket-closed"]);
    log::debug!("request done, from {client}");
}

/// Drive one connection through the request cycle. Records other than
/// BEGIN_REQUEST are skipped until a request starts; after the
/// responder runs, exactly one END_REQUEST is sent (unless the peer is
/// already gone) and the connection is done.
pub fn process_request(context: &Context, conn: &mut Connection, client: &str) -> Result<()> {
    conn.set_read_timeout(Some(context.so_timeout))?;

    loop {
        let record = match protocol::read_record(conn) {
            Ok(record) => record,
            Err(e) if e.is_connection_error() => {
                log::debug!("connection from {client} closed before a request: {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if record.header.rec_type != RecordType::BeginRequest {
            log::debug!(
                "skipping record type {:?} while waiting for BEGIN_REQUEST",
                record.header.rec_type
            );
            continue;
        }
        let request_id = record.header.request_id;

        let app_status = match run_request(context, conn, client, request_id, &record) {
            Ok(status) => status,
            Err(e) => match error::failure_kind(&e) {
                FailureKind::Connection => {
                    log::debug!("connection from {client} lost: {e:#}");
                    return Ok(());
                }
                FailureKind::Unnecessary => 241,
                FailureKind::InProgress => {
                    log::error!("responder for {client} failed mid-stream: {e:#}");
                    242
                }
                FailureKind::Fatal => {
                    send_fatal_error(conn, request_id, &e);
                    242
                }
            },
        };

        let endreq = EndRequestBody {
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        };
        if let Err(e) = protocol::send_record(
            conn,
            RecordType::EndRequest,
            request_id,
            &endreq.to_bytes(),
        ) {
            if e.is_connection_error() {
                log::debug!("peer {client} gone before END_REQUEST: {e}");
            } else {
                return Err(e.into());
            }
        }

        //  Keep-alive is not supported: one request per connection.
        return Ok(());
    }
}

/// The fallible middle of the request cycle, separated so the caller
/// can map each failure kind onto an app status.
fn run_request(
    context: &Context,
    conn: &mut Connection,
    client: &str,
    request_id: u16,
    begin: &Record,
) -> Result<u32> {
    let begreq = BeginRequestBody::from_content(&begin.content)?;
    if begreq.keep_conn() {
        log::error!("peer requested keep-alive, unsupported");
        return Err(FcgiError::KeepConnUnsupported.into());
    }
    if begreq.role != Role::Responder as u16 {
        log::warn!("unsupported role {}, continuing as responder", begreq.role);
    }

    let mut params = HashMap::new();
    loop {
        let record = protocol::read_record(conn)?;
        if record.header.request_id != request_id {
            return Err(FcgiError::Protocol(format!(
                "request id changed from {request_id} to {} in PARAMS stream",
                record.header.request_id
            ))
            .into());
        }
        if record.header.rec_type != RecordType::Params {
            return Err(FcgiError::Protocol(format!(
                "expected PARAMS, got {:?}",
                record.header.rec_type
            ))
            .into());
        }
        if record.header.content_length == 0 {
            break;
        }
        params.extend(protocol::decode_params(&record.content)?);
    }

    let mut request = Request::new(context, conn, client.to_string(), request_id, params);
    let mut responder: Box<dyn Responder> = match &context.responder_factory {
        Some(factory) => match factory(&request) {
            Some(responder) => responder,
            None => Box::new(ErrorResponder::not_implemented()),
        },
        None => Box::new(ErrorResponder::not_implemented()),
    };

    let result = responder.do_response(&mut request);
    responder.close();

    match result {
        Ok(status) => {
            context.incr_stats(&["response-ok"]);
            Ok(status)
        }
        Err(e) => {
            context.incr_stats(&["response-ng"]);
            Err(e)
        }
    }
}

/// Emit the 500 page with a fresh error code on STDOUT and the error
/// chain on STDERR. Failures here are swallowed; a degenerate peer must
/// not take the worker down.
fn send_fatal_error(conn: &mut Connection, request_id: u16, err: &anyhow::Error) {
    if let Err(e) = try_send_fatal_error(conn, request_id, err) {
        log::debug!("fatal-error report failed: {e}");
    }
}

fn try_send_fatal_error(
    conn: &mut Connection,
    request_id: u16,
    err: &anyhow::Error,
) -> crate::error::FcgiResult<()> {
    let errcode = Uuid::new_v4();
    let textmsg = format!("error-code={errcode}");
    let htmlmsg = format!("<html><body>{textmsg}</body></html>");

    let mut headers = Headers::new();
    headers.set("Status", format!("500 {}", status_text(500)));
    headers.set("Content-Type", "text/html; charset=utf-8");

    let hresp = Response::new(headers, htmlmsg);
    response::send_response(conn, request_id, &hresp)?;
    protocol::send_record(conn, RecordType::Stdout, request_id, &[])?;

    //  One line for the server log: the error code plus the flattened
    //  cause chain.
    let chain = err
        .chain()
        .map(|cause| cause.to_string().replace('\n', " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("; ");
    let logmsg = format!("{textmsg}; {chain}");
    log::error!("{logmsg}");
    protocol::send_record(conn, RecordType::Stderr, request_id, logmsg.as_bytes())?;
    protocol::send_record(conn, RecordType::Stderr, request_id, &[])?;
    Ok(())
}
