//! Error kinds for the FastCGI runtime.
//!
//! The listener sorts request failures into buckets: the peer is gone
//! (abandon the request, send nothing), the application signalled
//! something through a sentinel (app status 241/242), or a real error
//! that becomes a 500 page on STDOUT.

use std::io;

/// Result alias used throughout the protocol layer.
pub type FcgiResult<T> = Result<T, FcgiError>;

/// Failures of the record codec, the responder machinery, and the
/// request loop.
#[derive(Debug, thiserror::Error)]
pub enum FcgiError {
    /// Peer closed or reset the connection. The request is abandoned
    /// without an END_REQUEST record.
    #[error("peer closed the connection")]
    ConnectionClosed,

    /// Malformed record, unexpected record type, or bad params encoding.
    /// Handled like a dead connection.
    #[error("FastCGI protocol error: {0}")]
    Protocol(String),

    /// BEGIN_REQUEST carried FCGI_KEEP_CONN. Keep-alive is unsupported.
    #[error("keep-alive connections are not supported")]
    KeepConnUnsupported,

    /// Raised by an application to say the response was already handled
    /// some other way. Maps to app status 241.
    #[error("response already handled by the application")]
    UnnecessaryResponse,

    /// The response header block already went out.
    #[error("response header already sent")]
    HeaderAlreadySent,

    /// The stdin stream was already consumed. Iteration is single-shot.
    #[error("stdin stream already consumed")]
    StdinConsumed,

    /// write() on a chunked stream after it was closed.
    #[error("chunked stream already closed")]
    StreamClosed,

    /// A buffering responder produced neither a response nor a stream.
    #[error("responder produced no response")]
    NoResponse,

    /// The application failed after response headers were sent. No second
    /// header block may be emitted; maps to app status 242.
    #[error("application failed after response headers were sent: {0:#}")]
    ResponseInProgress(anyhow::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FcgiError {
    /// True when the error means the peer is simply gone. Timeouts are
    /// not included; those become 500 responses upstream.
    pub fn is_connection_error(&self) -> bool {
        match self {
            FcgiError::ConnectionClosed => true,
            FcgiError::Io(e) => io_means_disconnect(e),
            _ => false,
        }
    }
}

/// Whether an io error indicates the peer hung up, as opposed to a
/// timeout or a local problem.
pub(crate) fn io_means_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// What the request loop should do about a responder failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// Abandon the request; the peer is gone.
    Connection,
    /// App status 241, END_REQUEST, nothing on STDOUT.
    Unnecessary,
    /// App status 242; the header block is out, so no 500 page.
    InProgress,
    /// App status 242 after a 500 page with an error code.
    Fatal,
}

/// Classify an application-level failure. Looks through the anyhow
/// chain for a typed [`FcgiError`] or a bare [`io::Error`].
pub(crate) fn failure_kind(err: &anyhow::Error) -> FailureKind {
    if let Some(fe) = err.downcast_ref::<FcgiError>() {
        return match fe {
            FcgiError::ConnectionClosed
            | FcgiError::Protocol(_)
            | FcgiError::KeepConnUnsupported => FailureKind::Connection,
            FcgiError::Io(e) if io_means_disconnect(e) => FailureKind::Connection,
            FcgiError::UnnecessaryResponse => FailureKind::Unnecessary,
            FcgiError::ResponseInProgress(_) => FailureKind::InProgress,
            _ => FailureKind::Fatal,
        };
    }
    if let Some(ioe) = err.downcast_ref::<io::Error>() {
        if io_means_disconnect(ioe) {
            return FailureKind::Connection;
        }
    }
    FailureKind::Fatal
}

#[test]
fn classify_failures() {
    use anyhow::anyhow;

    let e = anyhow::Error::from(FcgiError::ConnectionClosed);
    assert_eq!(failure_kind(&e), FailureKind::Connection);

    let e = anyhow::Error::from(FcgiError::UnnecessaryResponse);
    assert_eq!(failure_kind(&e), FailureKind::Unnecessary);

    let e = anyhow::Error::from(FcgiError::ResponseInProgress(anyhow!("boom")));
    assert_eq!(failure_kind(&e), FailureKind::InProgress);

    let e = anyhow::Error::from(FcgiError::NoResponse);
    assert_eq!(failure_kind(&e), FailureKind::Fatal);

    let e = anyhow::Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
    assert_eq!(failure_kind(&e), FailureKind::Connection);

    //  A read timeout is not a disconnect; it must surface as a 500.
    let e = anyhow::Error::from(io::Error::new(io::ErrorKind::WouldBlock, "timed out"));
    assert_eq!(failure_kind(&e), FailureKind::Fatal);

    let e = anyhow!("some application failure");
    assert_eq!(failure_kind(&e), FailureKind::Fatal);
}
