//! Stream abstraction over the two socket families the listener
//! accepts, plus the half-close drain used when a request ends.

use crate::protocol::PACKET_IO_LEN;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// One accepted upstream connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
    #[cfg(test)]
    Test(test_stream::TestStream),
}

impl Connection {
    /// Clone the underlying handle. Both handles refer to the same
    /// socket; the chunked stdout writer holds one while the request
    /// keeps the other for stdin.
    pub fn try_clone(&self) -> io::Result<Connection> {
        match self {
            Connection::Tcp(s) => Ok(Connection::Tcp(s.try_clone()?)),
            Connection::Unix(s) => Ok(Connection::Unix(s.try_clone()?)),
            #[cfg(test)]
            Connection::Test(s) => Ok(Connection::Test(s.clone())),
        }
    }

    /// Read timeout; `None` blocks forever. A zero duration is treated
    /// as no timeout (std rejects it outright).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        match self {
            Connection::Tcp(s) => s.set_read_timeout(timeout),
            Connection::Unix(s) => s.set_read_timeout(timeout),
            #[cfg(test)]
            Connection::Test(_) => Ok(()),
        }
    }

    /// Half-close: no more writes from this side.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.shutdown(Shutdown::Write),
            Connection::Unix(s) => s.shutdown(Shutdown::Write),
            #[cfg(test)]
            Connection::Test(_) => Ok(()),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            Connection::Unix(s) => s.read(buf),
            #[cfg(test)]
            Connection::Test(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            Connection::Unix(s) => s.write(buf),
            #[cfg(test)]
            Connection::Test(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            Connection::Unix(s) => s.flush(),
            #[cfg(test)]
            Connection::Test(s) => s.flush(),
        }
    }
}

/// How long the drain after half-close is allowed to take.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Shut down the write side, then read off whatever the peer still has
/// queued before the caller drops the socket. Closing with unread
/// inbound bytes would hand the web server a RST while it may still be
/// flushing toward us. Errors here are ignored; the connection is done
/// either way.
pub fn close_socket(conn: &mut Connection) {
    if let Err(e) = conn.shutdown_write() {
        log::debug!("shutdown on close: {e}");
    }
    let _ = conn.set_read_timeout(Some(DRAIN_TIMEOUT));

    let mut buff = [0u8; PACKET_IO_LEN];
    loop {
        match conn.read(&mut buff) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("drain on close: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_stream {
    use std::io::{self, Cursor, Read, Write};
    use std::sync::{Arc, Mutex};

    /// In-memory connection for tests: a scripted input and a shared,
    /// captured output. Clones share both, the way cloned socket
    /// handles share the descriptor.
    #[derive(Debug, Clone)]
    pub struct TestStream {
        input: Arc<Mutex<Cursor<Vec<u8>>>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl TestStream {
        pub fn new(input: Vec<u8>) -> Self {
            Self {
                input: Arc::new(Mutex::new(Cursor::new(input))),
                output: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Everything the code under test has written so far.
        pub fn output(&self) -> Vec<u8> {
            self.output.lock().unwrap().clone()
        }
    }

    impl Read for TestStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.lock().unwrap().read(buf)
        }
    }

    impl Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
impl Connection {
    /// A scripted connection plus the handle for inspecting its output.
    pub(crate) fn test(input: Vec<u8>) -> (Connection, test_stream::TestStream) {
        let stream = test_stream::TestStream::new(input);
        (Connection::Test(stream.clone()), stream)
    }
}

#[test]
fn close_drains_leftover_input() {
    let (mut conn, _peer) = Connection::test(vec![0u8; 3 * PACKET_IO_LEN + 17]);
    close_socket(&mut conn);
    let mut buf = [0u8; 1];
    //  Everything was consumed by the drain.
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
}
