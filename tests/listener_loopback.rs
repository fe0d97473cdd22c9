//! End-to-end over real loopback TCP: bind port 0, run the accept loop
//! on a thread, and speak FastCGI to it the way a web server would.

use fcgihost::protocol::{self, RecordType};
use fcgihost::{
    BufferedApp, Buffering, Config, ErrorResponder, Headers, Request, Response,
    ResponderFactory, StreamApp, Streaming,
};
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// All errors to console for cargo test.
fn test_logger() {
    let _ = simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stdout,
        simplelog::ColorChoice::Auto,
    )]);
}

/// Encode one FastCGI name-value pair.
fn encode_pair(out: &mut Vec<u8>, name: &str, value: &str) {
    for len in [name.len(), value.len()] {
        if len < 128 {
            out.push(len as u8);
        } else {
            out.extend_from_slice(&((len as u32) | (1 << 31)).to_be_bytes());
        }
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Send one complete request over the stream.
fn send_request(stream: &mut TcpStream, params: &[(&str, &str)], stdin: &[u8]) {
    protocol::send_record(stream, RecordType::BeginRequest, 1, &[0, 1, 0, 0, 0, 0, 0, 0])
        .unwrap();
    let mut pbuf = Vec::new();
    for (k, v) in params {
        encode_pair(&mut pbuf, k, v);
    }
    protocol::send_record(stream, RecordType::Params, 1, &pbuf).unwrap();
    protocol::send_record(stream, RecordType::Params, 1, &[]).unwrap();
    if !stdin.is_empty() {
        protocol::send_record(stream, RecordType::Stdin, 1, stdin).unwrap();
    }
    protocol::send_record(stream, RecordType::Stdin, 1, &[]).unwrap();
}

/// Collect (stdout bytes, stderr bytes, app status) from the response.
fn read_response(stream: &mut TcpStream) -> (Vec<u8>, Vec<u8>, u32) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let record = protocol::read_record(stream).expect("response record");
        match record.header.rec_type {
            RecordType::Stdout => stdout.extend_from_slice(&record.content),
            RecordType::Stderr => stderr.extend_from_slice(&record.content),
            RecordType::EndRequest => {
                let app_status = u32::from_be_bytes([
                    record.content[0],
                    record.content[1],
                    record.content[2],
                    record.content[3],
                ]);
                return (stdout, stderr, app_status);
            }
            other => panic!("unexpected record type {other:?}"),
        }
    }
}

struct StaticApp;

impl BufferedApp for StaticApp {
    fn make_response(&mut self, _req: &mut Request<'_>) -> anyhow::Result<Option<Response>> {
        Ok(Some(Response::new(
            Headers::from([("Status", "200 OK"), ("Content-Type", "text/javascript")]),
            "// js",
        )))
    }
}

struct EchoApp;

impl StreamApp for EchoApp {
    fn on_request(&mut self, req: &mut Request<'_>) -> anyhow::Result<()> {
        let mut out = req.open_stdout(Headers::from([("Content-Type", "text/plain")]))?;
        while let Some(data) = req.next_stdin()? {
            out.write(&data)?;
        }
        out.close()?;
        Ok(())
    }
}

/// GET gets the static body, POST gets the chunked echo.
fn selector() -> ResponderFactory {
    Box::new(|req| {
        Some(match req.param("REQUEST_METHOD") {
            Some("GET") => Box::new(Buffering(StaticApp)),
            Some("POST") => Box::new(Streaming(EchoApp)),
            _ => Box::new(ErrorResponder::method_not_allowed()),
        })
    })
}

fn config(nonblocking: bool) -> Config {
    let mut config = Config::default();
    config.bind_addr = fcgihost::BindAddr::Tcp("127.0.0.1".to_string(), 0);
    config.so_timeout = Duration::from_millis(200);
    config.threads = 2;
    config.nonblocking = nonblocking;
    config
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn run_requests_against(nonblocking: bool) {
    test_logger();

    let context = fcgihost::make_context(config(nonblocking), None, Some(selector()));
    let listener = fcgihost::Listener::bind(&context).unwrap();
    let addr = listener.local_addr().unwrap();

    let serve_context = Arc::clone(&context);
    let server = thread::spawn(move || fcgihost::serve(serve_context, listener));

    //  GET a static string body.
    let mut stream = connect(addr);
    send_request(
        &mut stream,
        &[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/a.js")],
        &[],
    );
    let (stdout, stderr, app_status) = read_response(&mut stream);
    assert_eq!(
        stdout,
        b"Status: 200 OK\r\nContent-Type: text/javascript\r\nContent-Length: 5\r\n\r\n// js"
    );
    assert!(stderr.is_empty());
    assert_eq!(app_status, 0);
    drop(stream);

    //  POST a small body; the echo comes back chunked.
    let mut stream = connect(addr);
    send_request(&mut stream, &[("REQUEST_METHOD", "POST")], b"hello");
    let (stdout, _, app_status) = read_response(&mut stream);
    let text = String::from_utf8(stdout).unwrap();
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!text.contains("Content-Length"));
    assert!(text.ends_with("0005\r\nhello\r\n0\r\n\r\n"));
    assert_eq!(app_status, 0);
    drop(stream);

    //  Graceful stop: clear the flag, then wake the accept loop with
    //  the supervisor's one-byte sentinel.
    context.stop();
    let mut sentinel = TcpStream::connect(addr).unwrap();
    let _ = sentinel.write_all(&[0]);
    drop(sentinel);

    server.join().unwrap().unwrap();

    assert!(context.get_stats("socket-accepted") >= 2);
    assert!(context.get_stats("socket-closed") >= 2);
    assert_eq!(context.get_stats("response-ok"), 2);
    let loop_stat = if nonblocking {
        "nonblocking-loop"
    } else {
        "blocking-loop"
    };
    assert!(context.get_stats(loop_stat) >= 1);
}

#[test]
fn blocking_loop_serves_requests() {
    run_requests_against(false);
}

#[test]
fn nonblocking_loop_serves_requests() {
    run_requests_against(true);
}
