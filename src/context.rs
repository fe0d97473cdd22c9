//! Process-wide configuration and runtime state shared by workers.

use crate::responder::{Request, Responder};
use anyhow::{Context as _, Result, anyhow, ensure};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where the listener binds. A Unix path supersedes the TCP pair.
#[derive(Debug, Clone)]
pub enum BindAddr {
    /// Host (empty means all interfaces) and port.
    Tcp(String, u16),
    /// Filesystem path of the Unix-domain socket.
    Unix(PathBuf),
}

/// Configuration assembled from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: BindAddr,
    pub pid_path: Option<PathBuf>,
    pub temp_dir: PathBuf,
    /// Worker pool size.
    pub threads: usize,
    /// Selector-based accept loop instead of the blocking one.
    pub nonblocking: bool,
    /// Stdin memory-to-file spill threshold, in bytes.
    pub max_stdio_mem: usize,
    /// Socket read/write timeout.
    pub so_timeout: Duration,
    /// Application extension values.
    pub extra: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: BindAddr::Tcp(String::new(), 9000),
            pid_path: None,
            temp_dir: std::env::temp_dir(),
            threads: 1,
            nonblocking: false,
            max_stdio_mem: usize::MAX,
            so_timeout: Duration::from_secs_f64(3.0),
            extra: HashMap::new(),
        }
    }
}

/// The core option set. The prefork front-end extends this with its own
/// options before parsing.
pub(crate) fn core_options() -> getopts::Options {
    let mut opts = getopts::Options::new();
    opts.optopt("", "chdir", "change work-directory", "DIR");
    opts.optopt("", "pid-path", "pid save full-path", "PATH");
    opts.optopt("", "temp-dir", "temporary directory", "DIR");
    opts.optopt("", "addr", "bind tcp/ip address", "HOST");
    opts.optopt("", "port", "bind tcp/ip port-number", "N");
    opts.optopt("", "file", "bind unix-domain-socket", "PATH");
    opts.optopt("", "threads", "number of threads", "N");
    opts.optopt("", "non-blocking", "use non-blocking select", "0|1");
    opts.optopt("", "max-stdio-mem", "max size of stdin in memory", "BYTES");
    opts.optopt("", "so-timeout", "socket timeout in seconds", "SECS");
    opts
}

/// Parse an option value, falling back to a default when absent.
pub(crate) fn opt_parse<T>(matches: &getopts::Matches, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match matches.opt_str(name) {
        Some(s) => s
            .parse::<T>()
            .map_err(|e| anyhow!("bad --{name} value {s:?}: {e}")),
        None => Ok(default),
    }
}

/// Build a [`Config`] from parsed matches, applying the side effects:
/// `--chdir` happens here, and the pid file is written (ASCII pid, no
/// trailing newline).
pub(crate) fn config_from_matches(matches: &getopts::Matches) -> Result<Config> {
    if let Some(workdir) = matches.opt_str("chdir") {
        std::env::set_current_dir(&workdir).with_context(|| format!("chdir to {workdir}"))?;
    }

    let pid_path = matches.opt_str("pid-path").map(PathBuf::from);
    if let Some(path) = &pid_path {
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("write pid file {}", path.display()))?;
    }

    let bind_addr = match matches.opt_str("file") {
        Some(path) => BindAddr::Unix(PathBuf::from(path)),
        None => BindAddr::Tcp(
            matches.opt_str("addr").unwrap_or_default(),
            opt_parse(matches, "port", 9000u16)?,
        ),
    };

    let so_timeout_secs = opt_parse(matches, "so-timeout", 3.0f64)?;
    ensure!(
        so_timeout_secs >= 0.0 && so_timeout_secs.is_finite(),
        "bad --so-timeout value {so_timeout_secs}"
    );

    Ok(Config {
        bind_addr,
        pid_path,
        temp_dir: matches
            .opt_str("temp-dir")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        threads: opt_parse(matches, "threads", 1usize)?,
        nonblocking: opt_parse(matches, "non-blocking", 0u8)? != 0,
        max_stdio_mem: opt_parse(matches, "max-stdio-mem", usize::MAX)?,
        so_timeout: Duration::from_secs_f64(so_timeout_secs),
        extra: HashMap::new(),
    })
}

/// Parse the core option set from an argv slice (program name already
/// stripped).
pub fn parse_args(args: &[String]) -> Result<Config> {
    let opts = core_options();
    let matches = opts.parse(args)?;
    config_from_matches(&matches)
}

/// Event delivered to the optional application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StartListener,
    Listen,
    Accept,
    Idle,
    StopListener,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::StartListener => "START-LISTENER",
            Event::Listen => "LISTEN",
            Event::Accept => "ACCEPT",
            Event::Idle => "IDLE",
            Event::StopListener => "STOP-LISTENER",
        };
        f.write_str(name)
    }
}

/// Application callback observing listener events.
pub type EventHandler = Box<dyn Fn(&Context, Event) + Send + Sync>;

/// Builds the responder for one request, or nothing to get the canned
/// 501.
pub type ResponderFactory =
    Box<dyn Fn(&Request<'_>) -> Option<Box<dyn Responder>> + Send + Sync>;

/// Process-wide configuration plus the mutable runtime state: the stats
/// counters (behind a mutex) and the running flag. Created once at
/// startup and shared read-mostly by the workers.
pub struct Context {
    /// Pid of the process that created the context. Under prefork this
    /// identifies the parent.
    pub pid: u32,
    pub bind_addr: BindAddr,
    pub pid_path: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub threads: usize,
    pub nonblocking: bool,
    pub max_stdio_mem: usize,
    pub so_timeout: Duration,
    pub extra: HashMap<String, String>,
    stats: Mutex<HashMap<String, u64>>,
    running: Arc<AtomicBool>,
    handler: Option<EventHandler>,
    pub(crate) responder_factory: Option<ResponderFactory>,
}

impl Context {
    pub fn with_handlers(
        config: Config,
        handler: Option<EventHandler>,
        responder_factory: Option<ResponderFactory>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            bind_addr: config.bind_addr,
            pid_path: config.pid_path,
            temp_dir: config.temp_dir,
            threads: config.threads,
            nonblocking: config.nonblocking,
            max_stdio_mem: config.max_stdio_mem,
            so_timeout: config.so_timeout,
            extra: config.extra,
            stats: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
            handler,
            responder_factory,
        }
    }

    pub fn new(config: Config) -> Self {
        Self::with_handlers(config, None, None)
    }

    /// Deliver an event to the application callback, if any.
    pub fn emit(&self, event: Event) {
        if let Some(handler) = &self.handler {
            handler(self, event);
        }
    }

    /// Whether the accept loops should keep going.
    pub fn looping(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown. Workers notice between requests.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Shared handle to the running flag, for signal handlers.
    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bump each named counter by one.
    pub fn incr_stats(&self, keys: &[&str]) {
        let mut stats = self.stats.lock().unwrap();
        for key in keys {
            *stats.entry((*key).to_string()).or_insert(0) += 1;
        }
    }

    /// One counter's current value.
    pub fn get_stats(&self, key: &str) -> u64 {
        self.stats.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Snapshot of all counters.
    pub fn stats(&self) -> HashMap<String, u64> {
        self.stats.lock().unwrap().clone()
    }
}

/// Build the shared context from a parsed configuration and the
/// application's hooks.
pub fn make_context(
    config: Config,
    event_handler: Option<EventHandler>,
    responder_factory: Option<ResponderFactory>,
) -> Arc<Context> {
    Arc::new(Context::with_handlers(config, event_handler, responder_factory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults() {
        let config = parse_args(&[]).unwrap();
        assert!(matches!(&config.bind_addr, BindAddr::Tcp(host, 9000) if host.is_empty()));
        assert_eq!(config.threads, 1);
        assert!(!config.nonblocking);
        assert_eq!(config.max_stdio_mem, usize::MAX);
        assert_eq!(config.so_timeout, Duration::from_secs_f64(3.0));
    }

    #[test]
    fn unix_socket_supersedes_tcp() {
        let config = parse_args(&args(&[
            "--addr",
            "10.0.0.1",
            "--port",
            "9901",
            "--file",
            "/tmp/app.sock",
        ]))
        .unwrap();
        assert!(matches!(&config.bind_addr, BindAddr::Unix(p) if p.ends_with("app.sock")));
    }

    #[test]
    fn numeric_options() {
        let config = parse_args(&args(&[
            "--threads",
            "8",
            "--non-blocking",
            "1",
            "--max-stdio-mem",
            "1048576",
            "--so-timeout",
            "0.25",
        ]))
        .unwrap();
        assert_eq!(config.threads, 8);
        assert!(config.nonblocking);
        assert_eq!(config.max_stdio_mem, 1048576);
        assert_eq!(config.so_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse_args(&args(&["--port", "nine"])).is_err());
        assert!(parse_args(&args(&["--so-timeout", "-1"])).is_err());
        assert!(parse_args(&args(&["--bogus-option", "1"])).is_err());
    }

    #[test]
    fn pid_file_is_written_without_newline() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("app.pid");
        let config =
            parse_args(&args(&["--pid-path", pid_path.to_str().unwrap()])).unwrap();
        assert_eq!(config.pid_path.as_deref(), Some(pid_path.as_path()));
        let written = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written, std::process::id().to_string());
    }

    #[test]
    fn stats_are_monotonic() {
        let context = Context::new(Config::default());
        assert_eq!(context.get_stats("socket-accepted"), 0);
        context.incr_stats(&["socket-accepted"]);
        context.incr_stats(&["socket-accepted", "socket-closed"]);
        assert_eq!(context.get_stats("socket-accepted"), 2);
        assert_eq!(context.get_stats("socket-closed"), 1);
        let snapshot = context.stats();
        assert_eq!(snapshot["socket-accepted"], 2);
    }

    #[test]
    fn running_flag() {
        let context = Context::new(Config::default());
        assert!(context.looping());
        context.stop();
        assert!(!context.looping());
    }

    #[test]
    fn event_names() {
        assert_eq!(Event::StartListener.to_string(), "START-LISTENER");
        assert_eq!(Event::Listen.to_string(), "LISTEN");
        assert_eq!(Event::Accept.to_string(), "ACCEPT");
        assert_eq!(Event::Idle.to_string(), "IDLE");
        assert_eq!(Event::StopListener.to_string(), "STOP-LISTENER");
    }

    #[test]
    fn events_reach_the_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let handler: EventHandler = Box::new(move |_context, event| {
            seen2.lock().unwrap().push(event);
        });
        let context = Context::with_handlers(Config::default(), Some(handler), None);
        context.emit(Event::Listen);
        context.emit(Event::Idle);
        assert_eq!(*seen.lock().unwrap(), vec![Event::Listen, Event::Idle]);
    }
}
