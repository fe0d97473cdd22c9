//! Multi-process supervisor: fork N workers over one listening socket,
//! replace the ones that die, and escalate shutdown from SIGTERM to a
//! wake-up byte to SIGKILL.
//!
//! The supervisor rides the event stream. On LISTEN the parent forks
//! its workers (the worker pool does not exist yet, so the process is
//! still single-threaded at that point); children fall through into the
//! accept loop while the parent stays behind to supervise. On ACCEPT a
//! worker checks its request budget. On STOP-LISTENER a worker exits.

use crate::context::{
    self, BindAddr, Config, Context, Event, EventHandler, ResponderFactory,
};
use crate::listener;
use anyhow::Result;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::collections::HashSet;
use std::io::{self, Write as _};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Supervisor options, parsed alongside the core set.
#[derive(Debug, Clone)]
pub struct PreforkOptions {
    /// Number of worker processes.
    pub procs: usize,
    /// Requests a worker serves before it retires (and is replaced).
    pub max_request: u64,
}

impl Default for PreforkOptions {
    fn default() -> Self {
        Self {
            procs: 1,
            max_request: u64::MAX,
        }
    }
}

/// Parse the core flags plus `--procs` and `--max-request` from one
/// argv slice.
pub fn parse_args(args: &[String]) -> Result<(Config, PreforkOptions)> {
    let mut opts = context::core_options();
    opts.optopt("", "procs", "number of processes", "N");
    opts.optopt("", "max-request", "request-limit per process", "N");
    let matches = opts.parse(args)?;

    let config = context::config_from_matches(&matches)?;
    let options = PreforkOptions {
        procs: context::opt_parse(&matches, "procs", 1usize)?,
        max_request: context::opt_parse(&matches, "max-request", u64::MAX)?,
    };
    Ok((config, options))
}

/// Build a context whose event handler runs the supervisor on top of
/// the application's own handler, and install the shutdown signal
/// handlers.
pub fn make_context(
    config: Config,
    options: PreforkOptions,
    event_handler: Option<EventHandler>,
    responder_factory: Option<ResponderFactory>,
) -> Result<Arc<Context>> {
    let hooked: EventHandler = Box::new(move |context, event| {
        if let Some(orig) = &event_handler {
            orig(context, event);
        }
        supervise_event(context, &options, event);
    });
    let context = context::make_context(config, Some(hooked), responder_factory);
    install_signal_handlers(&context)?;
    Ok(context)
}

/// Parse arguments, build the supervised context, bind and serve.
pub fn run(
    args: &[String],
    event_handler: Option<EventHandler>,
    responder_factory: Option<ResponderFactory>,
) -> Result<()> {
    let (config, options) = parse_args(args)?;
    let context = make_context(config, options, event_handler, responder_factory)?;
    listener::start(context)
}

/// The supervisor's slice of the event stream.
fn supervise_event(context: &Context, options: &PreforkOptions, event: Event) {
    match event {
        Event::Accept => {
            if context.get_stats("socket-accepted") > options.max_request {
                log::info!("accept count exceeded max-request, retiring worker");
                context.stop();
            }
        }
        Event::Listen => supervise(context, options),
        Event::StopListener => {
            if context.pid != std::process::id() {
                log::info!("worker {} exiting", std::process::id());
                std::process::exit(0);
            }
        }
        _ => {}
    }
}

/// Fork the workers and supervise them. Children return immediately to
/// fall into the accept loop; the parent loops here until shutdown and
/// then exits the process.
fn supervise(context: &Context, options: &PreforkOptions) {
    let mut workers: HashSet<Pid> = HashSet::new();

    while context.looping() {
        let nfork = options.procs.saturating_sub(workers.len());
        for _ in 0..nfork {
            //  The worker pool is created only after LISTEN, so there
            //  are no threads to lose across this fork.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => return,
                Ok(ForkResult::Parent { child }) => {
                    log::info!("created worker {child}");
                    workers.insert(child);
                }
                Err(e) => {
                    log::error!("fork failed: {e}");
                    break;
                }
            }
        }

        //  Watch for dying workers until shutdown is requested.
        while context.looping() {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        log::warn!("worker {pid} died: {status:?}");
                        workers.remove(&pid);
                        break; // back to the outer loop to refork
                    }
                }
                Err(e) => log::debug!("waitpid: {e}"),
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    shutdown_workers(context, &mut workers);

    if let Some(pid_path) = &context.pid_path {
        if pid_path.exists() {
            log::info!("unlink {}", pid_path.display());
            let _ = std::fs::remove_file(pid_path);
        }
    }
    if let BindAddr::Unix(path) = &context.bind_addr {
        if path.exists() {
            log::info!("unlink {}", path.display());
            let _ = std::fs::remove_file(path);
        }
    }

    log::info!("all done");
    std::process::exit(0);
}

/// Shutdown escalation: SIGTERM everyone, then (in blocking mode) one
/// NUL byte per survivor to wake accept, then SIGKILL.
fn shutdown_workers(context: &Context, workers: &mut HashSet<Pid>) {
    log::info!("detected terminate, start finalize");
    let sleep_sec = context.so_timeout / 2;

    log::info!("send SIGTERM to workers");
    send_signal(Signal::SIGTERM, workers);
    thread::sleep(sleep_sec);
    reap_workers(workers, sleep_sec);

    if !context.nonblocking && !workers.is_empty() {
        //  Workers may be parked waiting for a connection; a one-byte
        //  connection gets them back to the running-flag check.
        log::info!("send wake-up byte to workers");
        if let Err(e) = send_wakeup_packets(&context.bind_addr, workers.len()) {
            log::warn!("wake-up packet failed: {e}");
        }
        thread::sleep(sleep_sec);
        reap_workers(workers, sleep_sec);
    }

    if !workers.is_empty() {
        log::info!("force kill workers");
        send_signal(Signal::SIGKILL, workers);
        thread::sleep(sleep_sec);
        reap_workers(workers, sleep_sec);
    } else {
        log::info!("all workers exited");
    }
    log::info!("end finalize");
}

/// One NUL byte per remaining worker, over a fresh connection each.
fn send_wakeup_packets(bind_addr: &BindAddr, nworkers: usize) -> io::Result<()> {
    for i in 0..nworkers {
        log::info!("send wake-up packet {}/{nworkers}", i + 1);
        match bind_addr {
            BindAddr::Tcp(host, port) => {
                let host = if host.is_empty() { "127.0.0.1" } else { host.as_str() };
                let mut conn = TcpStream::connect((host, *port))?;
                conn.write_all(&[0])?;
            }
            BindAddr::Unix(path) => {
                let mut conn = UnixStream::connect(path)?;
                conn.write_all(&[0])?;
            }
        }
    }
    Ok(())
}

fn send_signal(signum: Signal, workers: &HashSet<Pid>) {
    for pid in workers {
        log::info!("send {signum} to worker {pid}");
        if let Err(e) = kill(*pid, signum) {
            log::warn!("kill {pid}: {e}");
        }
    }
}

/// Reap exited workers with a few retries before giving up.
fn reap_workers(workers: &mut HashSet<Pid>, sleep_sec: Duration) {
    const RETRY: usize = 5;

    for i in 0..RETRY {
        if workers.is_empty() {
            log::info!("no more workers");
            return;
        }
        for _ in 0..workers.len() {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        log::info!("worker {pid} exited: {status:?}");
                        workers.remove(&pid);
                    }
                }
                Err(e) => {
                    log::debug!("waitpid: {e}");
                    break;
                }
            }
        }
        if workers.is_empty() {
            return;
        }
        log::info!("workers still alive, retry {}/{RETRY}", i + 1);
        thread::sleep(sleep_sec);
    }
    log::warn!("gave up waiting for {} workers", workers.len());
}

/// The flag the signal handler flips. Registered once per process.
static RUNNING_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_terminate_signal(signum: nix::libc::c_int) {
    //  Only async-signal-safe work here: store the flag, restore the
    //  default disposition so a second signal is immediately fatal.
    if let Some(flag) = RUNNING_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
    if let Ok(sig) = Signal::try_from(signum) {
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }
}

/// Route SIGTERM/SIGINT to the context's running flag. Children forked
/// later inherit the disposition.
fn install_signal_handlers(context: &Context) -> Result<()> {
    let _ = RUNNING_FLAG.set(context.running_flag());

    let action = SigAction::new(
        SigHandler::Handler(on_terminate_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}
