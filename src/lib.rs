//! FastCGI hosting runtime.
//!
//! Accepts connections from an upstream web server over TCP or a
//! Unix-domain socket, decodes the FastCGI record protocol into
//! requests, dispatches each request to an application-supplied
//! responder, and encodes the responder's output back onto the
//! connection as records.
//
// Normal usage:
//
//     pub fn main() -> anyhow::Result<()> {
//         let args: Vec<String> = std::env::args().skip(1).collect();
//         let config = fcgihost::parse_args(&args)?;
//         let factory: fcgihost::ResponderFactory =
//             Box::new(|_req| Some(Box::new(fcgihost::Buffering(MyApp))));
//         let context = fcgihost::make_context(config, None, Some(factory));
//         fcgihost::start(context)
//     }
//
//! Multiplexing is not supported: one connection carries one request,
//! and FCGI_KEEP_CONN is rejected. Web servers distribute load across
//! worker threads (`--threads`) and, through the `prefork` module,
//! across worker processes.

mod error;

pub mod buffering;
pub mod connection;
pub mod context;
pub mod listener;
pub mod prefork;
pub mod protocol;
pub mod responder;
pub mod response;
pub mod streaming;

pub use crate::buffering::{BufferedApp, Buffering, StdinBuffer, StdinView};
pub use crate::connection::Connection;
pub use crate::context::{
    BindAddr, Config, Context, Event, EventHandler, ResponderFactory, make_context, parse_args,
};
pub use crate::error::{FcgiError, FcgiResult};
pub use crate::listener::{Listener, serve, start};
pub use crate::responder::{ErrorResponder, Request, Responder};
pub use crate::response::{Body, Headers, Response};
pub use crate::streaming::{ChunkedStream, StreamApp, Streaming};
