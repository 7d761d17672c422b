//! Embeddable HTTP/1.x server
//!
//! Every request is served by a pipeline of stages: a handler producing
//! the response, output filters transforming it and a connector writing it
//! to the socket. Request bodies flow the opposite way through input
//! filters. Stages talk through queues with backpressure, so neither side
//! buffers more than the configured limits.

extern crate httparse;
extern crate mio;
extern crate slab;
#[macro_use] extern crate quick_error;
#[macro_use] extern crate log;
#[cfg(test)] extern crate matches;

pub mod auth;
pub mod config;
pub mod conn;
pub mod error;
pub mod headers;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod response;
pub mod server;
pub mod stage;
pub mod stages;
mod date;
mod version;

pub use crate::config::{Host, Limits, Location, ServerContext};
pub use crate::conn::{Conn, ConnState, Transport};
pub use crate::error::{Error, HttpError};
pub use crate::packet::Packet;
pub use crate::queue::{Ctx, Direction};
pub use crate::request::{Method, Request};
pub use crate::response::Response;
pub use crate::server::Server;
pub use crate::stage::{Methods, Stage, StageKind};
pub use crate::version::Version;
