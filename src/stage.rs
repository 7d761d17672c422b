//! The stage trait implemented by handlers, filters and connectors
use std::fmt;
use std::ops::BitOr;

use crate::config::{Host, Location};
use crate::packet::Packet;
use crate::queue::{Ctx, default_service};
use crate::request::{Method, Request};
use crate::response::Response;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Produces the response (and consumes the request body)
    Handler,
    /// Transforms data passing through
    Filter,
    /// Moves bytes between the pipeline and the network
    Connector,
}

/// Set of request methods a stage supports
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Methods(u16);

impl Methods {
    pub const GET: Methods = Methods(1 << 0);
    pub const HEAD: Methods = Methods(1 << 1);
    pub const POST: Methods = Methods(1 << 2);
    pub const PUT: Methods = Methods(1 << 3);
    pub const DELETE: Methods = Methods(1 << 4);
    pub const OPTIONS: Methods = Methods(1 << 5);
    pub const TRACE: Methods = Methods(1 << 6);
    pub const ALL: Methods = Methods(0x7f);

    pub fn empty() -> Methods {
        Methods(0)
    }
    pub fn of(method: Method) -> Methods {
        match method {
            Method::Get => Methods::GET,
            Method::Head => Methods::HEAD,
            Method::Post => Methods::POST,
            Method::Put => Methods::PUT,
            Method::Delete => Methods::DELETE,
            Method::Options => Methods::OPTIONS,
            Method::Trace => Methods::TRACE,
        }
    }
    pub fn contains(self, method: Method) -> bool {
        self.0 & Methods::of(method).0 != 0
    }
    /// Value for the `Allow` header
    pub fn allow_header(self) -> String {
        Method::all().iter()
            .filter(|m| self.contains(**m))
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl BitOr for Methods {
    type Output = Methods;
    fn bitor(self, other: Methods) -> Methods {
        Methods(self.0 | other.0)
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Methods({})", self.allow_header())
    }
}

/// A processing stage of the request pipeline
///
/// A stage is registered once in the `ServerContext` and shared between
/// all connections, so per-request state must go into the queue (see
/// `Ctx::set_data`). Every callback has a default, a stage overrides only
/// what it needs.
///
/// The `*_data` callbacks receive packets put by the previous stage, the
/// `*_service` callbacks are called when the queue is scheduled.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> StageKind;
    /// Methods the handler accepts, others are answered with 405
    fn methods(&self) -> Methods {
        Methods::GET | Methods::HEAD | Methods::POST
    }
    /// Virtual handlers don't map the URL to the filesystem
    fn is_virtual(&self) -> bool {
        false
    }
    /// Handler produces partial content itself, range filter is skipped
    fn handles_ranges(&self) -> bool {
        false
    }
    /// Custom match used when neither a location handler nor an extension
    /// mapping selected the handler
    fn matches(&self, _req: &Request, _location: &Location) -> bool {
        true
    }
    /// Called for every handler before matching, may rewrite the request
    ///
    /// Returns `true` when the request was fully answered (e.g. redirected)
    /// and matching must stop.
    fn modify(&self, _req: &mut Request, _resp: &mut Response, _host: &Host)
        -> bool
    {
        false
    }
    fn open(&self, _cx: &mut Ctx) {}
    fn start(&self, _cx: &mut Ctx) {}
    /// Called once on the handler when the whole request is received
    fn run(&self, _cx: &mut Ctx) {}
    fn close(&self, _cx: &mut Ctx) {}

    /// Body data reaching the stage
    ///
    /// The handler's receive queue is bounded by `Limits::queue_max` and the
    /// connection stops reading the body while it's full, so a handler
    /// accepting larger bodies takes packets off with `Ctx::get` as they
    /// arrive.
    fn incoming_data(&self, cx: &mut Ctx, packet: Packet) {
        default_incoming_data(cx, packet)
    }
    fn incoming_service(&self, cx: &mut Ctx) {
        default_service(cx)
    }
    fn outgoing_data(&self, cx: &mut Ctx, packet: Packet) {
        cx.put_for_service(packet, true)
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        default_service(cx)
    }
}

impl fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stage({})", self.name())
    }
}

/// Passes incoming packets on, the handler keeps them in its queue
///
/// When the end of a `application/x-www-form-urlencoded` body reaches the
/// handler, the body is parsed into form variables.
pub fn default_incoming_data(cx: &mut Ctx, packet: Packet) {
    if cx.next().is_some() {
        cx.put_next(packet);
        return;
    }
    let end = packet.is_end();
    cx.put_for_service(packet, false);
    if end {
        cx.queue_mut().eof = true;
        if cx.req.is_form() {
            let body: Vec<u8> = cx.queue().packets()
                .flat_map(|p| p.content().iter().cloned())
                .collect();
            cx.req.add_form_vars(&body);
        }
    }
}

/// Drops body data for handlers that don't use the request body
pub fn discard_incoming_data(cx: &mut Ctx, packet: Packet) {
    if packet.is_data() {
        return;
    }
    default_incoming_data(cx, packet);
}

#[cfg(test)]
mod test {
    use crate::request::Method;
    use super::Methods;

    #[test]
    fn method_sets() {
        let m = Methods::GET | Methods::HEAD;
        assert!(m.contains(Method::Get));
        assert!(m.contains(Method::Head));
        assert!(!m.contains(Method::Post));
        assert_eq!(m.allow_header(), "GET,HEAD");
        assert!(Methods::ALL.contains(Method::Trace));
        assert!(!Methods::empty().contains(Method::Get));
    }
}
