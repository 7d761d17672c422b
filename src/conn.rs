//! Connection state machine
//!
//! A connection owns the transport, the current exchange and the service
//! ring. It's driven by readable/writable events, each event runs the state
//! machine until it has to wait for more input or for the socket to drain.
use std::cmp::min;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Host, ServerContext};
use crate::error::{Error, HttpError};
use crate::packet::Packet;
use crate::pipeline::{self, Exchange};
use crate::queue::{Ctx, Direction, QueueSet, ServiceRing};
use crate::request::{BodyKind, Request};
use crate::response::Response;
use crate::version::Version;


const READ_SIZE: usize = 8192;

/// Byte stream the connection talks over
///
/// Both `read` and `write` are expected to be non-blocking and report
/// `WouldBlock` unless `set_blocking(true, ..)` was called.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn set_blocking(&mut self, _blocking: bool, _timeout: Duration)
        -> io::Result<()>
    {
        Ok(())
    }
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the request head
    Begin,
    /// Reading the request body
    Content,
    /// Pipeline runs, no more input needed
    Processing,
    /// Response is fully written
    Complete,
}

/// Connection parts the stages may touch
pub struct ConnCore {
    transport: Box<dyn Transport>,
    pub ctx: Arc<ServerContext>,
    /// Host serving the current request, switched by the `Host` header
    pub host: Arc<Host>,
    pub state: ConnState,
    /// Requests left before the connection is closed
    pub keep_alive_count: u32,
    pub expire: Instant,
    pub peer: Option<SocketAddr>,
    pub requests: u64,
    pub(crate) serviceq: ServiceRing,
    pub(crate) input: Vec<u8>,
    pub(crate) disconnected: bool,
    pub(crate) write_blocked: bool,
    pub(crate) read_eof: bool,
    blocking: bool,
}

impl ConnCore {
    pub(crate) fn new(ctx: Arc<ServerContext>, transport: Box<dyn Transport>)
        -> ConnCore
    {
        let host = ctx.default_host().clone();
        ConnCore {
            peer: transport.peer_addr(),
            transport,
            keep_alive_count: host.limits.max_keep_alive,
            expire: Instant::now() + host.limits.keep_alive_timeout,
            host,
            ctx,
            state: ConnState::Begin,
            requests: 0,
            serviceq: ServiceRing::default(),
            input: Vec::new(),
            disconnected: false,
            write_blocked: false,
            read_eof: false,
            blocking: false,
        }
    }
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
        let timeout = self.host.limits.write_block_timeout;
        if let Err(e) = self.transport.set_blocking(blocking, timeout) {
            warn!("can't switch socket blocking mode: {}", e);
        }
    }
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
    /// Marks the connection for immediate close
    pub fn disconnect(&mut self) {
        if !self.disconnected {
            debug!("disconnecting {:?}", self.peer);
        }
        self.disconnected = true;
        self.keep_alive_count = 0;
        self.serviceq.clear();
    }
    fn write_all_now(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            match self.transport.write(buf) {
                Ok(0) => break,
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("early write failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Fails the request replacing its body by an error (or redirect) page
///
/// Only the first failure counts. When the headers are already on the wire
/// the page can't be sent anymore and the connection is closed after the
/// response instead.
pub(crate) fn fail(req: &mut Request, resp: &mut Response,
                   queues: &mut QueueSet, core: &mut ConnCore,
                   code: u16, msg: &str)
{
    if req.failed {
        debug!("request already failed, ignoring {} {}", code, msg);
        return;
    }
    req.failed = true;
    if code >= 500 {
        error!("{} {}: {} {}", req.method, req.uri, code, msg);
    } else {
        info!("{} {}: {} {}", req.method, req.uri, code, msg);
    }
    if resp.headers_created() {
        core.keep_alive_count = 0;
        return;
    }
    let document = req.location.as_ref()
        .and_then(|loc| loc.error_documents.get(&code))
        .filter(|url| **url != req.url)
        .cloned();
    match document {
        Some(url) => {
            let host = core.host.clone();
            resp.redirect(302, &url, req, &host);
        }
        None => resp.set_error_body(code, msg),
    }
    if req.method == crate::request::Method::Head {
        resp.no_body = true;
    }
    queues.discard_data(Direction::Send);
}

impl<'a> Ctx<'a> {
    pub fn host(&self) -> &Arc<Host> {
        &self.conn.host
    }
    /// Fails the request, keep-alive is preserved
    pub fn fail_request(&mut self, code: u16, msg: &str) {
        fail(self.req, self.resp, self.queues, self.conn, code, msg);
    }
    /// Fails the request and closes the connection after the response
    pub fn fail_connection(&mut self, code: u16, msg: &str) {
        self.conn.keep_alive_count = 0;
        fail(self.req, self.resp, self.queues, self.conn, code, msg);
    }
    pub fn fail_with(&mut self, err: &Error) {
        let (code, _) = err.http_status();
        self.fail_connection(code, &err.to_string());
    }
    /// Aborts the connection dropping everything that's not written yet
    pub fn disconnect(&mut self) {
        self.conn.disconnect();
        for dir in &[Direction::Send, Direction::Receive] {
            let ids: Vec<_> = self.queues.chain(*dir).to_vec();
            for qid in ids {
                self.queues.clean(qid);
            }
        }
    }
}

enum Step {
    Proceed,
    NeedInput,
    Wait,
}

pub struct Conn {
    core: ConnCore,
    exchange: Option<Exchange>,
}

impl Conn {
    pub fn new(ctx: Arc<ServerContext>, transport: Box<dyn Transport>)
        -> Conn
    {
        Conn {
            core: ConnCore::new(ctx, transport),
            exchange: None,
        }
    }
    pub fn state(&self) -> ConnState {
        self.core.state
    }
    pub fn core(&self) -> &ConnCore {
        &self.core
    }
    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }
    pub fn keep_alive_count(&self) -> u32 {
        self.core.keep_alive_count
    }
    pub fn is_closed(&self) -> bool {
        self.core.disconnected
    }
    /// Output is blocked, the socket must be polled for writability
    pub fn wants_write(&self) -> bool {
        self.core.write_blocked && !self.core.disconnected
    }
    pub fn expire(&self) -> Instant {
        self.core.expire
    }
    /// Disconnects the connection if it's past its deadline
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.core.disconnected || now < self.core.expire {
            return false;
        }
        info!("connection {:?} timed out in {:?} state",
              self.core.peer, self.core.state);
        self.core.disconnect();
        self.close_exchange();
        true
    }

    pub fn process_read_event(&mut self) {
        if self.core.disconnected {
            return;
        }
        self.read_input();
        self.process();
    }

    pub fn process_write_event(&mut self) {
        if self.core.disconnected {
            return;
        }
        self.core.write_blocked = false;
        if let Some(ref mut ex) = self.exchange {
            ex.resume_output(&mut self.core);
        }
        self.process();
    }

    /// Reads everything available, returns whether anything new arrived
    fn read_input(&mut self) -> bool {
        if self.core.read_eof {
            return false;
        }
        let mut progress = false;
        let mut buf = [0u8; READ_SIZE];
        loop {
            if self.core.state == ConnState::Content
                && self.core.input.len() >= self.core.host.limits.queue_max
            {
                // body backlog, the rest is read once the handler catches up
                break;
            }
            match self.core.transport.read(&mut buf) {
                Ok(0) => {
                    self.core.read_eof = true;
                    return true;
                }
                Ok(n) => {
                    self.core.input.extend_from_slice(&buf[..n]);
                    progress = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("read error on {:?}: {}", self.core.peer, e);
                    self.core.disconnect();
                    break;
                }
            }
        }
        progress
    }

    /// Runs the state machine as long as it can make progress
    fn process(&mut self) {
        while !self.core.disconnected {
            let step = match self.core.state {
                ConnState::Begin => self.parse_request(),
                ConnState::Content => self.process_content(),
                ConnState::Processing => self.process_pipeline(),
                ConnState::Complete => self.process_completion(),
            };
            match step {
                Step::Proceed => continue,
                Step::NeedInput => {
                    if !self.read_input() {
                        break;
                    }
                }
                Step::Wait => break,
            }
        }
        if !self.core.disconnected && self.core.read_eof
            && self.core.state == ConnState::Begin
        {
            // client is gone and there is no complete request left
            self.core.disconnect();
        }
        if self.core.disconnected {
            self.close_exchange();
        }
        let limits = &self.core.host.limits;
        let timeout = if self.core.state == ConnState::Begin {
            limits.keep_alive_timeout
        } else {
            limits.request_timeout
        };
        self.core.expire = Instant::now() + timeout;
    }

    fn close_exchange(&mut self) {
        if let Some(mut ex) = self.exchange.take() {
            ex.teardown(&mut self.core);
        }
    }

    fn parse_request(&mut self) -> Step {
        let limits = self.core.host.limits.clone();
        let skip = self.core.input.iter()
            .position(|&c| c != b'\r' && c != b'\n')
            .unwrap_or(self.core.input.len());
        self.core.input.drain(..skip);
        let end = match self.core.input.windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            Some(pos) => pos + 4,
            None if self.core.input.len() > limits.max_header_size => {
                self.start_failed(Error::HeadersAreTooLarge);
                return Step::Proceed;
            }
            None => return Step::NeedInput,
        };
        if end > limits.max_header_size {
            self.start_failed(Error::HeadersAreTooLarge);
            return Step::Proceed;
        }
        let head: Vec<u8> = self.core.input.drain(..end).collect();
        self.core.requests += 1;
        self.core.keep_alive_count = self.core.keep_alive_count
            .saturating_sub(1);

        let mut req = Request::new(&limits);
        req.client = self.core.peer;
        let result = req.parse_head(&head, &limits);
        if let Some(ref name) = req.host_name {
            self.core.host = self.core.ctx.host(name);
        }
        if self.core.host.trace.enabled {
            debug!(target: "embed_http::trace", "request head:\n{}",
                   String::from_utf8_lossy(&head));
        }
        if req.close_requested
            || req.version == Version::Http10 && !req.keep_alive_requested
            || req.body == BodyKind::Eof
        {
            self.core.keep_alive_count = 0;
        }
        let failure = match result {
            Ok(()) => None,
            Err(e) => {
                // can't find where the body ends, so can't keep alive
                self.core.keep_alive_count = 0;
                Some((e.http_status().0, e.to_string()))
            }
        };
        let mut ex = pipeline::create(&mut self.core, req, failure);
        if ex.req.has_body() && ex.req.failed {
            // the body is not read, so it can't be skipped to the next
            // request
            self.core.keep_alive_count = 0;
        }
        if ex.req.has_body() && !ex.req.failed {
            if ex.req.expect_continue && ex.req.version == Version::Http11 {
                self.core.write_all_now(b"HTTP/1.1 100 Continue\r\n\r\n");
            }
            self.core.state = ConnState::Content;
        } else {
            self.core.state = ConnState::Processing;
            ex.run(&mut self.core);
        }
        self.exchange = Some(ex);
        Step::Proceed
    }

    /// Starts an exchange for a request whose head can't be parsed
    fn start_failed(&mut self, err: Error) {
        let limits = self.core.host.limits.clone();
        self.core.input.clear();
        self.core.keep_alive_count = 0;
        let req = Request::new(&limits);
        let failure = Some((err.http_status().0, err.to_string()));
        let mut ex = pipeline::create(&mut self.core, req, failure);
        self.core.state = ConnState::Processing;
        ex.run(&mut self.core);
        self.exchange = Some(ex);
    }

    fn process_content(&mut self) -> Step {
        let Conn { ref mut core, ref mut exchange } = *self;
        let ex = match exchange.as_mut() {
            Some(ex) => ex,
            None => {
                core.state = ConnState::Begin;
                return Step::Proceed;
            }
        };
        if core.input.is_empty() && !core.read_eof {
            return Step::NeedInput;
        }
        let room = ex.receive_room(core);
        if room == 0 {
            // handler must consume its queue first, input stays buffered
            debug!("receive queue of {} {} is full", ex.req.method, ex.req.url);
            return Step::Wait;
        }
        let mut data = Vec::new();
        let done = match ex.req.body {
            BodyKind::Fixed(_) => {
                let n = min(min(ex.req.remaining_content,
                                core.input.len() as u64),
                            room as u64) as usize;
                data.extend(core.input.drain(..n));
                ex.req.remaining_content -= n as u64;
                ex.req.remaining_content == 0
            }
            BodyKind::Chunked => {
                match ex.req.chunk.decode(&core.input, &mut data, room) {
                    Ok(n) => {
                        core.input.drain(..n);
                    }
                    Err(e) => {
                        let qid = ex.queues.head(Direction::Send);
                        if let Some(qid) = qid {
                            ex.ctx(core, qid).fail_with(&e);
                        }
                        core.state = ConnState::Processing;
                        ex.run(core);
                        return Step::Proceed;
                    }
                }
                ex.req.remaining_content = ex.req.chunk.remaining()
                    .unwrap_or(u64::max_value());
                ex.req.chunk.is_done()
            }
            BodyKind::Eof => {
                let n = min(core.input.len(), room);
                data.extend(core.input.drain(..n));
                let done = core.read_eof && core.input.is_empty();
                if done {
                    ex.req.remaining_content = 0;
                }
                done
            }
        };
        if data.is_empty() && !done {
            if core.read_eof {
                debug!("premature end of request body from {:?}", core.peer);
                core.disconnect();
                return Step::Wait;
            }
            return Step::NeedInput;
        }
        ex.req.received_content += data.len() as u64;
        if ex.req.received_content > core.host.limits.max_body {
            if let Some(qid) = ex.queues.head(Direction::Send) {
                ex.ctx(core, qid).fail_with(&Error::PayloadTooLarge);
            }
            core.state = ConnState::Processing;
            ex.run(core);
            return Step::Proceed;
        }
        if !data.is_empty() {
            ex.put_incoming(core, Packet::data(data));
        }
        if ex.req.failed {
            // input filter rejected the body, the rest is not read
            core.keep_alive_count = 0;
            core.state = ConnState::Processing;
            ex.run(core);
            return Step::Proceed;
        }
        if done {
            ex.put_incoming(core, Packet::end());
            core.state = ConnState::Processing;
            ex.run(core);
        }
        Step::Proceed
    }

    fn process_pipeline(&mut self) -> Step {
        let Conn { ref mut core, ref mut exchange } = *self;
        match exchange.as_mut() {
            Some(ex) => ex.service(core),
            None => core.state = ConnState::Complete,
        }
        if core.state == ConnState::Complete {
            Step::Proceed
        } else {
            Step::Wait
        }
    }

    fn process_completion(&mut self) -> Step {
        if let Some(mut ex) = self.exchange.take() {
            let req = &ex.req;
            info!(target: "embed_http::access", "{} \"{} {} {}\" {} {} {:?}",
                  self.core.peer.map_or_else(|| "-".to_string(),
                                             |p| p.ip().to_string()),
                  req.method, req.uri, req.version, ex.resp.code,
                  ex.resp.bytes_written, req.started.elapsed());
            ex.teardown(&mut self.core);
        }
        if self.core.keep_alive_count == 0 {
            self.core.disconnect();
            return Step::Wait;
        }
        self.core.state = ConnState::Begin;
        self.core.host = self.core.ctx.default_host().clone();
        Step::Proceed
    }
}
