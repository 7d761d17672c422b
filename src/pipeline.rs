//! Pipeline assembly: handler selection, queue chains and their lifecycle
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::config::{AuthKind, Host, Location, ServerContext};
use crate::conn::{ConnCore, fail};
use crate::error::{Error, HttpError};
use crate::packet::Packet;
use crate::queue::{Ctx, Direction, QueueId, QueueSet};
use crate::request::{FileInfo, Method, Request};
use crate::response::Response;
use crate::stage::{Stage, StageKind};
use crate::version::Version;


/// Limit of internal url rewrites (directory index) per request
pub const MAX_REWRITE: u32 = 20;

const PATH: &AsciiSet = &CONTROLS
    .add(b' ').add(b'"').add(b'#').add(b'%').add(b'<').add(b'>')
    .add(b'?').add(b'`').add(b'{').add(b'}');

/// Request, response and the queues connecting the stages serving them
pub struct Exchange {
    pub req: Request,
    pub resp: Response,
    pub(crate) queues: QueueSet,
    ran: bool,
}

impl Exchange {
    pub(crate) fn ctx<'a>(&'a mut self, core: &'a mut ConnCore, qid: QueueId)
        -> Ctx<'a>
    {
        Ctx::new(qid, &mut self.queues, &mut self.req, &mut self.resp, core)
    }
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Hands body data from the connection to the receive chain
    pub(crate) fn put_incoming(&mut self, core: &mut ConnCore,
                               packet: Packet)
    {
        match self.queues.head(Direction::Receive) {
            Some(qid) => {
                let mut cx = self.ctx(core, qid);
                cx.put(qid, packet);
                cx.service_queues();
            }
            None => debug!("no receive pipeline, dropping {:?}", packet),
        }
    }

    /// Body bytes the handler's receive queue can take before it's full
    ///
    /// A full queue is scheduled first, giving the handler a chance to
    /// consume what it has. Without a receive chain there is no limit.
    pub(crate) fn receive_room(&mut self, core: &mut ConnCore) -> usize {
        let qid = match self.queues.tail(Direction::Receive) {
            Some(qid) => qid,
            None => return usize::max_value(),
        };
        if self.queues[qid].count() >= self.queues[qid].max {
            self.queues[qid].full = true;
            let mut cx = self.ctx(core, qid);
            cx.schedule(qid);
            cx.service_queues();
        }
        let q = &self.queues[qid];
        q.max.saturating_sub(q.count())
    }

    /// Kicks off the handler once the whole request is received
    pub(crate) fn run(&mut self, core: &mut ConnCore) {
        if self.ran {
            return;
        }
        self.ran = true;
        let qid = match self.queues.head(Direction::Send) {
            Some(qid) => qid,
            None => return,
        };
        let stage = self.queues[qid].stage.clone();
        let mut cx = self.ctx(core, qid);
        if cx.req.failed {
            cx.put_end();
        } else {
            stage.run(&mut cx);
        }
        cx.service_queues();
    }

    /// Services scheduled queues until nothing is left to do
    pub(crate) fn service(&mut self, core: &mut ConnCore) {
        if let Some(qid) = self.queues.head(Direction::Send) {
            self.ctx(core, qid).service_queues();
        }
    }

    /// Schedules the connector after the socket became writable
    pub(crate) fn resume_output(&mut self, core: &mut ConnCore) {
        if let Some(qid) = self.queues.tail(Direction::Send) {
            let mut cx = self.ctx(core, qid);
            cx.enable(qid);
            cx.service_queues();
        }
    }

    fn open(&mut self, core: &mut ConnCore) {
        // the handler goes last so filters may fail the request first,
        // and it's opened on its send queue, where `run` finds its data
        let head = self.queues.head(Direction::Send);
        let mut order: Vec<QueueId> = self.queues.chain(Direction::Send)
            .iter().skip(1).cloned().collect();
        order.extend(self.queues.chain(Direction::Receive).iter().cloned()
            .filter(|&qid| head.is_none() || self.queues[qid].pair != head));
        order.extend(head);
        for qid in order {
            let q = &self.queues[qid];
            if q.open || q.pair.map_or(false, |p| self.queues[p].open) {
                continue;
            }
            let stage = q.stage.clone();
            if self.req.failed && stage.kind() == StageKind::Handler {
                continue;
            }
            self.queues[qid].open = true;
            stage.open(&mut self.ctx(core, qid));
        }
        let ids: Vec<QueueId> = self.queues.ids().collect();
        for qid in ids {
            let q = &self.queues[qid];
            if !q.open || q.started
                || q.pair.map_or(false, |p| self.queues[p].started)
            {
                continue;
            }
            let stage = q.stage.clone();
            self.queues[qid].started = true;
            stage.start(&mut self.ctx(core, qid));
        }
    }

    /// Closes every open queue and removes temporary uploads
    pub(crate) fn teardown(&mut self, core: &mut ConnCore) {
        let ids: Vec<QueueId> = self.queues.ids().collect();
        for qid in ids {
            if !self.queues[qid].open {
                continue;
            }
            self.queues[qid].open = false;
            let stage = self.queues[qid].stage.clone();
            stage.close(&mut self.ctx(core, qid));
        }
        self.resp.file = None;
        let auto_delete = self.req.location.as_ref()
            .map_or(true, |l| l.auto_delete_uploads);
        if auto_delete {
            for file in self.req.files.drain(..) {
                if let Err(e) = fs::remove_file(&file.filename) {
                    debug!("can't remove upload {:?}: {}", file.filename, e);
                }
            }
        }
        core.serviceq.clear();
    }
}

/// Builds the pipeline for a parsed request
///
/// A `failure` collapses the pipeline to the pass handler serving the
/// error page, it's used when the request head can't be parsed.
pub(crate) fn create(core: &mut ConnCore, req: Request,
                     failure: Option<(u16, String)>)
    -> Exchange
{
    let ctx = core.ctx.clone();
    let host = core.host.clone();
    let mut ex = Exchange {
        req,
        resp: Response::new(),
        queues: QueueSet::new(),
        ran: false,
    };
    if ex.req.location.is_none() {
        ex.req.location = Some(host.location(&ex.req.url));
    }
    if let Some((code, msg)) = failure {
        fail(&mut ex.req, &mut ex.resp, &mut ex.queues, core, code, &msg);
    } else if ex.req.bad_range {
        let err = Error::BadRange;
        fail(&mut ex.req, &mut ex.resp, &mut ex.queues, core,
             err.http_status().0, &err.to_string());
    }
    let pass = ctx.pass_handler();
    let handler = if ex.req.failed {
        pass.clone()
    } else {
        match select_handler(&ctx, &host, &mut ex.req, &mut ex.resp) {
            Ok(handler) => handler,
            Err((code, msg)) => {
                fail(&mut ex.req, &mut ex.resp, &mut ex.queues, core,
                     code, &msg);
                pass.clone()
            }
        }
    };
    if let Some(query) = ex.req.query.clone() {
        ex.req.add_form_vars(query.as_bytes());
    }
    let location = ex.req.location.clone()
        .unwrap_or_else(|| Arc::new(Location::default()));
    let is_pass = Arc::ptr_eq(&handler, &pass);

    let mut send = vec![handler.clone()];
    let mut chunking = false;
    if !is_pass {
        for name in &location.output_filters {
            let filter = match ctx.stage(name) {
                Some(filter) => filter,
                None => {
                    warn!("output filter {:?} is not registered", name);
                    continue;
                }
            };
            let skip = match filter.name() {
                "authFilter" => location.auth.kind == AuthKind::None,
                "rangeFilter" => ex.req.ranges.is_empty()
                    || handler.handles_ranges(),
                "chunkFilter" => !location.chunking
                    || ex.req.version == Version::Http10
                    || known_length(&handler, &ex.req),
                _ => false,
            };
            if skip || !filter.matches(&ex.req, &location) {
                continue;
            }
            chunking |= filter.name() == "chunkFilter";
            send.push(filter);
        }
    }
    let mut connector_name = &location.connector[..];
    if handler.name() == "fileHandler" && connector_name == "netConnector"
        && ex.req.ranges.is_empty() && !chunking && !host.trace.enabled
    {
        connector_name = "sendConnector";
    }
    let connector = match ctx.stage(connector_name) {
        Some(connector) => connector,
        None => {
            warn!("connector {:?} is not registered", connector_name);
            ctx.net_connector()
        }
    };
    send.push(connector.clone());

    let mut receive = Vec::new();
    if ex.req.has_body() || matches!(ex.req.method, Method::Post | Method::Put)
    {
        receive.push(connector.clone());
        if !is_pass {
            for name in &location.input_filters {
                match ctx.stage(name) {
                    Some(filter) if filter.matches(&ex.req, &location) => {
                        receive.push(filter);
                    }
                    Some(_) => {}
                    None => warn!("input filter {:?} is not registered", name),
                }
            }
        }
        receive.push(handler.clone());
    }
    debug!("pipeline for {} {}: {}", ex.req.method, ex.req.url,
        send.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> "));

    let limits = &host.limits;
    for stage in send {
        ex.queues.add(stage, Direction::Send,
                      limits.queue_max, limits.packet_size);
    }
    for stage in receive {
        ex.queues.add(stage, Direction::Receive,
                      limits.queue_max, limits.packet_size);
    }
    ex.queues.pair_up();
    ex.resp.send_direct = connector.name() == "sendConnector";
    ex.resp.chunk_size = limits.chunk_size;
    ex.resp.handler = Some(handler);
    ex.resp.connector = Some(connector);

    ex.open(core);
    if let Some(qid) = ex.queues.head(Direction::Send) {
        ex.ctx(core, qid).put_for_service(Packet::header(), false);
    }
    ex
}

fn known_length(handler: &Arc<dyn Stage>, req: &Request) -> bool {
    handler.name() == "fileHandler"
        && req.info.as_ref().map_or(false, |info| !info.is_dir)
}

/// Selects the handler, following directory index rewrites
fn select_handler(ctx: &ServerContext, host: &Host, req: &mut Request,
                  resp: &mut Response)
    -> Result<Arc<dyn Stage>, (u16, String)>
{
    let pass = ctx.pass_handler();
    while req.rewrites < MAX_REWRITE {
        let location = host.location(&req.url);
        req.location = Some(location.clone());
        for stage in ctx.stages() {
            if stage.kind() == StageKind::Handler
                && stage.modify(req, resp, host)
            {
                return Ok(pass);
            }
        }
        let handler = find_handler(ctx, req, &location)?;
        if !handler.is_virtual() {
            map_to_storage(req, host, &location);
            if req.info.as_ref().map_or(false, |i| i.is_dir) {
                if !req.url.ends_with('/') {
                    let mut target = utf8_percent_encode(&req.url, PATH)
                        .to_string();
                    target.push('/');
                    if let Some(ref query) = req.query {
                        target.push('?');
                        target.push_str(query);
                    }
                    resp.redirect(302, &target, req, host);
                    return Ok(pass);
                }
                let url = format!("{}{}", req.url, host.index);
                debug!("rewriting {} to {}", req.url, url);
                req.set_url(url);
                req.rewrites += 1;
                continue;
            }
        }
        let allowed = handler.methods();
        match req.method {
            Method::Options => {
                resp.headers.set("Allow", allowed.allow_header());
                return Ok(pass);
            }
            Method::Trace => return Ok(pass),
            method if !allowed.contains(method) => {
                resp.headers.set("Allow", allowed.allow_header());
                let err = Error::MethodNotAllowed(method.to_string());
                debug!("{} for {}", err, handler.name());
                return Err((err.http_status().0, err.to_string()));
            }
            _ => return Ok(handler),
        }
    }
    Err((500, "Too many url rewrites".into()))
}

fn find_handler(ctx: &ServerContext, req: &Request, location: &Location)
    -> Result<Arc<dyn Stage>, (u16, String)>
{
    if let Some(ref name) = location.handler {
        return ctx.stage(name).ok_or_else(|| {
            (500, format!("Handler {:?} is not registered", name))
        });
    }
    if let Some(name) = req.extension.as_ref()
        .and_then(|ext| location.extensions.get(ext))
    {
        return ctx.stage(name).ok_or_else(|| {
            (500, format!("Handler {:?} is not registered", name))
        });
    }
    for stage in ctx.stages() {
        if stage.kind() == StageKind::Handler
            && location.handlers.iter().any(|n| n == stage.name())
            && stage.matches(req, location)
        {
            return Ok(stage.clone());
        }
    }
    Ok(ctx.stage("fileHandler").unwrap_or_else(|| ctx.pass_handler()))
}

fn storage_root<'a>(host: &'a Host, location: &'a Location, url: &'a str)
    -> (&'a Path, &'a str)
{
    match location.alias {
        Some(ref alias) => {
            let rest = url.get(location.prefix.len()..).unwrap_or("");
            (alias, rest)
        }
        None => (&host.document_root, url),
    }
}

fn storage_path(root: &Path, url: &str) -> PathBuf {
    root.join(url.trim_start_matches('/'))
}

/// Maps the url to a file, splitting off path info past an existing file
fn map_to_storage(req: &mut Request, host: &Host, location: &Location) {
    let url = req.url.clone();
    let (root, rel) = storage_root(host, location, &url);
    let path = storage_path(root, rel);
    req.info = FileInfo::stat(&path);
    req.filename = Some(path);
    req.path_info = None;
    req.script_name = req.url.clone();
    if req.info.is_some() {
        return;
    }
    let mut end = rel.trim_end_matches('/').len();
    while let Some(idx) = rel[..end].rfind('/') {
        if idx == 0 {
            break;
        }
        let candidate = storage_path(root, &rel[..idx]);
        if let Some(info) = FileInfo::stat(&candidate) {
            if !info.is_dir {
                let split = req.url.len() - rel.len() + idx;
                req.path_info = Some(req.url[split..].to_string());
                req.script_name = req.url[..split].to_string();
                req.filename = Some(candidate);
                req.info = Some(info);
            }
            break;
        }
        end = idx;
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use crate::config::{AuthConfig, AuthKind, Host, Location, ServerContext};
    use crate::queue::Direction;
    use crate::test_util::Fixture;
    use super::create;

    fn names(fx: &mut Fixture, head: &str) -> (Vec<String>, Vec<String>) {
        let req = fx.request(head);
        let ex = create(&mut fx.core, req, None);
        let list = |dir| ex.queues().chain(dir).iter()
            .map(|&q| ex.queues()[q].stage().name().to_string())
            .collect::<Vec<_>>();
        (list(Direction::Send), list(Direction::Receive))
    }

    #[test]
    fn static_file_uses_send_connector() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("index.html"), "hello world").unwrap();
        let (send, receive) = names(&mut fx, "GET /index.html HTTP/1.1\r\n\r\n");
        assert_eq!(send, vec!["fileHandler", "sendConnector"]);
        assert!(receive.is_empty());
    }

    #[test]
    fn ranges_keep_net_connector() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("a.txt"), "hello world").unwrap();
        let (send, _) = names(&mut fx,
            "GET /a.txt HTTP/1.1\r\nRange: bytes=0-4\r\n\r\n");
        assert_eq!(send, vec!["fileHandler", "rangeFilter", "netConnector"]);
    }

    #[test]
    fn post_gets_receive_chain() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("form.html"), "x").unwrap();
        let (_, receive) = names(&mut fx, "POST /form.html HTTP/1.1\r\n\
            Content-Type: multipart/form-data; boundary=xyz\r\n\
            Content-Length: 10\r\n\r\n");
        assert_eq!(receive,
                   vec!["sendConnector", "uploadFilter", "fileHandler"]);
    }

    #[test]
    fn failed_request_collapses_to_pass_handler() {
        let mut fx = Fixture::new();
        let req = fx.request("GET /x HTTP/1.1\r\n\r\n");
        let ex = create(&mut fx.core, req, Some((400, "Bad".into())));
        assert_eq!(ex.resp.code, 400);
        let send: Vec<_> = ex.queues().chain(Direction::Send).iter()
            .map(|&q| ex.queues()[q].stage().name().to_string())
            .collect();
        assert_eq!(send, vec!["passHandler", "netConnector"]);
    }

    #[test]
    fn directory_redirect_and_index_rewrite() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.root().join("dir")).unwrap();
        fs::write(fx.root().join("dir/index.html"), "idx").unwrap();
        let req = fx.request("GET /dir HTTP/1.1\r\nHost: h\r\n\r\n");
        let ex = create(&mut fx.core, req, None);
        assert_eq!(ex.resp.code, 302);
        assert_eq!(ex.resp.headers.get("Location"), Some("http://h/dir/"));

        let req = fx.request("GET /dir/ HTTP/1.1\r\n\r\n");
        let ex = create(&mut fx.core, req, None);
        assert_eq!(ex.req.url, "/dir/index.html");
        assert_eq!(ex.req.rewrites, 1);
        assert_eq!(ex.resp.code, 200);
    }

    #[test]
    fn path_info_split() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("script.x"), "#!").unwrap();
        let req = fx.request("GET /script.x/extra/path HTTP/1.1\r\n\r\n");
        let ex = create(&mut fx.core, req, None);
        assert_eq!(ex.req.script_name, "/script.x");
        assert_eq!(ex.req.path_info.as_deref(), Some("/extra/path"));
    }

    #[test]
    fn method_not_allowed() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("a.txt"), "x").unwrap();
        let req = fx.request("DELETE /a.txt HTTP/1.1\r\n\r\n");
        let ex = create(&mut fx.core, req, None);
        assert_eq!(ex.resp.code, 405);
        assert_eq!(ex.resp.headers.get("Allow"), Some("GET,HEAD,POST"));
        assert!(ex.req.failed);
    }

    #[test]
    fn auth_filter_only_with_auth_configured() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("a.txt"), "x").unwrap();
        let mut host = Host::new("x", fx.root());
        host.add_location(Location::new("/").auth(AuthConfig {
            kind: AuthKind::Basic,
            realm: "r".into(),
            users: Vec::new(),
            groups: Vec::new(),
        }));
        fx.core.ctx = Arc::new(ServerContext::new(host));
        fx.core.host = fx.core.ctx.default_host().clone();
        let req = fx.request("GET /a.txt HTTP/1.1\r\n\r\n");
        let ex = create(&mut fx.core, req, None);
        assert_eq!(ex.resp.code, 401);
        let send: Vec<_> = ex.queues().chain(Direction::Send).iter()
            .map(|&q| ex.queues()[q].stage().name().to_string())
            .collect();
        assert_eq!(send, vec!["fileHandler", "authFilter", "sendConnector"]);
    }
}
