//! Resolved server configuration: limits, locations, hosts and the
//! server context holding the stage registry
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthBackend, Users};
use crate::stage::Stage;
use crate::stages;


pub const DEFAULT_SERVER_NAME: &str = concat!("embed-http/",
                                              env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Limits {
    /// Size of the whole request head, request line included
    pub max_header_size: usize,
    pub max_headers: usize,
    pub max_url: usize,
    pub max_body: u64,
    pub max_upload: u64,
    /// Longest chunk size line accepted in a chunked request body
    pub max_chunk_head: usize,
    /// Backpressure ceiling of every queue
    pub queue_max: usize,
    pub packet_size: usize,
    /// Size of chunks for chunked responses
    pub chunk_size: usize,
    pub max_keep_alive: u32,
    pub keep_alive_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound for a blocking write
    pub write_block_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_header_size: 16384,
            max_headers: 256,
            max_url: 4096,
            max_body: 100 << 20,
            max_upload: 100 << 20,
            max_chunk_head: 128,
            queue_max: 64 << 10,
            packet_size: 8 << 10,
            chunk_size: 8 << 10,
            max_keep_alive: 100,
            keep_alive_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            write_block_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(feature = "serde")]
impl Limits {
    /// Reads limits from JSON, missing fields keep their defaults
    pub fn from_json(text: &str) -> Result<Limits, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MimeTypes {
    by_extension: HashMap<String, String>,
    default: String,
}

impl Default for MimeTypes {
    fn default() -> MimeTypes {
        let mut types = MimeTypes {
            by_extension: HashMap::new(),
            default: "application/octet-stream".into(),
        };
        for &(ext, mime) in &[
            ("html", "text/html"),
            ("htm", "text/html"),
            ("txt", "text/plain"),
            ("css", "text/css"),
            ("js", "application/javascript"),
            ("json", "application/json"),
            ("xml", "text/xml"),
            ("png", "image/png"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("gif", "image/gif"),
            ("svg", "image/svg+xml"),
            ("ico", "image/x-icon"),
            ("pdf", "application/pdf"),
            ("zip", "application/zip"),
            ("gz", "application/gzip"),
        ] {
            types.add(ext, mime);
        }
        types
    }
}

impl MimeTypes {
    pub fn add(&mut self, extension: &str, mime: &str) {
        self.by_extension.insert(extension.to_ascii_lowercase(), mime.into());
    }
    pub fn lookup<P: AsRef<Path>>(&self, path: P) -> &str {
        path.as_ref().extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.by_extension.get(&e.to_ascii_lowercase()))
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AuthKind {
    None,
    Basic,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuthConfig {
    pub kind: AuthKind,
    pub realm: String,
    /// When non-empty only these users are let in
    pub users: Vec<String>,
    /// When non-empty the user must be a member of one of these groups
    pub groups: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            kind: AuthKind::None,
            realm: String::new(),
            users: Vec::new(),
            groups: Vec::new(),
        }
    }
}

/// Per URL-prefix settings
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Location {
    pub prefix: String,
    /// Handler serving every request of the location
    pub handler: Option<String>,
    /// File extension to handler name
    pub extensions: HashMap<String, String>,
    /// Handlers probed with `Stage::matches` in this order
    pub handlers: Vec<String>,
    pub input_filters: Vec<String>,
    pub output_filters: Vec<String>,
    pub connector: String,
    pub auth: AuthConfig,
    /// Status code to URL of a custom error page
    pub error_documents: HashMap<u16, String>,
    /// MIME type to cache lifetime
    pub expires: HashMap<String, Duration>,
    pub upload_dir: PathBuf,
    pub auto_delete_uploads: bool,
    /// Directory the prefix maps to instead of the document root
    pub alias: Option<PathBuf>,
    pub chunking: bool,
    pub session_timeout: Duration,
}

impl Default for Location {
    fn default() -> Location {
        Location::new("/")
    }
}

impl Location {
    pub fn new(prefix: &str) -> Location {
        Location {
            prefix: prefix.into(),
            handler: None,
            extensions: HashMap::new(),
            handlers: Vec::new(),
            input_filters: vec!["uploadFilter".into()],
            output_filters: vec![
                "authFilter".into(),
                "rangeFilter".into(),
                "chunkFilter".into(),
            ],
            connector: "netConnector".into(),
            auth: AuthConfig::default(),
            error_documents: HashMap::new(),
            expires: HashMap::new(),
            upload_dir: env::temp_dir(),
            auto_delete_uploads: true,
            alias: None,
            chunking: true,
            session_timeout: Duration::from_secs(1800),
        }
    }
    pub fn handler(mut self, name: &str) -> Location {
        self.handler = Some(name.into());
        self
    }
    pub fn extension(mut self, ext: &str, handler: &str) -> Location {
        self.extensions.insert(ext.into(), handler.into());
        self
    }
    pub fn custom_handler(mut self, name: &str) -> Location {
        self.handlers.push(name.into());
        self
    }
    pub fn auth(mut self, auth: AuthConfig) -> Location {
        self.auth = auth;
        self
    }
    pub fn error_document(mut self, code: u16, url: &str) -> Location {
        self.error_documents.insert(code, url.into());
        self
    }
    pub fn expires(mut self, mime: &str, lifespan: Duration) -> Location {
        self.expires.insert(mime.into(), lifespan);
        self
    }
    pub fn upload_dir<P: Into<PathBuf>>(mut self, dir: P) -> Location {
        self.upload_dir = dir.into();
        self
    }
    pub fn alias<P: Into<PathBuf>>(mut self, dir: P) -> Location {
        self.alias = Some(dir.into());
        self
    }
    pub fn chunking(mut self, enabled: bool) -> Location {
        self.chunking = enabled;
        self
    }
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.prefix[..])
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trace {
    /// Log request and response heads under the `embed_http::trace` target
    pub enabled: bool,
    /// How much of the bodies to log
    pub max_body: usize,
}

pub struct Host {
    pub name: String,
    pub document_root: PathBuf,
    pub index: String,
    pub server_name: String,
    pub mime_types: MimeTypes,
    pub limits: Limits,
    pub trace: Trace,
    /// Answer TRACE requests instead of failing them with 405
    pub trace_method: bool,
    locations: Vec<Arc<Location>>,
}

impl Host {
    pub fn new<P: Into<PathBuf>>(name: &str, document_root: P) -> Host {
        Host {
            name: name.into(),
            document_root: document_root.into(),
            index: "index.html".into(),
            server_name: DEFAULT_SERVER_NAME.into(),
            mime_types: MimeTypes::default(),
            limits: Limits::default(),
            trace: Trace::default(),
            trace_method: false,
            locations: vec![Arc::new(Location::default())],
        }
    }
    /// Adds a location, replacing the one with the same prefix
    pub fn add_location(&mut self, location: Location) {
        self.locations.retain(|l| l.prefix != location.prefix);
        self.locations.push(Arc::new(location));
        // longest prefix first
        self.locations.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }
    pub fn location(&self, url: &str) -> Arc<Location> {
        self.locations.iter()
            .find(|l| l.matches(url))
            .cloned()
            .unwrap_or_else(|| Arc::new(Location::default()))
    }
    pub fn locations(&self) -> &[Arc<Location>] {
        &self.locations
    }
}

/// Everything shared by all connections of a server
///
/// Built once at startup and passed as `Arc<ServerContext>`.
pub struct ServerContext {
    stages: Vec<Arc<dyn Stage>>,
    default_host: Arc<Host>,
    hosts: Vec<Arc<Host>>,
    auth: Arc<dyn AuthBackend>,
}

impl ServerContext {
    /// Creates a context with the built-in stages registered
    pub fn new(default_host: Host) -> ServerContext {
        let mut ctx = ServerContext {
            stages: Vec::new(),
            default_host: Arc::new(default_host),
            hosts: Vec::new(),
            auth: Arc::new(Users::new()),
        };
        stages::register_builtin(&mut ctx);
        ctx
    }
    /// Registers a stage, replacing the one with the same name
    ///
    /// Registration order is the order of custom handler matching.
    pub fn add_stage<S: Stage + 'static>(&mut self, stage: S) {
        let stage: Arc<dyn Stage> = Arc::new(stage);
        match self.stages.iter().position(|s| s.name() == stage.name()) {
            Some(idx) => self.stages[idx] = stage,
            None => self.stages.push(stage),
        }
    }
    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.iter().find(|s| s.name() == name).cloned()
    }
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }
    /// Handler used for failed and already answered requests
    pub fn pass_handler(&self) -> Arc<dyn Stage> {
        self.stage("passHandler")
            .unwrap_or_else(|| Arc::new(stages::PassHandler))
    }
    pub(crate) fn net_connector(&self) -> Arc<dyn Stage> {
        self.stage("netConnector")
            .unwrap_or_else(|| Arc::new(stages::NetConnector))
    }
    pub fn add_host(&mut self, host: Host) {
        self.hosts.push(Arc::new(host));
    }
    pub fn default_host(&self) -> &Arc<Host> {
        &self.default_host
    }
    /// Finds a virtual host by the `Host` header value
    pub fn host(&self, name: &str) -> Arc<Host> {
        let name = match name.rfind(':') {
            Some(idx) if !name.ends_with(']') => &name[..idx],
            _ => name,
        };
        self.hosts.iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .unwrap_or(&self.default_host)
            .clone()
    }
    pub fn set_auth_backend<A: AuthBackend + 'static>(&mut self, backend: A) {
        self.auth = Arc::new(backend);
    }
    pub fn auth(&self) -> &Arc<dyn AuthBackend> {
        &self.auth
    }
}
