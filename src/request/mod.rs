//! Parsed request and the request head parser
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::{FromStr, from_utf8};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use httparse::{self, Status};
use httpdate::parse_http_date;
use percent_encoding::percent_decode_str;
use url::form_urlencoded;

use crate::config::{Limits, Location};
use crate::error::Error;
use crate::headers::{Headers, cgi_name, ends_chunked, is_close, is_continue};
use crate::headers::is_keep_alive;
use crate::version::Version;

pub mod chunk;
pub mod range;

pub use self::chunk::ChunkDecoder;
pub use self::range::Range;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
}

impl Method {
    pub fn all() -> &'static [Method] {
        use self::Method::*;
        &[Get, Head, Post, Put, Delete, Options, Trace]
    }
    pub fn as_str(&self) -> &'static str {
        use self::Method::*;
        match *self {
            Get => "GET",
            Head => "HEAD",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Options => "OPTIONS",
            Trace => "TRACE",
        }
    }
}

impl FromStr for Method {
    type Err = Error;
    fn from_str(s: &str) -> Result<Method, Error> {
        Method::all().iter()
            .find(|m| m.as_str() == s)
            .cloned()
            .ok_or_else(|| Error::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the request body is delimited
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyKind {
    Fixed(u64),
    Chunked,
    /// Body continues until the client closes its side of the socket
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfRange {
    Etag(String),
    Date(SystemTime),
}

/// Filesystem target of the request
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub inode: u64,
    pub is_dir: bool,
}

impl FileInfo {
    pub fn stat(path: &Path) -> Option<FileInfo> {
        let meta = fs::metadata(path).ok()?;
        Some(FileInfo {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().ok(),
            inode: inode(&meta),
            is_dir: meta.is_dir(),
        })
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

/// A file received by the upload filter
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Name of the form field
    pub name: String,
    /// File name as sent by the client
    pub client_filename: String,
    /// Where the content is stored
    pub filename: PathBuf,
    pub content_type: Option<String>,
    pub size: u64,
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// Request target exactly as received
    pub uri: String,
    /// Decoded and normalized path
    pub url: String,
    pub query: Option<String>,
    pub extension: Option<String>,
    /// Part of the url that maps to the script (see `path_info`)
    pub script_name: String,
    /// Tail of the url past an existing file
    pub path_info: Option<String>,
    pub headers: Headers,
    /// Headers as pseudo-CGI variables, `HTTP_USER_AGENT` and alike
    pub vars: HashMap<String, String>,
    pub host_name: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyKind,
    /// Bytes of body still expected, `u64::MAX` when unknown
    pub remaining_content: u64,
    pub received_content: u64,
    pub(crate) chunk: ChunkDecoder,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub close_requested: bool,
    pub keep_alive_requested: bool,
    pub expect_continue: bool,
    pub since: Option<SystemTime>,
    /// `If-Modified-Since` rather than `If-Unmodified-Since`
    pub if_modified: bool,
    /// `If-Match` rather than `If-None-Match`
    pub if_match: bool,
    pub etags: Vec<String>,
    pub if_range: Option<IfRange>,
    pub ranges: Vec<Range>,
    /// `Range` header was present but malformed
    pub bad_range: bool,
    pub auth_type: Option<String>,
    pub auth_details: Option<String>,
    pub user: Option<String>,
    pub location: Option<Arc<Location>>,
    pub filename: Option<PathBuf>,
    pub info: Option<FileInfo>,
    pub form_vars: HashMap<String, String>,
    pub files: Vec<UploadFile>,
    pub failed: bool,
    pub rewrites: u32,
    pub client: Option<SocketAddr>,
    pub started: Instant,
    /// Request head kept to answer TRACE
    pub(crate) raw_head: Vec<u8>,
}

impl Request {
    pub fn new(limits: &Limits) -> Request {
        Request {
            method: Method::Get,
            version: Version::Http11,
            uri: String::new(),
            url: String::from("/"),
            query: None,
            extension: None,
            script_name: String::new(),
            path_info: None,
            headers: Headers::new(),
            vars: HashMap::new(),
            host_name: None,
            content_type: None,
            content_length: None,
            body: BodyKind::Fixed(0),
            remaining_content: 0,
            received_content: 0,
            chunk: ChunkDecoder::new(limits.max_chunk_head),
            cookie: None,
            user_agent: None,
            close_requested: false,
            keep_alive_requested: false,
            expect_continue: false,
            since: None,
            if_modified: false,
            if_match: false,
            etags: Vec::new(),
            if_range: None,
            ranges: Vec::new(),
            bad_range: false,
            auth_type: None,
            auth_details: None,
            user: None,
            location: None,
            filename: None,
            info: None,
            form_vars: HashMap::new(),
            files: Vec::new(),
            failed: false,
            rewrites: 0,
            client: None,
            started: Instant::now(),
            raw_head: Vec::new(),
        }
    }

    /// Parses the request head (request line and headers up to the blank
    /// line)
    ///
    /// Fields are filled in as they are parsed, so on error the method and
    /// version are known whenever the request line itself was valid.
    pub fn parse_head(&mut self, buf: &[u8], limits: &Limits)
        -> Result<(), Error>
    {
        let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut raw = httparse::Request::new(&mut headers);
        match raw.parse(buf) {
            Ok(Status::Complete(_)) => {}
            Ok(Status::Partial) => return Err(Error::PrematureEndOfStream),
            Err(httparse::Error::TooManyHeaders) => {
                return Err(Error::TooManyHeaders);
            }
            Err(e) => return Err(e.into()),
        }
        self.version = Version::from_minor(raw.version.unwrap_or(1));
        self.method = raw.method.unwrap_or("").parse()?;
        let uri = raw.path.unwrap_or("");
        if uri.len() > limits.max_url {
            return Err(Error::UrlTooLong);
        }
        self.set_uri(uri)?;
        for header in raw.headers.iter() {
            let value = from_utf8(header.value)?;
            self.add_header(header.name, value, limits)?;
        }
        if self.method == Method::Trace {
            self.raw_head = buf.to_vec();
        }
        self.body = self.body_kind()?;
        self.remaining_content = match self.body {
            BodyKind::Fixed(n) => n,
            BodyKind::Chunked | BodyKind::Eof => u64::max_value(),
        };
        Ok(())
    }

    fn add_header(&mut self, name: &str, value: &str, limits: &Limits)
        -> Result<(), Error>
    {
        self.headers.add(name, value);
        self.vars.entry(cgi_name(name))
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        let lower = name.to_ascii_lowercase();
        match &lower[..] {
            "authorization" => {
                let value = value.trim();
                let mut pair = value.splitn(2, ' ');
                self.auth_type = pair.next().map(|t| t.to_ascii_lowercase());
                self.auth_details = pair.next().map(|d| d.trim().to_string());
            }
            "connection" => {
                let bytes = value.as_bytes();
                if bytes.split(|&x| x == b',').any(is_close) {
                    self.close_requested = true;
                }
                if bytes.split(|&x| x == b',').any(is_keep_alive) {
                    self.keep_alive_requested = true;
                }
            }
            "content-length" => {
                if self.content_length.is_some() {
                    return Err(Error::DuplicateContentLength);
                }
                let len: u64 = value.trim().parse()
                    .map_err(Error::BadContentLength)?;
                if len > limits.max_body {
                    return Err(Error::PayloadTooLarge);
                }
                self.content_length = Some(len);
            }
            "content-type" => {
                self.content_type = Some(value.trim().to_string());
            }
            "cookie" => {
                match self.cookie {
                    Some(ref mut cookie) => {
                        cookie.push_str("; ");
                        cookie.push_str(value);
                    }
                    None => self.cookie = Some(value.to_string()),
                }
            }
            "expect" => {
                if is_continue(value.as_bytes()) {
                    self.expect_continue = true;
                }
            }
            "host" => {
                self.host_name = Some(value.trim().to_string());
            }
            "if-modified-since" | "if-unmodified-since" => {
                // unparsable dates are ignored
                if let Ok(time) = parse_http_date(value.trim()) {
                    self.since = Some(time);
                    self.if_modified = lower == "if-modified-since";
                }
            }
            "if-match" | "if-none-match" => {
                self.if_match = lower == "if-match";
                self.etags.extend(value.split(',')
                    .map(|tag| tag.trim())
                    .filter(|tag| !tag.is_empty())
                    .map(|tag| tag.to_string()));
            }
            "if-range" => {
                let value = value.trim();
                self.if_range = if value.starts_with('"')
                    || value.starts_with("W/")
                {
                    Some(IfRange::Etag(value.to_string()))
                } else {
                    parse_http_date(value).ok().map(IfRange::Date)
                };
            }
            "range" => match range::parse(value) {
                Ok(ranges) => self.ranges = ranges,
                Err(e) => {
                    debug!("{}: {:?}", e, value);
                    self.ranges.clear();
                    self.bad_range = true;
                }
            },
            "transfer-encoding" => {
                if ends_chunked(value.as_bytes()) {
                    self.chunk = ChunkDecoder::new(limits.max_chunk_head);
                    self.body = BodyKind::Chunked;
                }
            }
            "user-agent" => {
                self.user_agent = Some(value.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn body_kind(&self) -> Result<BodyKind, Error> {
        use self::Method::*;
        if self.body == BodyKind::Chunked {
            Ok(BodyKind::Chunked)
        } else if let Some(len) = self.content_length {
            Ok(BodyKind::Fixed(len))
        } else if !matches!(self.method, Post | Put) {
            Ok(BodyKind::Fixed(0))
        } else if self.close_requested || self.version == Version::Http10 {
            Ok(BodyKind::Eof)
        } else {
            Err(Error::LengthRequired)
        }
    }

    /// Sets the request target, decoding and normalizing the path
    pub fn set_uri(&mut self, uri: &str) -> Result<(), Error> {
        self.uri = uri.to_string();
        if uri == "*" && self.method == Method::Options {
            self.url = "*".into();
            return Ok(());
        }
        let mut target = uri;
        for scheme in &["http://", "https://"] {
            if target.len() > scheme.len()
                && target[..scheme.len()].eq_ignore_ascii_case(scheme)
            {
                let rest = &target[scheme.len()..];
                let slash = rest.find('/').unwrap_or(rest.len());
                if self.host_name.is_none() {
                    self.host_name = Some(rest[..slash].to_string());
                }
                target = if slash < rest.len() { &rest[slash..] } else { "/" };
                break;
            }
        }
        let (path, query) = match target.find('?') {
            Some(idx) => (&target[..idx], Some(&target[idx+1..])),
            None => (target, None),
        };
        if !path.starts_with('/') {
            return Err(Error::BadUrl);
        }
        let decoded = percent_decode_str(path).decode_utf8()
            .map_err(|_| Error::BadUrl)?;
        if decoded.contains('\0') {
            return Err(Error::BadUrl);
        }
        self.set_url(normalize(&decoded)?);
        self.query = query.map(|q| q.to_string());
        Ok(())
    }

    /// Replaces the decoded url, used for internal rewrites
    pub fn set_url(&mut self, url: String) {
        let last = &url[url.rfind('/').map_or(0, |i| i+1)..];
        self.extension = last.rfind('.')
            .map(|i| last[i+1..].to_ascii_lowercase())
            .filter(|e| !e.is_empty());
        self.script_name = url.clone();
        self.path_info = None;
        self.url = url;
    }

    pub fn has_body(&self) -> bool {
        self.remaining_content > 0
    }
    pub fn is_form(&self) -> bool {
        self.content_type.as_ref().map_or(false, |t| {
            t.to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
    }
    /// Decodes url-encoded variables into `form_vars`
    pub fn add_form_vars(&mut self, encoded: &[u8]) {
        for (name, value) in form_urlencoded::parse(encoded) {
            self.form_vars.insert(name.into_owned(), value.into_owned());
        }
    }
    pub fn form_var(&self, name: &str) -> Option<&str> {
        self.form_vars.get(name).map(|v| &v[..])
    }

    /// Whether the cached copy of the client is still valid
    ///
    /// Both the modification date and the entity tag must agree. When the
    /// content has changed any requested ranges are dropped so the whole
    /// entity is sent.
    pub fn content_not_modified(&mut self, modified: Option<SystemTime>,
                                etag: Option<&str>)
        -> bool
    {
        if self.since.is_none() && self.etags.is_empty() {
            return false;
        }
        let same = self.match_modified(modified) && self.match_etag(etag);
        if !same && !self.ranges.is_empty() {
            debug!("content changed, sending whole entity of {}", self.url);
            self.ranges.clear();
        }
        same
    }

    fn match_modified(&self, modified: Option<SystemTime>) -> bool {
        let since = match self.since {
            Some(since) => unix_secs(since),
            None => return true,
        };
        let modified = modified.map(unix_secs).unwrap_or(0);
        if self.if_modified {
            modified <= since
        } else {
            modified > since
        }
    }

    fn match_etag(&self, etag: Option<&str>) -> bool {
        if self.etags.is_empty() {
            return true;
        }
        let etag = match etag {
            Some(etag) => etag,
            None => return false,
        };
        let found = self.etags.iter().any(|t| t == etag || t == "*");
        found != self.if_match
    }

    /// Whether ranges may be applied to the entity
    pub fn if_range_matches(&self, modified: Option<SystemTime>,
                            etag: Option<&str>)
        -> bool
    {
        match self.if_range {
            None => true,
            Some(IfRange::Etag(ref tag)) => Some(&tag[..]) == etag,
            Some(IfRange::Date(date)) => modified
                .map_or(false, |m| unix_secs(m) <= unix_secs(date)),
        }
    }
}

/// Resolves `.` and `..` segments and collapses repeated slashes
pub fn normalize(path: &str) -> Result<String, Error> {
    let mut parts: Vec<&str> = Vec::new();
    let mut trailing = false;
    for segment in path.split('/') {
        match segment {
            "" => {}
            "." => trailing = true,
            ".." => {
                parts.pop().ok_or(Error::BadUrl)?;
                trailing = true;
            }
            seg => {
                parts.push(seg);
                trailing = false;
            }
        }
    }
    if path.ends_with('/') {
        trailing = true;
    }
    let mut result = String::with_capacity(path.len());
    for part in &parts {
        result.push('/');
        result.push_str(part);
    }
    if result.is_empty() || trailing {
        result.push('/');
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use std::time::{Duration, UNIX_EPOCH};

    use matches::assert_matches;

    use crate::config::Limits;
    use crate::error::Error;
    use crate::version::Version;
    use super::{BodyKind, Method, Range, Request, normalize};

    fn parse(head: &str) -> Result<Request, Error> {
        let limits = Limits::default();
        let mut req = Request::new(&limits);
        req.parse_head(head.as_bytes(), &limits).map(|()| req)
    }

    #[test]
    fn simple_get() {
        let req = parse("GET /index.html?a=1 HTTP/1.1\r\n\
                         Host: example.org\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.query.as_deref(), Some("a=1"));
        assert_eq!(req.extension.as_deref(), Some("html"));
        assert_eq!(req.host_name.as_deref(), Some("example.org"));
        assert_eq!(req.body, BodyKind::Fixed(0));
        assert!(!req.has_body());
    }

    #[test]
    fn body_kinds() {
        let req = parse("POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
            .unwrap();
        assert_eq!(req.body, BodyKind::Fixed(5));
        assert_eq!(req.remaining_content, 5);
        let req = parse("POST /x HTTP/1.1\r\n\
                         Transfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(req.body, BodyKind::Chunked);
        let req = parse("POST /x HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.body, BodyKind::Eof);
        assert_matches!(parse("POST /x HTTP/1.1\r\n\r\n"),
                        Err(Error::LengthRequired));
    }

    #[test]
    fn duplicate_content_length() {
        assert_matches!(parse("POST /x HTTP/1.1\r\nContent-Length: 5\r\n\
                               Content-Length: 5\r\n\r\n"),
                        Err(Error::DuplicateContentLength));
    }

    #[test]
    fn bad_request_lines() {
        assert_matches!(parse("BREW /pot HTTP/1.1\r\n\r\n"),
                        Err(Error::UnsupportedMethod(_)));
        assert_matches!(parse("GET /../etc/passwd HTTP/1.1\r\n\r\n"),
                        Err(Error::BadUrl));
        assert_matches!(parse("GET nope HTTP/1.1\r\n\r\n"),
                        Err(Error::BadUrl));
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(5000));
        assert_matches!(parse(&long), Err(Error::UrlTooLong));
    }

    #[test]
    fn method_known_after_url_error() {
        let limits = Limits::default();
        let mut req = Request::new(&limits);
        let res = req.parse_head(b"HEAD /%ff HTTP/1.0\r\n\r\n", &limits);
        assert_matches!(res, Err(Error::BadUrl));
        assert_eq!(req.method, Method::Head);
        assert_eq!(req.version, Version::Http10);
    }

    #[test]
    fn absolute_uri() {
        let req = parse("GET http://example.org/a%20b HTTP/1.1\r\n\r\n")
            .unwrap();
        assert_eq!(req.url, "/a b");
        assert_eq!(req.host_name.as_deref(), Some("example.org"));
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("//a//b/").unwrap(), "/a/b/");
        assert_eq!(normalize("/a/..").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_matches!(normalize("/.."), Err(Error::BadUrl));
    }

    #[test]
    fn conditional_headers() {
        let req = parse("GET / HTTP/1.1\r\n\
            If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
            If-None-Match: \"a\", \"b\"\r\n\
            Range: bytes=0-4\r\n\r\n").unwrap();
        assert_eq!(req.since, Some(UNIX_EPOCH + Duration::from_secs(784111777)));
        assert!(req.if_modified);
        assert!(!req.if_match);
        assert_eq!(req.etags, vec!["\"a\"", "\"b\""]);
        assert_eq!(req.ranges, vec![Range::new(0, 5)]);
    }

    #[test]
    fn not_modified_needs_both_validators() {
        let time = UNIX_EPOCH + Duration::from_secs(784111777);
        let mut req = parse("GET / HTTP/1.1\r\n\
            If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
            If-None-Match: \"e\"\r\n\
            Range: bytes=0-4\r\n\r\n").unwrap();
        assert!(req.content_not_modified(Some(time), Some("\"e\"")));
        assert_eq!(req.ranges.len(), 1);
        assert!(!req.content_not_modified(Some(time), Some("\"stale\"")));
        assert!(req.ranges.is_empty());
        let newer = time + Duration::from_secs(10);
        assert!(!req.content_not_modified(Some(newer), Some("\"e\"")));
    }

    #[test]
    fn unconditional_request_is_modified() {
        let mut req = parse("GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(!req.content_not_modified(None, Some("\"e\"")));
    }

    #[test]
    fn form_vars() {
        let mut req = parse("GET /?a=1&b=x%20y HTTP/1.1\r\n\r\n").unwrap();
        let query = req.query.clone().unwrap();
        req.add_form_vars(query.as_bytes());
        req.add_form_vars(b"c=3+4");
        assert_eq!(req.form_var("a"), Some("1"));
        assert_eq!(req.form_var("b"), Some("x y"));
        assert_eq!(req.form_var("c"), Some("3 4"));
    }

    #[test]
    fn bad_range_is_not_a_parse_error() {
        let req = parse("GET / HTTP/1.1\r\nRange: bytes=5-1\r\n\r\n")
            .unwrap();
        assert!(req.bad_range);
        assert!(req.ranges.is_empty());
    }

    #[test]
    fn header_variables() {
        let req = parse("GET / HTTP/1.1\r\nUser-Agent: curl/8\r\n\
                         X-Forwarded-For: a\r\nx-forwarded-for: b\r\n\r\n")
            .unwrap();
        assert_eq!(req.vars.get("HTTP_USER_AGENT").map(|v| &v[..]),
                   Some("curl/8"));
        assert_eq!(req.vars.get("HTTP_X_FORWARDED_FOR").map(|v| &v[..]),
                   Some("a, b"));
        assert_eq!(req.vars.len(), 2);
    }

    #[test]
    fn connection_tokens() {
        let req = parse("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap();
        assert!(req.keep_alive_requested);
        let req = parse("GET / HTTP/1.1\r\nConnection: TE, close\r\n\r\n")
            .unwrap();
        assert!(req.close_requested);
    }
}
