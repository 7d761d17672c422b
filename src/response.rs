//! Response metadata and the header block generator
use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::Host;
use crate::date;
use crate::error::reason;
use crate::headers::Headers;
use crate::request::Request;
use crate::stage::Stage;


pub struct Response {
    pub code: u16,
    /// Custom headers, emitted after the standard ones
    pub headers: Headers,
    pub mime_type: Option<String>,
    /// Length of the body to be sent, `None` when unknown
    pub length: Option<u64>,
    /// Length of the whole entity (differs from `length` for ranges)
    pub entity_length: Option<u64>,
    /// Preferred size of chunks and of packets written by the handler
    pub chunk_size: usize,
    /// Body uses chunked transfer encoding
    pub chunked: bool,
    /// Synthetic body (error or redirect page) replacing handler output
    pub alt_body: Option<Vec<u8>>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub file: Option<File>,
    pub handler: Option<Arc<dyn Stage>>,
    pub connector: Option<Arc<dyn Stage>>,
    pub content_range: Option<String>,
    pub range_boundary: Option<String>,
    pub accept_ranges: bool,
    /// Headers only (HEAD, 304)
    pub no_body: bool,
    /// Don't emit caching headers
    pub no_expires: bool,
    /// Connector reads entity packets from `file` itself
    pub send_direct: bool,
    pub bytes_written: u64,
    headers_created: bool,
}

impl Response {
    pub fn new() -> Response {
        Response {
            code: 200,
            headers: Headers::new(),
            mime_type: None,
            length: None,
            entity_length: None,
            chunk_size: 0,
            chunked: false,
            alt_body: None,
            etag: None,
            last_modified: None,
            file: None,
            handler: None,
            connector: None,
            content_range: None,
            range_boundary: None,
            accept_ranges: false,
            no_body: false,
            no_expires: false,
            send_direct: false,
            bytes_written: 0,
            headers_created: false,
        }
    }
    pub fn headers_created(&self) -> bool {
        self.headers_created
    }
    pub fn set_header<K: Into<String>, V: Into<String>>(&mut self,
        name: K, value: V)
    {
        self.headers.set(name, value);
    }

    /// Replaces the body by a minimal HTML error page
    pub fn set_error_body(&mut self, code: u16, message: &str) {
        let phrase = reason(code);
        let body = format!(
            "<!DOCTYPE html>\r\n\
             <html><head><title>{code} {phrase}</title></head>\r\n\
             <body><h2>{code} {phrase}</h2>\r\n\
             <p>{message}</p>\r\n\
             </body></html>\r\n",
            code=code, phrase=phrase, message=escape_html(message));
        self.set_alt_body(code, "text/html", body.into_bytes());
    }

    /// Redirects the client to `target`
    ///
    /// Relative targets are made absolute using the requested host name.
    pub fn redirect(&mut self, code: u16, target: &str, req: &Request,
                    host: &Host)
    {
        let location = if target.contains("://") {
            target.to_string()
        } else {
            let name = req.host_name.as_ref().unwrap_or(&host.name);
            format!("http://{}{}", name, target)
        };
        let body = format!(
            "<!DOCTYPE html>\r\n\
             <html><head><title>{code} {phrase}</title></head>\r\n\
             <body><h2>{code} {phrase}</h2>\r\n\
             <p>The document has moved <a href=\"{url}\">here</a>.</p>\r\n\
             </body></html>\r\n",
            code=code, phrase=reason(code), url=escape_html(&location));
        self.headers.set("Location", location);
        self.set_alt_body(code, "text/html", body.into_bytes());
    }

    fn set_alt_body(&mut self, code: u16, mime: &str, body: Vec<u8>) {
        self.code = code;
        self.mime_type = Some(mime.into());
        self.length = Some(body.len() as u64);
        self.entity_length = None;
        self.content_range = None;
        self.range_boundary = None;
        self.accept_ranges = false;
        self.etag = None;
        self.last_modified = None;
        self.chunked = false;
        self.no_expires = true;
        self.alt_body = Some(body);
    }

    pub fn is_redirect(&self) -> bool {
        self.headers.contains("Location") && (300..400).contains(&self.code)
    }

    /// Whether a message body is allowed at all for the status
    pub fn body_allowed(&self) -> bool {
        !(self.code < 200 || self.code == 204 || self.code == 304)
    }

    /// Generates the header block
    ///
    /// Returns `None` if the headers were already generated for this
    /// response. `keep_alive` is the number of requests the connection
    /// still accepts, zero makes it `Connection: close`. When the body is
    /// chunked the final blank line is left out, the first chunk prefix
    /// starts with it.
    pub fn fill_headers(&mut self, req: &Request, host: &Host,
                        keep_alive: u32)
        -> Option<Vec<u8>>
    {
        if self.headers_created {
            return None;
        }
        self.headers_created = true;
        let mut buf = String::with_capacity(256);
        buf.push_str(&format!("{} {} {}\r\n",
            req.version, self.code, reason(self.code)));
        buf.push_str("Date: ");
        date::extend(&mut buf);
        buf.push_str("\r\n");
        buf.push_str(&format!("Server: {}\r\n", host.server_name));

        if !self.no_expires {
            let lifespan = req.location.as_ref()
                .and_then(|loc| self.mime_type.as_ref()
                    .and_then(|mime| loc.expires.get(mime)));
            if let Some(lifespan) = lifespan {
                buf.push_str(&format!("Cache-Control: max-age={}\r\n",
                    lifespan.as_secs()));
                buf.push_str(&format!("Expires: {}\r\n",
                    date::format(SystemTime::now() + *lifespan)));
            }
        }
        if let Some(ref etag) = self.etag {
            buf.push_str(&format!("ETag: {}\r\n", etag));
        }
        if let Some(modified) = self.last_modified {
            buf.push_str(&format!("Last-Modified: {}\r\n",
                date::format(modified)));
        }
        if self.chunked {
            buf.push_str("Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = self.length {
            if self.body_allowed() {
                buf.push_str(&format!("Content-Length: {}\r\n", len));
            }
        }
        if let Some(ref boundary) = self.range_boundary {
            buf.push_str(&format!(
                "Content-Type: multipart/byteranges; boundary={}\r\n",
                boundary));
        } else {
            if let Some(ref range) = self.content_range {
                buf.push_str(&format!("Content-Range: {}\r\n", range));
            }
            if self.accept_ranges {
                buf.push_str("Accept-Ranges: bytes\r\n");
            }
            if let Some(ref mime) = self.mime_type {
                if !self.is_redirect() || self.alt_body.is_some() {
                    buf.push_str(&format!("Content-Type: {}\r\n", mime));
                }
            }
        }
        if keep_alive > 0 {
            buf.push_str("Connection: keep-alive\r\n");
            buf.push_str(&format!("Keep-Alive: timeout={}, max={}\r\n",
                host.limits.keep_alive_timeout.as_secs(), keep_alive));
        } else {
            buf.push_str("Connection: close\r\n");
        }
        for (name, value) in &self.headers {
            buf.push_str(name);
            buf.push_str(": ");
            buf.push_str(value);
            buf.push_str("\r\n");
        }
        if !self.chunked {
            buf.push_str("\r\n");
        }
        Some(buf.into_bytes())
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

pub fn escape_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#39;"),
            c => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod test {
    use std::str::from_utf8;

    use crate::config::{Host, Limits};
    use crate::request::Request;
    use super::{Response, escape_html};

    fn request() -> Request {
        let limits = Limits::default();
        let mut req = Request::new(&limits);
        req.parse_head(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n", &limits)
            .unwrap();
        req
    }

    fn lines(head: &[u8]) -> Vec<String> {
        from_utf8(head).unwrap().split("\r\n").map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn order_of_headers() {
        let req = request();
        let host = Host::new("x", "/tmp");
        let mut resp = Response::new();
        resp.length = Some(11);
        resp.etag = Some("\"1-11-0\"".into());
        resp.mime_type = Some("text/plain".into());
        resp.headers.add("X-Custom", "1");
        let head = resp.fill_headers(&req, &host, 5).unwrap();
        let names: Vec<String> = lines(&head).iter()
            .skip(1)
            .filter_map(|l| l.split(':').next().map(|n| n.to_string()))
            .filter(|n| !n.is_empty())
            .collect();
        assert_eq!(names, vec!["Date", "Server", "ETag", "Content-Length",
            "Content-Type", "Connection", "Keep-Alive", "X-Custom"]);
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(head.ends_with(b"X-Custom: 1\r\n\r\n"));
    }

    #[test]
    fn emitted_once() {
        let req = request();
        let host = Host::new("x", "/tmp");
        let mut resp = Response::new();
        assert!(resp.fill_headers(&req, &host, 1).is_some());
        assert!(resp.headers_created());
        assert!(resp.fill_headers(&req, &host, 1).is_none());
    }

    #[test]
    fn chunked_has_no_length_and_no_blank_line() {
        let req = request();
        let host = Host::new("x", "/tmp");
        let mut resp = Response::new();
        resp.length = Some(5);
        resp.chunked = true;
        let head = resp.fill_headers(&req, &host, 0).unwrap();
        let text = from_utf8(&head).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_body_is_escaped() {
        let mut resp = Response::new();
        resp.set_error_body(404, "Cannot find <script>");
        let body = from_utf8(resp.alt_body.as_ref().unwrap()).unwrap();
        assert!(body.contains("404 Not Found"));
        assert!(body.contains("&lt;script&gt;"));
        assert_eq!(resp.length, Some(body.len() as u64));
        assert_eq!(escape_html("a&\"b'"), "a&amp;&quot;b&#39;");
    }

    #[test]
    fn redirect_is_absolute() {
        let req = request();
        let host = Host::new("default", "/tmp");
        let mut resp = Response::new();
        resp.redirect(302, "/dir/", &req, &host);
        assert_eq!(resp.code, 302);
        assert_eq!(resp.headers.get("Location"), Some("http://x/dir/"));
        assert!(resp.is_redirect());
    }
}
