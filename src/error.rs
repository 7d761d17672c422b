use std::io;
use std::num::ParseIntError;
use std::str::Utf8Error;

use httparse;


quick_error!{
    /// Error type which is passed to `fail_request` and `fail_connection`
    ///
    /// Note, you should not match the enum values and/or make an exhaustive
    /// match over the enum. More errors will be added at will.
    ///
    /// Use `HttpError` trait instead
    #[derive(Debug)]
    pub enum Error {
        HeadersAreTooLarge {
            display("headers are larger than the configured limit")
        }
        BadHeaders(e: httparse::Error) {
            from()
            display("error parsing headers: {:?}", e)
        }
        TooManyHeaders {
            display("too many headers in request")
        }
        InvalidChunkSize(e: httparse::InvalidChunkSize) {
            from()
            display("error parsing chunk size")
        }
        BadChunk {
            display("malformed chunk framing")
        }
        DuplicateContentLength {
            display("duplicate `Content-Length` header in request")
        }
        BadContentLength(err: ParseIntError) {
            display("error parsing `Content-Length` header: {}", err)
        }
        LengthRequired {
            display("request body without length")
        }
        UrlTooLong {
            display("url is longer than the configured limit")
        }
        BadUrl {
            display("bad url")
        }
        UnsupportedMethod(method: String) {
            display("unsupported method {:?}", method)
        }
        MethodNotAllowed(method: String) {
            display("method {} is not supported by the handler", method)
        }
        PayloadTooLarge {
            display("payload is larger than is allowed by server settings")
        }
        BadRange {
            display("bad `Range` header")
        }
        RangeNotSatisfiable {
            display("requested range not satisfiable")
        }
        PrematureEndOfStream {
            display("premature end of stream")
        }
        BadUtf8(err: Utf8Error) {
            from()
            display("bad utf8 in one of the crucial headers: {}", err)
        }
        BadUpload(msg: &'static str) {
            display("bad upload: {}", msg)
        }
        Memory {
            display("can't grow buffer")
        }
        Io(err: io::Error) {
            from()
            source(err)
            display("I/O error: {}", err)
        }
    }
}

/// A trait which represents an error which can be formatted as HTTP error page
pub trait HttpError {
    /// Return HTTP status code and status text
    ///
    /// The status text and code are also printed on the error page itself
    fn http_status(&self) -> (u16, &'static str);
}

impl HttpError for Error {
    fn http_status(&self) -> (u16, &'static str) {
        use self::Error::*;
        match *self {
            HeadersAreTooLarge => (413, "Request Entity Too Large"),
            BadHeaders(_) => (400, "Bad Request"),
            TooManyHeaders => (400, "Bad Request"),
            BadUtf8(_) => (400, "Bad Request"),
            BadContentLength(_) => (400, "Bad Request"),
            InvalidChunkSize(_) => (400, "Bad Request"),
            BadChunk => (400, "Bad Request"),
            DuplicateContentLength => (400, "Bad Request"),
            LengthRequired => (411, "Length Required"),
            UrlTooLong => (414, "Request-URI Too Large"),
            BadUrl => (400, "Bad Request"),
            UnsupportedMethod(_) => (501, "Not Implemented"),
            MethodNotAllowed(_) => (405, "Method Not Allowed"),
            PayloadTooLarge => (413, "Request Entity Too Large"),
            BadRange => (416, "Requested Range Not Satisfiable"),
            RangeNotSatisfiable => (416, "Requested Range Not Satisfiable"),
            BadUpload(_) => (400, "Bad Request"),
            Memory => (500, "Internal Server Error"),
            Io(_) => (500, "Internal Server Error"),
            // This one almost never reaches the destination
            PrematureEndOfStream => (400, "Bad Request"),
        }
    }
}

/// Canonical reason phrase for the status codes the server emits
pub fn reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::{Error, HttpError, reason};

    #[test]
    fn status_of_parse_errors() {
        assert_eq!(Error::DuplicateContentLength.http_status().0, 400);
        assert_eq!(Error::UrlTooLong.http_status().0, 414);
        assert_eq!(Error::HeadersAreTooLarge.http_status().0, 413);
        assert_eq!(Error::UnsupportedMethod("FOO".into()).http_status().0,
                   501);
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason(206), "Partial Content");
        assert_eq!(reason(304), "Not Modified");
        assert_eq!(reason(999), "Unknown");
    }
}
