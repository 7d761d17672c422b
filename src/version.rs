use std::fmt::{self, Display};

/// Represents a version of the HTTP protocol.
///
/// HTTP/0.9 is only of historic importance and is not supported. Most
/// requests that appear to be HTTP/0.9 are malformed HTTP/1.0 requests.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    /// HTTP/1.0 protocol version.
    Http10,
    /// HTTP/1.1 protocol version as described in RFC7230 and others.
    Http11,
}

impl Version {
    /// Converts the minor version reported by `httparse`
    pub fn from_minor(minor: u8) -> Version {
        if minor == 0 { Version::Http10 } else { Version::Http11 }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Version::*;
        f.write_str(match *self {
            Http10 => "HTTP/1.0",
            Http11 => "HTTP/1.1",
        })
    }
}
