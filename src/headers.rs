//! Header helpers: an ordered, case-insensitive multimap and the small
//! token matchers used while scanning request headers.
use std::slice;


/// Ordered multimap of header fields
///
/// Lookups are case-insensitive. Insertion order is preserved, which is the
/// order headers are written on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Headers {
    items: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { items: Vec::new() }
    }
    /// Returns first value of the header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items.iter()
            .find(|&&(ref k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }
    /// Returns all values of the header in order
    pub fn get_all<'a>(&'a self, name: &'a str)
        -> impl Iterator<Item=&'a str> + 'a
    {
        self.items.iter()
            .filter(move |&&(ref k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
    /// Replaces all values of the header by a single one
    ///
    /// The position of the first occurrence is kept.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V)
    {
        let name = name.into();
        let value = value.into();
        match self.items.iter().position(|x| x.0.eq_ignore_ascii_case(&name)) {
            Some(idx) => {
                self.items[idx].1 = value;
                let mut n = 0;
                self.items.retain(|x| {
                    n += 1;
                    n - 1 <= idx || !x.0.eq_ignore_ascii_case(&name)
                });
            }
            None => self.items.push((name, value)),
        }
    }
    /// Appends a header, keeping the existing ones (e.g. `Set-Cookie`)
    pub fn add<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V)
    {
        self.items.push((name.into(), value.into()));
    }
    /// Appends a value to an existing header joined by `", "`
    pub fn append<K: Into<String>>(&mut self, name: K, value: &str) {
        let name = name.into();
        match self.items.iter_mut().find(|x| x.0.eq_ignore_ascii_case(&name)) {
            Some(item) => {
                item.1.push_str(", ");
                item.1.push_str(value);
            }
            None => self.items.push((name, value.to_string())),
        }
    }
    pub fn remove(&mut self, name: &str) {
        self.items.retain(|x| !x.0.eq_ignore_ascii_case(name));
    }
    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    pub fn iter(&self) -> Iter {
        Iter(self.items.iter())
    }
}

pub struct Iter<'a>(slice::Iter<'a, (String, String)>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);
    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        self.0.next().map(|&(ref k, ref v)| (&k[..], &v[..]))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Name of the pseudo-CGI variable for a request header
///
/// `User-Agent` becomes `HTTP_USER_AGENT`.
pub fn cgi_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 5);
    result.push_str("HTTP_");
    for ch in name.chars() {
        match ch {
            '-' => result.push('_'),
            c => result.push(c.to_ascii_uppercase()),
        }
    }
    result
}

#[inline(always)]
fn is_space(ch: u8) -> bool {
    matches!(ch, b'\r' | b'\n' | b' ' | b'\t')
}

#[inline(always)]
// header value is byte sequence
// we need case insensitive comparison and strip out of the whitespace
fn is_token(val: &[u8], token: &[u8]) -> bool {
    let start = match val.iter().position(|&x| !is_space(x)) {
        Some(x) => x,
        None => return false,
    };
    let end = val.iter().rposition(|&x| !is_space(x)).map_or(start, |x| x+1);
    val[start..end].eq_ignore_ascii_case(token)
}

#[inline(always)]
pub fn is_close(val: &[u8]) -> bool {
    is_token(val, b"close")
}

#[inline(always)]
pub fn is_keep_alive(val: &[u8]) -> bool {
    is_token(val, b"keep-alive")
}

#[inline(always)]
pub fn is_chunked(val: &[u8]) -> bool {
    is_token(val, b"chunked")
}

/// True if chunked is the final transfer coding of the header value
pub fn ends_chunked(val: &[u8]) -> bool {
    val.rsplit(|&x| x == b',').next().map_or(false, is_chunked)
}

#[inline(always)]
pub fn is_continue(val: &[u8]) -> bool {
    is_token(val, b"100-continue")
}

#[cfg(test)]
mod test {
    use super::{Headers, cgi_name, ends_chunked, is_chunked, is_close};

    #[test]
    fn test_chunked() {
        assert!(is_chunked(b"chunked"));
        assert!(is_chunked(b"Chunked"));
        assert!(is_chunked(b"chuNKED"));
        assert!(is_chunked(b"   CHUNKED"));
        assert!(is_chunked(b"   CHUNKED  "));
        assert!(!is_chunked(b"chunkedx"));
        assert!(!is_chunked(b"   "));
        assert!(ends_chunked(b"gzip, chunked"));
        assert!(!ends_chunked(b"chunked, gzip"));
    }

    #[test]
    fn test_close() {
        assert!(is_close(b"close"));
        assert!(is_close(b"Close"));
        assert!(is_close(b" CLOSE"));
        assert!(is_close(b"   close   "));
    }

    #[test]
    fn test_cgi_name() {
        assert_eq!(cgi_name("User-Agent"), "HTTP_USER_AGENT");
        assert_eq!(cgi_name("host"), "HTTP_HOST");
    }

    #[test]
    fn multimap_order_and_case() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("X-Other", "y");
        h.add("set-cookie", "b=2");
        assert_eq!(h.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(h.get_all("Set-Cookie").collect::<Vec<_>>(),
                   vec!["a=1", "b=2"]);
        h.set("Set-Cookie", "c=3");
        let all: Vec<_> = h.iter().collect();
        assert_eq!(all, vec![("Set-Cookie", "c=3"), ("X-Other", "y")]);
        h.append("X-Other", "z");
        assert_eq!(h.get("x-other"), Some("y, z"));
    }
}
